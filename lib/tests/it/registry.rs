use stevedore_lib::{Digest, Error, Platform, Reference};
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use crate::support::{
    fixture_image, mount_fixture, registry_for, server_domain, DOCKER_MANIFEST, OCI_INDEX,
};

const REPO: &str = "testorg/app";

fn tagged_reference(server: &MockServer) -> Reference {
    format!("{}/{REPO}:latest", server_domain(server))
        .parse::<Reference>()
        .expect("parse reference")
}

#[test_log::test(tokio::test)]
async fn resolve_single_platform_manifest() {
    let server = MockServer::start().await;
    let image = fixture_image();
    mount_fixture(&server, REPO, "latest", &image).await;

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    let resolved = registry
        .resolve(&reference, Some(&Platform::linux_amd64()))
        .await
        .expect("resolve image");

    pretty_assertions::assert_eq!(resolved.digest, image.manifest_digest);
    pretty_assertions::assert_eq!(resolved.manifest.layers.len(), 1);
    pretty_assertions::assert_eq!(resolved.config.rootfs.diff_ids, vec![image.diff_id.clone()]);
    pretty_assertions::assert_eq!(resolved.config_bytes.as_ref(), image.config_bytes.as_slice());
}

#[test_log::test(tokio::test)]
async fn resolve_through_index() {
    let server = MockServer::start().await;
    let image = fixture_image();

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [
            {
                "mediaType": DOCKER_MANIFEST,
                "digest": image.manifest_digest.to_string(),
                "size": image.manifest_bytes.len(),
                "platform": { "os": "linux", "architecture": "amd64" },
            },
            {
                "mediaType": DOCKER_MANIFEST,
                "digest": Digest::from_bytes(b"some other build").to_string(),
                "size": 1,
                "platform": { "os": "linux", "architecture": "s390x" },
            },
        ],
    });
    let index_bytes = serde_json::to_vec(&index).expect("serialize index");
    let index_digest = Digest::from_bytes(&index_bytes);

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", index_digest.to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/{index_digest}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(index_bytes.clone())
                .insert_header("Content-Type", OCI_INDEX),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/{}", image.manifest_digest)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(image.manifest_bytes.clone())
                .insert_header("Content-Type", DOCKER_MANIFEST),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/blobs/{}", image.config_digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(image.config_bytes.clone()))
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    let resolved = registry
        .resolve(&reference, Some(&Platform::linux_amd64()))
        .await
        .expect("resolve through the index");

    pretty_assertions::assert_eq!(resolved.digest, image.manifest_digest);
}

#[test_log::test(tokio::test)]
async fn resolve_missing_image_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    let err = registry
        .resolve(&reference, None)
        .await
        .expect_err("must be missing");
    assert!(matches!(err, Error::ImageNotFound { .. }), "got {err:?}");
}

#[test_log::test(tokio::test)]
async fn resolve_verifies_manifest_body() {
    let server = MockServer::start().await;
    let image = fixture_image();
    let lying_digest = Digest::from_bytes(b"not the manifest body");

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", lying_digest.to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/{lying_digest}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(image.manifest_bytes.clone())
                .insert_header("Content-Type", DOCKER_MANIFEST),
        )
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    let err = registry
        .resolve(&reference, None)
        .await
        .expect_err("body must not verify");
    assert!(matches!(err, Error::DigestMismatch { .. }), "got {err:?}");
}

#[test_log::test(tokio::test)]
async fn nested_index_is_invalid() {
    let server = MockServer::start().await;

    let inner = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [],
    });
    let inner_bytes = serde_json::to_vec(&inner).expect("serialize inner index");
    let inner_digest = Digest::from_bytes(&inner_bytes);

    let outer = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [{
            "mediaType": OCI_INDEX,
            "digest": inner_digest.to_string(),
            "size": inner_bytes.len(),
            "platform": { "os": "linux", "architecture": "amd64" },
        }],
    });
    let outer_bytes = serde_json::to_vec(&outer).expect("serialize outer index");
    let outer_digest = Digest::from_bytes(&outer_bytes);

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", outer_digest.to_string()),
        )
        .mount(&server)
        .await;
    for (digest, bytes) in [(&outer_digest, &outer_bytes), (&inner_digest, &inner_bytes)] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{REPO}/manifests/{digest}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(bytes.clone())
                    .insert_header("Content-Type", OCI_INDEX),
            )
            .mount(&server)
            .await;
    }

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    let err = registry
        .resolve(&reference, Some(&Platform::linux_amd64()))
        .await
        .expect_err("nested index must be rejected");
    assert!(matches!(err, Error::InvalidManifest(_)), "got {err:?}");
}

#[test_log::test(tokio::test)]
async fn mismatched_diff_ids_are_invalid() {
    let server = MockServer::start().await;
    let image = fixture_image();

    // Config listing two diff IDs for a single-layer manifest.
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": {
            "type": "layers",
            "diff_ids": [
                image.diff_id.to_string(),
                Digest::from_bytes(b"phantom layer").to_string(),
            ],
        },
    });
    let config_bytes = serde_json::to_vec(&config).expect("serialize config");
    let config_digest = Digest::from_bytes(&config_bytes);

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": config_digest.to_string(),
            "size": config_bytes.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "digest": image.blob_digest.to_string(),
            "size": image.layer_gz.len(),
        }],
    });
    let manifest_bytes = serde_json::to_vec(&manifest).expect("serialize manifest");
    let manifest_digest = Digest::from_bytes(&manifest_bytes);

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", manifest_digest.to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/{manifest_digest}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest_bytes.clone())
                .insert_header("Content-Type", DOCKER_MANIFEST),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/blobs/{config_digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(config_bytes.clone()))
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    let err = registry
        .resolve(&reference, None)
        .await
        .expect_err("layer count must match diff IDs");
    assert!(matches!(err, Error::InvalidManifest(_)), "got {err:?}");
}

#[test_log::test(tokio::test)]
async fn index_without_matching_platform() {
    let server = MockServer::start().await;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [{
            "mediaType": DOCKER_MANIFEST,
            "digest": Digest::from_bytes(b"windows build").to_string(),
            "size": 1,
            "platform": { "os": "windows", "architecture": "amd64" },
        }],
    });
    let index_bytes = serde_json::to_vec(&index).expect("serialize index");
    let index_digest = Digest::from_bytes(&index_bytes);

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", index_digest.to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/{index_digest}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(index_bytes.clone())
                .insert_header("Content-Type", OCI_INDEX),
        )
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    let target = "linux/arm/v7".parse::<Platform>().expect("parse platform");
    let err = registry
        .resolve(&reference, Some(&target))
        .await
        .expect_err("no matching platform");
    match err {
        Error::PlatformNotAvailable { requested } => {
            pretty_assertions::assert_eq!(requested, "linux/arm/v7");
        }
        other => panic!("expected PlatformNotAvailable, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn list_tags_paginates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/tags/list")))
        .and(query_param("n", "2"))
        .and(query_param("last", "v1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": REPO,
            "tags": ["v2", "v3"],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let reference = format!("{}/{REPO}", server_domain(&server))
        .parse::<Reference>()
        .expect("parse reference");
    let listing = registry
        .list_tags(&reference, Some(2), Some("v1"))
        .await
        .expect("list tags");
    pretty_assertions::assert_eq!(listing.tags, vec!["v2", "v3"]);
}

#[test_log::test(tokio::test)]
async fn catalog_lists_repositories() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "repositories": ["library/alpine", "testorg/app"],
        })))
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let repositories = registry.catalog(None, None).await.expect("catalog");
    pretty_assertions::assert_eq!(repositories, vec!["library/alpine", "testorg/app"]);
}

#[test_log::test(tokio::test)]
async fn manifest_exists_and_delete() {
    let server = MockServer::start().await;
    let image = fixture_image();
    mount_fixture(&server, REPO, "latest", &image).await;

    Mock::given(method("DELETE"))
        .and(path(format!("/v2/{REPO}/manifests/{}", image.manifest_digest)))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    assert!(registry.manifest_exists(&reference).await.expect("head"));
    registry.delete_manifest(&reference).await.expect("delete");
}

#[test_log::test(tokio::test)]
async fn unknown_manifest_media_type() {
    let server = MockServer::start().await;
    let body = b"<html>not a manifest</html>".to_vec();
    let digest = Digest::from_bytes(&body);

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Docker-Content-Digest", digest.to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/{digest}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.clone())
                .insert_header("Content-Type", "text/html"),
        )
        .mount(&server)
        .await;

    let registry = registry_for(&server);
    let reference = tagged_reference(&server);
    let err = registry
        .resolve(&reference, None)
        .await
        .expect_err("must reject unknown media type");
    assert!(matches!(err, Error::UnsupportedMediaType(_)), "got {err:?}");
}
