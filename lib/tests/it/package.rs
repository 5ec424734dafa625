use std::path::Path;

use async_compression::tokio::bufread::GzipDecoder;
use async_tempfile::TempDir;
use simple_test_case::test_case;
use stevedore_lib::{
    chain_ids,
    package::{self, ImageFormat},
    Digest, Error, Reference,
};
use tokio::{fs, io::BufReader};

use crate::support::{read_archive, read_archive_from, tar_with_file};

/// Drop a pull-shaped directory on disk: `image_config.json` plus one
/// populated chain-ID directory. Returns the config digest and diff ID.
async fn build_image_dir(dir: &Path, layer_tar: &[u8]) -> (Digest, Digest) {
    let diff_id = Digest::from_bytes(layer_tar);
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": { "type": "layers", "diff_ids": [diff_id.to_string()] },
    });
    let config_bytes = serde_json::to_vec(&config).expect("serialize config");
    fs::write(dir.join("image_config.json"), &config_bytes)
        .await
        .expect("write config");

    let chain = chain_ids(&[diff_id.clone()]);
    let layer_dir = dir.join(chain[0].as_hex());
    fs::create_dir_all(&layer_dir).await.expect("create layer dir");
    fs::write(layer_dir.join("layer.tar"), layer_tar)
        .await
        .expect("write layer");

    (Digest::from_bytes(&config_bytes), diff_id)
}

#[test_log::test(tokio::test)]
async fn assemble_v2_layout() {
    let dir = TempDir::new().await.expect("temp dir");
    let layer = tar_with_file("etc/hostname", b"image\n");
    let (config_digest, diff_id) = build_image_dir(dir.dir_path(), &layer).await;

    let reference = "hello-world".parse::<Reference>().expect("parse reference");
    package::assemble(dir.dir_path(), Some(&reference), ImageFormat::V2)
        .await
        .expect("assemble");

    let config_name = format!("{}.json", config_digest.as_hex());
    assert!(dir.dir_path().join(&config_name).is_file());
    assert!(!dir.dir_path().join("image_config.json").exists());

    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.dir_path().join("manifest.json")).await.expect("read"))
            .expect("parse manifest.json");
    let entry = &manifest[0];
    pretty_assertions::assert_eq!(entry["Config"], config_name.as_str());
    pretty_assertions::assert_eq!(entry["RepoTags"][0], "hello-world:latest");
    let chain = chain_ids(&[diff_id]);
    pretty_assertions::assert_eq!(
        entry["Layers"][0],
        format!("{}/layer.tar", chain[0].as_hex()).as_str()
    );
}

#[test_log::test(tokio::test)]
async fn assemble_rejects_corrupted_layer() {
    let dir = TempDir::new().await.expect("temp dir");
    let layer = tar_with_file("etc/hostname", b"image\n");
    let (_, diff_id) = build_image_dir(dir.dir_path(), &layer).await;

    // Corrupt the layer after the config already fixed its diff ID.
    let chain = chain_ids(&[diff_id]);
    fs::write(
        dir.dir_path().join(chain[0].as_hex()).join("layer.tar"),
        b"not the layer anymore",
    )
    .await
    .expect("overwrite layer");

    let err = package::assemble(dir.dir_path(), None, ImageFormat::V2)
        .await
        .expect_err("must fail the integrity check");
    assert!(matches!(err, Error::IntegrityCheckFailed(_)), "got {err:?}");
}

#[test_log::test(tokio::test)]
async fn assemble_oci_layout() {
    let dir = TempDir::new().await.expect("temp dir");
    let layer = tar_with_file("etc/hostname", b"image\n");
    let (config_digest, diff_id) = build_image_dir(dir.dir_path(), &layer).await;

    let reference = "hello-world:latest".parse::<Reference>().expect("parse reference");
    package::assemble(dir.dir_path(), Some(&reference), ImageFormat::Oci)
        .await
        .expect("assemble");

    let layout = fs::read_to_string(dir.dir_path().join("oci-layout"))
        .await
        .expect("read oci-layout");
    pretty_assertions::assert_eq!(layout, r#"{"imageLayoutVersion":"1.0.0"}"#);

    let blobs = dir.dir_path().join("blobs").join("sha256");
    assert!(blobs.join(config_digest.as_hex()).is_file());
    assert!(blobs.join(diff_id.as_hex()).is_file());

    // The chain directory was consumed into the blob store.
    let chain = chain_ids(&[diff_id]);
    assert!(!dir.dir_path().join(chain[0].as_hex()).exists());

    let index: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.dir_path().join("index.json")).await.expect("read"))
            .expect("parse index.json");
    let digest = index["manifests"][0]["digest"]
        .as_str()
        .and_then(|raw| raw.parse::<Digest>().ok())
        .expect("manifest digest");
    let manifest_blob = fs::read(blobs.join(digest.as_hex())).await.expect("manifest blob");
    assert!(digest.verify(&manifest_blob));
    pretty_assertions::assert_eq!(
        index["manifests"][0]["annotations"]["org.opencontainers.image.base.name"],
        "hello-world:latest"
    );
}

#[test_log::test(tokio::test)]
async fn tar_dir_roundtrips() {
    let dir = TempDir::new().await.expect("temp dir");
    fs::write(dir.dir_path().join("manifest.json"), b"[]")
        .await
        .expect("write file");
    let nested = dir.dir_path().join("nested");
    fs::create_dir_all(&nested).await.expect("create nested");
    fs::write(nested.join("layer.tar"), b"layer bytes")
        .await
        .expect("write nested file");

    let output = dir.dir_path().with_extension("tar");
    package::tar_dir(dir.dir_path(), &output, false)
        .await
        .expect("pack");

    let contents = read_archive(&output).await;
    pretty_assertions::assert_eq!(contents["manifest.json"], b"[]".to_vec());
    pretty_assertions::assert_eq!(contents["nested/layer.tar"], b"layer bytes".to_vec());
    fs::remove_file(&output).await.expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn tar_dir_gzip_roundtrips() {
    let dir = TempDir::new().await.expect("temp dir");
    fs::write(dir.dir_path().join("manifest.json"), b"[]")
        .await
        .expect("write file");

    let output = dir.dir_path().with_extension("tar.gz");
    package::tar_dir(dir.dir_path(), &output, true)
        .await
        .expect("pack");

    let file = fs::File::open(&output).await.expect("open archive");
    let contents = read_archive_from(GzipDecoder::new(BufReader::new(file))).await;
    pretty_assertions::assert_eq!(contents["manifest.json"], b"[]".to_vec());
    fs::remove_file(&output).await.expect("cleanup");
}

#[test_case(
    "library/hello-world@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
    false,
    "library_hello-world_sha256_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa.tar";
    "digest reference drops default domain"
)]
#[test_case("hello-world", false, "library_hello-world_latest.tar"; "bare name")]
#[test_case("ghcr.io/user/app:v1", false, "ghcr.io_user_app_v1.tar"; "explicit domain")]
#[test_case("hello-world:latest", true, "library_hello-world_latest.tar.gz"; "gzip suffix")]
#[test]
fn archive_name(input: &str, gzip: bool, expected: &str) {
    let reference = input.parse::<Reference>().expect("parse reference");
    pretty_assertions::assert_eq!(package::archive_name(&reference, gzip), expected);
}
