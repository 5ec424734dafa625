//! Interacts with remote OCI registries: the scoped transport, manifest
//! resolution, and blob download.

use std::{path::Path, sync::Arc, time::Duration};

use bon::bon;
use bytes::Bytes;
use futures_lite::StreamExt;
use reqwest::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::Deserialize;
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    auth::{AuthEngine, ChallengeScheme, Scope},
    manifest::{Descriptor, ImageConfig, Index, Manifest, MediaType, SCHEMA_VERSION},
    transform::{self, Compression, RunningDigest, CHUNK_SIZE},
    Authentication, Digest, Error, Platform, Reference, Result,
};

/// Default timeout for metadata requests (pings, manifests, tags, tokens).
const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle-read timeout; the only time bound on blob bodies.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Header carrying the canonical digest of a manifest response.
const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// A page of the tag listing for a repository.
#[derive(Debug, Clone, Deserialize)]
pub struct TagList {
    /// The repository the tags belong to.
    pub name: String,

    /// The tags themselves, in registry order.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Vec<String>,
}

/// Used when a manifest response carries no usable Content-Type header.
#[derive(Debug, Deserialize)]
struct MediaTypeProbe {
    #[serde(rename = "mediaType")]
    media_type: Option<MediaType>,
}

/// The product of resolving a reference all the way down: the manifest's
/// digest, the manifest itself, and the image configuration it points at.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Digest of the resolved single-platform manifest.
    pub digest: Digest,

    /// The resolved manifest.
    pub manifest: Manifest,

    /// The parsed image configuration.
    pub config: ImageConfig,

    /// The configuration blob exactly as fetched; its hash is the config
    /// digest, so it must be persisted byte for byte.
    pub config_bytes: Bytes,
}

/// Each instance is a client for a single remote registry.
///
/// Cloning is cheap: clones share the transport, the resolved challenge, and
/// the token cache.
#[derive(Debug, Clone)]
pub struct Registry {
    client: reqwest::Client,
    base_url: String,
    auth: Arc<AuthEngine>,
    metadata_timeout: Duration,
}

#[bon]
impl Registry {
    /// Create a client for the registry at the given domain.
    #[builder]
    pub fn new(
        /// Registry domain, with optional port (e.g. "ghcr.io", "localhost:5000").
        #[builder(into)]
        domain: String,

        /// Credentials to present; anonymous when omitted.
        authentication: Option<Authentication>,

        /// Connect with plain HTTP instead of TLS.
        plain_http: Option<bool>,

        /// Skip TLS certificate verification.
        accept_invalid_certs: Option<bool>,

        /// Timeout for metadata requests. Blob bodies are unbounded in total
        /// and governed by `read_timeout` instead.
        metadata_timeout: Option<Duration>,

        /// Idle-read timeout for response bodies.
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let scheme = if plain_http.unwrap_or(false) {
            "http"
        } else {
            "https"
        };
        let base_url = format!("{scheme}://{domain}");

        let client = reqwest::Client::builder()
            .user_agent(concat!("stevedore/", env!("CARGO_PKG_VERSION")))
            .read_timeout(read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT))
            .danger_accept_invalid_certs(accept_invalid_certs.unwrap_or(false))
            .build()?;

        let metadata_timeout = metadata_timeout.unwrap_or(DEFAULT_METADATA_TIMEOUT);
        let auth = AuthEngine::new(
            client.clone(),
            base_url.clone(),
            authentication.unwrap_or_default(),
            metadata_timeout,
        );

        Ok(Self {
            client,
            base_url,
            auth: Arc::new(auth),
            metadata_timeout,
        })
    }
}

impl Registry {
    /// Probe the registry and resolve its authentication challenge.
    pub async fn ping(&self) -> Result<()> {
        self.auth.challenge().await.map(|_| ())
    }

    fn url(&self, suffix: impl AsRef<str>) -> String {
        format!("{}/v2/{}", self.base_url, suffix.as_ref())
    }

    fn not_found(&self, reference: &Reference) -> Error {
        Error::ImageNotFound {
            reference: reference.to_string(),
        }
    }

    /// Issue a request under a scope.
    ///
    /// A 401 against an attached bearer token invalidates the cached token
    /// and replays the request exactly once with a fresh one; a second 401
    /// is terminal.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        scope: &Scope,
        accept: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut refreshed = false;
        loop {
            let authorization = self.auth.authorization(scope).await?;

            let mut request = self.client.request(method.clone(), url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            if let Some(header) = &authorization {
                request = request.header(AUTHORIZATION, header);
            }

            let response = request.send().await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                let bearer = self.auth.scheme().await? == Some(ChallengeScheme::Bearer);
                if bearer && authorization.is_some() && !refreshed {
                    warn!(url, "bearer token rejected; refreshing once");
                    self.auth.invalidate(scope).await;
                    refreshed = true;
                    continue;
                }
                return Err(Error::Unauthorized {
                    registry: self.base_url.clone(),
                });
            }
            return Ok(response);
        }
    }

    /// List the tags of the referenced repository, optionally paginated.
    #[instrument(skip(self), fields(repository = %reference.path))]
    pub async fn list_tags(
        &self,
        reference: &Reference,
        limit: Option<u32>,
        last: Option<&str>,
    ) -> Result<TagList> {
        let scope = Scope::pull(&reference.path);
        let mut url = self.url(format!("{}/tags/list", reference.path));

        let mut params = Vec::new();
        if let Some(limit) = limit {
            params.push(format!("n={limit}"));
        }
        if let Some(last) = last {
            params.push(format!("last={last}"));
        }
        if !params.is_empty() {
            url = format!("{url}?{}", params.join("&"));
        }

        let response = self
            .execute(Method::GET, &url, &scope, None, Some(self.metadata_timeout))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(self.not_found(reference));
        }
        Ok(response.error_for_status()?.json().await?)
    }

    /// List repositories in the registry, optionally paginated.
    #[instrument(skip(self))]
    pub async fn catalog(&self, limit: Option<u32>, last: Option<&str>) -> Result<Vec<String>> {
        let scope = Scope::catalog();
        let mut url = self.url("_catalog");

        let mut params = Vec::new();
        if let Some(limit) = limit {
            params.push(format!("n={limit}"));
        }
        if let Some(last) = last {
            params.push(format!("last={last}"));
        }
        if !params.is_empty() {
            url = format!("{url}?{}", params.join("&"));
        }

        let response = self
            .execute(Method::GET, &url, &scope, None, Some(self.metadata_timeout))
            .await?;
        let page: CatalogPage = response.error_for_status()?.json().await?;
        Ok(page.repositories)
    }

    /// Whether the referenced manifest exists.
    pub async fn manifest_exists(&self, reference: &Reference) -> Result<bool> {
        let scope = Scope::pull(&reference.path);
        let url = self.url(format!("{}/manifests/{}", reference.path, reference.target()));
        let accept = MediaType::manifest_accept();
        let response = self
            .execute(
                Method::HEAD,
                &url,
                &scope,
                Some(&accept),
                Some(self.metadata_timeout),
            )
            .await?;
        Ok(response.status().is_success())
    }

    /// Delete the referenced manifest. Tag references are resolved to their
    /// digest first, since registries only delete by digest.
    #[instrument(skip(self), fields(reference = %reference))]
    pub async fn delete_manifest(&self, reference: &Reference) -> Result<()> {
        let digest = self.manifest_digest(reference).await?;
        let scope = Scope::delete(&reference.path);
        let url = self.url(format!("{}/manifests/{digest}", reference.path));
        let response = self
            .execute(
                Method::DELETE,
                &url,
                &scope,
                None,
                Some(self.metadata_timeout),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(self.not_found(reference));
        }
        response.error_for_status()?;
        info!(%digest, "manifest deleted");
        Ok(())
    }

    /// Resolve the reference to the digest the registry stores for it.
    ///
    /// Digested references answer immediately. Otherwise the manifest is
    /// HEADed and the `Docker-Content-Digest` header consulted; registries
    /// that omit it get a GET and the body is hashed directly.
    #[instrument(skip(self), fields(reference = %reference))]
    pub async fn manifest_digest(&self, reference: &Reference) -> Result<Digest> {
        if let Some(digest) = reference.digest() {
            return Ok(digest.clone());
        }

        let scope = Scope::pull(&reference.path);
        let url = self.url(format!("{}/manifests/{}", reference.path, reference.target()));
        let accept = MediaType::manifest_accept();
        let response = self
            .execute(
                Method::HEAD,
                &url,
                &scope,
                Some(&accept),
                Some(self.metadata_timeout),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(self.not_found(reference));
        }
        let response = response.error_for_status()?;

        if let Some(header) = response.headers().get(DOCKER_CONTENT_DIGEST) {
            return header
                .to_str()
                .ok()
                .and_then(|value| value.parse::<Digest>().ok())
                .ok_or_else(|| {
                    Error::InvalidManifest(
                        "registry sent an unparseable Docker-Content-Digest".to_string(),
                    )
                });
        }

        // A HEAD body is empty, so hash the manifest itself instead.
        let (bytes, _) = self.manifest_bytes(reference, &reference.target()).await?;
        Ok(Digest::from_bytes(&bytes))
    }

    /// Fetch the raw manifest bytes plus the media type that describes them.
    async fn manifest_bytes(
        &self,
        reference: &Reference,
        target: &str,
    ) -> Result<(Bytes, MediaType)> {
        let scope = Scope::pull(&reference.path);
        let url = self.url(format!("{}/manifests/{target}", reference.path));
        let accept = MediaType::manifest_accept();
        let response = self
            .execute(
                Method::GET,
                &url,
                &scope,
                Some(&accept),
                Some(self.metadata_timeout),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(self.not_found(reference));
        }
        let response = response.error_for_status()?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = response.bytes().await?;

        let media_type = match content_type {
            Some(raw) => MediaType::parse(&raw)?,
            None => serde_json::from_slice::<MediaTypeProbe>(&bytes)
                .ok()
                .and_then(|probe| probe.media_type)
                .ok_or_else(|| {
                    Error::UnsupportedMediaType(
                        "manifest response carried no media type".to_string(),
                    )
                })?,
        };
        Ok((bytes, media_type))
    }

    /// Resolve a reference to a concrete single-platform image.
    ///
    /// Multi-arch indexes are recursed through exactly once, filtered by the
    /// requested platform (or the host platform when none is given); the
    /// returned configuration always carries one diff ID per manifest layer.
    #[instrument(skip(self, platform), fields(reference = %reference))]
    pub async fn resolve(
        &self,
        reference: &Reference,
        platform: Option<&Platform>,
    ) -> Result<ResolvedImage> {
        let target = platform.cloned().unwrap_or_else(Platform::host).normalize();
        let mut digest = self.manifest_digest(reference).await?;

        // An index may point at a manifest, but never at another index.
        let mut manifest = None;
        for depth in 0..2 {
            let (bytes, media_type) = self.manifest_bytes(reference, &digest.to_string()).await?;

            let actual = Digest::from_bytes_with(digest.algorithm(), &bytes);
            if actual != digest {
                return Err(Error::DigestMismatch {
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                });
            }

            if media_type.is_manifest() {
                let parsed: Manifest = serde_json::from_slice(&bytes)
                    .map_err(|err| Error::InvalidManifest(err.to_string()))?;
                if parsed.schema_version != SCHEMA_VERSION {
                    return Err(Error::InvalidManifest(format!(
                        "unsupported schema version {}",
                        parsed.schema_version
                    )));
                }
                manifest = Some(parsed);
                break;
            }
            if !media_type.is_index() {
                return Err(Error::UnsupportedMediaType(media_type.to_string()));
            }
            if depth == 1 {
                return Err(Error::InvalidManifest(
                    "index points at another index".to_string(),
                ));
            }

            let index: Index = serde_json::from_slice(&bytes)
                .map_err(|err| Error::InvalidManifest(err.to_string()))?;
            let descriptor = index
                .select(&target)
                .ok_or_else(|| Error::PlatformNotAvailable {
                    requested: target.to_string(),
                })?;
            debug!(platform = %target, digest = %descriptor.digest, "selected platform manifest");
            digest = descriptor.digest.clone();
        }
        let manifest = manifest
            .ok_or_else(|| Error::InvalidManifest("index recursion exhausted".to_string()))?;

        let config_bytes = self.blob_bytes(reference, &manifest.config.digest).await?;
        let config: ImageConfig = serde_json::from_slice(&config_bytes)
            .map_err(|err| Error::InvalidManifest(format!("invalid image configuration: {err}")))?;

        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(Error::InvalidManifest(format!(
                "configuration lists {} diff IDs for {} layers",
                config.rootfs.diff_ids.len(),
                manifest.layers.len()
            )));
        }

        info!(%digest, layers = manifest.layers.len(), "resolved image");
        Ok(ResolvedImage {
            digest,
            manifest,
            config,
            config_bytes,
        })
    }

    async fn blob_response(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<reqwest::Response> {
        let scope = Scope::pull(&reference.path);
        let url = self.url(format!("{}/blobs/{digest}", reference.path));
        let response = self.execute(Method::GET, &url, &scope, None, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(self.not_found(reference));
        }
        Ok(response.error_for_status()?)
    }

    /// Fetch a small blob (an image configuration) fully into memory,
    /// verifying its digest.
    pub async fn blob_bytes(&self, reference: &Reference, digest: &Digest) -> Result<Bytes> {
        let response = self.blob_response(reference, digest).await?;
        let bytes = response.bytes().await?;
        if !digest.verify(&bytes) {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: Digest::from_bytes_with(digest.algorithm(), &bytes).to_string(),
            });
        }
        Ok(bytes)
    }

    /// Stream a layer blob to `dest`, verifying the bytes as received against
    /// the descriptor digest, then peeling the layer's compression so `dest`
    /// ends up a plain tar. Returns the count of on-wire bytes written.
    ///
    /// The descriptor digest covers the compressed bytes as the registry
    /// serves them; the uncompressed content is separately covered by the
    /// image configuration's diff IDs. On any failure the partial files are
    /// removed.
    #[instrument(skip(self, layer), fields(digest = %layer.digest))]
    pub async fn download_blob(
        &self,
        reference: &Reference,
        layer: &Descriptor,
        dest: &Path,
    ) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let compression = layer.media_type.compression();
        let staging = match compression {
            Compression::None => dest.to_path_buf(),
            Compression::Gzip => dest.with_extension("tar.gz"),
            Compression::Zstd => dest.with_extension("tar.zst"),
        };

        let written = match self.download_verified(reference, &layer.digest, &staging).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&staging).await;
                return Err(err);
            }
        };

        if compression != Compression::None {
            let peeled = transform::decompress(&staging, dest, compression).await;
            let _ = fs::remove_file(&staging).await;
            if let Err(err) = peeled {
                let _ = fs::remove_file(dest).await;
                return Err(err);
            }
        }

        Ok(written)
    }

    async fn download_verified(
        &self,
        reference: &Reference,
        digest: &Digest,
        path: &Path,
    ) -> Result<u64> {
        let response = self.blob_response(reference, digest).await?;

        let mut hasher = RunningDigest::new(digest.algorithm());
        let mut writer = BufWriter::new(fs::File::create(path).await?);
        let mut written = 0u64;

        let mut stream = Box::pin(response.bytes_stream());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for slice in chunk.chunks(CHUNK_SIZE) {
                hasher.update(slice);
                writer.write_all(slice).await?;
                written += slice.len() as u64;
            }
        }
        writer.flush().await?;

        let actual = hasher.finalize();
        if actual != *digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        debug!(bytes = written, "blob verified");
        Ok(written)
    }
}
