//! Assembles a downloaded image directory into a Docker V2 archive layout or
//! an OCI image layout, and packs the result into an optionally gzipped tar.
//!
//! The input directory contract is what a pull leaves behind:
//! `image_config.json` plus one `<chain-id-hex>/layer.tar` per layer.
//! Both assemblers re-hash everything they reference before declaring the
//! directory an image, so a corrupted download can't be packed silently.

use std::{collections::BTreeMap, path::Path, str::FromStr};

use async_compression::tokio::write::GzipEncoder;
use serde::Serialize;
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
};
use tokio_tar::Builder;
use tracing::{debug, instrument};

use crate::{
    chain_ids,
    manifest::{
        Descriptor, ImageConfig, Index, Manifest, MediaType, ANNOTATION_BASE_NAME, LAYOUT_VERSION,
        SCHEMA_VERSION,
    },
    transform, Digest, Error, Reference, Result, DEFAULT_DOMAIN,
};

/// File a pull drops the raw image configuration into.
pub const CONFIG_FILE: &str = "image_config.json";

/// The name of the per-layer tarball inside its chain-ID directory.
pub const LAYER_FILE: &str = "layer.tar";

/// The on-disk layout to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    /// Docker V2 archive layout, as produced by `docker save`.
    #[default]
    V2,

    /// OCI image layout.
    Oci,
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v2" => Ok(ImageFormat::V2),
            "oci" => Ok(ImageFormat::Oci),
            other => Err(format!("unknown image format: {other} (expected v2 or oci)")),
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageFormat::V2 => write!(f, "v2"),
            ImageFormat::Oci => write!(f, "oci"),
        }
    }
}

/// One entry of a Docker V2 archive's `manifest.json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveManifestEntry {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// The file name a pulled archive is saved under: the repository name and
/// target with separators flattened, e.g. `library_hello-world_latest.tar`.
pub fn archive_name(reference: &Reference, gzip: bool) -> String {
    let name = if reference.domain == DEFAULT_DOMAIN {
        reference.path.clone()
    } else {
        format!("{}/{}", reference.domain, reference.path)
    };
    let stem = format!("{name}_{}", reference.target()).replace(['/', ':', '@'], "_");
    let suffix = if gzip { ".tar.gz" } else { ".tar" };
    format!("{stem}{suffix}")
}

/// Rewrite the contents of `image_dir` into the requested layout.
///
/// `reference` feeds the archive's name metadata (`RepoTags`, the OCI base
/// image annotation); pass `None` when repackaging a directory whose origin
/// is unknown.
#[instrument(skip(reference))]
pub async fn assemble(
    image_dir: &Path,
    reference: Option<&Reference>,
    format: ImageFormat,
) -> Result<()> {
    let config_bytes = fs::read(image_dir.join(CONFIG_FILE)).await.map_err(|err| {
        Error::IntegrityCheckFailed(format!("cannot read {CONFIG_FILE}: {err}"))
    })?;
    let config: ImageConfig = serde_json::from_slice(&config_bytes)
        .map_err(|err| Error::InvalidManifest(format!("invalid image configuration: {err}")))?;
    let config_digest = Digest::from_bytes(&config_bytes);
    let chain = chain_ids(&config.rootfs.diff_ids);

    match format {
        ImageFormat::V2 => {
            docker_v2(
                image_dir,
                reference,
                &config,
                &config_bytes,
                &config_digest,
                &chain,
            )
            .await
        }
        ImageFormat::Oci => {
            oci_layout(
                image_dir,
                reference,
                &config,
                &config_bytes,
                &config_digest,
                &chain,
            )
            .await
        }
    }
}

/// Lay the directory out as a Docker V2 archive: `<config-hex>.json`,
/// `<chain-id-hex>/layer.tar` per layer, and a single-entry `manifest.json`.
async fn docker_v2(
    image_dir: &Path,
    reference: Option<&Reference>,
    config: &ImageConfig,
    config_bytes: &[u8],
    config_digest: &Digest,
    chain: &[Digest],
) -> Result<()> {
    let config_name = format!("{}.json", config_digest.as_hex());
    fs::write(image_dir.join(&config_name), config_bytes).await?;

    let layers = chain
        .iter()
        .map(|chain_id| format!("{}/{LAYER_FILE}", chain_id.as_hex()))
        .collect::<Vec<_>>();
    let repo_tags = reference
        .and_then(Reference::repo_tag)
        .into_iter()
        .collect::<Vec<_>>();
    let entry = ArchiveManifestEntry {
        config: config_name.clone(),
        repo_tags,
        layers,
    };
    fs::write(image_dir.join("manifest.json"), to_json(&[entry])?).await?;
    let _ = fs::remove_file(image_dir.join(CONFIG_FILE)).await;

    // Nothing gets packed until the directory hashes to its own metadata.
    let on_disk = transform::file_digest(&image_dir.join(&config_name)).await?;
    if on_disk != *config_digest {
        return Err(Error::IntegrityCheckFailed(format!(
            "{config_name} hashes to {on_disk}"
        )));
    }
    verify_layers(image_dir, config, chain).await?;

    debug!(layers = chain.len(), "assembled docker v2 layout");
    Ok(())
}

/// Lay the directory out as an OCI image layout.
///
/// Layers are stored uncompressed under their diff-ID digests (the
/// `docker save` convention), so every file under `blobs/` hashes to its own
/// path. The manifest is rewritten to match and the index points at it,
/// annotated with the image's familiar name.
async fn oci_layout(
    image_dir: &Path,
    reference: Option<&Reference>,
    config: &ImageConfig,
    config_bytes: &[u8],
    config_digest: &Digest,
    chain: &[Digest],
) -> Result<()> {
    verify_layers(image_dir, config, chain).await?;

    let blobs = image_dir.join("blobs").join(config_digest.algorithm().as_str());
    fs::create_dir_all(&blobs).await?;
    fs::write(blobs.join(config_digest.as_hex()), config_bytes).await?;

    let mut layers = Vec::with_capacity(chain.len());
    for (chain_id, diff_id) in chain.iter().zip(&config.rootfs.diff_ids) {
        let src = image_dir.join(chain_id.as_hex()).join(LAYER_FILE);
        let size = fs::metadata(&src).await?.len() as i64;
        fs::rename(&src, blobs.join(diff_id.as_hex())).await?;
        let _ = fs::remove_dir(image_dir.join(chain_id.as_hex())).await;
        layers.push(Descriptor {
            media_type: MediaType::OciLayer,
            digest: diff_id.clone(),
            size,
            platform: None,
            annotations: None,
            urls: None,
        });
    }

    let manifest = Manifest {
        schema_version: SCHEMA_VERSION,
        media_type: MediaType::OciManifest,
        config: Descriptor {
            media_type: MediaType::OciConfig,
            digest: config_digest.clone(),
            size: config_bytes.len() as i64,
            platform: None,
            annotations: None,
            urls: None,
        },
        layers,
    };
    let manifest_bytes = to_json(&manifest)?;
    let manifest_digest = Digest::from_bytes(&manifest_bytes);
    fs::write(blobs.join(manifest_digest.as_hex()), &manifest_bytes).await?;

    let annotations = reference
        .and_then(Reference::repo_tag)
        .map(|name| BTreeMap::from([(ANNOTATION_BASE_NAME.to_string(), name)]));
    let index = Index {
        schema_version: SCHEMA_VERSION,
        media_type: Some(MediaType::OciIndex),
        manifests: vec![Descriptor {
            media_type: MediaType::OciManifest,
            digest: manifest_digest,
            size: manifest_bytes.len() as i64,
            platform: Some(config.platform()),
            annotations,
            urls: None,
        }],
    };
    fs::write(image_dir.join("index.json"), to_json(&index)?).await?;
    fs::write(
        image_dir.join("oci-layout"),
        format!(r#"{{"imageLayoutVersion":"{LAYOUT_VERSION}"}}"#),
    )
    .await?;
    let _ = fs::remove_file(image_dir.join(CONFIG_FILE)).await;

    debug!(layers = chain.len(), "assembled oci layout");
    Ok(())
}

/// Check each `<chain-id>/layer.tar` against its diff ID.
async fn verify_layers(image_dir: &Path, config: &ImageConfig, chain: &[Digest]) -> Result<()> {
    for (chain_id, diff_id) in chain.iter().zip(&config.rootfs.diff_ids) {
        let path = image_dir.join(chain_id.as_hex()).join(LAYER_FILE);
        let actual = transform::file_digest(&path).await.map_err(|_| {
            Error::IntegrityCheckFailed(format!("missing layer: {}", path.display()))
        })?;
        if actual != *diff_id {
            return Err(Error::IntegrityCheckFailed(format!(
                "layer {} hashes to {actual}, expected {diff_id}",
                chain_id.as_hex()
            )));
        }
    }
    Ok(())
}

/// Pack a directory into a tar archive, optionally gzip-wrapped.
#[instrument]
pub async fn tar_dir(src: &Path, output: &Path, gzip: bool) -> Result<()> {
    let file = fs::File::create(output).await?;
    if gzip {
        let encoder = GzipEncoder::new(BufWriter::new(file));
        let mut builder = Builder::new(encoder);
        builder.append_dir_all("", src).await?;
        let mut encoder = builder.into_inner().await?;
        encoder.shutdown().await?;
        encoder.into_inner().flush().await?;
    } else {
        let mut builder = Builder::new(BufWriter::new(file));
        builder.append_dir_all("", src).await?;
        builder.into_inner().await?.flush().await?;
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| Error::Io(std::io::Error::other(err)))
}
