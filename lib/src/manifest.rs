//! The wire documents of the registry protocol: media types, manifests,
//! indexes, and image configurations.

use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{AsRefStr, Display, EnumString};

use crate::{ext::PriorityFind, transform::Compression, Digest, Error, Platform, Result};

/// The schema version every manifest and index must declare.
pub const SCHEMA_VERSION: u32 = 2;

/// The annotation naming the image a layout was built from.
pub const ANNOTATION_BASE_NAME: &str = "org.opencontainers.image.base.name";

/// The `oci-layout` marker file contents.
pub const LAYOUT_VERSION: &str = "1.0.0";

/// The media types this crate understands.
///
/// This is a closed set: anything else surfaces as
/// [`Error::UnsupportedMediaType`] instead of being carried along opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
pub enum MediaType {
    /// A Docker schema 2 image manifest.
    #[strum(serialize = "application/vnd.docker.distribution.manifest.v2+json")]
    DockerManifest,

    /// A Docker schema 2 manifest list (multi-arch).
    #[strum(serialize = "application/vnd.docker.distribution.manifest.list.v2+json")]
    DockerManifestList,

    /// An OCI image manifest.
    #[strum(serialize = "application/vnd.oci.image.manifest.v1+json")]
    OciManifest,

    /// An OCI image index (multi-arch).
    #[strum(serialize = "application/vnd.oci.image.index.v1+json")]
    OciIndex,

    /// A Docker image configuration blob.
    #[strum(serialize = "application/vnd.docker.container.image.v1+json")]
    DockerConfig,

    /// An OCI image configuration blob.
    #[strum(serialize = "application/vnd.oci.image.config.v1+json")]
    OciConfig,

    /// An uncompressed Docker layer.
    #[strum(serialize = "application/vnd.docker.image.rootfs.diff.tar")]
    DockerLayer,

    /// A gzip-compressed Docker layer.
    #[strum(serialize = "application/vnd.docker.image.rootfs.diff.tar.gzip")]
    DockerLayerGzip,

    /// A gzip-compressed Docker foreign layer.
    #[strum(serialize = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip")]
    DockerLayerForeignGzip,

    /// An uncompressed OCI layer.
    #[strum(serialize = "application/vnd.oci.image.layer.v1.tar")]
    OciLayer,

    /// A gzip-compressed OCI layer.
    #[strum(serialize = "application/vnd.oci.image.layer.v1.tar+gzip")]
    OciLayerGzip,

    /// A zstd-compressed OCI layer.
    #[strum(serialize = "application/vnd.oci.image.layer.v1.tar+zstd")]
    OciLayerZstd,

    /// A non-distributable OCI layer. Deprecated upstream; clients are told
    /// to treat these as ordinary layers.
    #[strum(serialize = "application/vnd.oci.image.layer.nondistributable.v1.tar")]
    OciLayerNondistributable,

    /// A gzip-compressed non-distributable OCI layer.
    #[strum(serialize = "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip")]
    OciLayerNondistributableGzip,
}

impl MediaType {
    /// Parse a media type, surfacing unknown values as a typed error.
    pub fn parse(s: &str) -> Result<Self> {
        Self::from_str(s).map_err(|_| Error::UnsupportedMediaType(s.to_string()))
    }

    /// Whether this names a single-image manifest.
    pub fn is_manifest(&self) -> bool {
        matches!(self, MediaType::DockerManifest | MediaType::OciManifest)
    }

    /// Whether this names a multi-arch index.
    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::DockerManifestList | MediaType::OciIndex)
    }

    /// The compression wrapped around a layer of this type.
    pub fn compression(&self) -> Compression {
        match self {
            MediaType::DockerLayerGzip
            | MediaType::DockerLayerForeignGzip
            | MediaType::OciLayerGzip
            | MediaType::OciLayerNondistributableGzip => Compression::Gzip,
            MediaType::OciLayerZstd => Compression::Zstd,
            _ => Compression::None,
        }
    }

    /// The `Accept` header value for manifest requests: both manifest forms,
    /// both index forms, and a wildcard for registries that answer with
    /// nothing more specific.
    pub fn manifest_accept() -> String {
        [
            MediaType::DockerManifest,
            MediaType::DockerManifestList,
            MediaType::OciManifest,
            MediaType::OciIndex,
        ]
        .iter()
        .map(|media_type| media_type.as_ref())
        .chain(std::iter::once("*/*"))
        .collect::<Vec<&str>>()
        .join(", ")
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        MediaType::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A pointer at a blob: its type, its digest, and its size, with optional
/// platform and annotation metadata when it appears in an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of the referenced content.
    pub media_type: MediaType,

    /// The content digest of the referenced blob.
    pub digest: Digest,

    /// The size of the referenced blob in bytes.
    pub size: i64,

    /// The platform the referenced manifest targets, for index entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Arbitrary annotation metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Alternate fetch locations, used by foreign layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

/// A single image's manifest: its configuration blob plus ordered layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,

    pub media_type: MediaType,

    /// Pointer at the image configuration blob.
    pub config: Descriptor,

    /// Ordered layer blobs, base first.
    pub layers: Vec<Descriptor>,
}

/// A multi-arch index: one descriptor per platform build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    pub manifests: Vec<Descriptor>,
}

impl Index {
    /// Pick the index entry best matching the target platform.
    ///
    /// Candidates are ranked by the target's compatibility vector, with index
    /// order breaking ties; entries without platform metadata (attestations
    /// and the like) never match. Returns `None` when nothing matches.
    pub fn select(&self, target: &Platform) -> Option<&Descriptor> {
        select(&self.manifests, target)
    }
}

/// Pick the descriptor best matching the target platform.
///
/// On Windows targets with a known OS version, entries whose build number
/// exceeds the target's are rejected, and entries sharing the target's build
/// prefix are preferred over those that don't.
pub fn select<'a>(manifests: &'a [Descriptor], target: &Platform) -> Option<&'a Descriptor> {
    let target = target.normalize();
    let vector = target.compatibility();
    let windows = target.os == Platform::WINDOWS && target.os_version.is_some();

    manifests
        .iter()
        .filter_map(|descriptor| {
            let platform = descriptor.platform.as_ref()?;
            if windows && !build_acceptable(platform, &target) {
                return None;
            }
            let rank = vector.iter().position(|candidate| candidate == platform)?;
            let rank = if windows {
                rank * 2 + version_rank(platform, &target)
            } else {
                rank
            };
            Some((rank, descriptor))
        })
        .priority_find(|(rank, _)| *rank)
        .map(|(_, descriptor)| descriptor)
}

/// Whether the candidate's Windows build does not exceed the target's.
fn build_acceptable(candidate: &Platform, target: &Platform) -> bool {
    match (
        candidate.os_version.as_deref().and_then(build_number),
        target.os_version.as_deref().and_then(build_number),
    ) {
        (Some(candidate), Some(target)) => candidate <= target,
        _ => true,
    }
}

/// Rank boost for candidates sharing the target's `major.minor.build` prefix.
fn version_rank(candidate: &Platform, target: &Platform) -> usize {
    let prefix = target.os_version.as_deref().map(build_prefix);
    match (candidate.os_version.as_deref(), prefix) {
        (Some(version), Some(prefix)) if version.starts_with(&prefix) => 0,
        _ => 1,
    }
}

/// The build number is the third dotted component of a Windows version.
fn build_number(version: &str) -> Option<u64> {
    version.split('.').nth(2)?.parse().ok()
}

/// The `major.minor.build` prefix of a Windows version string.
fn build_prefix(version: &str) -> String {
    version.split('.').take(3).collect::<Vec<_>>().join(".")
}

/// The root filesystem section of an image configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always "layers" for images this crate handles.
    #[serde(rename = "type")]
    pub kind: String,

    /// Digests of the uncompressed layer tars, base first.
    pub diff_ids: Vec<Digest>,
}

/// The runtime section of an image configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
}

/// One step of an image's build history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// The image configuration blob: what platform the image was built for,
/// how to run it, and the identities of its uncompressed layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    pub architecture: String,

    pub os: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(default, rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,

    pub rootfs: RootFs,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<History>>,
}

impl ImageConfig {
    /// The platform this image was built for.
    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            architecture: self.architecture.clone(),
            variant: self.variant.clone(),
            os_version: self.os_version.clone(),
            os_features: self.os_features.clone().unwrap_or_default(),
        }
    }
}
