#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::{str::FromStr, sync::LazyLock};

use bon::Builder;
use derive_more::derive::{Debug, Display};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use tap::Pipe;

pub mod auth;
pub mod error;
pub mod manifest;
pub mod package;
pub mod pull;
pub mod registry;
pub mod transform;

mod ext;

pub use error::{Error, Result};

use error::{DigestError, ReferenceError};

/// The registry used when a reference doesn't specify one.
pub const DEFAULT_DOMAIN: &str = "registry-1.docker.io";

/// Historical alias for the default registry; rewritten to [`DEFAULT_DOMAIN`].
pub const INDEX_DOMAIN: &str = "index.docker.io";

/// The namespace prepended to single-component paths on the default registry.
pub const DEFAULT_NAMESPACE: &str = "library";

/// The tag assumed when a reference carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Longest allowed `domain/path` for a reference, as the user wrote it.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// Hostname with optional port, a bracketed IPv6 literal, or `localhost`.
static DOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*|\[[0-9a-fA-F:]+\])(?::[0-9]+)?$",
    )
    .expect("domain pattern compiles")
});

/// A single path component: lowercase alphanumerics joined by separators.
static COMPONENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*$").expect("component pattern compiles")
});

/// A tag: up to 128 characters, starting with a word character.
static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern compiles")
});

/// Digest algorithms understood by this crate.
///
/// The OCI image spec registers these three; anything else is rejected at
/// parse time rather than carried along opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    /// Length of the hex rendering of a digest produced by this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha384 => 96,
            Algorithm::Sha512 => 128,
        }
    }

    /// The canonical name, as used in the `algorithm:hex` form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hash(&self, content: &[u8]) -> String {
        match self {
            Algorithm::Sha256 => hex::encode(Sha256::digest(content)),
            Algorithm::Sha384 => hex::encode(Sha384::digest(content)),
            Algorithm::Sha512 => hex::encode(Sha512::digest(content)),
        }
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A content-addressable digest in the canonical `algorithm:hex` form.
///
/// Two digests are equal exactly when their canonical renderings are equal.
///
/// ```
/// # use std::str::FromStr;
/// let digest = stevedore_lib::Digest::from_str("sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4").expect("parse digest");
/// assert_eq!(digest.algorithm(), stevedore_lib::Algorithm::Sha256);
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[debug("{}", self.to_string())]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// The algorithm that produced this digest.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex payload, without the algorithm prefix.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Digest the content with SHA-256.
    pub fn from_bytes(content: impl AsRef<[u8]>) -> Self {
        Self::from_bytes_with(Algorithm::Sha256, content)
    }

    /// Digest the content with the given algorithm.
    pub fn from_bytes_with(algorithm: Algorithm, content: impl AsRef<[u8]>) -> Self {
        Self {
            algorithm,
            hex: algorithm.hash(content.as_ref()),
        }
    }

    /// Create a SHA-256 digest from an already-computed raw hash.
    pub fn from_hash(hash: impl AsRef<[u8]>) -> Self {
        Self::from_raw(Algorithm::Sha256, hash)
    }

    /// Create a digest from an already-computed raw hash.
    pub(crate) fn from_raw(algorithm: Algorithm, hash: impl AsRef<[u8]>) -> Self {
        Self {
            algorithm,
            hex: hex::encode(hash.as_ref()),
        }
    }

    /// Report whether the content hashes to this digest under its algorithm.
    pub fn verify(&self, content: impl AsRef<[u8]>) -> bool {
        self.algorithm.hash(content.as_ref()) == self.hex
    }

    /// Report whether the string is a well formed digest.
    pub fn is_digest(s: &str) -> bool {
        Self::from_str(s).is_ok()
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s.split_once(':').ok_or(DigestError::Format)?;
        let algorithm = Algorithm::from_str(algorithm)?;
        if hex.is_empty() || !hex.bytes().all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9')) {
            return Err(DigestError::Format);
        }
        if hex.len() != algorithm.hex_len() {
            return Err(DigestError::Length {
                expected: algorithm.hex_len(),
                actual: hex.len(),
            });
        }
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl From<&Digest> for Digest {
    fn from(digest: &Digest) -> Self {
        digest.clone()
    }
}

/// Derive the chain of cumulative layer identities from an ordered list of
/// diff IDs.
///
/// The first chain ID is the first diff ID itself; each subsequent one is the
/// SHA-256 of the previous chain ID and the next diff ID in canonical form,
/// joined by a single space. Chain IDs name the layer directories inside a
/// Docker V2 image archive.
///
/// ```
/// # use stevedore_lib::{chain_ids, Digest};
/// let diff = Digest::from_bytes(b"layer");
/// assert_eq!(chain_ids(&[diff.clone()]), vec![diff]);
/// ```
pub fn chain_ids(diff_ids: &[Digest]) -> Vec<Digest> {
    let mut chain: Vec<Digest> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            None => diff_id.clone(),
            Some(parent) => Digest::from_bytes(format!("{parent} {diff_id}")),
        };
        chain.push(next);
    }
    chain
}

/// Platform represents the platform a container image is built for.
/// This follows the OCI Image Spec's platform definition while also supporting
/// Docker's platform string format (e.g. "linux/amd64").
///
/// Comparisons are over the normalized os/architecture/variant triple;
/// `os_version` and `os_features` never participate in equality.
///
/// ```
/// # use std::str::FromStr;
/// let platform = stevedore_lib::Platform::from_str("linux/x86_64").expect("parse platform");
/// assert_eq!(platform.to_string(), "linux/amd64");
/// ```
#[derive(Debug, Clone, Eq, Builder, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system the container runs on (e.g. "linux", "windows", "darwin").
    ///
    /// Per the OCI spec, OS values must correspond with GOOS.
    #[builder(into)]
    pub os: String,

    /// CPU architecture (e.g. "amd64", "arm64").
    ///
    /// Per the OCI spec, architecture values must correspond with GOARCH.
    #[builder(into)]
    pub architecture: String,

    /// Variant of the CPU (e.g. "v7" for armv7).
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    /// Operating system version (e.g. "10.0.14393.1066" for windows).
    #[builder(into)]
    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Additional platform features required.
    #[builder(into, default)]
    #[serde(default, rename = "os.features", skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
}

impl Platform {
    /// Canonical name for the linux operating system.
    pub const LINUX: &'static str = "linux";

    /// Canonical name for the Windows operating system.
    pub const WINDOWS: &'static str = "windows";

    /// Canonical name for the AMD64 architecture.
    pub const AMD64: &'static str = "amd64";

    /// Canonical name for the ARM64 architecture.
    pub const ARM64: &'static str = "arm64";

    /// The platform of the running host, normalized.
    pub fn host() -> Self {
        Self::builder()
            .os(std::env::consts::OS)
            .architecture(std::env::consts::ARCH)
            .build()
            .normalize()
    }

    /// Create an instance for Linux AMD64.
    pub fn linux_amd64() -> Self {
        Self::builder()
            .os(Self::LINUX)
            .architecture(Self::AMD64)
            .build()
    }

    /// Create an instance for Linux ARM64.
    pub fn linux_arm64() -> Self {
        Self::builder()
            .os(Self::LINUX)
            .architecture(Self::ARM64)
            .build()
    }

    /// Clone the instance with the given variant.
    pub fn with_variant(self, variant: &str) -> Self {
        Self::builder()
            .os(self.os)
            .architecture(self.architecture)
            .os_features(self.os_features)
            .maybe_os_version(self.os_version)
            .variant(variant)
            .build()
    }

    /// Rewrite aliases into the canonical os/architecture/variant values.
    ///
    /// Alias handling follows the table containerd maintains:
    /// `x86_64`/`x86-64` become `amd64`, `aarch64` becomes `arm64`,
    /// `armhf`/`armel` become `arm` v7/v6, `macos` becomes `darwin`.
    /// Default variants fold away (`amd64/v1`, `arm64/v8`) and a bare `arm`
    /// gains its default `v7`.
    pub fn normalize(&self) -> Self {
        let os = match self.os.to_lowercase().as_str() {
            "macos" => "darwin".to_string(),
            other => other.to_string(),
        };

        let architecture = self.architecture.to_lowercase();
        let variant = self
            .variant
            .as_ref()
            .map(|v| v.to_lowercase())
            .filter(|v| !v.is_empty());

        let (architecture, variant) = match architecture.as_str() {
            "x86_64" | "x86-64" | "amd64" => ("amd64".to_string(), variant.filter(|v| v != "v1")),
            "aarch64" | "arm64" => ("arm64".to_string(), variant.filter(|v| v != "v8")),
            "armhf" => ("arm".to_string(), Some("v7".to_string())),
            "armel" => ("arm".to_string(), Some("v6".to_string())),
            "arm" => ("arm".to_string(), variant.or_else(|| Some("v7".to_string()))),
            _ => (architecture.clone(), variant),
        };

        Self {
            os,
            architecture,
            variant,
            os_version: self.os_version.clone(),
            os_features: self.os_features.clone(),
        }
    }

    /// The ordered list of platforms an image for this target may run as.
    ///
    /// The target itself always comes first. AMD64 microarchitecture levels
    /// fall back toward the baseline and finally `386`; ARM variants fall
    /// back toward `v5`; ARM64 additionally accepts `arm/v8`.
    pub fn compatibility(&self) -> Vec<Platform> {
        fn entry(os: &str, architecture: &str, variant: Option<String>) -> Platform {
            Platform {
                os: os.to_string(),
                architecture: architecture.to_string(),
                variant,
                os_version: None,
                os_features: Vec::new(),
            }
        }

        let target = self.normalize();
        let mut vector = vec![target.clone()];

        let variant_level = target
            .variant
            .as_deref()
            .and_then(|v| v.strip_prefix('v'))
            .and_then(|v| v.parse::<u32>().ok());

        match target.architecture.as_str() {
            Platform::AMD64 => {
                if let Some(level) = variant_level {
                    for fallback in (2..level).rev() {
                        vector.push(entry(
                            &target.os,
                            Platform::AMD64,
                            Some(format!("v{fallback}")),
                        ));
                    }
                    vector.push(entry(&target.os, Platform::AMD64, None));
                }
                vector.push(entry(&target.os, "386", None));
            }
            "arm" => {
                if let Some(level) = variant_level.filter(|level| *level >= 5) {
                    for fallback in (5..level).rev() {
                        vector.push(entry(&target.os, "arm", Some(format!("v{fallback}"))));
                    }
                }
            }
            Platform::ARM64 => {
                vector.push(entry(&target.os, "arm", Some("v8".to_string())));
            }
            _ => {}
        }

        vector
    }
}

impl PartialEq for Platform {
    fn eq(&self, other: &Self) -> bool {
        let this = self.normalize();
        let that = other.normalize();
        this.os == that.os
            && this.architecture == that.architecture
            && this.variant == that.variant
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split('/').collect::<Vec<_>>();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(Error::InvalidPlatform(s.to_string()));
        }

        match parts.as_slice() {
            [os, architecture] => Self::builder()
                .os(*os)
                .architecture(*architecture)
                .build()
                .normalize()
                .pipe(Ok),
            [os, architecture, variant] => Self::builder()
                .os(*os)
                .architecture(*architecture)
                .variant(*variant)
                .build()
                .normalize()
                .pipe(Ok),
            _ => Err(Error::InvalidPlatform(s.to_string())),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl From<&Platform> for Platform {
    fn from(platform: &Platform) -> Self {
        platform.clone()
    }
}

/// Version identifier for a container image: a tag, a digest, both, or
/// nothing at all (in which case operations assume the `latest` tag).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Version {
    /// Neither a tag nor a digest was written.
    #[default]
    None,

    /// A named tag (e.g. "latest", "1.0.0").
    Tag(String),

    /// A content digest (e.g. "sha256:123abc...").
    Digest(Digest),

    /// Both a tag and a digest; the digest wins for resolution.
    Both { tag: String, digest: Digest },
}

impl Version {
    /// Create a tagged instance.
    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag(tag.into())
    }

    /// Create a digest instance.
    pub fn digest(digest: impl Into<Digest>) -> Self {
        Self::Digest(digest.into())
    }
}

/// A container image reference provided by a user.
///
/// Parsing performs the normalization Docker users expect: a missing domain
/// becomes [`DEFAULT_DOMAIN`], a single-component path on that domain gains
/// the [`DEFAULT_NAMESPACE`] prefix, and [`INDEX_DOMAIN`] is rewritten.
///
/// ```
/// # use std::str::FromStr;
/// let reference = stevedore_lib::Reference::from_str("hello-world").expect("parse reference");
/// assert_eq!(reference.to_string(), "registry-1.docker.io/library/hello-world");
/// assert_eq!(reference.target(), "latest");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Reference {
    /// Registry host, with optional port (e.g. "ghcr.io", "localhost:5000").
    #[builder(into)]
    pub domain: String,

    /// Repository path (e.g. "library/ubuntu").
    #[builder(into)]
    pub path: String,

    /// Version identifier: tag, digest, both, or neither.
    #[builder(into, default)]
    pub version: Version,
}

impl Reference {
    /// The tag or digest to ask the registry for; `latest` when unspecified.
    pub fn target(&self) -> String {
        match &self.version {
            Version::None => DEFAULT_TAG.to_string(),
            Version::Tag(tag) => tag.clone(),
            Version::Digest(digest) | Version::Both { digest, .. } => digest.to_string(),
        }
    }

    /// The digest, when the reference pins one.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.version {
            Version::Digest(digest) | Version::Both { digest, .. } => Some(digest),
            _ => None,
        }
    }

    /// The tag, when the reference names one.
    pub fn tag(&self) -> Option<&str> {
        match &self.version {
            Version::Tag(tag) | Version::Both { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// The short name users know the image by: the default domain is dropped,
    /// as is the `library/` namespace for official images.
    pub fn familiar_name(&self) -> String {
        if self.domain != DEFAULT_DOMAIN {
            return format!("{}/{}", self.domain, self.path);
        }
        match self.path.strip_prefix("library/") {
            Some(rest) if !rest.contains('/') => rest.to_string(),
            _ => self.path.clone(),
        }
    }

    /// The `name:tag` pair recorded in a Docker V2 archive's `RepoTags`.
    /// Digest-only references have none.
    pub fn repo_tag(&self) -> Option<String> {
        match &self.version {
            Version::Digest(_) => None,
            Version::Tag(tag) | Version::Both { tag, .. } => {
                Some(format!("{}:{tag}", self.familiar_name()))
            }
            Version::None => Some(format!("{}:{DEFAULT_TAG}", self.familiar_name())),
        }
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }

        // A bare image ID is ambiguous with a repository name; reject it outright.
        if s.len() == 64 && s.bytes().all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9')) {
            return Err(ReferenceError::Format(format!(
                "cannot use a 64-character hex string as a repository name: {s}"
            )));
        }

        // The first segment is a domain only when it can't be a path component.
        let (explicit_domain, remainder) = match s.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first), rest)
            }
            _ => (None, s),
        };

        let (rest, digest) = match remainder.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest)),
            None => (remainder, None),
        };
        let (name, tag) = match rest.split_once(':') {
            Some((name, tag)) => (name, Some(tag)),
            None => (rest, None),
        };

        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(ReferenceError::Uppercase);
        }

        let domain = explicit_domain.unwrap_or(DEFAULT_DOMAIN);
        if !DOMAIN_PATTERN.is_match(domain) {
            return Err(ReferenceError::Format(format!("invalid domain: {domain}")));
        }
        if name.is_empty() {
            return Err(ReferenceError::Format(format!(
                "reference has no repository path: {s}"
            )));
        }
        for component in name.split('/') {
            if !COMPONENT_PATTERN.is_match(component) {
                return Err(ReferenceError::Format(format!(
                    "invalid path component: {component:?}"
                )));
            }
        }
        if let Some(tag) = tag {
            if !TAG_PATTERN.is_match(tag) {
                return Err(ReferenceError::Format(format!("invalid tag: {tag:?}")));
            }
        }

        // The length limit applies to the name as the user wrote it,
        // before any default domain or namespace is attached.
        let typed_len = explicit_domain.map(|d| d.len() + 1).unwrap_or(0) + name.len();
        if typed_len > NAME_TOTAL_LENGTH_MAX {
            return Err(ReferenceError::TooLong);
        }

        let digest = digest
            .map(Digest::from_str)
            .transpose()
            .map_err(ReferenceError::Digest)?;

        let domain = if domain == INDEX_DOMAIN {
            DEFAULT_DOMAIN
        } else {
            domain
        };
        let path = if domain == DEFAULT_DOMAIN && !name.contains('/') {
            format!("{DEFAULT_NAMESPACE}/{name}")
        } else {
            name.to_string()
        };

        let version = match (tag, digest) {
            (None, None) => Version::None,
            (Some(tag), None) => Version::Tag(tag.to_string()),
            (None, Some(digest)) => Version::Digest(digest),
            (Some(tag), Some(digest)) => Version::Both {
                tag: tag.to_string(),
                digest,
            },
        };

        Ok(Reference {
            domain: domain.to_string(),
            path,
            version,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        match &self.version {
            Version::None => Ok(()),
            Version::Tag(tag) => write!(f, ":{tag}"),
            Version::Digest(digest) => write!(f, "@{digest}"),
            Version::Both { tag, digest } => write!(f, ":{tag}@{digest}"),
        }
    }
}

impl From<&Reference> for Reference {
    fn from(reference: &Reference) -> Self {
        reference.clone()
    }
}

/// Authentication method for a registry.
#[derive(Debug, Clone, Default, Display)]
pub enum Authentication {
    /// No authentication
    #[default]
    #[display("none")]
    None,

    /// Basic authentication
    #[display("basic:{username}")]
    Basic {
        /// The username
        username: String,

        /// The password
        #[debug(skip)]
        password: String,
    },
}

impl Authentication {
    /// Create an instance for basic authentication
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The username/password pair, when credentials were provided.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self {
            Authentication::None => None,
            Authentication::Basic { username, password } => {
                Some((username.as_str(), password.as_str()))
            }
        }
    }
}
