//! The error kinds surfaced to callers.
//!
//! Every fallible operation in this crate returns one of the kinds below;
//! transport and filesystem failures are wrapped rather than stringified so
//! the source chain stays intact.

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a digest string failed to parse.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// The string is not in `algorithm:hex` form, or the payload is not
    /// lowercase hex.
    #[error("digest is not in `algorithm:hex` form")]
    Format,

    /// The algorithm tag is not one this crate knows how to compute.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The hex payload has the wrong length for its algorithm.
    #[error("digest payload must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Why a reference string failed to parse.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// The reference was empty.
    #[error("reference is empty")]
    Empty,

    /// The repository path contained uppercase characters.
    #[error("repository name must be lowercase")]
    Uppercase,

    /// The `domain/path` name exceeds 255 characters.
    #[error("repository name must not exceed 255 characters")]
    TooLong,

    /// The reference does not match the grammar.
    #[error("invalid reference format: {0}")]
    Format(String),

    /// The digest portion of the reference is invalid.
    #[error("invalid digest in reference")]
    Digest(#[source] DigestError),
}

/// Everything that can go wrong while talking to a registry or assembling an
/// image on disk.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The user-supplied reference failed to parse.
    #[error("invalid reference")]
    InvalidReference(#[from] ReferenceError),

    /// A digest string failed to parse.
    #[error("invalid digest")]
    InvalidDigest(#[from] DigestError),

    /// A platform string was not `os/arch` or `os/arch/variant`.
    #[error("invalid platform (expected os/arch[/variant]): {0}")]
    InvalidPlatform(String),

    /// Authentication was attempted and exhausted; the registry still says 401.
    #[error("authentication rejected by {registry}")]
    Unauthorized { registry: String },

    /// The token endpoint refused or failed the token exchange.
    /// Unlike [`Error::Unauthorized`] this may succeed on retry.
    #[error("token exchange failed: {reason}")]
    AuthFailure { reason: String },

    /// The registry's WWW-Authenticate header could not be understood.
    #[error("malformed WWW-Authenticate challenge: {0}")]
    MalformedChallenge(String),

    /// The manifest does not exist in the registry.
    #[error("image not found: {reference}")]
    ImageNotFound { reference: String },

    /// The registry returned a manifest that violates its own schema.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A media type outside the known Docker/OCI set.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Downloaded content does not hash to its declared digest.
    /// The partial file has already been removed.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// An on-disk image directory does not hash to its own metadata.
    #[error("image directory failed integrity check: {0}")]
    IntegrityCheckFailed(String),

    /// No entry in the image index matches the requested platform.
    #[error("no manifest matches platform {requested}")]
    PlatformNotAvailable { requested: String },

    /// Transport-level failure.
    #[error("network error")]
    Network(#[from] reqwest::Error),

    /// Local filesystem failure.
    #[error("i/o error")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// The process exit code the CLI reports for this kind.
    ///
    /// 1 user error, 2 not found, 3 authentication, 4 integrity, 5 I/O.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InvalidReference(_)
            | Error::InvalidDigest(_)
            | Error::InvalidPlatform(_)
            | Error::Cancelled => 1,
            Error::ImageNotFound { .. } | Error::PlatformNotAvailable { .. } => 2,
            Error::Unauthorized { .. }
            | Error::AuthFailure { .. }
            | Error::MalformedChallenge(_) => 3,
            Error::DigestMismatch { .. }
            | Error::IntegrityCheckFailed(_)
            | Error::InvalidManifest(_)
            | Error::UnsupportedMediaType(_) => 4,
            Error::Network(_) | Error::Io(_) => 5,
        }
    }
}

impl From<async_tempfile::Error> for Error {
    fn from(err: async_tempfile::Error) -> Self {
        Error::Io(std::io::Error::other(err))
    }
}
