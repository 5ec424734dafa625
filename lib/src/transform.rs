//! File-level transforms shared by the blob downloader and the packager.

use std::path::Path;

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter},
};

use crate::{Algorithm, Digest, Result};

/// Upper bound on a single read/hash step.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// An incremental hash matching a declared digest algorithm.
pub(crate) enum RunningDigest {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl RunningDigest {
    pub(crate) fn new(algorithm: Algorithm) -> Self {
        use sha2::Digest as _;
        match algorithm {
            Algorithm::Sha256 => RunningDigest::Sha256(sha2::Sha256::new()),
            Algorithm::Sha384 => RunningDigest::Sha384(sha2::Sha384::new()),
            Algorithm::Sha512 => RunningDigest::Sha512(sha2::Sha512::new()),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        use sha2::Digest as _;
        match self {
            RunningDigest::Sha256(hasher) => hasher.update(data),
            RunningDigest::Sha384(hasher) => hasher.update(data),
            RunningDigest::Sha512(hasher) => hasher.update(data),
        }
    }

    pub(crate) fn finalize(self) -> Digest {
        use sha2::Digest as _;
        match self {
            RunningDigest::Sha256(hasher) => {
                Digest::from_raw(Algorithm::Sha256, hasher.finalize())
            }
            RunningDigest::Sha384(hasher) => {
                Digest::from_raw(Algorithm::Sha384, hasher.finalize())
            }
            RunningDigest::Sha512(hasher) => {
                Digest::from_raw(Algorithm::Sha512, hasher.finalize())
            }
        }
    }
}

/// The compression wrapped around a blob on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// The blob is a plain tar.
    #[default]
    None,

    /// The blob is gzip-compressed.
    Gzip,

    /// The blob is zstd-compressed.
    Zstd,
}

/// Hash a file on disk with SHA-256, reading in bounded chunks.
pub async fn file_digest(path: &Path) -> Result<Digest> {
    use sha2::{Digest as _, Sha256};
    let mut hasher = Sha256::new();
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(Digest::from_hash(hasher.finalize()))
}

/// Peel the compression off `src`, writing the plain contents to `dest`.
/// Returns the number of decompressed bytes written.
pub async fn decompress(src: &Path, dest: &Path, compression: Compression) -> Result<u64> {
    let reader = BufReader::new(File::open(src).await?);
    let mut writer = BufWriter::new(File::create(dest).await?);
    let copied = match compression {
        Compression::None => {
            let mut reader = reader;
            tokio::io::copy(&mut reader, &mut writer).await?
        }
        Compression::Gzip => {
            let mut decoder = GzipDecoder::new(reader);
            tokio::io::copy(&mut decoder, &mut writer).await?
        }
        Compression::Zstd => {
            let mut decoder = ZstdDecoder::new(reader);
            tokio::io::copy(&mut decoder, &mut writer).await?
        }
    };
    writer.flush().await?;
    Ok(copied)
}
