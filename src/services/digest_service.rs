//! Content digests for candidate files.
//!
//! A plain digest is used for local integrity checks only. Remote
//! comparisons always go through the keyed content hash, which is computed
//! with the *target* folder's hash key so identical content in different
//! folders never compares equal.

use crate::services::{crypto::HashKey, failure::ErrorClass};
use blake2::digest::consts::U32;
use blake2::digest::{Digest, Mac};
use blake2::{Blake2b, Blake2bMac};
use std::{io, str::FromStr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

type Blake2b256 = Blake2b<U32>;
type KeyedBlake2b256 = Blake2bMac<U32>;

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("digest algorithm `{0}` is not supported")]
    Unsupported(String),
    #[error("reading content failed: {0}")]
    Io(#[from] io::Error),
}

impl DigestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unsupported(_) => ErrorClass::TerminalLocal,
            Self::Io(err) if err.kind() == io::ErrorKind::NotFound => ErrorClass::TerminalLocal,
            Self::Io(_) => ErrorClass::Transient,
        }
    }
}

/// Algorithm used for the plain local digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Blake2b256,
}

impl FromStr for DigestAlgorithm {
    type Err = DigestError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "blake2b" | "blake2b-256" => Ok(Self::Blake2b256),
            other => Err(DigestError::Unsupported(other.to_string())),
        }
    }
}

/// Result of digesting one content stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    /// Hex plain digest, local use only.
    pub local: String,
    /// Hex keyed content hash, present when a hash key was supplied.
    pub keyed: Option<String>,
    pub size_bytes: u64,
}

enum LocalHasher {
    Md5(md5::Context),
    Blake2b(Blake2b256),
}

impl LocalHasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Self::Md5(md5::Context::new()),
            DigestAlgorithm::Blake2b256 => Self::Blake2b(Blake2b256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Blake2b(hasher) => Digest::update(hasher, data),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Md5(ctx) => format!("{:x}", ctx.compute()),
            Self::Blake2b(hasher) => hex::encode(Digest::finalize(hasher)),
        }
    }
}

fn keyed_hasher(key: &[u8]) -> Result<KeyedBlake2b256, DigestError> {
    KeyedBlake2b256::new_from_slice(key)
        .map_err(|_| DigestError::Unsupported("keyed blake2b with this key length".into()))
}

/// Digest a byte stream, optionally computing the keyed content hash too.
pub async fn digest_stream<R>(
    mut reader: R,
    algorithm: DigestAlgorithm,
    key: Option<&HashKey>,
) -> Result<ContentDigest, DigestError>
where
    R: AsyncRead + Unpin,
{
    let mut local = LocalHasher::new(algorithm);
    let mut keyed = key.map(|k| keyed_hasher(k.as_bytes())).transpose()?;
    let mut buf = vec![0u8; READ_BUFFER];
    let mut size_bytes = 0u64;

    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        size_bytes += read as u64;
        local.update(&buf[..read]);
        if let Some(mac) = keyed.as_mut() {
            Mac::update(mac, &buf[..read]);
        }
    }

    Ok(ContentDigest {
        local: local.finish(),
        keyed: keyed.map(|mac| hex::encode(mac.finalize().into_bytes())),
        size_bytes,
    })
}

/// Keyed content hash of an in-memory buffer.
#[cfg(test)]
pub fn keyed_hash(key: &HashKey, data: &[u8]) -> Result<String, DigestError> {
    let mut mac = keyed_hasher(key.as_bytes())?;
    Mac::update(&mut mac, data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Keyed BLAKE2b-256 over `parts`, each length-prefixed so boundaries are unambiguous.
pub fn keyed_mac(key: &[u8; 32], parts: &[&[u8]]) -> Result<[u8; 32], DigestError> {
    let mut mac = keyed_hasher(key)?;
    for part in parts {
        Mac::update(&mut mac, &(part.len() as u64).to_le_bytes());
        Mac::update(&mut mac, part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Unkeyed BLAKE2b-256 of a buffer, used for block integrity.
pub fn block_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&Digest::finalize(hasher));
    out
}
