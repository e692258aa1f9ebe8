//! Key material and block encryption.
//!
//! The pipeline only talks to the [`CryptoProvider`] trait. [`LocalKeyring`]
//! is the implementation used by the daemon: every key is derived from one
//! 32-byte master key kept in a key file.

use crate::models::revision::CipherBlock;
use crate::services::{
    digest_service::{self, DigestError},
    failure::ErrorClass,
};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use rand::RngCore;
use std::{fmt, io::ErrorKind, path::Path};
use thiserror::Error;
use tokio::fs;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes a sealed block carries on top of its plaintext.
pub const CIPHER_OVERHEAD: u64 = (NONCE_LEN + TAG_LEN) as u64;

/// Per-folder key for keyed content hashes.
#[derive(Clone, PartialEq, Eq)]
pub struct HashKey([u8; 32]);

impl HashKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HashKey(..)")
    }
}

/// Identifies the revision a block is encrypted for.
#[derive(Debug, Clone)]
pub struct EncryptionContext {
    pub volume_id: String,
    pub link_id: String,
    pub revision_id: String,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("hash key for folder `{folder_id}` in volume `{volume_id}` is not available")]
    FolderKeyUnavailable { volume_id: String, folder_id: String },
    #[error("block encryption failed: {0}")]
    EncryptionFailure(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("key file: {0}")]
    KeyFile(String),
}

impl CryptoError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::FolderKeyUnavailable { .. } => ErrorClass::Conditional,
            Self::EncryptionFailure(_) | Self::Signing(_) => ErrorClass::Transient,
            Self::KeyFile(_) => ErrorClass::TerminalLocal,
        }
    }
}

impl From<DigestError> for CryptoError {
    fn from(err: DigestError) -> Self {
        Self::Signing(err.to_string())
    }
}

#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Hash key of `folder_id`; fails with `FolderKeyUnavailable` while the
    /// folder's key material cannot be obtained.
    async fn folder_hash_key(&self, volume_id: &str, folder_id: &str)
    -> Result<HashKey, CryptoError>;

    /// Encrypt and sign one block. Each call is independent of every other block.
    async fn encrypt_block(
        &self,
        index: u32,
        plaintext: &[u8],
        ctx: &EncryptionContext,
    ) -> Result<CipherBlock, CryptoError>;

    /// Sign the ordered list of block hashes of a revision.
    async fn sign_manifest(
        &self,
        ctx: &EncryptionContext,
        block_hashes: &[String],
    ) -> Result<String, CryptoError>;
}

/// Keyring deriving all keys from a master key.
pub struct LocalKeyring {
    master: [u8; 32],
}

impl LocalKeyring {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    /// Load the hex master key at `path`, creating a random one if missing.
    pub async fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        match fs::read_to_string(path).await {
            Ok(text) => {
                let raw = hex::decode(text.trim())
                    .map_err(|e| CryptoError::KeyFile(format!("{}: {e}", path.display())))?;
                let master: [u8; 32] = raw.try_into().map_err(|_| {
                    CryptoError::KeyFile(format!("{}: expected 32 bytes", path.display()))
                })?;
                Ok(Self::new(master))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let mut master = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut master);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
                }
                fs::write(path, hex::encode(master))
                    .await
                    .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
                tracing::info!("generated new master key at {}", path.display());
                Ok(Self::new(master))
            }
            Err(err) => Err(CryptoError::KeyFile(err.to_string())),
        }
    }

    fn derive(&self, purpose: &str, parts: &[&str]) -> Result<[u8; 32], CryptoError> {
        let mut input: Vec<&[u8]> = vec![purpose.as_bytes()];
        input.extend(parts.iter().map(|p| p.as_bytes()));
        Ok(digest_service::keyed_mac(&self.master, &input)?)
    }

    fn sign(&self, ctx: &EncryptionContext, message: &[&[u8]]) -> Result<String, CryptoError> {
        let key = self.derive("signing", &[&ctx.volume_id, &ctx.link_id])?;
        let sig = digest_service::keyed_mac(&key, message)?;
        Ok(general_purpose::STANDARD.encode(sig))
    }
}

#[async_trait]
impl CryptoProvider for LocalKeyring {
    async fn folder_hash_key(
        &self,
        volume_id: &str,
        folder_id: &str,
    ) -> Result<HashKey, CryptoError> {
        Ok(HashKey::from_bytes(
            self.derive("folder-hash", &[volume_id, folder_id])?,
        ))
    }

    async fn encrypt_block(
        &self,
        index: u32,
        plaintext: &[u8],
        ctx: &EncryptionContext,
    ) -> Result<CipherBlock, CryptoError> {
        let key = self.derive("content", &[&ctx.volume_id, &ctx.link_id])?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::EncryptionFailure(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let aad = format!("{}:{}", ctx.revision_id, index);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| CryptoError::EncryptionFailure(format!("AES-GCM encrypt: {e}")))?;

        // [12-byte nonce][ciphertext with appended 16-byte tag]
        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&sealed);

        let digest = digest_service::block_digest(&ciphertext);
        let signature = self.sign(ctx, &[&digest])?;
        Ok(CipherBlock {
            index,
            ciphertext: Bytes::from(ciphertext),
            hash: general_purpose::STANDARD.encode(digest),
            signature,
        })
    }

    async fn sign_manifest(
        &self,
        ctx: &EncryptionContext,
        block_hashes: &[String],
    ) -> Result<String, CryptoError> {
        let mut message: Vec<&[u8]> = vec![ctx.revision_id.as_bytes()];
        message.extend(block_hashes.iter().map(|h| h.as_bytes()));
        self.sign(ctx, &message)
    }
}
