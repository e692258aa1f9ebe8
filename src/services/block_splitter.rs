//! Splitting sources into bounded blocks and encrypting them.
//!
//! Blocks are 1-indexed and encrypted independently, so resuming a partial
//! transfer never touches a block that was already confirmed.

use crate::models::revision::CipherBlock;
use crate::services::{
    crypto::{CIPHER_OVERHEAD, CryptoError, CryptoProvider, EncryptionContext},
    failure::ErrorClass,
};
use bytes::Bytes;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

/// Share of the advertised maximum block size usable for plaintext; the
/// rest is headroom for encryption expansion.
pub const BLOCK_SIZE_PERCENT: u64 = 90;

/// Smallest advertised maximum whose headroom still fits the cipher overhead.
pub const MIN_DECLARED_BLOCK_SIZE: u64 = CIPHER_OVERHEAD * 100 / (100 - BLOCK_SIZE_PERCENT);

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("source `{uri}` is unreadable: {source}")]
    SourceUnreadable {
        uri: String,
        #[source]
        source: io::Error,
    },
    #[error("source `{uri}` changed after it was hashed")]
    SourceChanged { uri: String },
    #[error(transparent)]
    Encryption(#[from] CryptoError),
    #[error("block i/o: {0}")]
    Io(#[from] io::Error),
}

impl BlockError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SourceUnreadable { .. } | Self::SourceChanged { .. } => ErrorClass::TerminalLocal,
            Self::Encryption(err) => err.class(),
            Self::Io(_) => ErrorClass::Transient,
        }
    }
}

/// One plaintext block before encryption.
#[derive(Debug, Clone)]
pub struct PlaintextBlock {
    /// 1-based sequence index.
    pub index: u32,
    pub data: Bytes,
}

/// Plaintext block size for an advertised maximum (never zero).
pub fn effective_block_size(declared_max: u64) -> u64 {
    (declared_max * BLOCK_SIZE_PERCENT / 100).max(1)
}

/// Number of blocks needed for `size_bytes`; an empty source has none.
pub fn block_count(size_bytes: u64, block_size: u64) -> u32 {
    size_bytes.div_ceil(block_size.max(1)) as u32
}

/// Local path of a source URI (`file://` or a plain path).
pub fn source_path(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

/// Open a source, reporting a vanished or forbidden file as unreadable.
pub async fn open_source(uri: &str) -> Result<File, BlockError> {
    File::open(source_path(uri)).await.map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => BlockError::SourceUnreadable {
            uri: uri.to_string(),
            source: err,
        },
        _ => BlockError::Io(err),
    })
}

/// Streams blocks out of a source file and encrypts them one at a time.
#[derive(Clone)]
pub struct BlockSplitter {
    crypto: Arc<dyn CryptoProvider>,
    block_size: u64,
}

impl BlockSplitter {
    pub fn new(crypto: Arc<dyn CryptoProvider>, declared_max: u64) -> Self {
        Self {
            crypto,
            block_size: effective_block_size(declared_max),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Current size of the source and its block count.
    pub async fn plan(&self, uri: &str) -> Result<(u64, u32), BlockError> {
        let file = open_source(uri).await?;
        let size = file.metadata().await?.len();
        Ok((size, block_count(size, self.block_size)))
    }

    /// Read plaintext block `index` (1-based) of a source.
    pub async fn read_block(&self, uri: &str, index: u32) -> Result<PlaintextBlock, BlockError> {
        let mut file = open_source(uri).await?;
        let offset = u64::from(index.saturating_sub(1)) * self.block_size;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut data = Vec::with_capacity(self.block_size as usize);
        (&mut file).take(self.block_size).read_to_end(&mut data).await?;
        if data.is_empty() {
            return Err(BlockError::SourceUnreadable {
                uri: uri.to_string(),
                source: io::Error::new(ErrorKind::UnexpectedEof, format!("block {index} past end")),
            });
        }
        Ok(PlaintextBlock {
            index,
            data: Bytes::from(data),
        })
    }

    pub async fn encrypt(
        &self,
        block: &PlaintextBlock,
        ctx: &EncryptionContext,
    ) -> Result<CipherBlock, BlockError> {
        Ok(self.crypto.encrypt_block(block.index, &block.data, ctx).await?)
    }

    /// Read and encrypt block `index` of a source.
    pub async fn encrypt_from_source(
        &self,
        uri: &str,
        index: u32,
        ctx: &EncryptionContext,
    ) -> Result<CipherBlock, BlockError> {
        let block = self.read_block(uri, index).await?;
        self.encrypt(&block, ctx).await
    }
}
