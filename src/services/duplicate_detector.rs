//! Detects content that already exists in the target remote folder.
//!
//! Content hashes are folder-scoped: the candidate is always hashed with the
//! target folder's key, never the key of the folder it came from.

use crate::models::revision::RemoteFileRef;
use crate::services::{
    block_splitter,
    crypto::CryptoProvider,
    digest_service::{self, ContentDigest, DigestAlgorithm},
    failure::PipelineError,
    remote::RemoteDrive,
};
use std::sync::Arc;

/// Outcome of hashing a candidate and looking it up remotely.
#[derive(Debug, Clone)]
pub struct DuplicateCheck {
    pub digest: ContentDigest,
    /// Keyed content hash in the target folder.
    pub content_hash: String,
    pub existing: Option<RemoteFileRef>,
}

#[derive(Clone)]
pub struct DuplicateDetector {
    crypto: Arc<dyn CryptoProvider>,
    remote: Arc<dyn RemoteDrive>,
    algorithm: DigestAlgorithm,
}

impl DuplicateDetector {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        remote: Arc<dyn RemoteDrive>,
        algorithm: DigestAlgorithm,
    ) -> Self {
        Self {
            crypto,
            remote,
            algorithm,
        }
    }

    /// Remote file in `target_folder` whose keyed hash equals `keyed_hash`.
    pub async fn find_existing(
        &self,
        volume_id: &str,
        target_folder: &str,
        keyed_hash: &str,
    ) -> Result<Option<RemoteFileRef>, PipelineError> {
        Ok(self
            .remote
            .find_by_hash(volume_id, target_folder, keyed_hash)
            .await?)
    }

    /// Plain local digest of `source_uri` with the configured algorithm.
    pub async fn local_digest(&self, source_uri: &str) -> Result<String, PipelineError> {
        let source = block_splitter::open_source(source_uri).await?;
        let digest = digest_service::digest_stream(source, self.algorithm, None).await?;
        Ok(digest.local)
    }

    /// Hash `source_uri` with the target folder's key and look it up.
    pub async fn check(
        &self,
        volume_id: &str,
        target_folder: &str,
        source_uri: &str,
    ) -> Result<DuplicateCheck, PipelineError> {
        let key = self.crypto.folder_hash_key(volume_id, target_folder).await?;
        let source = block_splitter::open_source(source_uri).await?;
        let digest = digest_service::digest_stream(source, self.algorithm, Some(&key)).await?;

        let Some(content_hash) = digest.keyed.clone() else {
            return Err(PipelineError::Validation(
                "keyed content hash missing".into(),
            ));
        };
        let existing = self
            .find_existing(volume_id, target_folder, &content_hash)
            .await?;
        if let Some(found) = &existing {
            tracing::debug!(
                link_id = %found.link_id,
                target_folder,
                "content already present remotely"
            );
        }
        Ok(DuplicateCheck {
            digest,
            content_hash,
            existing,
        })
    }
}
