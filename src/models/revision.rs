//! Types exchanged with the remote drive when committing file content.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Reference to a file that already exists remotely.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoteFileRef {
    pub volume_id: String,
    pub parent_id: String,
    pub link_id: String,
    pub name: String,
}

/// A remote link with a draft revision, either freshly created or added
/// to a file that already has an active revision.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Draft {
    pub link_id: String,
    pub revision_id: String,
    /// Client uid the draft was created with.
    pub client_uid: String,
}

/// An encrypted block ready for transfer.
#[derive(Clone, Debug)]
pub struct CipherBlock {
    pub index: u32,
    pub ciphertext: Bytes,
    pub hash: String,
    pub signature: String,
}

/// One block of a revision as known by the remote.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RevisionBlock {
    pub index: u32,
    pub url: String,
    pub hash: String,
    pub signature: String,
}

/// Remote lifecycle of a revision.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RevisionState {
    Draft,
    Active,
    /// Replaced by a newer active revision of the same link.
    Obsolete,
}

/// The server-side container of blocks for one version of a file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Revision {
    pub revision_id: String,
    pub link_id: String,
    pub state: RevisionState,
    pub blocks: Vec<RevisionBlock>,
    pub manifest_signature: Option<String>,
}

impl Revision {
    /// Complete once indices `1..=expected` all carry a hash and a manifest
    /// signature covers them.
    pub fn is_complete(&self, expected: u32) -> bool {
        if self.manifest_signature.is_none() || self.blocks.len() != expected as usize {
            return false;
        }
        let mut indices: Vec<u32> = self.blocks.iter().map(|b| b.index).collect();
        indices.sort_unstable();
        indices
            .iter()
            .enumerate()
            .all(|(pos, idx)| *idx == pos as u32 + 1)
            && self.blocks.iter().all(|b| !b.hash.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(index: u32) -> RevisionBlock {
        RevisionBlock {
            index,
            url: format!("blocks/{index}"),
            hash: format!("h{index}"),
            signature: "sig".into(),
        }
    }

    fn revision(blocks: Vec<RevisionBlock>, signed: bool) -> Revision {
        Revision {
            revision_id: "rev".into(),
            link_id: "link".into(),
            state: RevisionState::Draft,
            blocks,
            manifest_signature: signed.then(|| "manifest".to_string()),
        }
    }

    #[test]
    fn complete_requires_contiguous_indices_and_signature() {
        assert!(revision(vec![block(2), block(1), block(3)], true).is_complete(3));
        assert!(!revision(vec![block(1), block(3)], true).is_complete(2));
        assert!(!revision(vec![block(1), block(2)], false).is_complete(2));
        assert!(!revision(vec![block(1)], true).is_complete(2));
    }

    #[test]
    fn empty_revision_is_complete_when_signed() {
        assert!(revision(Vec::new(), true).is_complete(0));
    }
}
