//! FileManifest: the persisted record for one shared file.
//!
//! JSON-encoded. Carries everything retrieval needs except the password: the
//! PBKDF2 salt and parameters, the per-transfer file id bound into every
//! shard's associated data, and the ordered shard locators.

use serde::{Deserialize, Serialize};
use shardrop_core::{Locator, RetrievalCode, ShardropError, ShardropResult};
use shardrop_crypto::{salt_from_hex, KdfParams, FILE_ID_SIZE, SALT_SIZE};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Current Unix time in seconds
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A manifest describing one shared file's shards and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileManifest {
    /// Manifest format version
    pub version: u32,
    /// Six-digit code the recipient types
    pub retrieval_code: RetrievalCode,
    /// Argon2id PHC string of the access password
    pub access_secret: String,
    /// PBKDF2 salt (hex)
    pub key_salt: String,
    /// PBKDF2 parameters used by the uploader
    pub kdf: KdfParams,
    /// Random per-transfer id (hex), bound into each shard's AAD
    pub file_id: String,
    /// Plaintext bytes per shard
    pub shard_size: u64,
    /// Plaintext length of the whole file
    pub original_size: u64,
    /// BLAKE3 of the whole plaintext (hex)
    pub content_hash: String,
    /// Ordered shard locators; index in this list is the shard index
    pub shard_locators: Vec<Locator>,
    pub original_name: String,
    pub mime_type: String,
    /// Unix timestamp when the manifest was committed
    pub created_at: u64,
    /// Unix timestamp after which the manifest is treated as gone
    pub expires_at: u64,
}

impl FileManifest {
    pub fn from_bytes(data: &[u8]) -> ShardropResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ShardropError::Persistence(format!("parsing manifest: {e}")))
    }

    pub fn to_bytes(&self) -> ShardropResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ShardropError::Persistence(format!("serializing manifest: {e}")))
    }

    pub fn shard_count(&self) -> u64 {
        self.shard_locators.len() as u64
    }

    /// Expired manifests are indistinguishable from missing ones.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn salt_bytes(&self) -> ShardropResult<[u8; SALT_SIZE]> {
        salt_from_hex(&self.key_salt).map_err(|e| self.corrupt(e.to_string()))
    }

    pub fn file_id_bytes(&self) -> ShardropResult<[u8; FILE_ID_SIZE]> {
        let bytes = hex::decode(&self.file_id).map_err(|e| self.corrupt(format!("file id: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| self.corrupt(format!("file id must be {FILE_ID_SIZE} bytes")))
    }

    /// Structural checks run before a manifest is trusted for retrieval.
    pub fn validate(&self) -> ShardropResult<()> {
        if self.shard_locators.is_empty() {
            return Err(self.corrupt("no shard locators".into()));
        }
        if self.shard_size == 0 || self.original_size == 0 {
            return Err(self.corrupt("zero shard size or file size".into()));
        }
        let expected = self.original_size.div_ceil(self.shard_size);
        if expected != self.shard_count() {
            return Err(self.corrupt(format!(
                "{} locators for {} bytes in {}-byte shards (expected {expected})",
                self.shard_count(),
                self.original_size,
                self.shard_size
            )));
        }
        self.salt_bytes()?;
        self.file_id_bytes()?;
        Ok(())
    }

    /// Base name safe to create in a local directory; falls back to `download`.
    ///
    /// `original_name` is stored as the uploader sent it. Anything that could
    /// climb out of the destination directory is stripped here.
    pub fn safe_file_name(&self) -> String {
        let base = self
            .original_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
        match cleaned.as_str() {
            "" | "." | ".." => "download".to_string(),
            _ => cleaned,
        }
    }

    fn corrupt(&self, detail: String) -> ShardropError {
        ShardropError::Persistence(format!(
            "manifest {} is corrupt: {detail}",
            self.retrieval_code
        ))
    }
}
