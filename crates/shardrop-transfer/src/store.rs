//! Manifest persistence keyed by retrieval code.
//!
//! Two backends are available:
//!   - **JSON file**: re-read before every operation and flushed atomically
//!     via temp+rename after every mutation, so the CLI and the daemon see
//!     each other's writes. Two processes mutating in the same instant can
//!     still lose one update; only the in-process lock is exclusive.
//!   - **Memory**: same semantics, nothing on disk.
//!
//! Uniqueness of retrieval codes is enforced inside `insert_if_absent`, under
//! the store's lock. Callers never check-then-insert.

use shardrop_core::{RetrievalCode, ShardropError, ShardropResult};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::manifest::FileManifest;

/// Document store of manifests.
pub trait ManifestStore: Send + Sync {
    /// Insert unless a record with the same code exists (expired or not).
    /// `Ok(false)` means the code is taken and the caller should re-roll.
    fn insert_if_absent(
        &self,
        manifest: &FileManifest,
    ) -> impl Future<Output = ShardropResult<bool>> + Send;

    /// Raw lookup; expiry is the caller's concern.
    fn find_by_code(
        &self,
        code: &RetrievalCode,
    ) -> impl Future<Output = ShardropResult<Option<FileManifest>>> + Send;

    /// `Ok(false)` if there was nothing to delete.
    fn delete_by_code(
        &self,
        code: &RetrievalCode,
    ) -> impl Future<Output = ShardropResult<bool>> + Send;

    /// Every manifest with `expires_at <= now`.
    fn find_expired(&self, now: u64)
        -> impl Future<Output = ShardropResult<Vec<FileManifest>>> + Send;

    /// Number of stored manifests, live or expired
    fn count(&self) -> impl Future<Output = ShardropResult<usize>> + Send;
}

impl<T: ManifestStore> ManifestStore for Arc<T> {
    async fn insert_if_absent(&self, manifest: &FileManifest) -> ShardropResult<bool> {
        (**self).insert_if_absent(manifest).await
    }

    async fn find_by_code(&self, code: &RetrievalCode) -> ShardropResult<Option<FileManifest>> {
        (**self).find_by_code(code).await
    }

    async fn delete_by_code(&self, code: &RetrievalCode) -> ShardropResult<bool> {
        (**self).delete_by_code(code).await
    }

    async fn find_expired(&self, now: u64) -> ShardropResult<Vec<FileManifest>> {
        (**self).find_expired(now).await
    }

    async fn count(&self) -> ShardropResult<usize> {
        (**self).count().await
    }
}

fn expired_in(entries: &HashMap<String, FileManifest>, now: u64) -> Vec<FileManifest> {
    let mut expired: Vec<FileManifest> = entries
        .values()
        .filter(|m| m.is_expired(now))
        .cloned()
        .collect();
    expired.sort_by_key(|m| m.expires_at);
    expired
}

/// In-memory manifest store
#[derive(Default)]
pub struct MemoryManifestStore {
    entries: Mutex<HashMap<String, FileManifest>>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestStore for MemoryManifestStore {
    async fn insert_if_absent(&self, manifest: &FileManifest) -> ShardropResult<bool> {
        let mut entries = self.entries.lock().await;
        let code = manifest.retrieval_code.as_str();
        if entries.contains_key(code) {
            return Ok(false);
        }
        entries.insert(code.to_string(), manifest.clone());
        Ok(true)
    }

    async fn find_by_code(&self, code: &RetrievalCode) -> ShardropResult<Option<FileManifest>> {
        Ok(self.entries.lock().await.get(code.as_str()).cloned())
    }

    async fn delete_by_code(&self, code: &RetrievalCode) -> ShardropResult<bool> {
        Ok(self.entries.lock().await.remove(code.as_str()).is_some())
    }

    async fn find_expired(&self, now: u64) -> ShardropResult<Vec<FileManifest>> {
        Ok(expired_in(&*self.entries.lock().await, now))
    }

    async fn count(&self) -> ShardropResult<usize> {
        Ok(self.entries.lock().await.len())
    }
}

fn parse(path: &Path, bytes: &[u8]) -> ShardropResult<HashMap<String, FileManifest>> {
    serde_json::from_slice(bytes)
        .map_err(|e| ShardropError::Persistence(format!("parsing {}: {e}", path.display())))
}

/// Manifest store persisted to one JSON document
pub struct JsonManifestStore {
    /// Path to the JSON database on disk
    path: PathBuf,
    /// In-memory map: retrieval code → manifest
    entries: Mutex<HashMap<String, FileManifest>>,
}

impl JsonManifestStore {
    /// Load or create a store at the given path.
    /// If the file doesn't exist, starts empty.
    pub async fn open(path: &Path) -> ShardropResult<Self> {
        let entries = match tokio::fs::read(path).await {
            Ok(bytes) => parse(path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(ShardropError::Persistence(format!(
                    "reading {}: {e}",
                    path.display()
                )))
            }
        };

        tracing::debug!(path = %path.display(), manifests = entries.len(), "manifest store opened");

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    /// Pick up writes made by other processes. A missing file means every
    /// record was removed. Any other read failure fails the operation; the
    /// cached map is never served or flushed in its place.
    async fn refresh(&self, entries: &mut HashMap<String, FileManifest>) -> ShardropResult<()> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => *entries = parse(&self.path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => entries.clear(),
            Err(e) => {
                return Err(ShardropError::Persistence(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomic write: temp file, then rename over the database.
    async fn flush(&self, entries: &HashMap<String, FileManifest>) -> ShardropResult<()> {
        let persist = |what: &str, p: &Path, e: std::io::Error| {
            ShardropError::Persistence(format!("{what} {}: {e}", p.display()))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| persist("creating", parent, e))?;
            }
        }

        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| ShardropError::Persistence(format!("serializing manifests: {e}")))?;

        let tmp = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| persist("writing", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| persist("renaming to", &self.path, e))?;
        Ok(())
    }
}

impl ManifestStore for JsonManifestStore {
    async fn insert_if_absent(&self, manifest: &FileManifest) -> ShardropResult<bool> {
        let mut entries = self.entries.lock().await;
        self.refresh(&mut entries).await?;
        let code = manifest.retrieval_code.as_str().to_string();
        if entries.contains_key(&code) {
            return Ok(false);
        }

        entries.insert(code.clone(), manifest.clone());
        if let Err(e) = self.flush(&entries).await {
            entries.remove(&code);
            return Err(e);
        }
        Ok(true)
    }

    async fn find_by_code(&self, code: &RetrievalCode) -> ShardropResult<Option<FileManifest>> {
        let mut entries = self.entries.lock().await;
        self.refresh(&mut entries).await?;
        Ok(entries.get(code.as_str()).cloned())
    }

    async fn delete_by_code(&self, code: &RetrievalCode) -> ShardropResult<bool> {
        let mut entries = self.entries.lock().await;
        self.refresh(&mut entries).await?;
        let Some(removed) = entries.remove(code.as_str()) else {
            return Ok(false);
        };
        if let Err(e) = self.flush(&entries).await {
            entries.insert(code.as_str().to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    async fn find_expired(&self, now: u64) -> ShardropResult<Vec<FileManifest>> {
        let mut entries = self.entries.lock().await;
        self.refresh(&mut entries).await?;
        Ok(expired_in(&entries, now))
    }

    async fn count(&self) -> ShardropResult<usize> {
        let mut entries = self.entries.lock().await;
        self.refresh(&mut entries).await?;
        Ok(entries.len())
    }
}
