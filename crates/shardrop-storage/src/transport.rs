//! Shard transport: locator naming, bounded retry, per-request timeouts
//!
//! Every storage call is wrapped in `tokio::time::timeout` and retried with a
//! fixed delay up to `RetryPolicy::max_attempts`. Not-found and
//! permission-denied are terminal on the first attempt; everything else
//! (network errors, 5xx, rate limiting, timeouts) is treated as transient.

use opendal::ErrorKind;
use shardrop_core::config::TransferConfig;
use shardrop_core::{Locator, ShardropError, ShardropResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::blob::BlobStore;

/// Smallest body a stored shard can have: 12-byte nonce, one byte of
/// ciphertext, 16-byte tag.
pub const MIN_SHARD_BODY: usize = 29;

/// Retry budget shared by upload, fetch and delete
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (values below 1 act as 1)
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub delay: Duration,
    /// Upper bound on a single storage request
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            delay: Duration::from_millis(cfg.retry_delay_ms),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        }
    }
}

enum Failure {
    Transient(String),
    Terminal(String),
}

fn classify(e: opendal::Error) -> Failure {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => Failure::Terminal(e.to_string()),
        _ => Failure::Transient(e.to_string()),
    }
}

/// Uploads, fetches and deletes encrypted shards in a `BlobStore`.
pub struct ShardTransport<S> {
    store: S,
    folder: String,
    retry: RetryPolicy,
}

impl<S: BlobStore> ShardTransport<S> {
    pub fn new(store: S, folder: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            folder: folder.into().trim_matches('/').to_string(),
            retry,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Storage key for shard `index` of transfer `file_id`: `{folder}/{file_id}/{index:08}`
    pub fn locator_for(&self, file_id: &str, index: u64) -> Locator {
        if self.folder.is_empty() {
            Locator::new(format!("{file_id}/{index:08}"))
        } else {
            Locator::new(format!("{}/{file_id}/{index:08}", self.folder))
        }
    }

    /// Store one encrypted shard. Returns its locator once storage acknowledged it.
    pub async fn upload(&self, file_id: &str, index: u64, body: Vec<u8>) -> ShardropResult<Locator> {
        let locator = self.locator_for(file_id, index);
        let bytes = body.len();
        let store = &self.store;
        let key = locator.as_str();

        self.with_retry(Some(index), "upload", move || {
            let body = body.clone();
            async move { store.put(key, body).await.map_err(classify) }
        })
        .await?;

        debug!(shard = index, bytes, locator = %locator, "shard stored");
        Ok(locator)
    }

    /// Fetch one encrypted shard. Bodies shorter than `MIN_SHARD_BODY` count as
    /// a failed attempt, never as valid (empty) content.
    pub async fn fetch(&self, locator: &Locator, index: u64) -> ShardropResult<Vec<u8>> {
        let store = &self.store;
        let key = locator.as_str();

        let body = self
            .with_retry(Some(index), "fetch", move || async move {
                let body = store.get(key).await.map_err(classify)?;
                if body.len() < MIN_SHARD_BODY {
                    return Err(Failure::Transient(format!(
                        "undersized body ({} bytes, need at least {MIN_SHARD_BODY})",
                        body.len()
                    )));
                }
                Ok(body)
            })
            .await?;

        debug!(shard = index, bytes = body.len(), "shard fetched");
        Ok(body)
    }

    /// Delete one shard. Already-absent objects count as deleted.
    pub async fn delete(&self, locator: &Locator) -> ShardropResult<()> {
        let store = &self.store;
        let key = locator.as_str();

        self.with_retry(None, "delete", move || async move {
            match store.remove(key).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(classify(e)),
            }
        })
        .await
    }

    /// Best-effort delete of every locator; returns the ones that could not be removed.
    pub async fn delete_all(&self, locators: &[Locator]) -> Vec<Locator> {
        let mut failed = Vec::new();
        for locator in locators {
            if let Err(e) = self.delete(locator).await {
                error!(locator = %locator, error = %e, "shard delete failed");
                failed.push(locator.clone());
            }
        }
        failed
    }

    async fn with_retry<T, F, Fut>(
        &self,
        shard: Option<u64>,
        what: &'static str,
        mut attempt_fn: F,
    ) -> ShardropResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let max = self.retry.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=max {
            match tokio::time::timeout(self.retry.request_timeout, attempt_fn()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(Failure::Terminal(msg))) => {
                    return Err(ShardropError::transport(shard, format!("{what} failed: {msg}")));
                }
                Ok(Err(Failure::Transient(msg))) => last = msg,
                Err(_) => {
                    last = format!("timed out after {:?}", self.retry.request_timeout);
                }
            }

            if attempt < max {
                warn!(shard = ?shard, attempt, max_attempts = max, error = %last, "{} failed, retrying", what);
                tokio::time::sleep(self.retry.delay).await;
            }
        }

        Err(ShardropError::transport(
            shard,
            format!("{what} failed after {max} attempts: {last}"),
        ))
    }
}
