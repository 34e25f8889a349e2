use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ShardropError, ShardropResult};

/// Largest shard a deployment may configure (512 MiB)
pub const MAX_SHARD_SIZE: u64 = 512 * 1024 * 1024;

/// Floor for the PBKDF2 iteration count accepted from config
pub const MIN_PBKDF2_ITERATIONS: u32 = 10_000;

/// Top-level configuration (loaded from shardrop.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardropConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub crypto: CryptoConfig,
    pub manifest: ManifestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Seconds between expiry sweeps (default: 3600)
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind: "s3", "fs", or "memory"
    pub backend: String,
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Key prefix under which shard objects are stored
    pub folder: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Plaintext bytes per shard (default: 10 MiB)
    pub shard_size: u64,
    /// Shards in flight per transfer (1 = strictly sequential)
    pub concurrency: usize,
    /// Attempts per shard upload/fetch before the transfer is aborted
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Timeout for a single storage request, in seconds
    pub request_timeout_secs: u64,
    /// Minimum password length accepted for uploads
    pub min_password_len: usize,
    /// Lifetime of a shared file, in seconds (default: 24h)
    pub ttl_secs: u64,
    /// Retrieval-code rolls before giving up on a unique code
    pub code_attempts: u32,
}

/// Password-based crypto parameters for new uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iterations for the shard key
    pub pbkdf2_iterations: u32,
    /// Argon2id memory cost in KiB for the access secret
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost for the access secret
    pub argon2_time_cost: u32,
    /// Argon2id parallelism for the access secret
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// JSON manifest database path
    pub path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "json".into(),
            sweep_interval_secs: 3600,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "s3".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "shardrop".into(),
            root: PathBuf::from("/var/lib/shardrop/blobs"),
            folder: "shards".into(),
            enforce_tls: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            shard_size: 10 * 1024 * 1024,
            concurrency: 1,
            max_attempts: 3,
            retry_delay_ms: 1000,
            request_timeout_secs: 60,
            min_password_len: 8,
            ttl_secs: 24 * 60 * 60,
            code_attempts: 32,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 100_000,
            argon2_mem_cost_kib: 19_456,
            argon2_time_cost: 2,
            argon2_parallelism: 1,
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/shardrop/manifests.json"),
        }
    }
}

impl ShardropConfig {
    /// Reject values that would make transfers unsafe or impossible.
    pub fn validate(&self) -> ShardropResult<()> {
        let t = &self.transfer;
        if t.shard_size == 0 || t.shard_size > MAX_SHARD_SIZE {
            return Err(ShardropError::Config(format!(
                "transfer.shard_size must be in 1..={MAX_SHARD_SIZE}, got {}",
                t.shard_size
            )));
        }
        if t.max_attempts == 0 {
            return Err(ShardropError::Config(
                "transfer.max_attempts must be at least 1".into(),
            ));
        }
        if t.code_attempts == 0 {
            return Err(ShardropError::Config(
                "transfer.code_attempts must be at least 1".into(),
            ));
        }
        if self.crypto.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(ShardropError::Config(format!(
                "crypto.pbkdf2_iterations must be at least {MIN_PBKDF2_ITERATIONS}"
            )));
        }
        match self.storage.backend.as_str() {
            "s3" | "fs" | "memory" => {}
            other => {
                return Err(ShardropError::Config(format!(
                    "unknown storage.backend '{other}' (expected s3, fs, or memory)"
                )))
            }
        }
        if !matches!(self.daemon.log_format.as_str(), "json" | "text") {
            tracing::warn!(format = %self.daemon.log_format, "unknown log_format, using text");
        }
        Ok(())
    }

    /// In-flight shard count, clamped to 1..=8
    pub fn effective_concurrency(&self) -> usize {
        self.transfer.concurrency.clamp(1, 8)
    }
}
