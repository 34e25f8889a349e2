//! OpenDAL Operator factory for shardrop storage backends
//!
//! Only `LoggingLayer` is applied. Retries belong to `ShardTransport`, and no
//! caching layer may sit in front of shard fetches.

use anyhow::{Context, Result};
use opendal::Operator;

use shardrop_core::config::StorageConfig;

/// Object-storage credentials, loaded by the binaries at startup and injected here
#[derive(Clone)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

impl StorageCredentials {
    /// Read credentials from `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`,
    /// falling back to `SHARDROP_ACCESS_KEY_ID`/`SHARDROP_SECRET_ACCESS_KEY`.
    ///
    /// Returns `None` unless both halves are set.
    pub fn from_env() -> Option<Self> {
        let var = |primary: &str, fallback: &str| {
            std::env::var(primary)
                .or_else(|_| std::env::var(fallback))
                .ok()
                .filter(|v| !v.is_empty())
        };
        Some(Self {
            access_key_id: var("AWS_ACCESS_KEY_ID", "SHARDROP_ACCESS_KEY_ID")?,
            secret_access_key: var("AWS_SECRET_ACCESS_KEY", "SHARDROP_SECRET_ACCESS_KEY")?,
        })
    }
}

/// Minimal config needed to build an S3 operator
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub credentials: StorageCredentials,
}

/// Build an OpenDAL Operator for any S3-compatible endpoint
///
/// Uses path-style addressing (default in opendal 0.55), which MinIO and
/// SeaweedFS require.
pub fn build_s3_operator(cfg: &S3Config) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.credentials.access_key_id)
        .secret_access_key(&cfg.credentials.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();

    Ok(op)
}

/// Build an operator for the configured backend (`s3`, `fs` or `memory`).
///
/// For `s3`, credentials are required. If `enforce_tls` is true and the
/// endpoint uses HTTP, this returns an error; otherwise a warning is logged
/// for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &StorageConfig,
    credentials: Option<&StorageCredentials>,
) -> Result<Operator> {
    match storage.backend.as_str() {
        "s3" => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        storage.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP, credentials are transmitted unencrypted. \
                     Set storage.enforce_tls = true and use HTTPS in production."
                );
            }

            let credentials = credentials
                .cloned()
                .context("s3 backend needs credentials (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)")?;

            build_s3_operator(&S3Config {
                endpoint: storage.endpoint.clone(),
                region: storage.region.clone(),
                bucket: storage.bucket.clone(),
                credentials,
            })
        }
        "fs" => {
            let root = storage
                .root
                .to_str()
                .with_context(|| format!("fs root is not UTF-8: {}", storage.root.display()))?;
            let op = Operator::new(opendal::services::Fs::default().root(root))
                .context("creating OpenDAL fs operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish();
            Ok(op)
        }
        "memory" => {
            tracing::warn!("memory storage backend: shards are lost when the process exits");
            let op = Operator::new(opendal::services::Memory::default())
                .context("creating OpenDAL memory operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish();
            Ok(op)
        }
        other => anyhow::bail!("unknown storage backend '{other}'"),
    }
}
