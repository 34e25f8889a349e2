//! shardrop-storage: OpenDAL storage abstraction + shard transport
//!
//! `BlobStore` is the seam between the transfer engine and object storage.
//! `ShardTransport` layers locator naming, bounded retry and per-request
//! timeouts on top of any `BlobStore`.

pub mod blob;
pub mod health;
pub mod operator;
pub mod transport;

pub use blob::BlobStore;
pub use health::{check_health, is_healthy};
pub use operator::{build_from_core_config, build_s3_operator, S3Config, StorageCredentials};
pub use transport::{RetryPolicy, ShardTransport, MIN_SHARD_BODY};
