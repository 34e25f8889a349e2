//! shardrop-transfer: sharded encrypted upload and retrieval
//!
//! Upload: validate password → derive key → for each shard: encrypt → upload
//! (retry) → collect locators in shard order → hash access secret → commit
//! manifest under a fresh retrieval code.
//!
//! Retrieval: look up code → verify access secret → re-derive key → for each
//! locator in order: fetch → decrypt → append → verify content hash.
//!
//! The manifest is the last thing written. Any failure before that deletes the
//! shards already stored for the transfer.

pub mod cleanup;
pub mod engine;
pub mod manifest;
pub mod store;

pub use cleanup::{sweep_expired, SweepReport};
pub use engine::{
    ProgressFn, RetrievedFile, RetrievedMeta, TransferEngine, TransferSettings, UploadReceipt,
    UploadSource,
};
pub use manifest::{now_secs, FileManifest, MANIFEST_VERSION};
pub use store::{JsonManifestStore, ManifestStore, MemoryManifestStore};
