//! shardrop-chunks: fixed-size sharding and BLAKE3 content hashing
//!
//! # Overview
//! - `fixed`: shard planning (`ceil(len / shard_size)` pieces, never an empty
//!   trailing shard) and a streaming reader that yields one shard at a time
//! - `blake3`: whole-file content hashing, verified after reassembly

pub mod blake3;
pub mod fixed;

// Convenience re-exports for the most common operations
pub use blake3::{hash_bytes, hash_from_hex, hash_to_hex, ContentHasher, Hash};
pub use fixed::{split_slice, ShardPlan, ShardReader};
