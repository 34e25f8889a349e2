//! shardrop-crypto: client-side encryption for shared files
//!
//! Architecture: Split-then-Encrypt with ChaCha20-Poly1305
//!
//! Pipeline: plaintext → fixed-size shard → encrypt (fresh nonce) → upload
//!
//! Key material:
//! ```text
//! password ──PBKDF2-HMAC-SHA256(key_salt, iterations)──▶ Shard Key (256-bit, never stored)
//!   └── Shard AEAD: ChaCha20-Poly1305 (nonce=random 96-bit,
//!                   AAD="shardrop-v1"||file_id||shard_index||shard_count)
//! password ──Argon2id(PHC salt)──▶ access secret (stored, gates retrieval)
//! ```

pub mod access;
pub mod error;
pub mod kdf;
pub mod shard;

pub use access::{hash_access_secret, verify_access_secret, AccessParams};
pub use error::CryptoError;
pub use kdf::{derive_shard_key, generate_salt, salt_from_hex, salt_to_hex, KdfParams, ShardKey};
pub use shard::{decrypt_shard, encrypt_shard, ShardAad};

/// Size of a shard key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the per-file key salt
pub const SALT_SIZE: usize = 16;

/// Size of the per-transfer file identifier bound into every shard
pub const FILE_ID_SIZE: usize = 16;

/// Bytes added to every shard on the wire (nonce + tag)
pub const SHARD_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
