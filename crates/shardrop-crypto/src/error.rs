use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Authentication failed: wrong key, tampered bytes, or wrong shard position
    #[error("shard authentication failed: wrong password, corrupted data, or misplaced shard")]
    Integrity,

    #[error("encrypted shard too short: {len} bytes (minimum {min})")]
    Truncated { len: usize, min: usize },

    #[error("shard encryption failed")]
    Encrypt,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("access secret error: {0}")]
    Access(String),

    #[error("invalid encoding: {0}")]
    Encoding(String),
}
