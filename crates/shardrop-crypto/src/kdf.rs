//! Key derivation: PBKDF2-HMAC-SHA256 password + salt → shard key

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit shard encryption key derived from the sharing password.
///
/// Never persisted; re-derived from `(password, key_salt)` on retrieval.
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct ShardKey {
    bytes: [u8; KEY_SIZE],
}

impl ShardKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ShardKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters. Recorded in every manifest so the recipient derives
/// with exactly what the uploader used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// HMAC-SHA256 rounds (default: 100 000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: 100_000,
        }
    }
}

/// Derive a 256-bit shard key from a password and salt using PBKDF2-HMAC-SHA256.
///
/// Pure function of its inputs: the same `(password, salt, params)` yields the
/// same key on any machine.
pub fn derive_shard_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<ShardKey, CryptoError> {
    if params.iterations == 0 {
        return Err(CryptoError::Kdf("iteration count must be non-zero".into()));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        params.iterations,
        &mut key,
    );

    Ok(ShardKey::from_bytes(key))
}

/// Fresh random salt for a new upload.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub fn salt_to_hex(salt: &[u8; SALT_SIZE]) -> String {
    hex::encode(salt)
}

pub fn salt_from_hex(s: &str) -> Result<[u8; SALT_SIZE], CryptoError> {
    let bytes = hex::decode(s).map_err(|e| CryptoError::Encoding(format!("key salt: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        CryptoError::Encoding(format!(
            "key salt must be {SALT_SIZE} bytes, got {}",
            b.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Use fast params for testing
    const FAST: KdfParams = KdfParams { iterations: 1000 };

    #[test]
    fn test_kdf_deterministic() {
        let password = SecretString::from("correcthorse");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_shard_key(&password, &salt, &FAST).unwrap();
        let key2 = derive_shard_key(&password, &salt, &FAST).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passwords() {
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_shard_key(&SecretString::from("password-a"), &salt, &FAST).unwrap();
        let key2 = derive_shard_key(&SecretString::from("password-b"), &salt, &FAST).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let password = SecretString::from("same-password");

        let key1 = derive_shard_key(&password, &[1u8; SALT_SIZE], &FAST).unwrap();
        let key2 = derive_shard_key(&password, &[2u8; SALT_SIZE], &FAST).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_iterations_matter() {
        let password = SecretString::from("same-password");
        let salt = [7u8; SALT_SIZE];

        let key1 = derive_shard_key(&password, &salt, &KdfParams { iterations: 1000 }).unwrap();
        let key2 = derive_shard_key(&password, &salt, &KdfParams { iterations: 1001 }).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_zero_iterations_rejected() {
        let result = derive_shard_key(
            &SecretString::from("pw"),
            &[0u8; SALT_SIZE],
            &KdfParams { iterations: 0 },
        );
        assert!(matches!(result, Err(CryptoError::Kdf(_))));
    }

    #[test]
    fn test_salt_hex_roundtrip() {
        let salt = generate_salt();
        let hex = salt_to_hex(&salt);
        assert_eq!(hex.len(), SALT_SIZE * 2);
        assert_eq!(salt_from_hex(&hex).unwrap(), salt);
    }

    #[test]
    fn test_salt_hex_rejects_wrong_length() {
        assert!(salt_from_hex("abcd").is_err());
        assert!(salt_from_hex("zz").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = ShardKey::from_bytes([0x42; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("66"));
    }
}
