//! Access secret: salted Argon2id hash of the sharing password (PHC string)
//!
//! Gates retrieval before any shard is fetched. Independent of the shard key:
//! it uses its own salt and algorithm, so the stored hash reveals nothing
//! about the PBKDF2 output.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CryptoError;

/// Argon2id parameters for newly hashed access secrets.
///
/// Verification reads the parameters back out of the stored PHC string.
#[derive(Debug, Clone)]
pub struct AccessParams {
    /// Memory cost in KiB (default: 19456 = 19 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 2)
    pub time_cost: u32,
    /// Parallelism (default: 1)
    pub parallelism: u32,
}

impl Default for AccessParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 19_456,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Hash a password into a self-describing `$argon2id$...` string.
pub fn hash_access_secret(
    password: &SecretString,
    params: &AccessParams,
) -> Result<String, CryptoError> {
    let argon2_params = Params::new(params.mem_cost_kib, params.time_cost, params.parallelism, None)
        .map_err(|e| CryptoError::Access(format!("invalid Argon2id params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| CryptoError::Access(format!("salt encoding: {e}")))?;

    let hash = argon2
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map_err(|e| CryptoError::Access(format!("Argon2id hash failed: {e}")))?;
    Ok(hash.to_string())
}

/// Check a password against a stored access secret.
///
/// `Ok(false)` on mismatch; `Err` only when the stored digest is unreadable.
pub fn verify_access_secret(password: &SecretString, digest: &str) -> Result<bool, CryptoError> {
    let parsed = PasswordHash::new(digest)
        .map_err(|e| CryptoError::Access(format!("malformed access secret: {e}")))?;

    match Argon2::default().verify_password(password.expose_secret().as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(CryptoError::Access(format!("verification failed: {e}"))),
    }
}
