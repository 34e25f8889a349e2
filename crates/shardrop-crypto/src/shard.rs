//! Per-shard ChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted shard format (binary, exactly what is uploaded):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = "shardrop-v1" || file_id (16 bytes) || shard_index (8 bytes, BE) || shard_count (8 bytes, BE)
//! ```
//!
//! The AAD binds each shard to its file, its position, and the total shard
//! count. Reordered locators, shards borrowed from another file, and a
//! truncated locator list all fail authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::error::CryptoError;
use crate::kdf::ShardKey;
use crate::{FILE_ID_SIZE, NONCE_SIZE, SHARD_OVERHEAD};

const AAD_DOMAIN: &[u8] = b"shardrop-v1";

/// Position of a shard within its file; authenticated but not transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardAad {
    pub file_id: [u8; FILE_ID_SIZE],
    pub index: u64,
    pub count: u64,
}

impl ShardAad {
    pub fn new(file_id: [u8; FILE_ID_SIZE], index: u64, count: u64) -> Self {
        Self {
            file_id,
            index,
            count,
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(AAD_DOMAIN.len() + FILE_ID_SIZE + 16);
        aad.extend_from_slice(AAD_DOMAIN);
        aad.extend_from_slice(&self.file_id);
        aad.extend_from_slice(&self.index.to_be_bytes());
        aad.extend_from_slice(&self.count.to_be_bytes());
        aad
    }
}

/// Encrypt a single shard with a fresh random nonce.
///
/// Returns: `[12-byte nonce][ciphertext][16-byte tag]`
pub fn encrypt_shard(key: &ShardKey, aad: ShardAad, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = aad.to_bytes();
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a single shard.
///
/// Input: `[12-byte nonce][ciphertext][16-byte tag]`. Either the whole
/// plaintext comes back or nothing does.
pub fn decrypt_shard(key: &ShardKey, aad: ShardAad, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wire.len() < SHARD_OVERHEAD {
        return Err(CryptoError::Truncated {
            len: wire.len(),
            min: SHARD_OVERHEAD,
        });
    }

    let (nonce_bytes, ciphertext) = wire.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let aad = aad.to_bytes();
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::Integrity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use proptest::prelude::*;

    fn key(b: u8) -> ShardKey {
        ShardKey::from_bytes([b; KEY_SIZE])
    }

    fn aad(index: u64, count: u64) -> ShardAad {
        ShardAad::new([0xAB; FILE_ID_SIZE], index, count)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key(1);
        let plaintext = b"hello, sharded world!";

        let encrypted = encrypt_shard(&k, aad(0, 1), plaintext).unwrap();
        let decrypted = decrypt_shard(&k, aad(0, 1), &encrypted).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_wire_layout() {
        let k = key(1);
        let plaintext = vec![0u8; 1000];

        let encrypted = encrypt_shard(&k, aad(0, 1), &plaintext).unwrap();

        // nonce (12) + plaintext (1000) + tag (16) = 1028
        assert_eq!(encrypted.len(), 12 + 1000 + 16);
        assert_eq!(encrypted.len(), plaintext.len() + SHARD_OVERHEAD);
    }

    #[test]
    fn test_nonces_are_fresh() {
        let k = key(1);
        let a = encrypt_shard(&k, aad(0, 1), b"same").unwrap();
        let b = encrypt_shard(&k, aad(0, 1), b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let encrypted = encrypt_shard(&key(1), aad(0, 1), b"secret data").unwrap();
        let result = decrypt_shard(&key(2), aad(0, 1), &encrypted);
        assert!(matches!(result, Err(CryptoError::Integrity)));
    }

    #[test]
    fn test_decrypt_wrong_index() {
        let k = key(1);
        let encrypted = encrypt_shard(&k, aad(0, 2), b"secret data").unwrap();
        let result = decrypt_shard(&k, aad(1, 2), &encrypted);
        assert!(
            matches!(result, Err(CryptoError::Integrity)),
            "wrong shard_index must fail (AAD mismatch)"
        );
    }

    #[test]
    fn test_decrypt_wrong_count() {
        let k = key(1);
        let encrypted = encrypt_shard(&k, aad(0, 3), b"secret data").unwrap();
        let result = decrypt_shard(&k, aad(0, 2), &encrypted);
        assert!(result.is_err(), "truncated shard list must fail (AAD mismatch)");
    }

    #[test]
    fn test_decrypt_wrong_file_id() {
        let k = key(1);
        let encrypted =
            encrypt_shard(&k, ShardAad::new([0xAA; FILE_ID_SIZE], 0, 1), b"secret").unwrap();
        let result = decrypt_shard(&k, ShardAad::new([0xBB; FILE_ID_SIZE], 0, 1), &encrypted);
        assert!(result.is_err(), "wrong file_id must fail (AAD mismatch)");
    }

    #[test]
    fn test_truncated_input() {
        let result = decrypt_shard(&key(1), aad(0, 1), &[0u8; SHARD_OVERHEAD - 1]);
        assert!(matches!(
            result,
            Err(CryptoError::Truncated { len: 27, min: 28 })
        ));

        let result = decrypt_shard(&key(1), aad(0, 1), &[]);
        assert!(matches!(result, Err(CryptoError::Truncated { .. })));
    }

    #[test]
    fn test_cut_tag_fails() {
        let k = key(1);
        let encrypted = encrypt_shard(&k, aad(0, 1), b"some shard bytes").unwrap();
        let result = decrypt_shard(&k, aad(0, 1), &encrypted[..encrypted.len() - 1]);
        assert!(result.is_err());
    }

    proptest! {
        /// Flipping any single byte of the wire form is always detected.
        #[test]
        fn single_byte_tamper_is_detected(
            data in proptest::collection::vec(any::<u8>(), 1..=512),
            pos in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let k = key(9);
            let mut wire = encrypt_shard(&k, aad(3, 5), &data).unwrap();
            let i = pos.index(wire.len());
            wire[i] ^= flip;
            prop_assert!(decrypt_shard(&k, aad(3, 5), &wire).is_err());
        }

        #[test]
        fn roundtrip_any_payload(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            let k = key(4);
            let wire = encrypt_shard(&k, aad(0, 1), &data).unwrap();
            prop_assert_eq!(wire.len(), data.len() + SHARD_OVERHEAD);
            prop_assert_eq!(decrypt_shard(&k, aad(0, 1), &wire).unwrap(), data);
        }
    }
}
