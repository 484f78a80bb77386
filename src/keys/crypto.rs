//! Cryptographic primitives for key sealing
//!
//! # Algorithms
//!
//! - **Key generation**: Ed25519 (pool keys and the issuer identity)
//! - **Key derivation**: Argon2id (store password -> sealing key)
//! - **Sealing**: ChaCha20-Poly1305 (authenticated encryption)
//!
//! The same seal/open pair protects both layers of a store: each private
//! key is sealed with the per-key password, and the whole container payload
//! is sealed again with the backing password. A wrong password surfaces as
//! an authentication failure, never as garbage plaintext.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::types::{KeywardenError, Result};

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for key derivation
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305
pub const NONCE_LEN: usize = 12;

/// Ed25519 secret key length
pub const SECRET_KEY_LEN: usize = 32;

/// Generate a new Ed25519 signing keypair from OS entropy.
///
/// Key material for the pool always comes from the OS random source; the
/// configurable seed affects certificate serials only.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Derive a 256-bit sealing key from a password using Argon2id.
///
/// Memory-hard parameters make offline brute force against a captured
/// store container expensive.
pub fn derive_sealing_key(password: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let params = Params::new(
        ARGON2_MEMORY_KB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(32),
    )
    .map_err(|e| KeywardenError::Internal(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| KeywardenError::Internal(format!("Key derivation failed: {e}")))?;

    Ok(key)
}

/// Seal plaintext under a derived key with ChaCha20-Poly1305.
///
/// The auth tag binds the ciphertext to the key; the nonce must be fresh
/// per seal operation.
pub fn seal(plaintext: &[u8], sealing_key: &[u8; 32], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(sealing_key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| KeywardenError::Internal(format!("Sealing failed: {e}")))
}

/// Open a sealed blob.
///
/// Tag verification failure means a wrong password or a tampered
/// container; both surface as an authentication failure.
pub fn open(ciphertext: &[u8], sealing_key: &[u8; 32], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(sealing_key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| KeywardenError::Authentication("Failed to open sealed data".into()))
}

/// Sign a payload with an Ed25519 key (certificate signatures).
pub fn sign_payload(signing_key: &SigningKey, payload: &[u8]) -> Signature {
    signing_key.sign(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let (signing_key, verifying_key) = generate_keypair();

        assert_eq!(signing_key.to_bytes().len(), SECRET_KEY_LEN);
        assert_eq!(signing_key.verifying_key(), verifying_key);
    }

    #[test]
    fn test_random_bytes_differ() {
        let a: [u8; SALT_LEN] = random_bytes();
        let b: [u8; SALT_LEN] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derivation_is_deterministic_per_salt() {
        let salt: [u8; SALT_LEN] = random_bytes();
        let k1 = derive_sealing_key(b"store-password", &salt).unwrap();
        let k2 = derive_sealing_key(b"store-password", &salt).unwrap();
        assert_eq!(k1, k2);

        let other_salt: [u8; SALT_LEN] = random_bytes();
        let k3 = derive_sealing_key(b"store-password", &other_salt).unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let salt: [u8; SALT_LEN] = random_bytes();
        let nonce: [u8; NONCE_LEN] = random_bytes();
        let key = derive_sealing_key(b"backing-password", &salt).unwrap();

        let sealed = seal(b"entry payload", &key, &nonce).unwrap();
        assert_ne!(sealed.as_slice(), b"entry payload");

        let opened = open(&sealed, &key, &nonce).unwrap();
        assert_eq!(opened, b"entry payload");
    }

    #[test]
    fn test_open_with_wrong_password_fails() {
        let salt: [u8; SALT_LEN] = random_bytes();
        let nonce: [u8; NONCE_LEN] = random_bytes();

        let key = derive_sealing_key(b"right", &salt).unwrap();
        let sealed = seal(b"secret", &key, &nonce).unwrap();

        let wrong = derive_sealing_key(b"wrong", &salt).unwrap();
        let result = open(&sealed, &wrong, &nonce);
        assert!(matches!(result, Err(KeywardenError::Authentication(_))));
    }

    #[test]
    fn test_signature_verifies() {
        use ed25519_dalek::Verifier;

        let (signing_key, verifying_key) = generate_keypair();
        let signature = sign_payload(&signing_key, b"certificate bytes");
        assert!(verifying_key.verify(b"certificate bytes", &signature).is_ok());
    }
}
