//! Key entry data model
//!
//! A `KeyEntry` is one pooled signing key: the public half, the sealed
//! private half, the self-issued certificate binding them, and lifecycle
//! timestamps. Entries move between stores by ownership transfer; the
//! private material never has two homes at once.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::keys::crypto::{
    derive_sealing_key, open, random_bytes, seal, NONCE_LEN, SALT_LEN, SECRET_KEY_LEN,
};
use crate::types::{KeywardenError, Result};

/// Lifecycle state of a pooled key.
///
/// `Available -> Consumed` happens exactly once, at acquire. `Expired` is
/// only ever reached from `Consumed`; purge destroys the entry entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    /// In the pool, never handed out
    Available,
    /// Handed out once; retained for signature verification
    Consumed,
    /// Past its certificate window, awaiting purge
    Expired,
}

/// Self-issued certificate binding a key id and public key to the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Fixed-length decimal serial, unique per issuer lifetime
    pub serial_number: String,

    /// Issuer name (self-issued: also the subject)
    pub issuer: String,

    /// Subject name
    pub subject: String,

    /// Key id this certificate certifies
    pub key_id: String,

    /// Certified Ed25519 public key (base64)
    pub public_key: String,

    /// Start of the validity window
    pub not_before: DateTime<Utc>,

    /// End of the validity window
    pub not_after: DateTime<Utc>,

    /// Ed25519 signature by the issuer key over the canonical bytes (base64)
    pub signature: String,
}

impl Certificate {
    /// Canonical byte string the issuer signs.
    ///
    /// Newline-joined fields in declaration order; RFC 3339 timestamps.
    /// Changing this layout invalidates every previously issued
    /// certificate.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}",
            self.serial_number,
            self.issuer,
            self.subject,
            self.key_id,
            self.public_key,
            self.not_before.to_rfc3339(),
            self.not_after.to_rfc3339(),
        )
        .into_bytes()
    }

    /// Verify the certificate signature against the issuer's public key.
    pub fn verify(&self, issuer_key: &VerifyingKey) -> Result<()> {
        use ed25519_dalek::Verifier;

        let sig_bytes = BASE64
            .decode(&self.signature)
            .map_err(|e| KeywardenError::Internal(format!("Invalid signature encoding: {e}")))?;
        let sig_arr: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeywardenError::Internal("Invalid signature length".into()))?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_arr);

        issuer_key
            .verify(&self.signing_bytes(), &signature)
            .map_err(|_| KeywardenError::Authentication("Certificate signature invalid".into()))
    }

    /// Whether `at` falls inside the validity window.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.not_before && at < self.not_after
    }
}

/// Decrypted Ed25519 secret, zeroized on drop.
pub struct SecretKeyMaterial {
    bytes: [u8; SECRET_KEY_LEN],
}

impl SecretKeyMaterial {
    /// Wrap raw secret bytes.
    pub fn new(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Reconstruct the signing key.
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.bytes)
    }
}

impl Drop for SecretKeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// A private key sealed with a per-key password.
///
/// Salt and nonce travel with the ciphertext so the bundle is
/// self-contained; only the password is external.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedKey {
    /// Argon2id salt (base64)
    pub salt: String,

    /// ChaCha20-Poly1305 nonce (base64)
    pub nonce: String,

    /// Sealed private key bytes (base64)
    pub ciphertext: String,
}

impl SealedKey {
    /// Seal a signing key under a per-key password with fresh salt/nonce.
    pub fn seal(signing_key: &SigningKey, key_password: &str) -> Result<Self> {
        let salt: [u8; SALT_LEN] = random_bytes();
        let nonce: [u8; NONCE_LEN] = random_bytes();

        let sealing_key = derive_sealing_key(key_password.as_bytes(), &salt)?;
        let mut secret = signing_key.to_bytes();
        let sealed = seal(&secret, &sealing_key, &nonce)?;
        secret.zeroize();

        Ok(Self {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(sealed),
        })
    }

    /// Open the sealed key with the per-key password.
    pub fn open(&self, key_password: &str) -> Result<SecretKeyMaterial> {
        let salt = BASE64
            .decode(&self.salt)
            .map_err(|e| KeywardenError::Internal(format!("Invalid salt encoding: {e}")))?;
        let nonce_bytes = BASE64
            .decode(&self.nonce)
            .map_err(|e| KeywardenError::Internal(format!("Invalid nonce encoding: {e}")))?;
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| KeywardenError::Internal(format!("Invalid ciphertext encoding: {e}")))?;

        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| KeywardenError::Internal("Invalid nonce length".into()))?;

        let sealing_key = derive_sealing_key(key_password.as_bytes(), &salt)?;
        let mut plaintext = open(&ciphertext, &sealing_key, &nonce)?;

        if plaintext.len() != SECRET_KEY_LEN {
            plaintext.zeroize();
            return Err(KeywardenError::Internal(format!(
                "Invalid decrypted key length: expected {}, got {}",
                SECRET_KEY_LEN,
                plaintext.len()
            )));
        }

        let mut bytes = [0u8; SECRET_KEY_LEN];
        bytes.copy_from_slice(&plaintext);
        plaintext.zeroize();
        Ok(SecretKeyMaterial::new(bytes))
    }
}

/// One pooled key: identity, sealed private half, certificate, lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    /// Opaque unique identifier, stable for the entry's lifetime
    pub key_id: String,

    /// Ed25519 public key (base64)
    pub public_key: String,

    /// Private key sealed with the holding store's per-key password
    pub sealed_private_key: SealedKey,

    /// Self-issued certificate for this key
    pub certificate: Certificate,

    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// `created_at` + certificate validity window
    pub expires_at: DateTime<Utc>,

    /// Lifecycle state
    pub state: KeyState,
}

impl KeyEntry {
    /// Decode the public key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let bytes = BASE64
            .decode(&self.public_key)
            .map_err(|e| KeywardenError::Internal(format!("Invalid public key encoding: {e}")))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeywardenError::Internal("Invalid public key length".into()))?;
        VerifyingKey::from_bytes(&arr)
            .map_err(|e| KeywardenError::Internal(format!("Invalid public key: {e}")))
    }

    /// Public view of this entry, safe to hand to verifiers.
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            key_id: self.key_id.clone(),
            public_key: self.public_key.clone(),
            certificate: self.certificate.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            state: self.state,
        }
    }
}

/// Public view of a key entry: everything except the private material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Key id
    pub key_id: String,

    /// Ed25519 public key (base64)
    pub public_key: String,

    /// Self-issued certificate
    pub certificate: Certificate,

    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// When the certificate window closes
    pub expires_at: DateTime<Utc>,

    /// Lifecycle state
    pub state: KeyState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::crypto::{generate_keypair, sign_payload};
    use chrono::Duration;

    fn test_certificate(key_id: &str, public_key: &str) -> Certificate {
        let (issuer_key, _) = generate_keypair();
        let now = Utc::now();
        let mut cert = Certificate {
            serial_number: "12345678901234567890".to_string(),
            issuer: "keywarden-test".to_string(),
            subject: "keywarden-test".to_string(),
            key_id: key_id.to_string(),
            public_key: public_key.to_string(),
            not_before: now,
            not_after: now + Duration::seconds(3600),
            signature: String::new(),
        };
        let sig = sign_payload(&issuer_key, &cert.signing_bytes());
        cert.signature = BASE64.encode(sig.to_bytes());
        cert
    }

    #[test]
    fn test_sealed_key_roundtrip() {
        let (signing_key, _) = generate_keypair();
        let sealed = SealedKey::seal(&signing_key, "key-password").unwrap();

        let opened = sealed.open("key-password").unwrap();
        assert_eq!(opened.signing_key().to_bytes(), signing_key.to_bytes());
    }

    #[test]
    fn test_sealed_key_wrong_password() {
        let (signing_key, _) = generate_keypair();
        let sealed = SealedKey::seal(&signing_key, "right").unwrap();

        let result = sealed.open("wrong");
        assert!(matches!(result, Err(KeywardenError::Authentication(_))));
    }

    #[test]
    fn test_certificate_verify() {
        let (issuer_key, issuer_pub) = generate_keypair();
        let (_, key_pub) = generate_keypair();
        let public_key = BASE64.encode(key_pub.to_bytes());
        let now = Utc::now();

        let mut cert = Certificate {
            serial_number: "00000000000000000001".to_string(),
            issuer: "keywarden".to_string(),
            subject: "keywarden".to_string(),
            key_id: "key-1".to_string(),
            public_key,
            not_before: now,
            not_after: now + Duration::seconds(60),
            signature: String::new(),
        };
        let sig = sign_payload(&issuer_key, &cert.signing_bytes());
        cert.signature = BASE64.encode(sig.to_bytes());

        assert!(cert.verify(&issuer_pub).is_ok());

        // Tampering with a certified field breaks the signature
        cert.key_id = "key-2".to_string();
        assert!(cert.verify(&issuer_pub).is_err());
    }

    #[test]
    fn test_certificate_validity_window() {
        let (_, key_pub) = generate_keypair();
        let cert = test_certificate("key-1", &BASE64.encode(key_pub.to_bytes()));

        assert!(cert.is_valid_at(Utc::now()));
        assert!(!cert.is_valid_at(Utc::now() - Duration::seconds(10)));
        assert!(!cert.is_valid_at(Utc::now() + Duration::seconds(7200)));
    }

    #[test]
    fn test_entry_json_roundtrip() {
        let (signing_key, verifying_key) = generate_keypair();
        let public_key = BASE64.encode(verifying_key.to_bytes());
        let now = Utc::now();

        let entry = KeyEntry {
            key_id: "key-roundtrip".to_string(),
            public_key: public_key.clone(),
            sealed_private_key: SealedKey::seal(&signing_key, "pw").unwrap(),
            certificate: test_certificate("key-roundtrip", &public_key),
            created_at: now,
            expires_at: now + Duration::seconds(3600),
            state: KeyState::Available,
        };

        let json = serde_json::to_string(&entry).unwrap();
        let back: KeyEntry = serde_json::from_str(&json).unwrap();

        assert_eq!(back.key_id, entry.key_id);
        assert_eq!(back.public_key, entry.public_key);
        assert_eq!(back.certificate.serial_number, entry.certificate.serial_number);
        assert_eq!(back.created_at, entry.created_at);
        assert_eq!(back.state, KeyState::Available);
        assert_eq!(
            back.sealed_private_key.open("pw").unwrap().signing_key().to_bytes(),
            signing_key.to_bytes()
        );
    }
}
