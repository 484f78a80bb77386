//! Self-issuing certificate authority
//!
//! Mints a certificate for each pooled key pair: the configured issuer
//! name as both subject and issuer, a fixed-length decimal serial number,
//! a validity window starting now, and an Ed25519 signature by the issuer
//! key. The issuer knows nothing about key stores.
//!
//! # Serial randomness
//!
//! Serials come from OS entropy unless a fixed seed is configured. A
//! fixed seed makes the serial stream predictable across restarts, which
//! is exactly what reproducible test fixtures want and exactly what
//! production does not; the knob therefore defaults to off.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::IssuerConfig;
use crate::keys::crypto::sign_payload;
use crate::keys::entry::Certificate;
use crate::types::{KeywardenError, Result};

/// Source of serial-number randomness.
///
/// Shared mutable state: the stream position advances per draw, so access
/// is serialized behind the issuer's lock.
enum SerialStream {
    /// OS entropy (production default)
    Os(OsRng),
    /// Deterministic stream derived from the configured seed
    Seeded(StdRng),
}

impl SerialStream {
    fn from_config(seed: Option<&str>) -> Self {
        match seed {
            Some(seed) => {
                warn!(
                    "Certificate serial stream is seeded; serials are \
                     predictable across restarts. Use only for test fixtures."
                );
                let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
                SerialStream::Seeded(StdRng::from_seed(digest))
            }
            None => SerialStream::Os(OsRng),
        }
    }

    /// Draw a serial of exactly `len` decimal digits (no leading zero).
    fn draw(&mut self, len: usize) -> String {
        match self {
            SerialStream::Os(rng) => draw_serial(rng, len),
            SerialStream::Seeded(rng) => draw_serial(rng, len),
        }
    }
}

fn draw_serial(rng: &mut impl Rng, len: usize) -> String {
    let mut serial = String::with_capacity(len);
    serial.push(char::from(b'1' + rng.gen_range(0..9u8)));
    for _ in 1..len {
        serial.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    serial
}

/// Deterministic-from-config self-signing authority.
pub struct CertificateIssuer {
    config: IssuerConfig,
    signing_key: SigningKey,
    serial_stream: Mutex<SerialStream>,
    /// Every serial ever issued in this issuer's lifetime
    issued: DashMap<String, ()>,
}

impl CertificateIssuer {
    /// Create an issuer from its config and externally provisioned
    /// signing key.
    pub fn new(config: IssuerConfig, signing_key: SigningKey) -> Self {
        let serial_stream = Mutex::new(SerialStream::from_config(
            config.secure_random_seed.as_deref(),
        ));
        Self {
            config,
            signing_key,
            serial_stream,
            issued: DashMap::new(),
        }
    }

    /// Public half of the issuer key, for certificate verification.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Issuer name stamped on certificates.
    pub fn issuer_name(&self) -> &str {
        &self.config.issuer_name
    }

    /// Mint a certificate for `public_key` under `key_id`.
    ///
    /// Fails with `SerialCollision` if the drawn serial was already
    /// issued; the caller retries with a fresh draw.
    pub fn mint(&self, key_id: &str, public_key: &VerifyingKey) -> Result<Certificate> {
        let serial = {
            let mut stream = self
                .serial_stream
                .lock()
                .map_err(|_| KeywardenError::Internal("Serial stream lock poisoned".into()))?;
            stream.draw(self.config.serial_number_length)
        };

        // insert returns the previous value, so the collision check and
        // the reservation are one atomic step
        if self.issued.insert(serial.clone(), ()).is_some() {
            return Err(KeywardenError::SerialCollision(serial));
        }

        let now = Utc::now();
        let mut certificate = Certificate {
            serial_number: serial,
            issuer: self.config.issuer_name.clone(),
            subject: self.config.issuer_name.clone(),
            key_id: key_id.to_string(),
            public_key: BASE64.encode(public_key.to_bytes()),
            not_before: now,
            not_after: now + Duration::seconds(self.config.certificate_valid_secs as i64),
            signature: String::new(),
        };

        let signature = sign_payload(&self.signing_key, &certificate.signing_bytes());
        certificate.signature = BASE64.encode(signature.to_bytes());

        debug!(
            key_id = %key_id,
            serial = %certificate.serial_number,
            not_after = %certificate.not_after,
            "Minted certificate"
        );

        Ok(certificate)
    }

    /// Number of certificates issued so far.
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    #[cfg(test)]
    fn mark_issued(&self, serial: &str) {
        self.issued.insert(serial.to_string(), ());
    }
}
