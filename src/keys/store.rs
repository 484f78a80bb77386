//! Password-protected key store
//!
//! A `KeyStore` is a typed container of key entries with no policy of its
//! own. On disk it is one sealed envelope: the entry list is serialized,
//! then sealed with a key derived from the backing password. Each entry's
//! private half is additionally sealed with the store's per-key password,
//! so a captured container leaks nothing and a wrong password fails
//! closed.
//!
//! Every successful mutation is persisted before the call returns; the
//! in-memory and durable views never diverge across a crash.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use crate::keys::backend::StoreBackend;
use crate::keys::crypto::{derive_sealing_key, open, random_bytes, seal, NONCE_LEN, SALT_LEN};
use crate::keys::entry::{KeyEntry, KeyInfo, KeyState, SealedKey, SecretKeyMaterial};
use crate::types::{KeywardenError, Result};

/// Container format version.
const CONTAINER_VERSION: u32 = 1;

/// Sealed on-disk envelope of a store.
#[derive(Debug, Serialize, Deserialize)]
struct Container {
    version: u32,
    /// Argon2id salt for the backing password (base64), fixed at creation
    salt: String,
    /// Seal nonce (base64), fresh per persist
    nonce: String,
    /// Sealed serialized payload (base64)
    ciphertext: String,
}

/// Decrypted store payload.
#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    entries: Vec<KeyEntry>,
}

/// A password-protected, typed container of key entries.
pub struct KeyStore {
    /// Store alias for logs ("long-term", "short-term", "used")
    name: String,

    backend: Box<dyn StoreBackend>,

    /// Key derived from the backing password at open; seals the container
    sealing_key: [u8; 32],

    /// Container salt, fixed for the store's lifetime
    salt: [u8; SALT_LEN],

    /// Password sealing each entry's private half
    key_password: String,

    entries: HashMap<String, KeyEntry>,
}

impl KeyStore {
    /// Open a store, creating an empty sealed container if none exists.
    ///
    /// Fails with `Authentication` if an existing container does not open
    /// under `backing_password`; nothing is mutated in that case.
    pub fn open(
        name: impl Into<String>,
        backend: Box<dyn StoreBackend>,
        backing_password: &str,
        key_password: &str,
    ) -> Result<Self> {
        let name = name.into();

        match backend.load()? {
            Some(blob) => {
                let container: Container = serde_json::from_slice(&blob).map_err(|e| {
                    KeywardenError::StoreIo(format!(
                        "Malformed container {}: {e}",
                        backend.describe()
                    ))
                })?;

                if container.version != CONTAINER_VERSION {
                    return Err(KeywardenError::StoreIo(format!(
                        "Unsupported container version {} in {}",
                        container.version,
                        backend.describe()
                    )));
                }

                let salt_bytes = BASE64.decode(&container.salt).map_err(|e| {
                    KeywardenError::StoreIo(format!("Invalid container salt: {e}"))
                })?;
                let salt: [u8; SALT_LEN] = salt_bytes
                    .try_into()
                    .map_err(|_| KeywardenError::StoreIo("Invalid container salt length".into()))?;

                let nonce_bytes = BASE64.decode(&container.nonce).map_err(|e| {
                    KeywardenError::StoreIo(format!("Invalid container nonce: {e}"))
                })?;
                let nonce: [u8; NONCE_LEN] = nonce_bytes
                    .try_into()
                    .map_err(|_| KeywardenError::StoreIo("Invalid container nonce length".into()))?;

                let ciphertext = BASE64.decode(&container.ciphertext).map_err(|e| {
                    KeywardenError::StoreIo(format!("Invalid container ciphertext: {e}"))
                })?;

                let sealing_key = derive_sealing_key(backing_password.as_bytes(), &salt)?;
                let mut plaintext = open(&ciphertext, &sealing_key, &nonce).map_err(|_| {
                    KeywardenError::Authentication(format!(
                        "Wrong backing password for store '{name}'"
                    ))
                })?;

                let payload: Payload = serde_json::from_slice(&plaintext).map_err(|e| {
                    KeywardenError::StoreIo(format!("Malformed store payload: {e}"))
                })?;
                plaintext.zeroize();

                let entries = payload
                    .entries
                    .into_iter()
                    .map(|e| (e.key_id.clone(), e))
                    .collect::<HashMap<_, _>>();

                debug!(store = %name, entries = entries.len(), "Opened key store");

                Ok(Self {
                    name,
                    backend,
                    sealing_key,
                    salt,
                    key_password: key_password.to_string(),
                    entries,
                })
            }
            None => {
                let salt: [u8; SALT_LEN] = random_bytes();
                let sealing_key = derive_sealing_key(backing_password.as_bytes(), &salt)?;

                let mut store = Self {
                    name,
                    backend,
                    sealing_key,
                    salt,
                    key_password: key_password.to_string(),
                    entries: HashMap::new(),
                };

                // Materialize the empty container so a wrong password is
                // caught on the next open rather than silently starting a
                // second history.
                store.persist()?;
                debug!(store = %store.name, "Created new key store");
                Ok(store)
            }
        }
    }

    /// Store alias.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key_id` is present.
    pub fn contains(&self, key_id: &str) -> bool {
        self.entries.contains_key(key_id)
    }

    /// Insert a new entry and persist.
    ///
    /// Fails with `DuplicateKeyId` if the id is already present. A failed
    /// persist rolls the insertion back; the store never claims an entry
    /// it could not make durable.
    pub fn put(&mut self, entry: KeyEntry) -> Result<()> {
        if self.entries.contains_key(&entry.key_id) {
            return Err(KeywardenError::DuplicateKeyId(entry.key_id));
        }

        let key_id = entry.key_id.clone();
        self.entries.insert(key_id.clone(), entry);

        if let Err(e) = self.persist() {
            self.entries.remove(&key_id);
            return Err(e);
        }

        Ok(())
    }

    /// Remove and return an entry, transferring ownership of its sealed
    /// private material; persists the removal before returning.
    pub fn take(&mut self, key_id: &str) -> Result<KeyEntry> {
        let entry = self
            .entries
            .remove(key_id)
            .ok_or_else(|| KeywardenError::NotFound(format!("{} in '{}'", key_id, self.name)))?;

        if let Err(e) = self.persist() {
            self.entries.insert(entry.key_id.clone(), entry);
            return Err(e);
        }

        Ok(entry)
    }

    /// Public view of one entry, if present.
    pub fn get_info(&self, key_id: &str) -> Option<KeyInfo> {
        self.entries.get(key_id).map(|e| e.info())
    }

    /// Up to `n` available entries, without removing them.
    pub fn peek_available(&self, n: usize) -> Vec<KeyInfo> {
        self.entries
            .values()
            .filter(|e| e.state == KeyState::Available)
            .take(n)
            .map(|e| e.info())
            .collect()
    }

    /// Any one available key id, for pool handout (members are
    /// interchangeable; no ordering guarantee).
    pub fn any_available_id(&self) -> Option<String> {
        self.entries
            .values()
            .find(|e| e.state == KeyState::Available)
            .map(|e| e.key_id.clone())
    }

    /// Snapshot of all entries as public views, for rotation sweeps.
    pub fn entries_info(&self) -> Vec<KeyInfo> {
        self.entries.values().map(|e| e.info()).collect()
    }

    /// Seal a signing key under this store's per-key password.
    pub fn seal_private(&self, signing_key: &SigningKey) -> Result<SealedKey> {
        SealedKey::seal(signing_key, &self.key_password)
    }

    /// Open an entry's private material with this store's per-key
    /// password.
    pub fn open_private(&self, entry: &KeyEntry) -> Result<SecretKeyMaterial> {
        entry
            .sealed_private_key
            .open(&self.key_password)
            .map_err(|e| match e {
                KeywardenError::Authentication(_) => KeywardenError::Authentication(format!(
                    "Wrong key password for store '{}'",
                    self.name
                )),
                other => other,
            })
    }

    /// Open the private material of a stored entry by id, leaving the
    /// entry in place.
    pub fn export_private(&self, key_id: &str) -> Result<SecretKeyMaterial> {
        let entry = self
            .entries
            .get(key_id)
            .ok_or_else(|| KeywardenError::NotFound(format!("{} in '{}'", key_id, self.name)))?;
        self.open_private(entry)
    }

    /// Serialize, seal and durably persist the current entry set.
    fn persist(&mut self) -> Result<()> {
        let payload = Payload {
            entries: self.entries.values().cloned().collect(),
        };
        let mut plaintext = serde_json::to_vec(&payload)
            .map_err(|e| KeywardenError::Internal(format!("Failed to serialize store: {e}")))?;

        let nonce: [u8; NONCE_LEN] = random_bytes();
        let sealed = seal(&plaintext, &self.sealing_key, &nonce)?;
        plaintext.zeroize();

        let container = Container {
            version: CONTAINER_VERSION,
            salt: BASE64.encode(self.salt),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(sealed),
        };
        let blob = serde_json::to_vec(&container)
            .map_err(|e| KeywardenError::Internal(format!("Failed to serialize container: {e}")))?;

        self.backend.persist(&blob)
    }
}
