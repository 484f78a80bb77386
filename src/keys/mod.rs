//! Key stores and the sealed data model
//!
//! Three instances of [`store::KeyStore`] back the pool: the long-term
//! identity store, the short-term available pool, and the used store that
//! retains consumed keys for verification. Stores are pure persistence and
//! lookup; policy lives in the pool manager and rotation modules.
//!
//! # Sealing layers
//!
//! - Each private key is sealed with the store's per-key password
//!   (Argon2id + ChaCha20-Poly1305)
//! - The whole entry list is sealed again with the backing password
//! - Decrypted material is zeroized on drop

pub mod backend;
pub mod crypto;
pub mod entry;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, StoreBackend};
pub use crypto::{generate_keypair, random_bytes, sign_payload, NONCE_LEN, SALT_LEN};
pub use entry::{Certificate, KeyEntry, KeyInfo, KeyState, SealedKey, SecretKeyMaterial};
pub use store::KeyStore;
