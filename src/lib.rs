//! Keywarden - ephemeral signing key lifecycle manager
//!
//! Keywarden maintains a warm pool of one-time-use Ed25519 signing keys
//! across three password-protected stores: a long-term store for the node
//! identity key, a short-term store of never-used pool keys, and a used
//! store retaining consumed keys so their signatures stay verifiable.
//!
//! ## Services
//!
//! - **Stores**: sealed, durably persisted key containers
//! - **Issuer**: self-issued certificates with collision-checked serials
//! - **Pool**: atomic acquire, floor-driven replenishment, lookup
//! - **Rotation**: pluggable policy naming expired history for purge
//! - **Audit**: JSONL trail of every lifecycle transition

pub mod config;
pub mod issuer;
pub mod keys;
pub mod logging;
pub mod pool;
pub mod rotation;
pub mod types;

pub use config::Args;
pub use issuer::CertificateIssuer;
pub use keys::store::KeyStore;
pub use pool::{IssuedKey, KeyPoolManager};
pub use rotation::{RotationPolicy, TimeBasedExpiry};
pub use types::{KeywardenError, Result};
