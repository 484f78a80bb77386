//! Common types for keywarden
//!
//! Error taxonomy and the crate-wide `Result` alias. Every fallible
//! operation on the consumed-side API returns one of these categories;
//! raw errors never cross the boundary uncategorized.

use thiserror::Error;

/// Errors surfaced by key stores, the issuer and the pool manager.
#[derive(Debug, Error)]
pub enum KeywardenError {
    /// Bad store or key password. Fatal for that store; retrying without
    /// new credentials will not help.
    #[error("authentication failure: {0}")]
    Authentication(String),

    /// Unknown key id. Recoverable; the caller decides what to do.
    #[error("not found: {0}")]
    NotFound(String),

    /// A key id already exists in the target store. Retried once with a
    /// fresh id before being surfaced as `Internal`.
    #[error("duplicate key id: {0}")]
    DuplicateKeyId(String),

    /// The issuer drew a serial number it has already handed out. The
    /// caller retries with a fresh draw.
    #[error("certificate serial collision: {0}")]
    SerialCollision(String),

    /// Replenishment failed, so no key could be handed out. Callers should
    /// back off and retry.
    #[error("key pool exhausted: {0}")]
    PoolExhausted(String),

    /// Persistence layer error after bounded retries.
    #[error("store i/o failure: {0}")]
    StoreIo(String),

    /// Invariant violation or unrecoverable internal condition.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, KeywardenError>;
