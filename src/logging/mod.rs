//! Logging infrastructure for keywarden
//!
//! Structured tracing goes to the subscriber installed by the binary;
//! this module adds the append-only key-lifecycle audit trail.

pub mod audit;

pub use audit::{AuditEvent, AuditEventType, AuditLogger};
