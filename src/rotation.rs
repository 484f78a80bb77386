//! Rotation policy
//!
//! Decides which retained keys are due for purging. Detection is kept
//! separate from deletion: a policy only names candidates over a
//! snapshot, and the pool manager performs the removal, so audit and
//! notification concerns stay out of the policy.

use chrono::{DateTime, Utc};

use crate::keys::entry::KeyInfo;

/// Pluggable expiry detection over a snapshot of store entries.
///
/// Implementations must be pure with respect to the stores: `sweep`
/// returns candidate ids and mutates nothing.
pub trait RotationPolicy: Send + Sync {
    /// Ids of entries that should be purged as of `now`.
    fn sweep(&self, now: DateTime<Utc>, entries: &[KeyInfo]) -> Vec<String>;
}

/// Default policy: purge once the certificate validity window has closed.
///
/// The config surface only supports time-based expiry; alternative
/// strategies (usage-count, external signal) plug in through the trait
/// without touching the pool manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeBasedExpiry;

impl RotationPolicy for TimeBasedExpiry {
    fn sweep(&self, now: DateTime<Utc>, entries: &[KeyInfo]) -> Vec<String> {
        entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key_id.clone())
            .collect()
    }
}
