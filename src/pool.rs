//! Key pool manager
//!
//! Orchestrates the three stores. Keeps the available pool at its floor,
//! hands each short-term key out exactly once, and retires consumed keys
//! into the used store so signatures they produced stay verifiable.
//! History is destroyed only when the rotation policy names an entry.
//!
//! # Locking
//!
//! The (available, used) pair sits behind one async mutex: the
//! take / mark-consumed / put-to-used handoff is atomic with respect to
//! concurrent acquires, and a rotation sweep can never observe an entry
//! mid-transition. The long-term store has its own read-write lock, so
//! identity-key lookups never block on pool churn. The issuer serializes
//! its own serial stream internally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::issuer::CertificateIssuer;
use crate::keys::entry::{KeyEntry, KeyInfo, KeyState, SecretKeyMaterial};
use crate::keys::store::KeyStore;
use crate::logging::AuditLogger;
use crate::rotation::RotationPolicy;
use crate::types::{KeywardenError, Result};

/// A key handed out by `acquire`: public view plus the decrypted secret.
///
/// The secret zeroizes on drop; callers sign and let it go.
pub struct IssuedKey {
    /// Public view (id, public key, certificate, timestamps)
    pub info: KeyInfo,
    /// Decrypted private material, owned by the caller
    pub secret: SecretKeyMaterial,
}

impl IssuedKey {
    /// Reconstruct the signing key.
    pub fn signing_key(&self) -> SigningKey {
        self.secret.signing_key()
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Keys waiting in the available store
    pub available: usize,
    /// Consumed keys retained for verification
    pub used: usize,
    /// Certificates minted over this process lifetime
    pub certificates_issued: usize,
}

/// The short-term store pair; always locked and mutated together.
struct ShortTermPool {
    available: KeyStore,
    used: KeyStore,
}

/// Orchestrates key generation, handout and retirement across the three
/// stores. Stores are injected at construction; nothing here is ambient.
pub struct KeyPoolManager {
    long_term: RwLock<KeyStore>,
    pool: Mutex<ShortTermPool>,
    issuer: CertificateIssuer,
    target_pool_size: usize,
    policy: Box<dyn RotationPolicy>,
    audit: AuditLogger,
}

impl KeyPoolManager {
    /// Create a manager over the three opened stores.
    ///
    /// Fails with `Internal` if a key id already lives in both short-term
    /// stores: an entry has at most one home.
    pub fn new(
        long_term: KeyStore,
        available: KeyStore,
        used: KeyStore,
        issuer: CertificateIssuer,
        target_pool_size: usize,
        policy: Box<dyn RotationPolicy>,
        audit: AuditLogger,
    ) -> Result<Self> {
        for entry in available.entries_info() {
            if used.contains(&entry.key_id) {
                return Err(KeywardenError::Internal(format!(
                    "Key {} present in both short-term stores",
                    entry.key_id
                )));
            }
        }

        Ok(Self {
            long_term: RwLock::new(long_term),
            pool: Mutex::new(ShortTermPool { available, used }),
            issuer,
            target_pool_size,
            policy,
            audit,
        })
    }

    /// The issuer this pool mints through.
    pub fn issuer(&self) -> &CertificateIssuer {
        &self.issuer
    }

    /// Hand out one short-term key, retiring it to the used store.
    ///
    /// An empty pool replenishes synchronously first; `PoolExhausted` is
    /// returned only when replenishment itself fails. The handoff is
    /// atomic: no two callers can receive the same key id, and a failed
    /// handoff leaves the entry available.
    pub async fn acquire(&self) -> Result<IssuedKey> {
        let mut pool = self.pool.lock().await;

        if pool.available.is_empty() {
            debug!("Available pool empty; replenishing before handout");
            self.replenish_locked(&mut pool).await.map_err(|e| {
                KeywardenError::PoolExhausted(format!("replenishment failed: {e}"))
            })?;
        }

        let key_id = pool
            .available
            .any_available_id()
            .ok_or_else(|| KeywardenError::PoolExhausted("no key available after replenish".into()))?;

        let entry = pool.available.take(&key_id)?;

        match self.retire_entry(&mut pool, entry).await {
            Ok(issued) => Ok(issued),
            Err((entry, e)) => {
                // Undo the take so no entry is lost mid-handoff
                if let Err(rollback) = pool.available.put(entry) {
                    return Err(KeywardenError::Internal(format!(
                        "Handoff failed ({e}) and rollback failed ({rollback})"
                    )));
                }
                Err(e)
            }
        }
    }

    /// Move a taken entry into the used store as Consumed and return the
    /// issued view. On failure the untouched entry comes back to the
    /// caller for rollback.
    async fn retire_entry(
        &self,
        pool: &mut ShortTermPool,
        entry: KeyEntry,
    ) -> std::result::Result<IssuedKey, (KeyEntry, KeywardenError)> {
        let secret = match pool.available.open_private(&entry) {
            Ok(secret) => secret,
            Err(e) => return Err((entry, e)),
        };

        // Reseal under the destination store's per-key password; the
        // sealed blob never exists in two stores at once.
        let resealed = match pool.used.seal_private(&secret.signing_key()) {
            Ok(sealed) => sealed,
            Err(e) => return Err((entry, e)),
        };

        let mut retired = entry.clone();
        retired.sealed_private_key = resealed;
        retired.state = KeyState::Consumed;
        let info = retired.info();

        if let Err(e) = pool.used.put(retired) {
            return Err((entry, e));
        }

        self.audit
            .log_acquired(&info.key_id, &info.certificate.serial_number, pool.available.len())
            .await;

        debug!(
            key_id = %info.key_id,
            pool_remaining = pool.available.len(),
            "Key acquired and retired to used store"
        );

        Ok(IssuedKey { info, secret })
    }

    /// Top the available pool up to its floor.
    ///
    /// Returns the number of keys generated. Runs under the pool lock, so
    /// only one replenishment is ever in flight.
    pub async fn replenish(&self) -> Result<usize> {
        let mut pool = self.pool.lock().await;
        self.replenish_locked(&mut pool).await
    }

    async fn replenish_locked(&self, pool: &mut ShortTermPool) -> Result<usize> {
        let mut generated = 0;

        while pool.available.len() < self.target_pool_size {
            // One retry with a fresh id/serial before giving up, per the
            // collision policy
            match self.generate_one(pool).await {
                Ok(()) => {}
                Err(KeywardenError::DuplicateKeyId(_)) | Err(KeywardenError::SerialCollision(_)) => {
                    self.generate_one(pool).await.map_err(|e| match e {
                        KeywardenError::DuplicateKeyId(id) => KeywardenError::Internal(format!(
                            "Repeated key id collision for {id}"
                        )),
                        KeywardenError::SerialCollision(s) => KeywardenError::Internal(format!(
                            "Repeated serial collision for {s}"
                        )),
                        other => other,
                    })?;
                }
                Err(e) => return Err(e),
            }
            generated += 1;
        }

        if generated > 0 {
            info!(
                generated,
                pool_size = pool.available.len(),
                "Replenished short-term key pool"
            );
        }

        Ok(generated)
    }

    /// Generate, certify and store one fresh pool key.
    async fn generate_one(&self, pool: &mut ShortTermPool) -> Result<()> {
        let (signing_key, verifying_key) = crate::keys::crypto::generate_keypair();
        let key_id = format!("key-{}", Uuid::new_v4());

        let certificate = self.issuer.mint(&key_id, &verifying_key)?;
        let sealed = pool.available.seal_private(&signing_key)?;

        // Lifecycle timestamps mirror the certificate window
        let entry = KeyEntry {
            key_id: key_id.clone(),
            public_key: certificate.public_key.clone(),
            sealed_private_key: sealed,
            created_at: certificate.not_before,
            expires_at: certificate.not_after,
            certificate,
            state: KeyState::Available,
        };

        let serial = entry.certificate.serial_number.clone();
        pool.available.put(entry)?;

        self.audit
            .log_replenished(&key_id, &serial, pool.available.len())
            .await;

        Ok(())
    }

    /// Look a key up for verification: long-term first, then available,
    /// then used. Returns a public view; private material stays home.
    pub async fn lookup(&self, key_id: &str) -> Result<KeyInfo> {
        if let Some(info) = self.long_term.read().await.get_info(key_id) {
            return Ok(info);
        }

        let pool = self.pool.lock().await;
        if let Some(info) = pool.available.get_info(key_id) {
            return Ok(info);
        }
        if let Some(info) = pool.used.get_info(key_id) {
            return Ok(info);
        }

        Err(KeywardenError::NotFound(key_id.to_string()))
    }

    /// Preview which used entries the rotation policy would purge at
    /// `now`, without mutating anything.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let pool = self.pool.lock().await;
        self.policy.sweep(now, &pool.used.entries_info())
    }

    /// Purge entries the rotation policy names at `now`.
    ///
    /// The only place a key entry is destroyed; sealed material drops
    /// with it and the decrypted form never existed here.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut pool = self.pool.lock().await;

        let candidates = self.policy.sweep(now, &pool.used.entries_info());
        let mut purged = Vec::with_capacity(candidates.len());

        for key_id in candidates {
            match pool.used.take(&key_id) {
                Ok(entry) => {
                    self.audit.log_purged(&entry.key_id, pool.used.name()).await;
                    purged.push(entry.key_id.clone());
                    drop(entry);
                }
                Err(KeywardenError::NotFound(_)) => {
                    // Named by the policy over a stale snapshot; nothing to do
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        if !purged.is_empty() {
            info!(purged = purged.len(), "Purged expired keys from used store");
        }

        Ok(purged)
    }

    /// One maintenance pass: top the pool up, then purge expired history.
    pub async fn maintenance_tick(&self) {
        if let Err(e) = self.replenish().await {
            warn!("Pool replenishment failed: {}", e);
        }
        if let Err(e) = self.purge_expired(Utc::now()).await {
            warn!("Rotation purge failed: {}", e);
        }
    }

    /// Periodic maintenance loop; runs until the task is dropped.
    pub async fn run_maintenance(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.maintenance_tick().await;
        }
    }

    /// Current pool occupancy.
    pub async fn stats(&self) -> PoolStats {
        let pool = self.pool.lock().await;
        PoolStats {
            available: pool.available.len(),
            used: pool.used.len(),
            certificates_issued: self.issuer.issued_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IssuerConfig;
    use crate::keys::backend::{MemoryBackend, StoreBackend};
    use crate::keys::crypto::generate_keypair;
    use crate::rotation::TimeBasedExpiry;
    use chrono::Duration as ChronoDuration;

    fn memory_store(name: &str) -> KeyStore {
        KeyStore::open(name, Box::new(MemoryBackend::new()), "backing", "per-key").unwrap()
    }

    fn test_issuer(valid_secs: u64) -> CertificateIssuer {
        let (signing_key, _) = generate_keypair();
        CertificateIssuer::new(
            IssuerConfig {
                issuer_name: "keywarden-test".to_string(),
                secure_random_seed: None,
                serial_number_length: 20,
                certificate_valid_secs: valid_secs,
            },
            signing_key,
        )
    }

    fn test_manager(target: usize) -> KeyPoolManager {
        KeyPoolManager::new(
            memory_store("long-term"),
            memory_store("short-term"),
            memory_store("used"),
            test_issuer(3600),
            target,
            Box::new(TimeBasedExpiry),
            AuditLogger::new("node-test".to_string()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_acquire_replenishes_pool_of_three() {
        let manager = test_manager(3);

        let issued = manager.acquire().await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.available, 2);
        assert_eq!(stats.used, 1);
        assert_eq!(stats.certificates_issued, 3);
        assert_eq!(issued.info.state, KeyState::Consumed);
    }

    #[tokio::test]
    async fn test_acquired_key_is_consumed_and_never_available_again() {
        let manager = test_manager(2);

        let issued = manager.acquire().await.unwrap();
        let key_id = issued.info.key_id.clone();

        let info = manager.lookup(&key_id).await.unwrap();
        assert_eq!(info.state, KeyState::Consumed);

        // Drain and refill the pool several times; the id never comes back
        for _ in 0..5 {
            let next = manager.acquire().await.unwrap();
            assert_ne!(next.info.key_id, key_id);
        }
        assert_eq!(manager.lookup(&key_id).await.unwrap().state, KeyState::Consumed);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_yield_distinct_ids() {
        let manager = Arc::new(test_manager(4));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                m.acquire().await.unwrap().info.key_id
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap()));
        }
        assert_eq!(ids.len(), 8);
        assert_eq!(manager.stats().await.used, 8);
    }

    #[tokio::test]
    async fn test_two_acquires_against_single_key_pool() {
        let manager = Arc::new(test_manager(1));
        manager.replenish().await.unwrap();
        assert_eq!(manager.stats().await.available, 1);

        let a = Arc::clone(&manager);
        let b = Arc::clone(&manager);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.acquire().await.unwrap().info.key_id }),
            tokio::spawn(async move { b.acquire().await.unwrap().info.key_id }),
        );
        assert_ne!(ra.unwrap(), rb.unwrap());
    }

    #[tokio::test]
    async fn test_replenish_reaches_floor_and_stops() {
        let manager = test_manager(5);

        let generated = manager.replenish().await.unwrap();
        assert_eq!(generated, 5);
        assert_eq!(manager.stats().await.available, 5);

        // Already at the floor: nothing further happens
        assert_eq!(manager.replenish().await.unwrap(), 0);
        assert_eq!(manager.stats().await.available, 5);
    }

    #[tokio::test]
    async fn test_issued_certificate_verifies() {
        let manager = test_manager(1);
        let issued = manager.acquire().await.unwrap();

        let cert = &issued.info.certificate;
        assert_eq!(cert.key_id, issued.info.key_id);
        assert_eq!(cert.serial_number.len(), 20);
        assert!(cert.verify(&manager.issuer().verifying_key()).is_ok());

        // The handed-out secret matches the certified public key
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        let derived = issued.signing_key().verifying_key();
        assert_eq!(BASE64.encode(derived.to_bytes()), issued.info.public_key);
    }

    #[tokio::test]
    async fn test_sweep_and_purge_expired_used_keys() {
        let manager = test_manager(2);

        let issued = manager.acquire().await.unwrap();
        let key_id = issued.info.key_id.clone();

        // Before expiry nothing is named
        assert!(manager.sweep(Utc::now()).await.is_empty());
        assert!(manager.purge_expired(Utc::now()).await.unwrap().is_empty());

        // Past the validity window the consumed key is purged
        let later = Utc::now() + ChronoDuration::seconds(7200);
        let named = manager.sweep(later).await;
        assert_eq!(named, vec![key_id.clone()]);

        let purged = manager.purge_expired(later).await.unwrap();
        assert_eq!(purged, vec![key_id.clone()]);

        assert!(matches!(
            manager.lookup(&key_id).await,
            Err(KeywardenError::NotFound(_))
        ));
        assert_eq!(manager.stats().await.used, 0);
    }

    #[tokio::test]
    async fn test_available_keys_survive_sweep() {
        let manager = test_manager(3);
        manager.replenish().await.unwrap();

        // Sweeps cover the used store only; the pool is untouched even
        // far in the future
        let later = Utc::now() + ChronoDuration::seconds(100_000);
        manager.purge_expired(later).await.unwrap();
        assert_eq!(manager.stats().await.available, 3);
    }

    #[tokio::test]
    async fn test_lookup_checks_long_term_first() {
        let mut long_term = memory_store("long-term");
        let issuer = test_issuer(3600);

        // Provision an identity entry the way the daemon shell does
        let (signing_key, verifying_key) = generate_keypair();
        let certificate = issuer.mint("identity", &verifying_key).unwrap();
        let entry = KeyEntry {
            key_id: "identity".to_string(),
            public_key: certificate.public_key.clone(),
            sealed_private_key: long_term.seal_private(&signing_key).unwrap(),
            created_at: certificate.not_before,
            expires_at: certificate.not_after,
            certificate,
            state: KeyState::Available,
        };
        long_term.put(entry).unwrap();

        let manager = KeyPoolManager::new(
            long_term,
            memory_store("short-term"),
            memory_store("used"),
            issuer,
            2,
            Box::new(TimeBasedExpiry),
            AuditLogger::new("node-test".to_string()),
        )
        .unwrap();

        let info = manager.lookup("identity").await.unwrap();
        assert_eq!(info.key_id, "identity");

        assert!(matches!(
            manager.lookup("missing").await,
            Err(KeywardenError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_short_term_stores_rejected() {
        let mut available = memory_store("short-term");
        let mut used = memory_store("used");
        let issuer = test_issuer(3600);

        let (signing_key, verifying_key) = generate_keypair();
        let certificate = issuer.mint("key-dup", &verifying_key).unwrap();
        let entry = KeyEntry {
            key_id: "key-dup".to_string(),
            public_key: certificate.public_key.clone(),
            sealed_private_key: available.seal_private(&signing_key).unwrap(),
            created_at: certificate.not_before,
            expires_at: certificate.not_after,
            certificate,
            state: KeyState::Available,
        };
        available.put(entry.clone()).unwrap();
        let mut retired = entry;
        retired.state = KeyState::Consumed;
        used.put(retired).unwrap();

        let result = KeyPoolManager::new(
            memory_store("long-term"),
            available,
            used,
            issuer,
            2,
            Box::new(TimeBasedExpiry),
            AuditLogger::new("node-test".to_string()),
        );
        assert!(matches!(result, Err(KeywardenError::Internal(_))));
    }

    /// Backend that accepts the initial container write, then fails.
    struct FailingBackend {
        writes: std::sync::atomic::AtomicUsize,
    }

    impl FailingBackend {
        fn new() -> Self {
            Self {
                writes: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    impl StoreBackend for FailingBackend {
        fn load(&self) -> crate::types::Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn persist(&self, _bytes: &[u8]) -> crate::types::Result<()> {
            let n = self
                .writes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Ok(())
            } else {
                Err(KeywardenError::StoreIo("disk full".into()))
            }
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    #[tokio::test]
    async fn test_acquire_surfaces_pool_exhausted_when_replenish_fails() {
        let broken = KeyStore::open(
            "short-term",
            Box::new(FailingBackend::new()),
            "backing",
            "per-key",
        )
        .unwrap();

        let manager = KeyPoolManager::new(
            memory_store("long-term"),
            broken,
            memory_store("used"),
            test_issuer(3600),
            2,
            Box::new(TimeBasedExpiry),
            AuditLogger::new("node-test".to_string()),
        )
        .unwrap();

        let result = manager.acquire().await;
        assert!(matches!(result, Err(KeywardenError::PoolExhausted(_))));
        // The failed put rolled back; nothing half-created remains
        assert_eq!(manager.stats().await.available, 0);
    }

    #[tokio::test]
    async fn test_failed_handoff_restores_entry_to_available() {
        let mut available = memory_store("short-term");
        let issuer = test_issuer(3600);

        let (signing_key, verifying_key) = generate_keypair();
        let certificate = issuer.mint("key-fragile", &verifying_key).unwrap();
        let entry = KeyEntry {
            key_id: "key-fragile".to_string(),
            public_key: certificate.public_key.clone(),
            sealed_private_key: available.seal_private(&signing_key).unwrap(),
            created_at: certificate.not_before,
            expires_at: certificate.not_after,
            certificate,
            state: KeyState::Available,
        };
        available.put(entry).unwrap();

        // Used store accepts its initial container, then refuses writes,
        // so the take succeeds and the put-to-used fails mid-handoff
        let used = KeyStore::open(
            "used",
            Box::new(FailingBackend::new()),
            "backing",
            "per-key",
        )
        .unwrap();

        let manager = KeyPoolManager::new(
            memory_store("long-term"),
            available,
            used,
            issuer,
            1,
            Box::new(TimeBasedExpiry),
            AuditLogger::new("node-test".to_string()),
        )
        .unwrap();

        let result = manager.acquire().await;
        assert!(matches!(result, Err(KeywardenError::StoreIo(_))));

        // The taken entry came back untouched; no key is stranded between
        // stores and a later caller can still receive it
        let stats = manager.stats().await;
        assert_eq!(stats.available, 1);
        assert_eq!(stats.used, 0);

        let info = manager.lookup("key-fragile").await.unwrap();
        assert_eq!(info.state, KeyState::Available);
    }
}
