//! Configuration for keywarden
//!
//! CLI arguments and environment variable handling using clap. The config
//! surface mirrors what the surrounding identity service provisions: three
//! key store groups, the pool floor and the self-issuer parameters.

use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// keywarden - ephemeral key lifecycle manager
///
/// Maintains a warm pool of one-time-use Ed25519 signing keys, certifies
/// each with a self-issued certificate, and retires consumed keys so
/// signatures they produced stay verifiable.
#[derive(Parser, Debug, Clone)]
#[command(name = "keywarden")]
#[command(about = "Ephemeral key lifecycle manager for identity federation")]
pub struct Args {
    /// Unique node identifier for this instance (audit trail)
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Path of the long-term key store
    #[arg(long, env = "LONG_TERM_STORE", default_value = "keys/long-term.kws")]
    pub long_term_store: PathBuf,

    /// Backing password of the long-term store
    #[arg(long, env = "LONG_TERM_STORE_PASSWORD")]
    pub long_term_store_password: String,

    /// Per-key password of the long-term store
    #[arg(long, env = "LONG_TERM_KEY_PASSWORD")]
    pub long_term_key_password: String,

    /// Kind of the long-term store (file, memory)
    #[arg(long, env = "LONG_TERM_STORE_KIND", default_value = "file")]
    pub long_term_store_kind: String,

    /// Path of the short-term available-key store
    #[arg(long, env = "SHORT_TERM_STORE", default_value = "keys/short-term.kws")]
    pub short_term_store: PathBuf,

    /// Backing password of the short-term store
    #[arg(long, env = "SHORT_TERM_STORE_PASSWORD")]
    pub short_term_store_password: String,

    /// Per-key password of the short-term store
    #[arg(long, env = "SHORT_TERM_KEY_PASSWORD")]
    pub short_term_key_password: String,

    /// Kind of the short-term store (file, memory)
    #[arg(long, env = "SHORT_TERM_STORE_KIND", default_value = "file")]
    pub short_term_store_kind: String,

    /// Path of the used short-term key store
    #[arg(long, env = "USED_SHORT_TERM_STORE", default_value = "keys/used-short-term.kws")]
    pub used_short_term_store: PathBuf,

    /// Backing password of the used short-term store
    #[arg(long, env = "USED_SHORT_TERM_STORE_PASSWORD")]
    pub used_short_term_store_password: String,

    /// Per-key password of the used short-term store
    #[arg(long, env = "USED_SHORT_TERM_KEY_PASSWORD")]
    pub used_short_term_key_password: String,

    /// Kind of the used short-term store (file, memory)
    #[arg(long, env = "USED_SHORT_TERM_STORE_KIND", default_value = "file")]
    pub used_short_term_store_kind: String,

    /// Floor size of the available short-term key pool
    #[arg(long, env = "INITIAL_SHORT_KEY_POOL", default_value = "20")]
    pub initial_short_key_pool: usize,

    /// Subject and issuer name stamped on self-issued certificates
    #[arg(long, env = "ISSUER_NAME", default_value = "keywarden")]
    pub issuer_name: String,

    /// Optional fixed seed for the certificate serial stream.
    ///
    /// A fixed seed makes serial numbers predictable across restarts; it
    /// exists for reproducible test fixtures only. Leave unset in
    /// production to draw from OS entropy.
    #[arg(long, env = "SECURE_RANDOM_SEED")]
    pub secure_random_seed: Option<String>,

    /// Exact decimal-digit length of certificate serial numbers
    #[arg(long, env = "SERIAL_NUMBER_LENGTH", default_value = "20")]
    pub serial_number_length: usize,

    /// Certificate validity window in seconds (default 90 days)
    #[arg(long, env = "CERTIFICATE_VALID_SECS", default_value = "7776000")]
    pub certificate_valid_secs: u64,

    /// Sign certificates with the host's server key instead of a
    /// dedicated identity key (selects the long-term store alias)
    #[arg(long, env = "USE_SERVER_KEY", default_value = "false")]
    pub use_server_key: bool,

    /// Hostname this instance issues certificates for
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    pub hostname: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Path of the JSONL key-lifecycle audit log (disabled when unset)
    #[arg(long, env = "AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// Maintenance tick interval in seconds (replenish + rotation sweep)
    #[arg(long, env = "MAINTENANCE_INTERVAL_SECS", default_value = "60")]
    pub maintenance_interval_secs: u64,
}

/// Backend kind of a key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Sealed JSON container on disk
    File,
    /// In-memory fake (tests, ephemeral deployments)
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StoreKind::File),
            "memory" => Ok(StoreKind::Memory),
            other => Err(format!("unknown store kind: {other}")),
        }
    }
}

/// Resolved configuration of one key store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store file path (ignored by the memory kind)
    pub path: PathBuf,
    /// Backend kind
    pub kind: StoreKind,
    /// Password sealing the store container
    pub backing_password: String,
    /// Password sealing each private key inside the container
    pub key_password: String,
}

/// Parameters of the self-issuing certificate authority.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Subject and issuer name on minted certificates
    pub issuer_name: String,
    /// Optional fixed seed for the serial stream (test reproducibility)
    pub secure_random_seed: Option<String>,
    /// Exact decimal-digit length of serial numbers
    pub serial_number_length: usize,
    /// Validity window applied to each certificate
    pub certificate_valid_secs: u64,
}

impl Args {
    /// Resolved configuration of the long-term store.
    pub fn long_term(&self) -> Result<StoreConfig, String> {
        Ok(StoreConfig {
            path: self.long_term_store.clone(),
            kind: self.long_term_store_kind.parse()?,
            backing_password: self.long_term_store_password.clone(),
            key_password: self.long_term_key_password.clone(),
        })
    }

    /// Resolved configuration of the short-term available store.
    pub fn short_term_available(&self) -> Result<StoreConfig, String> {
        Ok(StoreConfig {
            path: self.short_term_store.clone(),
            kind: self.short_term_store_kind.parse()?,
            backing_password: self.short_term_store_password.clone(),
            key_password: self.short_term_key_password.clone(),
        })
    }

    /// Resolved configuration of the used short-term store.
    pub fn short_term_used(&self) -> Result<StoreConfig, String> {
        Ok(StoreConfig {
            path: self.used_short_term_store.clone(),
            kind: self.used_short_term_store_kind.parse()?,
            backing_password: self.used_short_term_store_password.clone(),
            key_password: self.used_short_term_key_password.clone(),
        })
    }

    /// Resolved issuer parameters.
    pub fn issuer(&self) -> IssuerConfig {
        IssuerConfig {
            issuer_name: self.issuer_name.clone(),
            secure_random_seed: self.secure_random_seed.clone(),
            serial_number_length: self.serial_number_length,
            certificate_valid_secs: self.certificate_valid_secs,
        }
    }

    /// Long-term store alias the issuer signs with.
    pub fn issuer_alias(&self) -> &'static str {
        if self.use_server_key {
            "server"
        } else {
            "identity"
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.long_term()?;
        self.short_term_available()?;
        self.short_term_used()?;

        if self.serial_number_length == 0 || self.serial_number_length > 100 {
            return Err("SERIAL_NUMBER_LENGTH must be between 1 and 100".to_string());
        }

        if self.certificate_valid_secs == 0 {
            return Err("CERTIFICATE_VALID_SECS must be greater than zero".to_string());
        }

        if self.maintenance_interval_secs == 0 {
            return Err("MAINTENANCE_INTERVAL_SECS must be greater than zero".to_string());
        }

        // An entry has at most one home at any instant, so the short-term
        // stores must not share a container.
        if self.short_term_store == self.used_short_term_store {
            return Err(
                "SHORT_TERM_STORE and USED_SHORT_TERM_STORE must be distinct paths".to_string(),
            );
        }

        Ok(())
    }
}
