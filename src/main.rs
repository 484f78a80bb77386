//! Keywarden - ephemeral signing key lifecycle manager

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keywarden::{
    config::{Args, StoreConfig, StoreKind},
    issuer::CertificateIssuer,
    keys::{
        backend::{FileBackend, MemoryBackend, StoreBackend},
        crypto::generate_keypair,
        entry::{KeyEntry, KeyState},
        store::KeyStore,
    },
    logging::AuditLogger,
    pool::KeyPoolManager,
    rotation::TimeBasedExpiry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keywarden={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Keywarden - Key Lifecycle Manager");
    info!("======================================");
    info!(
        "Version: {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_SHORT"),
        env!("BUILD_TIMESTAMP")
    );
    info!("Node ID: {}", args.node_id);
    info!("Hostname: {}", args.hostname);
    info!("Issuer: {} (alias: {})", args.issuer_name, args.issuer_alias());
    info!("Pool floor: {} keys", args.initial_short_key_pool);
    info!("Serial length: {} digits", args.serial_number_length);
    info!("Certificate validity: {}s", args.certificate_valid_secs);
    info!("Maintenance interval: {}s", args.maintenance_interval_secs);
    info!("======================================");

    // Audit logger, optionally backed by a JSONL file
    let audit = AuditLogger::new(args.node_id.to_string());
    if let Some(ref path) = args.audit_log {
        if let Err(e) = audit.init_file(path.clone()).await {
            error!("Failed to open audit log {}: {}", path.display(), e);
            std::process::exit(1);
        }
        info!("Audit log: {}", path.display());
    }

    // Open the three stores; a wrong backing password fails here, before
    // anything is generated or mutated
    let long_term_cfg = match args.long_term() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Long-term store config error: {}", e);
            std::process::exit(1);
        }
    };
    let mut long_term = open_store("long-term", &long_term_cfg, &audit).await;

    let available_cfg = match args.short_term_available() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Short-term store config error: {}", e);
            std::process::exit(1);
        }
    };
    let available = open_store("short-term", &available_cfg, &audit).await;

    let used_cfg = match args.short_term_used() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Used store config error: {}", e);
            std::process::exit(1);
        }
    };
    let used = open_store("used", &used_cfg, &audit).await;

    // Load the issuer identity key from the long-term store, provisioning
    // one on first start
    let issuer = match provision_issuer(&args, &mut long_term) {
        Ok(issuer) => issuer,
        Err(e) => {
            error!("Failed to provision issuer key: {}", e);
            std::process::exit(1);
        }
    };

    let manager = match KeyPoolManager::new(
        long_term,
        available,
        used,
        issuer,
        args.initial_short_key_pool,
        Box::new(TimeBasedExpiry),
        audit,
    ) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("Failed to initialize key pool: {}", e);
            std::process::exit(1);
        }
    };

    // Warm the pool before declaring readiness
    match manager.replenish().await {
        Ok(generated) => {
            let stats = manager.stats().await;
            info!(
                generated,
                available = stats.available,
                used = stats.used,
                "Key pool warmed"
            );
        }
        Err(e) => {
            error!("Initial pool replenishment failed: {}", e);
            std::process::exit(1);
        }
    }

    // Periodic replenish + rotation sweep
    let maintenance = tokio::spawn(Arc::clone(&manager).run_maintenance(Duration::from_secs(
        args.maintenance_interval_secs,
    )));
    info!("Maintenance loop started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    maintenance.abort();

    let stats = manager.stats().await;
    info!(
        available = stats.available,
        used = stats.used,
        certificates_issued = stats.certificates_issued,
        "Keywarden stopped"
    );

    Ok(())
}

/// Open one store per its configured backend kind, exiting on failure.
async fn open_store(name: &str, cfg: &StoreConfig, audit: &AuditLogger) -> KeyStore {
    let backend: Box<dyn StoreBackend> = match cfg.kind {
        StoreKind::File => Box::new(FileBackend::new(cfg.path.clone())),
        StoreKind::Memory => Box::new(MemoryBackend::new()),
    };

    match KeyStore::open(name, backend, &cfg.backing_password, &cfg.key_password) {
        Ok(store) => {
            info!(store = name, entries = store.len(), "Store opened");
            audit.log_store_opened(name, store.len()).await;
            store
        }
        Err(e) => {
            error!("Failed to open {} store: {}", name, e);
            std::process::exit(1);
        }
    }
}

/// Load the issuer's identity key from the long-term store, generating
/// and certifying one on first start.
fn provision_issuer(args: &Args, long_term: &mut KeyStore) -> keywarden::Result<CertificateIssuer> {
    let alias = args.issuer_alias();

    if let Some(info) = long_term.get_info(alias) {
        let secret = long_term.export_private(alias)?;
        let issuer = CertificateIssuer::new(args.issuer(), secret.signing_key());

        info!(
            alias,
            serial = %info.certificate.serial_number,
            "Loaded issuer key from long-term store"
        );
        return Ok(issuer);
    }

    // First start: the identity certificate is signed by its own key
    let (signing_key, verifying_key) = generate_keypair();
    let issuer = CertificateIssuer::new(args.issuer(), signing_key.clone());
    let certificate = issuer.mint(alias, &verifying_key)?;

    let entry = KeyEntry {
        key_id: alias.to_string(),
        public_key: certificate.public_key.clone(),
        sealed_private_key: long_term.seal_private(&signing_key)?,
        created_at: certificate.not_before,
        expires_at: certificate.not_after,
        certificate,
        state: KeyState::Available,
    };
    long_term.put(entry)?;

    info!(alias, "Provisioned new issuer key in long-term store");
    Ok(issuer)
}
