//! Key-lifecycle audit logging
//!
//! Writes append-only JSONL events for every pool mutation so operators
//! can reconstruct which keys existed, when they were handed out, and
//! when they were destroyed. Events carry ids and serials only - never
//! passwords or private material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A key store was opened (or created) at startup
    StoreOpened,
    /// A fresh key entered the available pool
    KeyReplenished,
    /// A key was handed out and retired to the used store
    KeyAcquired,
    /// An expired key was destroyed by rotation
    KeyPurged,
}

/// One key-lifecycle audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub event_type: AuditEventType,
    /// Node that performed the operation
    pub node_id: String,
    /// Key id involved, if any
    pub key_id: Option<String>,
    /// Certificate serial involved, if any
    pub serial_number: Option<String>,
    /// Store the operation touched
    pub store: Option<String>,
    /// Available pool size after the operation
    pub pool_size: Option<usize>,
}

impl AuditEvent {
    /// Create a new audit event
    pub fn new(event_type: AuditEventType, node_id: String) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            node_id,
            key_id: None,
            serial_number: None,
            store: None,
            pool_size: None,
        }
    }

    /// Set the key id
    pub fn with_key(mut self, key_id: String) -> Self {
        self.key_id = Some(key_id);
        self
    }

    /// Set the certificate serial
    pub fn with_serial(mut self, serial: String) -> Self {
        self.serial_number = Some(serial);
        self
    }

    /// Set the store name
    pub fn with_store(mut self, store: String) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the post-operation pool size
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Audit logger that appends events to a JSONL file
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Mutex<AuditLoggerInner>>,
    node_id: String,
}

struct AuditLoggerInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl AuditLogger {
    /// Create a new audit logger (disabled until a file is attached)
    pub fn new(node_id: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AuditLoggerInner {
                writer: None,
                path: None,
            })),
            node_id,
        }
    }

    /// Attach the JSONL output file
    pub async fn init_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut inner = self.inner.lock().await;
        inner.writer = Some(BufWriter::new(file));
        inner.path = Some(path.clone());

        info!("Key audit logging initialized to {}", path.display());
        Ok(())
    }

    /// Log an audit event
    pub async fn log(&self, event: AuditEvent) {
        let jsonl = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock().await;

        if let Some(ref mut writer) = inner.writer {
            if let Err(e) = writeln!(writer, "{}", jsonl) {
                error!("Failed to write audit event: {}", e);
            }
            // Flush each event; audit lines are rare and must survive a crash
            if let Err(e) = writer.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        }
    }

    /// Log a store-opened event
    pub async fn log_store_opened(&self, store: &str, entries: usize) {
        let event = AuditEvent::new(AuditEventType::StoreOpened, self.node_id.clone())
            .with_store(store.to_string())
            .with_pool_size(entries);
        self.log(event).await;
    }

    /// Log a replenished key
    pub async fn log_replenished(&self, key_id: &str, serial: &str, pool_size: usize) {
        let event = AuditEvent::new(AuditEventType::KeyReplenished, self.node_id.clone())
            .with_key(key_id.to_string())
            .with_serial(serial.to_string())
            .with_pool_size(pool_size);
        self.log(event).await;
    }

    /// Log an acquired (consumed) key
    pub async fn log_acquired(&self, key_id: &str, serial: &str, pool_size: usize) {
        let event = AuditEvent::new(AuditEventType::KeyAcquired, self.node_id.clone())
            .with_key(key_id.to_string())
            .with_serial(serial.to_string())
            .with_pool_size(pool_size);
        self.log(event).await;
    }

    /// Log a purged key
    pub async fn log_purged(&self, key_id: &str, store: &str) {
        let event = AuditEvent::new(AuditEventType::KeyPurged, self.node_id.clone())
            .with_key(key_id.to_string())
            .with_store(store.to_string());
        self.log(event).await;
    }

    /// Node id stamped on events
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(AuditEventType::KeyAcquired, "node-1".to_string())
            .with_key("key-123".to_string())
            .with_serial("12345678901234567890".to_string())
            .with_pool_size(7);

        let jsonl = event.to_jsonl().unwrap();
        assert!(jsonl.contains("key_acquired"));
        assert!(jsonl.contains("key-123"));
        assert!(jsonl.contains("12345678901234567890"));
    }

    #[test]
    fn test_purge_event() {
        let event = AuditEvent::new(AuditEventType::KeyPurged, "node-1".to_string())
            .with_key("key-9".to_string())
            .with_store("used".to_string());

        let jsonl = event.to_jsonl().unwrap();
        assert!(jsonl.contains("key_purged"));
        assert!(jsonl.contains("used"));
    }

    #[tokio::test]
    async fn test_logger_appends_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let logger = AuditLogger::new("node-test".to_string());
        logger.init_file(path.clone()).await.unwrap();

        logger.log_replenished("key-1", "11111111111111111111", 1).await;
        logger.log_acquired("key-1", "11111111111111111111", 0).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("key_replenished"));
        assert!(lines[1].contains("key_acquired"));
    }

    #[tokio::test]
    async fn test_logger_without_file_is_a_noop() {
        let logger = AuditLogger::new("node-test".to_string());
        // Must not panic or block
        logger.log_purged("key-1", "used").await;
        assert_eq!(logger.node_id(), "node-test");
    }
}
