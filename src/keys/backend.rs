//! Storage backends for key stores
//!
//! A `KeyStore` serializes to one sealed container blob; backends only
//! move that blob to and from durable storage. The file backend replaces
//! the container atomically and fsyncs before returning, so the on-disk
//! view never lags a completed mutation. The memory backend is the test
//! fake the pool manager is exercised against.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use crate::types::{KeywardenError, Result};

/// Persistence attempts before a transient I/O error becomes fatal.
const PERSIST_ATTEMPTS: u32 = 3;

/// Base backoff between persistence attempts.
const PERSIST_BACKOFF: Duration = Duration::from_millis(50);

/// Moves sealed container blobs to and from durable storage.
pub trait StoreBackend: Send + Sync {
    /// Load the current container blob, or `None` if nothing was ever
    /// persisted.
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Durably persist the container blob before returning.
    ///
    /// Implementations may block on I/O and retry backoff; callers on an
    /// async runtime treat persistence as blocking storage work.
    fn persist(&self, bytes: &[u8]) -> Result<()>;

    /// Human-readable location for logs and errors.
    fn describe(&self) -> String;
}

/// File-backed storage: atomic replace with fsync and bounded retry.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_once(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write to a sibling temp file, fsync, then rename over the
        // container so a crash never leaves a half-written store.
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        // Persist the rename itself where the platform allows it.
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }

        Ok(())
    }

    /// Run a write with bounded retry, surfacing `StoreIo` once the
    /// attempts are exhausted.
    ///
    /// Sleeps synchronously between attempts (150 ms worst case), so the
    /// caller holds its locks for that long on a persistently failing
    /// disk.
    fn with_retry(&self, mut write: impl FnMut() -> std::io::Result<()>) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=PERSIST_ATTEMPTS {
            match write() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "Store persist attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < PERSIST_ATTEMPTS {
                        std::thread::sleep(PERSIST_BACKOFF * attempt);
                    }
                }
            }
        }

        Err(KeywardenError::StoreIo(format!(
            "Failed to persist {} after {PERSIST_ATTEMPTS} attempts: {}",
            self.path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

impl StoreBackend for FileBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeywardenError::StoreIo(format!(
                "Failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn persist(&self, bytes: &[u8]) -> Result<()> {
        self.with_retry(|| self.write_once(bytes))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory storage fake for deterministic tests.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Option<Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend pre-seeded with an existing container blob.
    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(Some(bytes)),
        }
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn persist(&self, bytes: &[u8]) -> Result<()> {
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
