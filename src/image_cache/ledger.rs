//! Durable failure ledger.
//!
//! Records conclusive download failures per (item, language) so the browser
//! does not hammer CDNs for artwork that was missing yesterday and is almost
//! certainly still missing today. Records expire after a retry window; a
//! later success deletes them.
//!
//! The ledger file is shared with other processes using the same cache root,
//! so every rewrite goes through temp-file + atomic rename under the
//! cross-process lock. A crash mid-write leaves the previous document intact.
//! I/O failures never block callers: the ledger degrades to "always retry".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::fs_lock::{CrossProcessLock, LockError};

use super::models::Language;

/// One failed (item, language) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub item_id: String,
    pub language: Language,
    pub last_failed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// On-disk document. Versioned so a future format change can migrate.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    records: Vec<FailureRecord>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Write-path lock failures surface; silent data loss on write is not
    /// acceptable. Everything else is logged and swallowed.
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a recorded failure suppresses retries.
    pub retry_window: Duration,
    /// Records older than this are deleted by maintenance sweeps.
    pub retention: Duration,
    pub read_lock_timeout: StdDuration,
    pub write_lock_timeout: StdDuration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retry_window: Duration::days(10),
            retention: Duration::days(30),
            read_lock_timeout: StdDuration::from_secs(30),
            write_lock_timeout: StdDuration::from_secs(60),
        }
    }
}

/// Persistent per-(item, language) failure store.
pub struct FailureLedger {
    path: PathBuf,
    lock: CrossProcessLock,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
    records: Mutex<HashMap<(String, Language), FailureRecord>>,
}

impl FailureLedger {
    /// Open the ledger at `path`, loading any existing document.
    ///
    /// A missing, unreadable, or corrupt file starts an empty ledger; the
    /// previous content is logged and abandoned rather than blocking startup.
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>, config: LedgerConfig) -> Self {
        let path = path.into();
        let lock = CrossProcessLock::new(path.with_extension("lock"));
        let records = Self::load(&path, &lock, config.read_lock_timeout);
        Self {
            path,
            lock,
            clock,
            config,
            records: Mutex::new(records),
        }
    }

    /// True if a failure for this key was recorded within the retry window.
    pub fn should_skip(&self, item_id: &str, language: Language) -> bool {
        let records = self.records.lock().unwrap();
        let Some(record) = records.get(&(item_id.to_string(), language)) else {
            return false;
        };
        let age = self.clock.now() - record.last_failed_at;
        age < self.config.retry_window
    }

    /// Upsert a failure record with the current timestamp.
    pub fn record_failure(
        &self,
        item_id: &str,
        language: Language,
        display_name: Option<&str>,
    ) -> Result<(), LedgerError> {
        {
            let mut records = self.records.lock().unwrap();
            records.insert(
                (item_id.to_string(), language),
                FailureRecord {
                    item_id: item_id.to_string(),
                    language,
                    last_failed_at: self.clock.now(),
                    display_name: display_name.map(str::to_string),
                },
            );
        }
        debug!("recorded artwork failure for {item_id}/{language}");
        self.persist()
    }

    /// Remove the record for a key after a conclusive success.
    pub fn clear(&self, item_id: &str, language: Language) -> Result<(), LedgerError> {
        let removed = {
            let mut records = self.records.lock().unwrap();
            records.remove(&(item_id.to_string(), language)).is_some()
        };
        if !removed {
            return Ok(());
        }
        debug!("cleared artwork failure for {item_id}/{language}");
        self.persist()
    }

    /// Delete records older than the retention window. Returns the number
    /// of records removed.
    pub fn prune(&self) -> Result<usize, LedgerError> {
        let cutoff = self.clock.now() - self.config.retention;
        let removed = {
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|_, r| r.last_failed_at >= cutoff);
            before - records.len()
        };
        if removed == 0 {
            return Ok(0);
        }
        info!("pruned {removed} expired failure records");
        self.persist()?;
        Ok(removed)
    }

    /// Re-read the document another process may have rewritten.
    ///
    /// Degrades to the in-memory state when the lock or the parse fails.
    pub fn reload(&self) {
        let loaded = Self::load(&self.path, &self.lock, self.config.read_lock_timeout);
        *self.records.lock().unwrap() = loaded;
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, item_id: &str, language: Language) -> Option<FailureRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(item_id.to_string(), language))
            .cloned()
    }

    fn load(
        path: &Path,
        lock: &CrossProcessLock,
        timeout: StdDuration,
    ) -> HashMap<(String, Language), FailureRecord> {
        if !path.exists() {
            return HashMap::new();
        }
        let _guard = match lock.acquire(timeout) {
            Ok(guard) => guard,
            Err(err) => {
                warn!("could not lock failure ledger for reading, starting empty: {err}");
                return HashMap::new();
            }
        };
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!("could not read failure ledger {path:?}: {err}");
                return HashMap::new();
            }
        };
        let document: LedgerDocument = match serde_json::from_str(&content) {
            Ok(document) => document,
            Err(err) => {
                warn!("failure ledger {path:?} is corrupt, starting empty: {err}");
                return HashMap::new();
            }
        };
        document
            .records
            .into_iter()
            .map(|r| ((r.item_id.clone(), r.language), r))
            .collect()
    }

    /// Rewrite the whole document atomically under the cross-process lock.
    ///
    /// Lock timeouts propagate; plain I/O errors are logged and swallowed so
    /// the pipeline keeps serving downloads.
    fn persist(&self) -> Result<(), LedgerError> {
        let document = {
            let records = self.records.lock().unwrap();
            let mut list: Vec<FailureRecord> = records.values().cloned().collect();
            list.sort_by(|a, b| {
                (&a.item_id, a.language.as_str()).cmp(&(&b.item_id, b.language.as_str()))
            });
            LedgerDocument { records: list }
        };

        let _guard = self.lock.acquire(self.config.write_lock_timeout)?;

        if let Err(err) = self.write_document(&document) {
            warn!("failed to persist failure ledger {:?}: {err}", self.path);
        }
        Ok(())
    }

    fn write_document(&self, document: &LedgerDocument) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("ledger path has no parent: {:?}", self.path))?;
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(document)?;
        let temp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(temp.path(), json)?;
        temp.persist(&self.path)?;
        Ok(())
    }
}
