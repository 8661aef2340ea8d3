//! Operation log: bounded, persisted record of mutations awaiting replay.
//!
//! `record` never fails. When the log grows past its capacity the oldest
//! entries are dropped, synced or not; losing unsynced entries that way is
//! an accepted bound of the design and is logged at warn level.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::clock::Clock;
use crate::models::{OperationEntry, OperationId, OperationKind, DEFAULT_ID_COLUMN};
use crate::remote::{RemoteError, RemoteResult, RemoteStore};
use crate::storage::{load_json, save_json, KeyValueStore};

/// Default number of entries retained
pub const DEFAULT_LOG_CAPACITY: usize = 1000;
/// Default key under which the log is persisted
pub const DEFAULT_OPLOG_KEY: &str = "wellsync.oplog";

/// Settings for an [`OperationLog`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationLogConfig {
    /// Maximum number of entries retained
    pub capacity: usize,
    /// Storage key for the persisted log
    pub storage_key: String,
    /// Column holding row identifiers in payloads
    pub id_column: String,
}

impl Default for OperationLogConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOG_CAPACITY,
            storage_key: DEFAULT_OPLOG_KEY.to_string(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
        }
    }
}

/// Outcome of a [`OperationLog::drain`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries replayed in this pass
    pub attempted: usize,
    /// Entries the remote accepted
    pub synced: usize,
    /// One message per failed entry
    pub errors: Vec<String>,
}

impl DrainReport {
    pub fn failed(&self) -> usize {
        self.errors.len()
    }
}

enum MarkSynced {
    Marked,
    /// Another drain got there first
    AlreadySynced,
    /// Truncated away by `record` while the replay was in flight
    Evicted,
}

/// Append-only log of offline mutations
pub struct OperationLog {
    entries: Mutex<Vec<OperationEntry>>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: OperationLogConfig,
}

impl OperationLog {
    /// Create a log backed by `store`, restoring any persisted entries.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: OperationLogConfig,
    ) -> Self {
        let mut entries = match load_json::<Vec<OperationEntry>>(store.as_ref(), &config.storage_key)
        {
            Ok(entries) => entries.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(
                    "Discarding unreadable operation log at '{}': {}",
                    config.storage_key,
                    error
                );
                Vec::new()
            }
        };
        let capacity = config.capacity.max(1);
        if entries.len() > capacity {
            entries.drain(..entries.len() - capacity);
        }

        Self {
            entries: Mutex::new(entries),
            store,
            clock,
            config: OperationLogConfig { capacity, ..config },
        }
    }

    pub const fn config(&self) -> &OperationLogConfig {
        &self.config
    }

    /// Append an unsynced operation.
    pub fn record(
        &self,
        table: impl Into<String>,
        payload: Value,
        kind: OperationKind,
    ) -> OperationEntry {
        let entry = OperationEntry::new(table, payload, kind, self.clock.now_millis());

        let mut entries = self.lock();
        entries.push(entry.clone());

        if entries.len() > self.config.capacity {
            let excess = entries.len() - self.config.capacity;
            let lost = entries[..excess].iter().filter(|entry| !entry.synced).count();
            entries.drain(..excess);
            if lost > 0 {
                tracing::warn!(
                    "Operation log over capacity ({}); dropped {} unsynced operation(s)",
                    self.config.capacity,
                    lost
                );
            }
        }

        self.persist(&entries);
        tracing::debug!("Recorded {} on '{}' ({})", entry.kind, entry.table, entry.id);
        entry
    }

    /// Replay every unsynced entry against `remote`, in capture order.
    ///
    /// Only entries present when the call starts are replayed. Failures are
    /// collected in the report and leave the entry eligible for the next pass.
    pub async fn drain(&self, remote: &dyn RemoteStore) -> DrainReport {
        let pending = self.pending();
        let mut report = DrainReport {
            attempted: pending.len(),
            ..DrainReport::default()
        };
        if pending.is_empty() {
            return report;
        }

        for entry in pending {
            match self.replay(remote, &entry).await {
                Ok(()) => match self.mark_synced(&entry.id) {
                    MarkSynced::Marked => report.synced += 1,
                    MarkSynced::Evicted => {
                        tracing::warn!(
                            "Replayed {} on '{}' ({}) after it was dropped from the log",
                            entry.kind,
                            entry.table,
                            entry.id
                        );
                        report.synced += 1;
                    }
                    MarkSynced::AlreadySynced => {}
                },
                Err(error) => {
                    tracing::warn!(
                        "Failed to replay {} on '{}' ({}): {}",
                        entry.kind,
                        entry.table,
                        entry.id,
                        error
                    );
                    report
                        .errors
                        .push(format!("{} {} {}: {error}", entry.kind, entry.table, entry.id));
                }
            }
        }

        tracing::debug!(
            "Drained operation log: {} synced, {} failed",
            report.synced,
            report.failed()
        );
        report
    }

    async fn replay(&self, remote: &dyn RemoteStore, entry: &OperationEntry) -> RemoteResult<()> {
        match entry.kind {
            OperationKind::Insert => remote.insert(&entry.table, &entry.payload).await,
            OperationKind::Update => {
                let id = self.required_row_id(entry)?;
                remote.update(&entry.table, &entry.payload, &id).await
            }
            OperationKind::Delete => {
                let id = self.required_row_id(entry)?;
                remote.delete(&entry.table, &id).await
            }
        }
    }

    fn required_row_id(&self, entry: &OperationEntry) -> RemoteResult<String> {
        entry
            .row_id(&self.config.id_column)
            .ok_or_else(|| RemoteError::MissingRowId(self.config.id_column.clone()))
    }

    /// Flip `synced` on an entry the remote accepted.
    fn mark_synced(&self, id: &OperationId) -> MarkSynced {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|entry| entry.id == *id) else {
            return MarkSynced::Evicted;
        };
        if entry.synced {
            return MarkSynced::AlreadySynced;
        }
        entry.synced = true;
        self.persist(&entries);
        MarkSynced::Marked
    }

    /// Number of unsynced entries
    pub fn pending_count(&self) -> usize {
        self.lock().iter().filter(|entry| !entry.synced).count()
    }

    /// Snapshot of all entries in capture order
    pub fn entries(&self) -> Vec<OperationEntry> {
        self.lock().clone()
    }

    /// Snapshot of unsynced entries in capture order
    pub fn pending(&self) -> Vec<OperationEntry> {
        self.lock()
            .iter()
            .filter(|entry| !entry.synced)
            .cloned()
            .collect()
    }

    /// Unsynced entries targeting `table`, in capture order
    pub fn pending_for(&self, table: &str) -> Vec<OperationEntry> {
        self.lock()
            .iter()
            .filter(|entry| !entry.synced && entry.table == table)
            .cloned()
            .collect()
    }

    /// Remove synced entries; returns how many were removed
    pub fn prune_synced(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| !entry.synced);
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries);
        }
        removed
    }

    /// Drop every entry, synced or not
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        if let Err(error) = self.store.remove(&self.config.storage_key) {
            tracing::warn!("Failed to clear persisted operation log: {}", error);
        }
    }

    fn persist(&self, entries: &[OperationEntry]) {
        if let Err(error) = save_json(self.store.as_ref(), &self.config.storage_key, entries) {
            tracing::warn!("Failed to persist operation log: {}", error);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OperationEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
