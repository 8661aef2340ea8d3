//! Sync coordination between the local log/cache and the remote store.

mod coordinator;
mod refresh;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::models::{OperationEntry, SyncConfig};
use crate::oplog::DrainReport;
use crate::state::SyncHealth;

pub use coordinator::{SyncCoordinator, SyncCoordinatorBuilder, DEFAULT_CONFIG_KEY};
pub use refresh::{plan_refresh, reconcile, RefreshGroup};

/// Shared online/offline flag, flipped by the host application
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Set the flag; returns true when this call moved it from offline to online
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        online && !was_online
    }
}

/// Result of one completed sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub drained: DrainReport,
    /// Table groups refreshed successfully
    pub refreshed_tables: Vec<String>,
    /// Rows written back into the cache
    pub refreshed_rows: usize,
    /// One message per table group that failed to refresh
    pub refresh_errors: Vec<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl SyncReport {
    pub fn has_errors(&self) -> bool {
        !self.drained.errors.is_empty() || !self.refresh_errors.is_empty()
    }

    /// First error of the cycle, drain errors before refresh errors
    pub fn first_error(&self) -> Option<&str> {
        self.drained
            .errors
            .first()
            .or_else(|| self.refresh_errors.first())
            .map(String::as_str)
    }
}

/// What a call to [`SyncCoordinator::run_once`] did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Connectivity is down; nothing was attempted
    Offline,
    /// Another cycle was in flight; this trigger was dropped
    AlreadyRunning,
    Completed(SyncReport),
}

impl CycleOutcome {
    pub const fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Offline | Self::AlreadyRunning => None,
        }
    }
}

/// Snapshot for sync-health indicators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub health: SyncHealth,
    pub online: bool,
    pub running: bool,
    pub pending_operations: usize,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
    pub config: SyncConfig,
}

/// Result of an application write through the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The remote store accepted the write directly
    Applied,
    /// The write was queued in the operation log
    Queued(OperationEntry),
}

/// Where [`SyncCoordinator::read_through`] served rows from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    /// Unexpired cached rows
    Cache,
    /// Freshly fetched from the remote store
    Remote,
    /// Remote unavailable; possibly expired cached rows
    StaleCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub rows: Vec<Value>,
    pub source: ReadSource,
}
