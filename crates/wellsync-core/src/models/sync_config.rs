//! Sync configuration model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

use super::operation::OperationKind;

/// Shortest accepted interval between periodic sync cycles
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(10);

/// How a refreshed remote row is reconciled with a pending local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Pending local payload replaces the remote row
    ClientWins,
    /// Remote row is cached as fetched
    #[default]
    ServerWins,
    /// Remote fields overlaid with the pending local fields
    Merge,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientWins => "client-wins",
            Self::ServerWins => "server-wins",
            Self::Merge => "merge",
        }
    }

    /// Reconcile `remote` with one pending local mutation.
    ///
    /// Returns `None` when the row should be dropped from the refreshed set.
    pub fn resolve(self, kind: OperationKind, local: &Value, remote: Value) -> Option<Value> {
        match (self, kind) {
            (Self::ServerWins, _) => Some(remote),
            (Self::ClientWins | Self::Merge, OperationKind::Delete) => None,
            (Self::ClientWins, _) => Some(local.clone()),
            (Self::Merge, _) => match (remote, local) {
                (Value::Object(mut merged), Value::Object(local_fields)) => {
                    for (key, value) in local_fields {
                        merged.insert(key.clone(), value.clone());
                    }
                    Some(Value::Object(merged))
                }
                _ => Some(local.clone()),
            },
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "client-wins" | "client" => Ok(Self::ClientWins),
            "server-wins" | "server" => Ok(Self::ServerWins),
            "merge" => Ok(Self::Merge),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict resolution '{other}' (expected client-wins, server-wins or merge)"
            ))),
        }
    }
}

/// Process-wide sync settings, persisted by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of table groups refreshed per cycle
    pub batch_size: usize,
    /// Delay between periodic sync cycles
    #[serde(rename = "sync_interval_ms", with = "interval_millis")]
    pub sync_interval: Duration,
    /// Whether refresh groups are ordered by priority
    pub priority_sync: bool,
    /// Conflict handling during cache refresh
    pub conflict_resolution: ConflictResolution,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            sync_interval: Duration::from_secs(30),
            priority_sync: true,
            conflict_resolution: ConflictResolution::ServerWins,
        }
    }
}

impl SyncConfig {
    /// Clamp values that would stall or spin the coordinator.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.sync_interval = self.sync_interval.max(MIN_SYNC_INTERVAL);
        self
    }

    /// Merge a partial update into this configuration.
    #[must_use]
    pub fn merged(mut self, patch: &SyncConfigPatch) -> Self {
        if let Some(batch_size) = patch.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(sync_interval) = patch.sync_interval {
            self.sync_interval = sync_interval;
        }
        if let Some(priority_sync) = patch.priority_sync {
            self.priority_sync = priority_sync;
        }
        if let Some(conflict_resolution) = patch.conflict_resolution {
            self.conflict_resolution = conflict_resolution;
        }
        self.normalized()
    }
}

/// Partial update for [`SyncConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfigPatch {
    pub batch_size: Option<usize>,
    pub sync_interval: Option<Duration>,
    pub priority_sync: Option<bool>,
    pub conflict_resolution: Option<ConflictResolution>,
}

impl SyncConfigPatch {
    pub const fn is_empty(&self) -> bool {
        self.batch_size.is_none()
            && self.sync_interval.is_none()
            && self.priority_sync.is_none()
            && self.conflict_resolution.is_none()
    }
}

mod interval_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
