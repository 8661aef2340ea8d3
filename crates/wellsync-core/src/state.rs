//! Sync-health indicator shared with host UIs.

use serde::Serialize;

/// Coarse sync health surfaced next to the pending-operations counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncHealth {
    /// Connectivity is down; writes are queued
    Offline,
    /// A cycle is in flight
    Syncing,
    /// Last cycle finished without errors and nothing is pending
    Synced,
    /// Work is pending or the last cycle reported errors
    Error,
}

impl SyncHealth {
    /// Derive health from the coordinator's observable state.
    pub const fn derive(online: bool, in_flight: bool, pending: usize, last_failed: bool) -> Self {
        if !online {
            Self::Offline
        } else if in_flight {
            Self::Syncing
        } else if pending > 0 || last_failed {
            Self::Error
        } else {
            Self::Synced
        }
    }
}
