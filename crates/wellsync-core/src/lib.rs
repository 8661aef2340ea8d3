//! wellsync-core - Offline-first data cache and sync engine
//!
//! Application writes are captured in an [`OperationLog`] while offline,
//! reads are served from a prioritized, TTL-based [`ReadCache`], and a
//! [`SyncCoordinator`] drains the log and refreshes stale rows once the
//! remote store is reachable again.

pub mod cache;
pub mod clock;
pub mod error;
pub mod models;
pub mod oplog;
pub mod remote;
pub mod state;
pub mod storage;
pub mod sync;
pub mod util;


pub use cache::{CacheConfig, CacheStats, ReadCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use models::{
    CacheEntry, ConflictResolution, OperationEntry, OperationId, OperationKind, Priority, Row,
    SyncConfig, SyncConfigPatch, SyncState,
};
pub use oplog::{DrainReport, OperationLog, OperationLogConfig};
pub use remote::{Filter, RemoteError, RemoteStore, TableHandle};
pub use state::SyncHealth;
pub use storage::KeyValueStore;
pub use sync::{Connectivity, CycleOutcome, SyncCoordinator, SyncReport, SyncStatus};
