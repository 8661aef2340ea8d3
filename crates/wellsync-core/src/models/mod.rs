//! Data models for wellsync

mod cache_entry;
mod operation;
mod row;
mod sync_config;

pub use cache_entry::{CacheEntry, Priority, SyncState, DEFAULT_STALE_AFTER_PERCENT};
pub use operation::{OperationEntry, OperationId, OperationKind};
pub use row::{row_id, Row, DEFAULT_ID_COLUMN};
pub use sync_config::{ConflictResolution, SyncConfig, SyncConfigPatch, MIN_SYNC_INTERVAL};
