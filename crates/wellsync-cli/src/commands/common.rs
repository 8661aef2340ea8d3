use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use wellsync_core::cache::{CacheConfig, ReadCache};
use wellsync_core::models::DEFAULT_ID_COLUMN;
use wellsync_core::oplog::{OperationLog, OperationLogConfig};
use wellsync_core::remote::{Filter, RemoteError, RemoteResult, RemoteStore, RestRemote};
use wellsync_core::storage::{KeyValueStore, SqliteStore};
use wellsync_core::{
    CacheEntry, Clock, OperationEntry, OperationKind, Priority, SyncCoordinator, SyncReport,
    SyncState, SystemClock,
};

use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

/// The engine as the CLI drives it
pub struct Engine {
    pub coordinator: SyncCoordinator,
    /// Whether a real remote store is configured
    pub remote_configured: bool,
}

impl Engine {
    pub fn require_remote(&self) -> Result<&SyncCoordinator, CliError> {
        if self.remote_configured {
            Ok(&self.coordinator)
        } else {
            Err(CliError::RemoteNotConfigured)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CacheListItem {
    pub row_id: Option<String>,
    pub priority: Priority,
    pub state: &'static str,
    pub captured_at: i64,
    pub expires_at: i64,
    pub data: Value,
}

/// Stand-in when no profile or environment names a backend
struct UnconfiguredRemote;

impl UnconfiguredRemote {
    fn error() -> RemoteError {
        RemoteError::InvalidConfiguration("no remote store configured".to_string())
    }
}

#[async_trait]
impl RemoteStore for UnconfiguredRemote {
    async fn fetch(&self, _table: &str, _filter: &Filter) -> RemoteResult<Vec<Value>> {
        Err(Self::error())
    }

    async fn insert(&self, _table: &str, _row: &Value) -> RemoteResult<()> {
        Err(Self::error())
    }

    async fn update(&self, _table: &str, _row: &Value, _match_id: &str) -> RemoteResult<()> {
        Err(Self::error())
    }

    async fn delete(&self, _table: &str, _id: &str) -> RemoteResult<()> {
        Err(Self::error())
    }
}

/// Open local state and connect the configured remote, if any.
///
/// Without a remote the engine runs offline and writes queue in the log.
pub fn open_engine(
    db_path: &Path,
    profile: Option<&str>,
    offline: bool,
) -> Result<Engine, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(db_path)?);

    let profiles = CliProfilesConfig::load()?;
    let profile_name = profiles.resolve_profile_name(profile);
    let rest_config = profiles
        .profile(&profile_name)
        .cloned()
        .unwrap_or_default()
        .rest_config();

    let Some(rest_config) = rest_config else {
        tracing::debug!("No remote configured for profile '{}'", profile_name);
        let coordinator = assemble(store, Arc::new(UnconfiguredRemote), DEFAULT_ID_COLUMN, false);
        return Ok(Engine {
            coordinator,
            remote_configured: false,
        });
    };

    let id_column = rest_config.id_column.clone();
    let remote = RestRemote::new(rest_config)?;
    Ok(Engine {
        coordinator: assemble(store, Arc::new(remote), &id_column, !offline),
        remote_configured: true,
    })
}

/// Wire log, cache and coordinator over one store.
pub fn assemble(
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    id_column: &str,
    online: bool,
) -> SyncCoordinator {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let log = OperationLog::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        OperationLogConfig {
            id_column: id_column.to_string(),
            ..OperationLogConfig::default()
        },
    );
    let cache = ReadCache::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        CacheConfig {
            id_column: id_column.to_string(),
            ..CacheConfig::default()
        },
    );

    SyncCoordinator::builder(Arc::new(log), Arc::new(cache), remote, store)
        .clock(clock)
        .online(online)
        .build()
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("WELLSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wellsync")
        .join("wellsync.db")
}

pub fn normalize_table(table: &str) -> Result<String, CliError> {
    let table = table.trim();
    if table.is_empty() {
        return Err(CliError::EmptyTable);
    }
    Ok(table.to_string())
}

/// Parse a JSON payload. Deletes also accept a bare, unquoted id.
pub fn parse_payload(raw: &str, kind: OperationKind) -> Result<Value, CliError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Ok(value),
        Err(_) if kind == OperationKind::Delete && !raw.trim().is_empty() => {
            Ok(Value::String(raw.trim().to_string()))
        }
        Err(error) => Err(CliError::InvalidPayload(error.to_string())),
    }
}

pub fn parse_rows(raw: &str) -> Result<Vec<Value>, CliError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(rows)) => Ok(rows),
        Ok(row @ Value::Object(_)) => Ok(vec![row]),
        Ok(_) => Err(CliError::InvalidPayload(
            "expected a JSON array of rows".to_string(),
        )),
        Err(error) => Err(CliError::InvalidPayload(error.to_string())),
    }
}

pub fn ttl_or_default(ttl_ms: Option<u64>, default: Duration) -> Duration {
    ttl_ms.map_or(default, Duration::from_millis)
}

pub fn format_operation_lines(entries: &[OperationEntry], now_ms: i64) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            format!(
                "{}  {:<6}  {:<16}  {}  {}",
                entry.id,
                entry.kind.as_str(),
                entry.table,
                format_relative_time(entry.created_at, now_ms),
                compact_json(&entry.payload, 60)
            )
        })
        .collect()
}

pub const fn state_label(state: SyncState) -> &'static str {
    match state {
        SyncState::Fresh => "fresh",
        SyncState::Stale => "stale",
        SyncState::Expired => "expired",
    }
}

pub fn cache_entry_to_item(entry: &CacheEntry) -> CacheListItem {
    CacheListItem {
        row_id: entry.row_id.clone(),
        priority: entry.priority,
        state: state_label(entry.sync_state),
        captured_at: entry.captured_at,
        expires_at: entry.expires_at,
        data: entry.data.clone(),
    }
}

pub fn format_cache_lines(entries: &[CacheEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            format!(
                "{:<8}  {:<6}  {:<7}  expires {}  {}",
                entry.row_id.as_deref().unwrap_or("-"),
                entry.priority.as_str(),
                state_label(entry.sync_state),
                format_timestamp(entry.expires_at),
                compact_json(&entry.data, 60)
            )
        })
        .collect()
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    let mut lines = vec![
        format!(
            "Operations: {} synced, {} failed",
            report.drained.synced,
            report.drained.failed()
        ),
        format!(
            "Refreshed: {} row(s) across {} table(s)",
            report.refreshed_rows,
            report.refreshed_tables.len()
        ),
    ];
    lines.extend(
        report
            .drained
            .errors
            .iter()
            .chain(&report.refresh_errors)
            .map(|error| format!("  error: {error}")),
    );
    lines
}

pub fn compact_json(value: &Value, max_chars: usize) -> String {
    let raw = value.to_string();
    if raw.chars().count() <= max_chars {
        return raw;
    }
    let truncated = raw.chars().take(max_chars.saturating_sub(3)).collect::<String>();
    format!("{truncated}...")
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn now_ms() -> i64 {
    SystemClock.now_millis()
}
