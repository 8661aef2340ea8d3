//! In-memory remote store with failure injection

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{row_id, DEFAULT_ID_COLUMN};

use super::{Filter, RemoteError, RemoteResult, RemoteStore};

/// Remote store kept in process memory.
///
/// Stands in for the hosted backend in tests and local demos. Individual
/// rows, whole tables, or the entire store can be made to fail.
#[derive(Debug)]
pub struct MemoryRemote {
    id_column: String,
    tables: Mutex<HashMap<String, Vec<Value>>>,
    failing_rows: Mutex<HashSet<String>>,
    failing_tables: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
    call_count: AtomicUsize,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::with_id_column(DEFAULT_ID_COLUMN)
    }

    #[must_use]
    pub fn with_id_column(id_column: impl Into<String>) -> Self {
        Self {
            id_column: id_column.into(),
            tables: Mutex::new(HashMap::new()),
            failing_rows: Mutex::new(HashSet::new()),
            failing_tables: Mutex::new(HashSet::new()),
            unavailable: AtomicBool::new(false),
            latency: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Replace the contents of `table`
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        lock(&self.tables).insert(table.to_string(), rows);
    }

    /// Current contents of `table`
    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    /// Make every write touching `row_id` fail
    pub fn fail_row(&self, row_id: impl Into<String>) {
        lock(&self.failing_rows).insert(row_id.into());
    }

    /// Make every call against `table` fail
    pub fn fail_table(&self, table: impl Into<String>) {
        lock(&self.failing_tables).insert(table.into());
    }

    /// Clear all injected failures
    pub fn heal(&self) {
        lock(&self.failing_rows).clear();
        lock(&self.failing_tables).clear();
        self.unavailable.store(false, Ordering::SeqCst);
    }

    /// Simulate a network partition
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Calls received so far, formatted as `"{method} {table} {detail}"`
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: String, table: &str, row: Option<&str>) -> RemoteResult<()> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.calls).push(call);

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("network unreachable".to_string()));
        }
        if lock(&self.failing_tables).contains(table) {
            return Err(RemoteError::Api {
                status: 503,
                message: format!("table '{table}' is failing"),
            });
        }
        if let Some(row) = row {
            if lock(&self.failing_rows).contains(row) {
                return Err(RemoteError::Rejected(format!("row '{row}' rejected")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Value>> {
        self.enter(format!("fetch {table}"), table, None).await?;
        Ok(lock(&self.tables)
            .get(table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, row: &Value) -> RemoteResult<()> {
        let id = row_id(row, &self.id_column);
        self.enter(
            format!("insert {table} {}", id.as_deref().unwrap_or("-")),
            table,
            id.as_deref(),
        )
        .await?;

        let mut tables = lock(&self.tables);
        let rows = tables.entry(table.to_string()).or_default();
        if let Some(id) = &id {
            if rows
                .iter()
                .any(|existing| row_id(existing, &self.id_column).as_ref() == Some(id))
            {
                return Err(RemoteError::Rejected(format!(
                    "duplicate key '{id}' in '{table}'"
                )));
            }
        }
        rows.push(row.clone());
        Ok(())
    }

    async fn update(&self, table: &str, row: &Value, match_id: &str) -> RemoteResult<()> {
        self.enter(format!("update {table} {match_id}"), table, Some(match_id))
            .await?;

        let mut tables = lock(&self.tables);
        let existing = tables
            .get_mut(table)
            .and_then(|rows| {
                rows.iter_mut().find(|existing| {
                    row_id(existing, &self.id_column).as_deref() == Some(match_id)
                })
            })
            .ok_or_else(|| {
                RemoteError::Rejected(format!("no row '{match_id}' in '{table}'"))
            })?;

        match (existing, row) {
            (Value::Object(current), Value::Object(changes)) => {
                for (key, value) in changes {
                    current.insert(key.clone(), value.clone());
                }
            }
            (existing, row) => *existing = row.clone(),
        }
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> RemoteResult<()> {
        self.enter(format!("delete {table} {id}"), table, Some(id))
            .await?;

        if let Some(rows) = lock(&self.tables).get_mut(table) {
            rows.retain(|existing| row_id(existing, &self.id_column).as_deref() != Some(id));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
