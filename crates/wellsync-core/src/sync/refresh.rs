//! Refresh planning and conflict reconciliation for cache refresh passes.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::models::{row_id, CacheEntry, ConflictResolution, OperationEntry, OperationKind, Priority};
use crate::remote::Filter;

/// Stale or expired rows of one table, refreshed with a single fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshGroup {
    pub table: String,
    /// Row ids referenced by the group, in first-seen order
    pub row_ids: Vec<String>,
    /// Whether some entry had no row id (forces a full-table fetch)
    pub has_anonymous_rows: bool,
    /// Highest priority present in the group
    pub priority: Priority,
    /// Largest TTL present in the group
    pub ttl_millis: i64,
}

impl RefreshGroup {
    fn new(table: String) -> Self {
        Self {
            table,
            row_ids: Vec::new(),
            has_anonymous_rows: false,
            priority: Priority::Low,
            ttl_millis: 1,
        }
    }

    fn absorb(&mut self, entry: &CacheEntry) {
        match &entry.row_id {
            Some(id) if !self.row_ids.contains(id) => self.row_ids.push(id.clone()),
            Some(_) => {}
            None => self.has_anonymous_rows = true,
        }
        self.priority = self.priority.max(entry.priority);
        self.ttl_millis = self.ttl_millis.max(entry.ttl_millis());
    }

    /// Add ids of rows that must survive the wholesale replacement
    pub fn include_ids(&mut self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            if !self.row_ids.contains(&id) {
                self.row_ids.push(id);
            }
        }
    }

    /// Remote filter selecting this group's rows
    pub fn filter(&self, id_column: &str) -> Filter {
        if self.has_anonymous_rows || self.row_ids.is_empty() {
            Filter::All
        } else {
            Filter::ids(id_column, self.row_ids.iter().cloned())
        }
    }
}

/// Group refresh candidates by table and bound the work for one cycle.
///
/// With `priority_sync`, groups are ordered by their highest priority
/// (ties keep table-name order). At most `batch_size` groups are returned.
pub fn plan_refresh(
    candidates: &[CacheEntry],
    priority_sync: bool,
    batch_size: usize,
) -> Vec<RefreshGroup> {
    let mut groups: BTreeMap<&str, RefreshGroup> = BTreeMap::new();
    for entry in candidates {
        groups
            .entry(entry.table.as_str())
            .or_insert_with(|| RefreshGroup::new(entry.table.clone()))
            .absorb(entry);
    }

    let mut groups = groups.into_values().collect::<Vec<_>>();
    if priority_sync {
        groups.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
    groups.truncate(batch_size.max(1));
    groups
}

/// Reconcile freshly fetched rows with operations still waiting in the log.
///
/// Pending operations apply in capture order. Under client-wins and merge,
/// pending inserts the remote doesn't know yet are kept in the result.
pub fn reconcile(
    rows: Vec<Value>,
    pending: &[OperationEntry],
    mode: ConflictResolution,
    id_column: &str,
) -> Vec<Value> {
    if pending.is_empty() {
        return rows;
    }

    let mut seen = HashSet::new();
    let mut reconciled = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(id) = row_id(&row, id_column) else {
            reconciled.push(row);
            continue;
        };
        let resolved = apply_pending(Some(row), &id, pending, mode, id_column);
        seen.insert(id);
        reconciled.extend(resolved);
    }

    if mode != ConflictResolution::ServerWins {
        for entry in pending {
            if entry.kind != OperationKind::Insert {
                continue;
            }
            let Some(id) = entry.row_id(id_column) else {
                continue;
            };
            if seen.insert(id.clone()) {
                reconciled.extend(apply_pending(None, &id, pending, mode, id_column));
            }
        }
    }
    reconciled
}

fn apply_pending(
    row: Option<Value>,
    id: &str,
    pending: &[OperationEntry],
    mode: ConflictResolution,
    id_column: &str,
) -> Option<Value> {
    pending
        .iter()
        .filter(|entry| entry.row_id(id_column).as_deref() == Some(id))
        .fold(row, |current, entry| match current {
            Some(current) => mode.resolve(entry.kind, &entry.payload, current),
            None if mode != ConflictResolution::ServerWins
                && entry.kind != OperationKind::Delete =>
            {
                Some(entry.payload.clone())
            }
            None => None,
        })
}
