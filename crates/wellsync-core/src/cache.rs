//! Read-through cache of previously fetched rows.
//!
//! Entries carry a priority and a TTL. The retained set is kept ordered by
//! priority, then capture time, newest first; anything past capacity is
//! evicted from the tail. Freshness is classified at read time only.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::clock::{duration_millis, Clock};
use crate::models::{
    row_id, CacheEntry, Priority, SyncState, DEFAULT_ID_COLUMN, DEFAULT_STALE_AFTER_PERCENT,
};
use crate::storage::{load_json, save_json, KeyValueStore};

/// Default maximum number of cached rows
pub const DEFAULT_CACHE_CAPACITY: usize = 500;
/// Default time-to-live for cached rows
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Default key under which the cache is persisted
pub const DEFAULT_CACHE_KEY: &str = "wellsync.cache";

/// Settings for a [`ReadCache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries retained
    pub max_entries: usize,
    /// TTL used when callers don't pick one
    pub default_ttl: Duration,
    /// Percent of the TTL after which entries are stale
    pub stale_after_percent: u32,
    /// Column holding row identifiers
    pub id_column: String,
    /// Storage key for the persisted entries
    pub storage_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_CAPACITY,
            default_ttl: DEFAULT_CACHE_TTL,
            stale_after_percent: DEFAULT_STALE_AFTER_PERCENT,
            id_column: DEFAULT_ID_COLUMN.to_string(),
            storage_key: DEFAULT_CACHE_KEY.to_string(),
        }
    }
}

/// Observability snapshot of the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub fresh: usize,
    pub stale: usize,
    pub expired: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Size of the serialized entries in bytes
    pub approx_bytes: usize,
    pub oldest_captured_at: Option<i64>,
    pub newest_captured_at: Option<i64>,
}

/// Bounded, prioritized, TTL-based row cache
pub struct ReadCache {
    entries: Mutex<Vec<CacheEntry>>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl ReadCache {
    /// Create a cache backed by `store`, restoring any persisted entries.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        let config = CacheConfig {
            max_entries: config.max_entries.max(1),
            ..config
        };
        let mut entries = match load_json::<Vec<CacheEntry>>(store.as_ref(), &config.storage_key) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(
                    "Discarding unreadable cache at '{}': {}",
                    config.storage_key,
                    error
                );
                Vec::new()
            }
        };
        retain_by_priority(&mut entries, config.max_entries);

        Self {
            entries: Mutex::new(entries),
            store,
            clock,
            config,
        }
    }

    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Replace every entry of `table` with `rows`.
    pub fn put(&self, table: &str, rows: Vec<Value>, priority: Priority, ttl: Duration) {
        let now = self.clock.now_millis();
        let ttl = duration_millis(ttl);
        let incoming = rows
            .into_iter()
            .enumerate()
            .map(|(position, row)| {
                let id = row_id(&row, &self.config.id_column);
                CacheEntry::new(table, id, position, row, priority, now, ttl)
            })
            .collect::<Vec<_>>();
        let count = incoming.len();

        let mut entries = self.lock();
        entries.retain(|entry| entry.table != table);
        let evicted = self.admit(&mut entries, incoming);
        self.persist(&entries);

        tracing::debug!(
            "Cached {} row(s) for '{}' at {} priority ({} evicted)",
            count,
            table,
            priority,
            evicted
        );
    }

    /// Put with the configured default TTL
    pub fn put_default(&self, table: &str, rows: Vec<Value>, priority: Priority) {
        self.put(table, rows, priority, self.config.default_ttl);
    }

    /// Insert or replace a single row, keyed by its row id.
    ///
    /// Used for optimistic writes; other rows of the table are kept.
    pub fn upsert_row(&self, table: &str, row: Value, priority: Priority, ttl: Duration) {
        let now = self.clock.now_millis();
        let id = row_id(&row, &self.config.id_column);

        let mut entries = self.lock();
        if let Some(id) = &id {
            entries.retain(|entry| !(entry.table == table && entry.row_id.as_ref() == Some(id)));
        }
        let position = entries.iter().filter(|entry| entry.table == table).count();
        let entry = CacheEntry::new(table, id, position, row, priority, now, duration_millis(ttl));
        self.admit(&mut entries, vec![entry]);
        self.persist(&entries);
    }

    /// Remove a single row; returns whether it was cached
    pub fn remove_row(&self, table: &str, row_id: &str) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| !(entry.table == table && entry.row_id.as_deref() == Some(row_id)));
        let removed = entries.len() != before;
        if removed {
            self.persist(&entries);
        }
        removed
    }

    /// Cached rows for `table`.
    ///
    /// Expired rows are only returned when `include_stale` is set. Every
    /// returned entry has its freshness reclassified.
    pub fn get(&self, table: &str, include_stale: bool) -> Vec<Value> {
        self.get_entries(table, include_stale)
            .into_iter()
            .map(|entry| entry.data)
            .collect()
    }

    /// Like [`Self::get`], returning the entries with their classification
    pub fn get_entries(&self, table: &str, include_stale: bool) -> Vec<CacheEntry> {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        entries
            .iter_mut()
            .filter(|entry| entry.table == table)
            .filter_map(|entry| {
                let state = entry.refresh_state(now, self.config.stale_after_percent);
                (include_stale || state != SyncState::Expired).then(|| entry.clone())
            })
            .collect()
    }

    /// Entries that are currently stale or expired
    pub fn refresh_candidates(&self) -> Vec<CacheEntry> {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        entries
            .iter_mut()
            .filter_map(|entry| {
                entry
                    .refresh_state(now, self.config.stale_after_percent)
                    .needs_refresh()
                    .then(|| entry.clone())
            })
            .collect()
    }

    /// Remove expired entries; returns how many were removed
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries);
            tracing::debug!("Evicted {} expired cache entr(ies)", removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now_millis();
        let entries = self.lock();
        let mut stats = CacheStats {
            total: entries.len(),
            approx_bytes: serde_json::to_vec(&*entries).map_or(0, |raw| raw.len()),
            ..CacheStats::default()
        };

        for entry in entries.iter() {
            match entry.classify(now, self.config.stale_after_percent) {
                SyncState::Fresh => stats.fresh += 1,
                SyncState::Stale => stats.stale += 1,
                SyncState::Expired => stats.expired += 1,
            }
            match entry.priority {
                Priority::High => stats.high += 1,
                Priority::Medium => stats.medium += 1,
                Priority::Low => stats.low += 1,
            }
            stats.oldest_captured_at = Some(
                stats
                    .oldest_captured_at
                    .map_or(entry.captured_at, |oldest| oldest.min(entry.captured_at)),
            );
            stats.newest_captured_at = Some(
                stats
                    .newest_captured_at
                    .map_or(entry.captured_at, |newest| newest.max(entry.captured_at)),
            );
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.lock().clear();
        if let Err(error) = self.store.remove(&self.config.storage_key) {
            tracing::warn!("Failed to clear persisted cache: {}", error);
        }
    }

    /// Merge `incoming` ahead of `entries`, re-sort, and truncate.
    /// Returns the number of evicted entries.
    fn admit(&self, entries: &mut Vec<CacheEntry>, incoming: Vec<CacheEntry>) -> usize {
        let existing = std::mem::replace(entries, incoming);
        entries.extend(existing);
        retain_by_priority(entries, self.config.max_entries)
    }

    fn persist(&self, entries: &[CacheEntry]) {
        if let Err(error) = save_json(self.store.as_ref(), &self.config.storage_key, entries) {
            tracing::warn!("Failed to persist cache: {}", error);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sort by priority then recency (stable, so earlier positions win ties)
/// and drop everything past `max_entries`.
fn retain_by_priority(entries: &mut Vec<CacheEntry>, max_entries: usize) -> usize {
    entries.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.captured_at.cmp(&a.captured_at))
    });
    let evicted = entries.len().saturating_sub(max_entries);
    entries.truncate(max_entries);
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TTL: Duration = Duration::from_millis(1_000);

    fn setup(max_entries: usize) -> (ReadCache, MemoryStore, ManualClock) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(10_000);
        let cache = ReadCache::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            CacheConfig {
                max_entries,
                ..CacheConfig::default()
            },
        );
        (cache, store, clock)
    }

    #[test]
    fn test_put_replaces_table_wholesale() {
        let (cache, _, _) = setup(10);
        cache.put(
            "students",
            vec![json!({"id": 1}), json!({"id": 2})],
            Priority::Low,
            TTL,
        );
        cache.put("classes", vec![json!({"id": "c"})], Priority::Low, TTL);
        cache.put("students", vec![json!({"id": 3})], Priority::Medium, TTL);

        assert_eq!(cache.get("students", true), vec![json!({"id": 3})]);
        assert_eq!(cache.get("classes", true), vec![json!({"id": "c"})]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_get_excludes_expired_unless_requested() {
        let (cache, _, clock) = setup(10);
        cache.put("students", vec![json!({"id": 1})], Priority::Low, TTL);

        clock.advance(Duration::from_millis(600));
        let entries = cache.get_entries("students", false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sync_state, SyncState::Stale);

        clock.advance(Duration::from_millis(500));
        assert!(cache.get("students", false).is_empty());
        let entries = cache.get_entries("students", true);
        assert_eq!(entries[0].sync_state, SyncState::Expired);
    }

    #[test]
    fn test_high_priority_evicts_low_before_high() {
        let (cache, _, clock) = setup(3);
        cache.put("a", vec![json!({"id": "old-high"})], Priority::High, TTL);
        clock.advance(Duration::from_millis(1));
        cache.put("b", vec![json!({"id": "low"})], Priority::Low, TTL);
        clock.advance(Duration::from_millis(1));
        cache.put("c", vec![json!({"id": "medium"})], Priority::Medium, TTL);
        clock.advance(Duration::from_millis(1));
        cache.put("d", vec![json!({"id": "new-high"})], Priority::High, TTL);

        assert_eq!(cache.len(), 3);
        assert!(cache.get("b", true).is_empty());
        assert_eq!(cache.get("a", true).len(), 1);
        assert_eq!(cache.get("c", true).len(), 1);
    }

    #[test]
    fn test_evict_expired_counts_removed() {
        let (cache, _, clock) = setup(10);
        cache.put("short", vec![json!({"id": 1}), json!({"id": 2})], Priority::Low, TTL);
        cache.put(
            "long",
            vec![json!({"id": 3})],
            Priority::Low,
            Duration::from_secs(60),
        );

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(cache.evict_expired(), 2);
        assert_eq!(cache.evict_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stats_counts_states_and_priorities() {
        let (cache, _, clock) = setup(10);
        cache.put("a", vec![json!({"id": 1})], Priority::High, TTL);
        clock.advance(Duration::from_millis(600));
        cache.put("b", vec![json!({"id": 2})], Priority::Low, TTL);
        cache.put(
            "c",
            vec![json!({"id": 3})],
            Priority::Medium,
            Duration::from_millis(100),
        );
        clock.advance(Duration::from_millis(200));

        let stats = cache.stats();
        assert_eq!(stats.total, 3);
        assert_eq!((stats.fresh, stats.stale, stats.expired), (1, 1, 1));
        assert_eq!((stats.high, stats.medium, stats.low), (1, 1, 1));
        assert_eq!(stats.oldest_captured_at, Some(10_000));
        assert_eq!(stats.newest_captured_at, Some(10_600));
        assert!(stats.approx_bytes > 0);
    }

    #[test]
    fn test_upsert_and_remove_row() {
        let (cache, _, _) = setup(10);
        cache.put(
            "students",
            vec![json!({"id": 1, "mood": 2}), json!({"id": 2, "mood": 3})],
            Priority::Low,
            TTL,
        );

        cache.upsert_row("students", json!({"id": 1, "mood": 5}), Priority::High, TTL);
        let rows = cache.get("students", true);
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&json!({"id": 1, "mood": 5})));

        assert!(cache.remove_row("students", "2"));
        assert!(!cache.remove_row("students", "2"));
        assert_eq!(cache.get("students", true), vec![json!({"id": 1, "mood": 5})]);
    }

    #[test]
    fn test_refresh_candidates_are_stale_or_expired() {
        let (cache, _, clock) = setup(10);
        cache.put("old", vec![json!({"id": 1})], Priority::Low, TTL);
        clock.advance(Duration::from_millis(700));
        cache.put("new", vec![json!({"id": 2})], Priority::Low, TTL);

        let candidates = cache.refresh_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].table, "old");
        assert_eq!(candidates[0].sync_state, SyncState::Stale);
    }

    #[test]
    fn test_entries_restore_from_store() {
        let (cache, store, _) = setup(10);
        cache.put("students", vec![json!({"id": 1})], Priority::High, TTL);

        let restored = ReadCache::new(
            Arc::new(store),
            Arc::new(ManualClock::new(10_000)),
            CacheConfig::default(),
        );
        assert_eq!(restored.get("students", true), vec![json!({"id": 1})]);

        restored.clear();
        assert!(restored.is_empty());
    }
}
