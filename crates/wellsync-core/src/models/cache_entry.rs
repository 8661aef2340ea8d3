//! Cache entry model and freshness classification

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Portion of the TTL (in percent) after which an entry is considered stale.
///
/// Entries older than half their TTL are refresh candidates even though
/// they can still be served. Override per cache through `CacheConfig`.
pub const DEFAULT_STALE_AFTER_PERCENT: u32 = 50;

/// Cache priority, governing eviction order and refresh order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(Error::InvalidInput(format!(
                "unknown priority '{other}' (expected high, medium or low)"
            ))),
        }
    }
}

/// Freshness of a cache entry, derived at read time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Fresh,
    Stale,
    Expired,
}

impl SyncState {
    /// Whether the entry should be picked up by a refresh pass
    pub const fn needs_refresh(self) -> bool {
        matches!(self, Self::Stale | Self::Expired)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Expired => "expired",
        })
    }
}

/// A cached row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `{table}_{row}_{captured_at}`, unique within a table
    pub id: String,
    /// Remote table this row came from
    pub table: String,
    /// Row identifier, when the row carries one
    #[serde(default)]
    pub row_id: Option<String>,
    /// Cached row value
    pub data: Value,
    /// Capture timestamp (Unix ms)
    pub captured_at: i64,
    /// Expiry timestamp (Unix ms), always after `captured_at`
    pub expires_at: i64,
    /// Eviction and refresh priority
    pub priority: Priority,
    /// Last computed freshness; recomputed on every read
    #[serde(skip)]
    pub sync_state: SyncState,
}

impl CacheEntry {
    /// Create an entry captured at `captured_at` living for `ttl_millis`.
    ///
    /// `position` names the row in the entry id when it has no identifier.
    /// Non-positive TTLs are clamped to one millisecond.
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        row_id: Option<String>,
        position: usize,
        data: Value,
        priority: Priority,
        captured_at: i64,
        ttl_millis: i64,
    ) -> Self {
        let table = table.into();
        let ttl_millis = ttl_millis.max(1);
        let id = match &row_id {
            Some(row_id) => format!("{table}_{row_id}_{captured_at}"),
            None => format!("{table}_{position}_{captured_at}"),
        };
        Self {
            id,
            table,
            row_id,
            data,
            captured_at,
            expires_at: captured_at.saturating_add(ttl_millis),
            priority,
            sync_state: SyncState::Fresh,
        }
    }

    /// Lifetime of this entry in milliseconds
    pub const fn ttl_millis(&self) -> i64 {
        self.expires_at - self.captured_at
    }

    pub const fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Classify freshness at `now`.
    pub fn classify(&self, now: i64, stale_after_percent: u32) -> SyncState {
        if self.is_expired(now) {
            return SyncState::Expired;
        }
        let stale_after = self
            .ttl_millis()
            .saturating_mul(i64::from(stale_after_percent))
            / 100;
        if now.saturating_sub(self.captured_at) > stale_after {
            SyncState::Stale
        } else {
            SyncState::Fresh
        }
    }

    /// Recompute and store the freshness classification.
    pub fn refresh_state(&mut self, now: i64, stale_after_percent: u32) -> SyncState {
        self.sync_state = self.classify(now, stale_after_percent);
        self.sync_state
    }
}
