//! Operation log entry model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::row::row_id;

/// A unique identifier for a captured operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Mutation kind replayed against the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" | "create" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" | "remove" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!(
                "unknown operation kind '{other}' (expected insert, update or delete)"
            ))),
        }
    }
}

/// A mutation captured while offline, pending replay against the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEntry {
    /// Unique identifier
    pub id: OperationId,
    /// Remote table targeted by the mutation
    pub table: String,
    /// Row data for insert/update, row identifier for delete
    pub payload: Value,
    /// Mutation kind
    pub kind: OperationKind,
    /// Capture timestamp (Unix ms)
    pub created_at: i64,
    /// Whether the remote store has accepted this operation
    pub synced: bool,
}

impl OperationEntry {
    /// Create a new unsynced entry
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        payload: Value,
        kind: OperationKind,
        created_at: i64,
    ) -> Self {
        Self {
            id: OperationId::new(),
            table: table.into(),
            payload,
            kind,
            created_at,
            synced: false,
        }
    }

    /// Row identifier this operation targets, if the payload carries one
    #[must_use]
    pub fn row_id(&self, id_column: &str) -> Option<String> {
        row_id(&self.payload, id_column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_id_unique() {
        let id1 = OperationId::new();
        let id2 = OperationId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_operation_id_parse() {
        let id = OperationId::new();
        let parsed: OperationId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_kind_parse_accepts_aliases() {
        assert_eq!("INSERT".parse::<OperationKind>().unwrap(), OperationKind::Insert);
        assert_eq!("remove".parse::<OperationKind>().unwrap(), OperationKind::Delete);
        assert!("upsert".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let value = serde_json::to_value(OperationKind::Update).unwrap();
        assert_eq!(value, json!("update"));
    }

    #[test]
    fn test_new_entry_is_unsynced() {
        let entry = OperationEntry::new(
            "feedback",
            json!({"id": "f-1", "score": 4}),
            OperationKind::Insert,
            42,
        );
        assert!(!entry.synced);
        assert_eq!(entry.created_at, 42);
        assert_eq!(entry.row_id("id").as_deref(), Some("f-1"));
    }

    #[test]
    fn test_delete_entry_with_bare_id() {
        let entry = OperationEntry::new("classes", json!(17), OperationKind::Delete, 0);
        assert_eq!(entry.row_id("id").as_deref(), Some("17"));
    }
}
