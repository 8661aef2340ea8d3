//! Row identity helpers shared by the log, cache, and remote layers

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Column holding the row identifier unless configured otherwise
pub const DEFAULT_ID_COLUMN: &str = "id";

/// Extract a row identifier from a JSON value.
///
/// Bare strings and numbers are treated as the identifier itself; objects
/// are looked up by `id_column`. Empty strings and other shapes yield `None`.
pub fn row_id(value: &Value, id_column: &str) -> Option<String> {
    match value {
        Value::String(id) => Some(id.trim().to_string()).filter(|id| !id.is_empty()),
        Value::Number(id) => Some(id.to_string()),
        Value::Object(map) => map.get(id_column).and_then(|id| match id {
            Value::Object(_) | Value::Array(_) => None,
            other => row_id(other, id_column),
        }),
        _ => None,
    }
}

/// A typed row stored in a named remote table.
///
/// Implementors bind a Rust type to its table so callers can go through
/// [`crate::remote::TableHandle`] instead of passing table names around.
pub trait Row: Serialize + DeserializeOwned + Send + Sync {
    /// Remote table name
    const TABLE: &'static str;

    /// Column holding the row identifier
    const ID_COLUMN: &'static str = DEFAULT_ID_COLUMN;

    /// Identifier of this row
    fn row_id(&self) -> String;
}
