//! Local key-value persistence for engine state.
//!
//! Every component persists its state as a JSON document under a
//! well-known key. Backends only need string get/set/remove.

mod memory;
mod migrations;
mod sqlite;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Trait for local key-value storage
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

/// Load and deserialize a JSON document.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON document.
pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_roundtrip_through_store() {
        let store = MemoryStore::new();
        save_json(&store, "doc", &json!({"a": [1, 2]})).unwrap();

        let loaded: Option<serde_json::Value> = load_json(&store, "doc").unwrap();
        assert_eq!(loaded, Some(json!({"a": [1, 2]})));

        let missing: Option<serde_json::Value> = load_json(&store, "other").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn load_json_reports_corrupt_documents() {
        let store = MemoryStore::new();
        store.set("doc", "{not json").unwrap();

        let loaded: Result<Option<serde_json::Value>> = load_json(&store, "doc");
        assert!(matches!(loaded, Err(crate::Error::Serialization(_))));
    }
}
