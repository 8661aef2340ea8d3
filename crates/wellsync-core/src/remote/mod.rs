//! Remote store capability consumed by the log and the sync coordinator.

mod memory;
mod rest;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{row_id, Row};

pub use memory::MemoryRemote;
pub use rest::{RestConfig, RestRemote};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Remote HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote API error: {message} ({status})")]
    Api { status: u16, message: String },
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
    #[error("Payload has no row id in column '{0}'")]
    MissingRowId(String),
    #[error("Remote rejected the operation: {0}")]
    Rejected(String),
    #[error("Invalid remote payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Row filter for remote reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Every row of the table
    All,
    /// Rows whose `column` equals `value`
    Eq { column: String, value: String },
    /// Rows whose `column` is one of `values`
    In { column: String, values: Vec<String> },
}

impl Filter {
    /// Rows whose `column` is one of `ids`
    pub fn ids(column: impl Into<String>, ids: impl IntoIterator<Item = String>) -> Self {
        Self::In {
            column: column.into(),
            values: ids.into_iter().collect(),
        }
    }

    /// Evaluate the filter against a JSON row
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Eq { column, value } => {
                row_id(row, column).is_some_and(|candidate| candidate == *value)
            }
            Self::In { column, values } => row_id(row, column)
                .is_some_and(|candidate| values.iter().any(|value| *value == candidate)),
        }
    }
}

/// Table-agnostic access to the hosted backend.
///
/// Rows travel as JSON; serialization is the implementor's concern.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read rows matching `filter`
    async fn fetch(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Value>>;

    /// Insert a new row
    async fn insert(&self, table: &str, row: &Value) -> RemoteResult<()>;

    /// Update the row identified by `match_id`
    async fn update(&self, table: &str, row: &Value, match_id: &str) -> RemoteResult<()>;

    /// Delete the row identified by `id`
    async fn delete(&self, table: &str, id: &str) -> RemoteResult<()>;
}

/// Typed view of one remote table
pub struct TableHandle<T: Row> {
    remote: Arc<dyn RemoteStore>,
    _row: PhantomData<fn() -> T>,
}

impl<T: Row> Clone for TableHandle<T> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            _row: PhantomData,
        }
    }
}

impl<T: Row> TableHandle<T> {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote,
            _row: PhantomData,
        }
    }

    pub const fn table(&self) -> &'static str {
        T::TABLE
    }

    pub async fn fetch_all(&self) -> RemoteResult<Vec<T>> {
        self.fetch(&Filter::All).await
    }

    pub async fn fetch_ids(&self, ids: impl IntoIterator<Item = String>) -> RemoteResult<Vec<T>> {
        self.fetch(&Filter::ids(T::ID_COLUMN, ids)).await
    }

    pub async fn fetch(&self, filter: &Filter) -> RemoteResult<Vec<T>> {
        let rows = self.remote.fetch(T::TABLE, filter).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(RemoteError::from))
            .collect()
    }

    pub async fn insert(&self, row: &T) -> RemoteResult<()> {
        let value = serde_json::to_value(row)?;
        self.remote.insert(T::TABLE, &value).await
    }

    pub async fn update(&self, row: &T) -> RemoteResult<()> {
        let value = serde_json::to_value(row)?;
        self.remote.update(T::TABLE, &value, &row.row_id()).await
    }

    pub async fn delete(&self, id: &str) -> RemoteResult<()> {
        self.remote.delete(T::TABLE, id).await
    }
}
