//! Engine adapter seam
//!
//! The analytical engine itself lives outside this workspace. Everything
//! Warden does to it goes through [`EngineAdapter`], and every component
//! reaches the adapter through a shared [`EngineSlot`] so that a fallback
//! backend can be swapped in (and the original restored) in one step.

use crate::error::EngineError;
use crate::types::{ConnectionId, OperationId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Rows returned by a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Row values, one vector per row
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Rows changed by a mutation
    pub rows_affected: u64,
}

impl QueryResult {
    /// Empty result
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Single-cell result
    #[must_use]
    pub fn scalar(column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            columns: vec![column.into()],
            rows: vec![vec![value.into()]],
            rows_affected: 0,
        }
    }

    /// First cell interpreted as an unsigned integer
    #[must_use]
    pub fn first_u64(&self) -> Option<u64> {
        let cell = self.rows.first()?.first()?;
        cell.as_u64()
            .or_else(|| cell.as_i64().and_then(|v| u64::try_from(v).ok()))
            .or_else(|| cell.as_str().and_then(|s| s.parse().ok()))
    }

    /// Number of rows
    #[inline]
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Table known to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name
    pub name: String,
    /// Engine-declared temporary table
    pub temporary: bool,
}

impl TableInfo {
    /// Regular table
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temporary: false,
        }
    }

    /// Temporary table
    #[inline]
    #[must_use]
    pub fn temporary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temporary: true,
        }
    }
}

/// Settings used to (re)initialise the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine memory limit
    pub memory_limit_bytes: u64,
    /// Maximum concurrent connections
    pub max_connections: u32,
    /// Data file, `None` for a purely in-memory engine
    pub data_path: Option<PathBuf>,
    /// Artifact to restore from on reinitialisation
    pub restore_from: Option<PathBuf>,
    /// Extra engine settings
    pub settings: BTreeMap<String, String>,
}

impl EngineConfig {
    /// Create a configuration
    #[inline]
    #[must_use]
    pub fn new(memory_limit_bytes: u64, max_connections: u32) -> Self {
        Self {
            memory_limit_bytes,
            max_connections,
            data_path: None,
            restore_from: None,
            settings: BTreeMap::new(),
        }
    }

    /// With data file
    #[inline]
    #[must_use]
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Whether the engine keeps no data file
    #[inline]
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.data_path.is_none()
    }
}

/// Operations Warden needs from the analytical engine
#[async_trait::async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Execute a statement
    async fn execute(&self, query: &str) -> Result<QueryResult, EngineError>;

    /// Ask the engine to cancel an operation cooperatively
    async fn cancel(&self, operation: &OperationId) -> Result<(), EngineError>;

    /// Terminate an operation forcibly
    async fn force_terminate(&self, operation: &OperationId) -> Result<(), EngineError>;

    /// Drop and re-open a connection
    async fn reset_connection(&self, connection: ConnectionId) -> Result<(), EngineError>;

    /// Close every connection
    async fn close(&self) -> Result<(), EngineError>;

    /// Re-open the engine with the given settings
    async fn reinitialize(&self, config: &EngineConfig) -> Result<(), EngineError>;

    /// Enumerate tables
    async fn list_tables(&self) -> Result<Vec<TableInfo>, EngineError>;

    /// Change the engine memory limit
    async fn set_memory_limit(&self, bytes: u64) -> Result<(), EngineError>;

    /// Change the connection limit
    async fn set_max_connections(&self, max: u32) -> Result<(), EngineError>;

    /// Short adapter name for logs
    fn name(&self) -> &str {
        "engine"
    }
}

/// Shared, swappable engine handle
#[derive(Clone)]
pub struct EngineSlot {
    inner: Arc<RwLock<Arc<dyn EngineAdapter>>>,
}

impl EngineSlot {
    /// Wrap an adapter
    #[must_use]
    pub fn new(engine: Arc<dyn EngineAdapter>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    /// Adapter currently in force
    #[inline]
    #[must_use]
    pub fn current(&self) -> Arc<dyn EngineAdapter> {
        Arc::clone(&self.inner.read())
    }

    /// Install another adapter, returning the previous one
    pub fn swap(&self, engine: Arc<dyn EngineAdapter>) -> Arc<dyn EngineAdapter> {
        std::mem::replace(&mut *self.inner.write(), engine)
    }
}

impl std::fmt::Debug for EngineSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSlot")
            .field("current", &self.current().name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait::async_trait]
    impl EngineAdapter for Named {
        async fn execute(&self, _query: &str) -> Result<QueryResult, EngineError> {
            Ok(QueryResult::scalar("name", self.0))
        }
        async fn cancel(&self, _operation: &OperationId) -> Result<(), EngineError> {
            Ok(())
        }
        async fn force_terminate(&self, _operation: &OperationId) -> Result<(), EngineError> {
            Ok(())
        }
        async fn reset_connection(&self, _connection: ConnectionId) -> Result<(), EngineError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn reinitialize(&self, _config: &EngineConfig) -> Result<(), EngineError> {
            Ok(())
        }
        async fn list_tables(&self) -> Result<Vec<TableInfo>, EngineError> {
            Ok(vec![])
        }
        async fn set_memory_limit(&self, _bytes: u64) -> Result<(), EngineError> {
            Ok(())
        }
        async fn set_max_connections(&self, _max: u32) -> Result<(), EngineError> {
            Ok(())
        }
        fn name(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn slot_swap_returns_previous() {
        let slot = EngineSlot::new(Arc::new(Named("local")));
        let clone = slot.clone();
        let previous = slot.swap(Arc::new(Named("remote")));

        assert_eq!(previous.name(), "local");
        assert_eq!(clone.current().name(), "remote");
        let result = clone.current().execute("SELECT 1").await.unwrap();
        assert_eq!(result.rows[0][0], serde_json::json!("remote"));
    }

    #[test]
    fn first_u64_accepts_numbers_and_strings() {
        assert_eq!(QueryResult::scalar("n", 42).first_u64(), Some(42));
        assert_eq!(QueryResult::scalar("n", "17").first_u64(), Some(17));
        assert_eq!(QueryResult::scalar("n", -1).first_u64(), None);
        assert_eq!(QueryResult::empty().first_u64(), None);
    }
}
