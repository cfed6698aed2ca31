//! In-memory engine double.
//!
//! Understands just enough SQL to keep per-table row counts honest:
//! `SELECT COUNT(*)`, `CREATE TABLE`, `DROP TABLE`, `INSERT ... VALUES`
//! and `DELETE ... LIMIT n`. Everything else succeeds with an empty result.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use warden_core::engine::{EngineAdapter, EngineConfig, QueryResult, TableInfo};
use warden_core::error::EngineError;
use warden_core::types::{ConnectionId, OperationId};

/// Non-query call recorded by the fake
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Cancel(OperationId),
    ForceTerminate(OperationId),
    ResetConnection(ConnectionId),
    Close,
    Reinitialize(EngineConfig),
    SetMemoryLimit(u64),
    SetMaxConnections(u32),
}

#[derive(Debug, Clone)]
struct FakeTable {
    rows: u64,
    temporary: bool,
}

#[derive(Debug)]
struct FakeState {
    tables: BTreeMap<String, FakeTable>,
    queries: Vec<String>,
    calls: Vec<EngineCall>,
    fail_patterns: Vec<String>,
    available: bool,
    open: bool,
    cancel_ok: bool,
    terminate_ok: bool,
    reset_ok: bool,
    reinit_ok: bool,
    list_tables_ok: bool,
    execute_delay: Option<Duration>,
    memory_limit: Option<u64>,
    max_connections: Option<u32>,
}

/// Scriptable engine double
#[derive(Debug)]
pub struct FakeEngine {
    name: String,
    state: Mutex<FakeState>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::named("fake")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(FakeState {
                tables: BTreeMap::new(),
                queries: Vec::new(),
                calls: Vec::new(),
                fail_patterns: Vec::new(),
                available: true,
                open: true,
                cancel_ok: true,
                terminate_ok: true,
                reset_ok: true,
                reinit_ok: true,
                list_tables_ok: true,
                execute_delay: None,
                memory_limit: None,
                max_connections: None,
            }),
        }
    }

    pub fn with_table(self, name: &str, rows: u64) -> Self {
        self.state.lock().tables.insert(
            name.to_string(),
            FakeTable {
                rows,
                temporary: false,
            },
        );
        self
    }

    pub fn with_temp_table(self, name: &str, rows: u64) -> Self {
        self.state.lock().tables.insert(
            name.to_string(),
            FakeTable {
                rows,
                temporary: true,
            },
        );
        self
    }

    pub fn insert_rows(&self, table: &str, n: u64) {
        let mut state = self.state.lock();
        let entry = state.tables.entry(table.to_string()).or_insert(FakeTable {
            rows: 0,
            temporary: false,
        });
        entry.rows += n;
    }

    pub fn create_table(&self, table: &str) {
        self.state.lock().tables.insert(
            table.to_string(),
            FakeTable {
                rows: 0,
                temporary: false,
            },
        );
    }

    pub fn row_count(&self, table: &str) -> Option<u64> {
        self.state.lock().tables.get(table).map(|t| t.rows)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state.lock().tables.contains_key(table)
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    pub fn queries_containing(&self, needle: &str) -> Vec<String> {
        self.state
            .lock()
            .queries
            .iter()
            .filter(|q| q.contains(needle))
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.queries.clear();
        state.calls.clear();
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn fail_queries_containing(&self, pattern: &str) {
        self.state.lock().fail_patterns.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_patterns.clear();
    }

    pub fn set_cancel_ok(&self, ok: bool) {
        self.state.lock().cancel_ok = ok;
    }

    pub fn set_terminate_ok(&self, ok: bool) {
        self.state.lock().terminate_ok = ok;
    }

    pub fn set_reset_ok(&self, ok: bool) {
        self.state.lock().reset_ok = ok;
    }

    pub fn set_reinit_ok(&self, ok: bool) {
        self.state.lock().reinit_ok = ok;
    }

    pub fn set_list_tables_ok(&self, ok: bool) {
        self.state.lock().list_tables_ok = ok;
    }

    pub fn set_execute_delay(&self, delay: Option<Duration>) {
        self.state.lock().execute_delay = delay;
    }

    pub fn memory_limit(&self) -> Option<u64> {
        self.state.lock().memory_limit
    }

    pub fn max_connections(&self) -> Option<u32> {
        self.state.lock().max_connections
    }

    pub fn count_calls(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn gate(&self) -> Result<(), EngineError> {
        let state = self.state.lock();
        if !state.available {
            return Err(EngineError::Unavailable(format!("{} is down", self.name)));
        }
        if !state.open {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn interpret(&self, query: &str) -> Result<QueryResult, EngineError> {
        let mut state = self.state.lock();
        state.queries.push(query.to_string());

        if !state.available {
            return Err(EngineError::Unavailable(format!("{} is down", self.name)));
        }
        if !state.open {
            return Err(EngineError::Closed);
        }
        if let Some(p) = state.fail_patterns.iter().find(|p| query.contains(p.as_str())) {
            return Err(EngineError::QueryFailed(format!("injected failure ({p})")));
        }

        let re = patterns();
        if let Some(c) = re.count.captures(query) {
            let table = &c[1];
            return state
                .tables
                .get(table)
                .map(|t| QueryResult::scalar("count", t.rows))
                .ok_or_else(|| EngineError::QueryFailed(format!("no such table: {table}")));
        }
        if let Some(c) = re.create.captures(query) {
            let temporary = c.get(1).is_some();
            state.tables.insert(
                c[2].to_string(),
                FakeTable { rows: 0, temporary },
            );
            return Ok(QueryResult::empty());
        }
        if let Some(c) = re.drop.captures(query) {
            let if_exists = c.get(1).is_some();
            let table = &c[2];
            if state.tables.remove(table).is_none() && !if_exists {
                return Err(EngineError::QueryFailed(format!("no such table: {table}")));
            }
            return Ok(QueryResult::empty());
        }
        if let Some(c) = re.insert.captures(query) {
            let table = c[1].to_string();
            let tuples = if query.to_ascii_uppercase().contains("VALUES") {
                re.tuple_sep.find_iter(query).count() as u64 + 1
            } else {
                0
            };
            let entry = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| EngineError::QueryFailed(format!("no such table: {table}")))?;
            entry.rows += tuples;
            return Ok(QueryResult {
                rows_affected: tuples,
                ..QueryResult::empty()
            });
        }
        if let Some(c) = re.delete.captures(query) {
            let table = c[1].to_string();
            let entry = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| EngineError::QueryFailed(format!("no such table: {table}")))?;
            let removed = if let Some(limit) = re.limit.captures(query) {
                limit[1].parse::<u64>().unwrap_or(0).min(entry.rows)
            } else if query.to_ascii_uppercase().contains("WHERE") {
                entry.rows.min(1)
            } else {
                entry.rows
            };
            entry.rows -= removed;
            return Ok(QueryResult {
                rows_affected: removed,
                ..QueryResult::empty()
            });
        }
        Ok(QueryResult::empty())
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }
}

struct Patterns {
    count: Regex,
    create: Regex,
    drop: Regex,
    insert: Regex,
    delete: Regex,
    limit: Regex,
    tuple_sep: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        count: Regex::new(r#"(?i)^\s*SELECT\s+COUNT\(\*\)\s+FROM\s+"?([^"\s;]+)"?"#).unwrap(),
        create: Regex::new(
            r#"(?i)^\s*CREATE\s+(?:OR\s+REPLACE\s+)?(TEMP\s+|TEMPORARY\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?"?([^"\s(;]+)"?"#,
        )
        .unwrap(),
        drop: Regex::new(r#"(?i)^\s*DROP\s+TABLE\s+(IF\s+EXISTS\s+)?"?([^"\s;]+)"?"#).unwrap(),
        insert: Regex::new(r#"(?i)^\s*INSERT\s+INTO\s+"?([^"\s(;]+)"?"#).unwrap(),
        delete: Regex::new(r#"(?i)^\s*DELETE\s+FROM\s+"?([^"\s;]+)"?"#).unwrap(),
        limit: Regex::new(r"(?i)LIMIT\s+(\d+)").unwrap(),
        tuple_sep: Regex::new(r"\)\s*,\s*\(").unwrap(),
    })
}

#[async_trait::async_trait]
impl EngineAdapter for FakeEngine {
    async fn execute(&self, query: &str) -> Result<QueryResult, EngineError> {
        let delay = self.state.lock().execute_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.interpret(query)
    }

    async fn cancel(&self, operation: &OperationId) -> Result<(), EngineError> {
        self.record(EngineCall::Cancel(operation.clone()));
        self.gate()?;
        if self.state.lock().cancel_ok {
            Ok(())
        } else {
            Err(EngineError::QueryFailed("cancel ignored".into()))
        }
    }

    async fn force_terminate(&self, operation: &OperationId) -> Result<(), EngineError> {
        self.record(EngineCall::ForceTerminate(operation.clone()));
        self.gate()?;
        if self.state.lock().terminate_ok {
            Ok(())
        } else {
            Err(EngineError::QueryFailed("terminate refused".into()))
        }
    }

    async fn reset_connection(&self, connection: ConnectionId) -> Result<(), EngineError> {
        self.record(EngineCall::ResetConnection(connection));
        self.gate()?;
        if self.state.lock().reset_ok {
            Ok(())
        } else {
            Err(EngineError::QueryFailed("reset refused".into()))
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Close);
        self.state.lock().open = false;
        Ok(())
    }

    async fn reinitialize(&self, config: &EngineConfig) -> Result<(), EngineError> {
        self.record(EngineCall::Reinitialize(config.clone()));
        let mut state = self.state.lock();
        if !state.reinit_ok {
            return Err(EngineError::Unavailable("reinitialize failed".into()));
        }
        state.open = true;
        state.available = true;
        state.memory_limit = Some(config.memory_limit_bytes);
        state.max_connections = Some(config.max_connections);
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<TableInfo>, EngineError> {
        self.gate()?;
        let state = self.state.lock();
        if !state.list_tables_ok {
            return Err(EngineError::QueryFailed("catalog unavailable".into()));
        }
        Ok(state
            .tables
            .iter()
            .map(|(name, t)| TableInfo {
                name: name.clone(),
                temporary: t.temporary,
            })
            .collect())
    }

    async fn set_memory_limit(&self, bytes: u64) -> Result<(), EngineError> {
        self.record(EngineCall::SetMemoryLimit(bytes));
        self.gate()?;
        let mut state = self.state.lock();
        if state.fail_patterns.iter().any(|p| p == "memory_limit") {
            return Err(EngineError::QueryFailed("injected failure (memory_limit)".into()));
        }
        state.memory_limit = Some(bytes);
        Ok(())
    }

    async fn set_max_connections(&self, max: u32) -> Result<(), EngineError> {
        self.record(EngineCall::SetMaxConnections(max));
        self.gate()?;
        self.state.lock().max_connections = Some(max);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
