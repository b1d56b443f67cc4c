//! Executor
//!
//! Runs one checked statement against a backend under a timeout that does
//! not depend on engine settings. Engine errors are captured verbatim in
//! the result instead of failing the request. Giving up on a statement
//! (timeout or cancellation) means dropping its future; backends interrupt
//! only the statement that future started.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use crate::error::{AgentError, Result};
use crate::safety::CheckedSql;
use crate::synth::Dialect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Rows as returned by a backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// More rows existed than the limit allowed
    pub truncated: bool,
}

/// A read-only SQL engine
#[async_trait]
pub trait QueryBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn dialect(&self) -> Dialect;

    /// Run one read-only statement. Engine failures come back as
    /// `AgentError::ExecutionFailed` carrying the engine's own text.
    /// Dropping the future abandons this statement and no other.
    async fn run(&self, statement: &str, row_limit: u32, timeout: Duration) -> Result<QueryRows>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn QueryBackend>,
}

impl Executor {
    pub fn new(backend: Arc<dyn QueryBackend>) -> Self {
        Self { backend }
    }

    pub async fn execute(&self, checked: &CheckedSql) -> ExecutionResult {
        let timeout = Duration::from_millis(checked.timeout_ms);
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.backend.run(&checked.statement, checked.row_limit, timeout)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(rows)) => {
                debug!("{} returned {} rows in {} ms", self.backend.name(), rows.rows.len(), elapsed_ms);
                // a result that fills an injected LIMIT may have been cut by it
                let truncated =
                    rows.truncated || (checked.limit_injected && rows.rows.len() >= checked.row_limit as usize);
                ExecutionResult {
                    row_count: rows.rows.len(),
                    columns: rows.columns,
                    rows: rows.rows,
                    error: None,
                    elapsed_ms,
                    truncated,
                }
            }
            Ok(Err(e)) => {
                let text = match e {
                    AgentError::ExecutionFailed(text) => text,
                    other => other.to_string(),
                };
                warn!("{} execution failed: {}", self.backend.name(), text);
                ExecutionResult {
                    error: Some(text),
                    elapsed_ms,
                    ..Default::default()
                }
            }
            Err(_) => {
                warn!("{} query timed out after {} ms", self.backend.name(), checked.timeout_ms);
                ExecutionResult {
                    error: Some(format!("query timed out after {} ms", checked.timeout_ms)),
                    elapsed_ms,
                    ..Default::default()
                }
            }
        }
    }
}
