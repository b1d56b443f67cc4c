use super::{QueryBackend, QueryRows};
use crate::error::{AgentError, Result};
use crate::schema::{ColumnSchema, DataType, ForeignKey, SchemaContext, TableSchema};
use crate::synth::Dialect;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// SQLite backend. File databases are opened read-only; statements are
/// additionally required to be read-only at prepare time.
///
/// Every statement runs on a connection checked out for that call alone,
/// so an interrupt only ever reaches the statement of the caller that
/// gave up on it.
pub struct SqliteBackend {
    pool: Arc<ConnectionPool>,
}

/// Idle connections plus one permit per connection the pool may hand out.
/// File databases open more connections on demand; an in-memory dataset
/// has exactly one.
struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    path: Option<PathBuf>,
}

impl ConnectionPool {
    fn take(&self) -> Result<Connection> {
        let pooled = self
            .idle
            .lock()
            .map_err(|_| AgentError::Database("sqlite pool lock poisoned".to_string()))?
            .pop();
        match (pooled, &self.path) {
            (Some(conn), _) => Ok(conn),
            (None, Some(path)) => open_file(path),
            (None, None) => Err(AgentError::Database("in-memory connection is unavailable".to_string())),
        }
    }

    fn give_back(&self, conn: Connection) {
        match self.idle.lock() {
            Ok(mut idle) => idle.push(conn),
            Err(_) => warn!("sqlite pool lock poisoned, dropping connection"),
        }
    }
}

fn open_file(path: &Path) -> Result<Connection> {
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?)
}

/// Interrupt access to one checked-out connection while its statement runs
#[derive(Clone)]
struct StatementSlot {
    interrupt: Arc<InterruptHandle>,
    active: Arc<Mutex<bool>>,
}

impl StatementSlot {
    fn new(conn: &Connection) -> Self {
        Self {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            active: Arc::new(Mutex::new(true)),
        }
    }

    /// Called by the worker before the connection goes back to the pool
    fn finish(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = false;
        }
    }

    fn interrupt_if_active(&self) {
        if let Ok(active) = self.active.lock() {
            if *active {
                self.interrupt.interrupt();
            }
        }
    }
}

/// Interrupts the statement when the caller stops waiting for it
/// (timeout or request cancellation drop the `run` future)
struct AbandonGuard(StatementSlot);

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        self.0.interrupt_if_active();
    }
}

fn engine_error(err: rusqlite::Error) -> AgentError {
    AgentError::ExecutionFailed(err.to_string())
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<{} bytes>", b.len())),
    }
}

fn query_rows(conn: &Connection, statement: &str, limit: usize, timeout: Duration) -> Result<QueryRows> {
    conn.busy_timeout(timeout).map_err(engine_error)?;

    let mut stmt = conn.prepare(statement).map_err(engine_error)?;
    if !stmt.readonly() {
        return Err(AgentError::ExecutionFailed("statement is not read-only".to_string()));
    }
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut out = Vec::new();
    let mut truncated = false;
    let mut rows = stmt.query([]).map_err(engine_error)?;
    while let Some(row) = rows.next().map_err(engine_error)? {
        if out.len() >= limit {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(value_to_json(row.get_ref(i).map_err(engine_error)?));
        }
        out.push(values);
    }

    Ok(QueryRows {
        columns,
        rows: out,
        truncated,
    })
}

impl SqliteBackend {
    /// Open a file database read-only, allowing up to `max_connections`
    /// statements to run at once
    pub fn open_read_only(path: impl AsRef<Path>, max_connections: usize) -> Result<Self> {
        let path = path.as_ref();
        let conn = open_file(path)?;
        info!(
            "Opened SQLite dataset {} read-only ({} connections)",
            path.display(),
            max_connections.max(1)
        );
        Ok(Self {
            pool: Arc::new(ConnectionPool {
                idle: Mutex::new(vec![conn]),
                permits: Arc::new(Semaphore::new(max_connections.max(1))),
                path: Some(path.to_path_buf()),
            }),
        })
    }

    /// Wrap an existing connection (used for in-memory datasets). Statements
    /// queue for the single connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            pool: Arc::new(ConnectionPool {
                idle: Mutex::new(vec![conn]),
                permits: Arc::new(Semaphore::new(1)),
                path: None,
            }),
        }
    }

    /// Build a schema snapshot from the catalog: tables, columns, primary
    /// keys, declared foreign keys and row counts. Roles are left empty.
    pub fn introspect(&self, dataset_id: &str) -> Result<SchemaContext> {
        let conn = self.pool.take()?;
        let context = introspect_connection(&conn, dataset_id);
        self.pool.give_back(conn);
        context
    }
}

fn introspect_connection(conn: &Connection, dataset_id: &str) -> Result<SchemaContext> {
    let mut names_stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names: Vec<String> = names_stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut tables = Vec::with_capacity(names.len());
    let mut foreign_keys = Vec::new();

    for name in &names {
        let mut info = conn.prepare(&format!("PRAGMA table_info(\"{}\")", name))?;
        let columns: Vec<ColumnSchema> = info
            .query_map([], |row| {
                let col_name: String = row.get(1)?;
                let declared: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
                let not_null: i64 = row.get(3)?;
                let pk: i64 = row.get(5)?;
                Ok(ColumnSchema {
                    name: col_name,
                    data_type: DataType::from_sql_type(&declared),
                    nullable: not_null == 0 && pk == 0,
                    is_primary_key: pk > 0,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut fk_stmt = conn.prepare(&format!("PRAGMA foreign_key_list(\"{}\")", name))?;
        let fks: Vec<(String, String, Option<String>)> = fk_stmt
            .query_map([], |row| Ok((row.get(2)?, row.get(3)?, row.get(4)?)))?
            .collect::<std::result::Result<_, _>>()?;
        for (to_table, from_column, to_column) in fks {
            foreign_keys.push(ForeignKey {
                from_table: name.clone(),
                to_column: to_column.unwrap_or_else(|| from_column.clone()),
                from_column,
                to_table,
            });
        }

        let row_count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", name), [], |row| row.get(0))?;

        tables.push(TableSchema {
            name: name.clone(),
            columns,
            row_count: Some(row_count.max(0) as u64),
        });
    }

    debug!(
        "Introspected {} tables and {} foreign keys for dataset {}",
        tables.len(),
        foreign_keys.len(),
        dataset_id
    );
    Ok(SchemaContext::new(dataset_id, tables, foreign_keys))
}

#[async_trait]
impl QueryBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn run(&self, statement: &str, row_limit: u32, timeout: Duration) -> Result<QueryRows> {
        // queueing for a connection touches no other caller's statement
        let permit = Arc::clone(&self.pool.permits)
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Database("sqlite pool closed".to_string()))?;
        let conn = self.pool.take()?;

        let slot = StatementSlot::new(&conn);
        let _abandon = AbandonGuard(slot.clone());
        let pool = Arc::clone(&self.pool);
        let statement = statement.to_string();
        let limit = row_limit as usize;

        tokio::task::spawn_blocking(move || -> Result<QueryRows> {
            // the permit follows the connection, not the caller
            let _permit = permit;
            let outcome = query_rows(&conn, &statement, limit, timeout);
            slot.finish();
            pool.give_back(conn);
            outcome
        })
        .await
        .map_err(|e| AgentError::ExecutionFailed(format!("sqlite worker failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SqliteBackend {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE dim_customer (customer_id INTEGER PRIMARY KEY, country TEXT NOT NULL);
             CREATE TABLE fact_sales (
                 invoice_no TEXT PRIMARY KEY,
                 customer_id INTEGER REFERENCES dim_customer(customer_id),
                 total_amount REAL
             );
             INSERT INTO dim_customer VALUES (1, 'United Kingdom'), (2, 'France');
             INSERT INTO fact_sales VALUES ('A1', 1, 10.5), ('A2', 1, 4.5), ('A3', 2, 7.0);",
        )
        .unwrap();
        SqliteBackend::from_connection(conn)
    }

    #[tokio::test]
    async fn test_run_truncates_at_limit() {
        let rows = backend()
            .run("SELECT invoice_no, total_amount FROM fact_sales ORDER BY invoice_no", 2, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["invoice_no", "total_amount"]);
        assert_eq!(rows.rows.len(), 2);
        assert!(rows.truncated);
        assert_eq!(rows.rows[0][1], serde_json::json!(10.5));
    }

    #[tokio::test]
    async fn test_write_statement_refused() {
        let err = backend()
            .run("DELETE FROM fact_sales", 10, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn test_engine_error_text() {
        let err = backend()
            .run("SELECT total_amt FROM fact_sales", 10, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            AgentError::ExecutionFailed(text) => assert!(text.contains("no such column")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    const SPIN: &str = "WITH RECURSIVE spin(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM spin WHERE x < 2000000) \
                        SELECT COUNT(*) FROM spin";
    const LONG_SPIN: &str = "WITH RECURSIVE spin(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM spin WHERE x < 100000000) \
                             SELECT COUNT(*) FROM spin";

    #[tokio::test]
    async fn test_waiting_caller_times_out_without_touching_running_statement() {
        let backend = Arc::new(backend());
        let slow = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.run(SPIN, 10, Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let quick = tokio::time::timeout(
            Duration::from_millis(100),
            backend.run("SELECT 1", 10, Duration::from_secs(1)),
        )
        .await;
        assert!(quick.is_err());

        let rows = slow.await.unwrap().unwrap();
        assert_eq!(rows.rows[0][0], serde_json::json!(2000000));
    }

    #[tokio::test]
    async fn test_abandoned_statement_is_interrupted() {
        let backend = backend();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            backend.run(LONG_SPIN, 10, Duration::from_secs(60)),
        )
        .await;
        assert!(abandoned.is_err());

        // the connection comes back as soon as the interrupt lands
        let rows = tokio::time::timeout(
            Duration::from_secs(5),
            backend.run("SELECT COUNT(*) FROM fact_sales", 10, Duration::from_secs(1)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(rows.rows[0][0], serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_file_database_runs_statements_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retail.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE fact_sales (invoice_no TEXT PRIMARY KEY); INSERT INTO fact_sales VALUES ('A1');")
            .unwrap();

        let backend = Arc::new(SqliteBackend::open_read_only(&path, 2).unwrap());
        let slow = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.run(LONG_SPIN, 10, Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let quick = backend
            .run("SELECT invoice_no FROM fact_sales", 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(quick.rows, vec![vec![serde_json::json!("A1")]]);
        assert!(!slow.is_finished());
        slow.abort();
    }

    #[test]
    fn test_introspect() {
        let ctx = backend().introspect("retail").unwrap();
        assert_eq!(ctx.tables.len(), 2);
        let fact = ctx.table("fact_sales").unwrap();
        assert_eq!(fact.row_count, Some(3));
        assert_eq!(fact.column("total_amount").unwrap().data_type, DataType::Numeric);
        assert!(fact.column("invoice_no").unwrap().is_primary_key);
        assert_eq!(ctx.foreign_keys.len(), 1);
        assert_eq!(ctx.foreign_keys[0].to_table, "dim_customer");
        assert_eq!(ctx.foreign_keys[0].to_column, "customer_id");
    }
}
