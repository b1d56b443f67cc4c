use super::{QueryBackend, QueryRows};
use crate::error::{AgentError, Result};
use crate::synth::Dialect;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Postgres backend over a shared pool.
///
/// Each statement runs inside a read-only transaction with a local
/// `statement_timeout`, and is wrapped so rows come back as ordered JSON
/// objects regardless of column types. The transaction is always rolled back.
pub struct PostgresBackend {
    pool: PgPool,
}

fn engine_error(err: sqlx::Error) -> AgentError {
    match err {
        sqlx::Error::Database(db) => AgentError::ExecutionFailed(db.message().to_string()),
        other => AgentError::ExecutionFailed(other.to_string()),
    }
}

impl PostgresBackend {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("Connected to Postgres dataset");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Wrap a checked statement so every row is returned as one JSON document
pub(crate) fn wrap_statement(statement: &str) -> String {
    format!(
        "SELECT row_to_json(guarded_query)::text FROM ({}) AS guarded_query LIMIT $1",
        statement
    )
}

/// Split ordered JSON row documents into columns and value rows
pub(crate) fn rows_from_json(documents: &[String], row_limit: usize) -> Result<QueryRows> {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::with_capacity(documents.len().min(row_limit));

    for doc in documents.iter().take(row_limit) {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(doc)?;
        if columns.is_empty() {
            columns = object.keys().cloned().collect();
        }
        rows.push(object.into_iter().map(|(_, v)| v).collect());
    }

    Ok(QueryRows {
        columns,
        rows,
        truncated: documents.len() > row_limit,
    })
}

#[async_trait]
impl QueryBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn run(&self, statement: &str, row_limit: u32, timeout: Duration) -> Result<QueryRows> {
        let mut tx = self.pool.begin().await.map_err(engine_error)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(engine_error)?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(engine_error)?;

        // one extra row tells us whether the result was truncated
        let fetched: std::result::Result<Vec<(String,)>, sqlx::Error> = sqlx::query_as(&wrap_statement(statement))
            .bind(row_limit as i64 + 1)
            .fetch_all(&mut *tx)
            .await;

        tx.rollback().await.map_err(engine_error)?;

        let documents: Vec<String> = fetched.map_err(engine_error)?.into_iter().map(|(doc,)| doc).collect();
        rows_from_json(&documents, row_limit as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_statement() {
        let wrapped = wrap_statement("SELECT 1 AS one");
        assert!(wrapped.starts_with("SELECT row_to_json(guarded_query)::text FROM (SELECT 1 AS one)"));
        assert!(wrapped.ends_with("LIMIT $1"));
    }

    #[test]
    fn test_rows_keep_column_order() {
        let docs = vec![
            r#"{"country":"United Kingdom","revenue":7308391.554}"#.to_string(),
            r#"{"country":"France","revenue":12.5}"#.to_string(),
            r#"{"country":"Spain","revenue":1.0}"#.to_string(),
        ];
        let rows = rows_from_json(&docs, 2).unwrap();
        assert_eq!(rows.columns, vec!["country", "revenue"]);
        assert_eq!(rows.rows.len(), 2);
        assert!(rows.truncated);
        assert_eq!(rows.rows[1][0], serde_json::json!("France"));
    }
}
