use super::{QueryTrace, TraceStore};
use crate::error::{AgentError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

/// Process-local trace store
#[derive(Default)]
pub struct InMemoryTraceStore {
    traces: DashMap<String, (u64, QueryTrace)>,
    sequence: AtomicU64,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

impl TraceStore for InMemoryTraceStore {
    fn append(&self, trace: &QueryTrace) -> Result<()> {
        match self.traces.entry(trace.trace_id.clone()) {
            Entry::Occupied(_) => Err(AgentError::Trace(format!("duplicate trace_id {}", trace.trace_id))),
            Entry::Vacant(slot) => {
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
                slot.insert((seq, trace.clone()));
                Ok(())
            }
        }
    }

    fn get(&self, trace_id: &str) -> Result<Option<QueryTrace>> {
        Ok(self.traces.get(trace_id).map(|entry| entry.value().1.clone()))
    }

    fn list(&self) -> Result<Vec<QueryTrace>> {
        let mut all: Vec<(u64, QueryTrace)> = self.traces.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|(seq, _)| *seq);
        Ok(all.into_iter().map(|(_, trace)| trace).collect())
    }
}

/// Durable trace store. Rows are inserted once and never updated.
pub struct SqliteTraceStore {
    db: Mutex<Connection>,
}

impl SqliteTraceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| AgentError::Trace(format!("Failed to open trace database: {}", e)))?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        info!("Trace store at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            db: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| AgentError::Trace("trace database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS query_traces (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id TEXT NOT NULL UNIQUE,
                dataset_id TEXT NOT NULL,
                status TEXT NOT NULL,
                confidence_tier TEXT NOT NULL,
                started_at TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| AgentError::Trace(format!("Failed to create table: {}", e)))?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_query_traces_dataset ON query_traces(dataset_id)",
            [],
        )
        .map_err(|e| AgentError::Trace(format!("Failed to create index: {}", e)))?;

        Ok(())
    }
}

impl TraceStore for SqliteTraceStore {
    fn append(&self, trace: &QueryTrace) -> Result<()> {
        let payload = serde_json::to_string(trace)?;
        let db = self.lock()?;
        let inserted = db.execute(
            r#"
            INSERT INTO query_traces (trace_id, dataset_id, status, confidence_tier, started_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                trace.trace_id,
                trace.dataset_id,
                trace.status.as_str(),
                trace.confidence_tier.to_string(),
                trace.started_at.to_rfc3339(),
                payload,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(AgentError::Trace(format!("duplicate trace_id {}", trace.trace_id)))
            }
            Err(e) => Err(AgentError::Trace(format!("Failed to insert trace: {}", e))),
        }
    }

    fn get(&self, trace_id: &str) -> Result<Option<QueryTrace>> {
        let db = self.lock()?;
        let mut stmt = db.prepare("SELECT payload FROM query_traces WHERE trace_id = ?1")?;
        let mut rows = stmt.query(params![trace_id])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<QueryTrace>> {
        let db = self.lock()?;
        let mut stmt = db.prepare("SELECT payload FROM query_traces ORDER BY seq")?;
        let payloads: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(AgentError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AnalysisStatus;
    use crate::trace::sample_trace;

    #[test]
    fn test_in_memory_rejects_duplicate() {
        let store = InMemoryTraceStore::new();
        store.append(&sample_trace("a", AnalysisStatus::Answered)).unwrap();
        store.append(&sample_trace("b", AnalysisStatus::Clarification)).unwrap();
        assert!(store.append(&sample_trace("a", AnalysisStatus::Answered)).is_err());

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|t| t.trace_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.get("b").unwrap().unwrap().status, AnalysisStatus::Clarification);
    }

    #[test]
    fn test_sqlite_round_trip_and_duplicate() {
        let store = SqliteTraceStore::in_memory().unwrap();
        let trace = sample_trace("t-1", AnalysisStatus::Unresolved);
        store.append(&trace).unwrap();
        let err = store.append(&trace).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(store.get("t-1").unwrap().unwrap(), trace);
        assert!(store.get("missing").unwrap().is_none());
    }
}
