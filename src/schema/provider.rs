//! Schema Context Provider
//!
//! Versioned, read-only snapshots per dataset. Publishing a new context
//! swaps the whole snapshot under a write lock; readers hold an `Arc` to
//! whichever version they saw and never observe a partial update.

use crate::error::{AgentError, Result};
use crate::schema::SchemaContext;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// One immutable version of a dataset's schema context
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub hash: String,
    /// Publish counter per dataset; 0 when the provider does not order versions
    pub version: u64,
    pub context: Arc<SchemaContext>,
}

impl SchemaSnapshot {
    pub fn new(context: SchemaContext) -> Self {
        Self::versioned(context, 0)
    }

    pub fn versioned(context: SchemaContext, version: u64) -> Self {
        let hash = context.schema_hash();
        Self {
            hash,
            version,
            context: Arc::new(context),
        }
    }
}

/// Read-only access to schema snapshots
pub trait SchemaProvider: Send + Sync {
    fn snapshot(&self, dataset_id: &str) -> Result<SchemaSnapshot>;
}

/// Process-wide schema cache, populated on first publish per dataset
#[derive(Default)]
pub struct InMemorySchemaProvider {
    snapshots: RwLock<HashMap<String, SchemaSnapshot>>,
}

impl InMemorySchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) a dataset's context; returns the new schema hash
    pub fn publish(&self, context: SchemaContext) -> Result<String> {
        let dataset_id = context.dataset_id.clone();
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| AgentError::Config("schema cache lock poisoned".to_string()))?;
        let hash = context.schema_hash();
        let version = match snapshots.get(&dataset_id) {
            Some(old) if old.hash == hash => old.version,
            Some(old) => old.version + 1,
            None => 1,
        };
        let previous = snapshots.insert(dataset_id.clone(), SchemaSnapshot::versioned(context, version));
        match previous {
            Some(old) if old.hash != hash => {
                info!("Schema for dataset '{}' replaced: {} -> {}", dataset_id, &old.hash[..12], &hash[..12]);
            }
            None => info!("Schema for dataset '{}' published: {}", dataset_id, &hash[..12]),
            _ => {}
        }
        Ok(hash)
    }

    pub fn datasets(&self) -> Vec<String> {
        self.snapshots
            .read()
            .map(|s| {
                let mut ids: Vec<String> = s.keys().cloned().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }
}

impl SchemaProvider for InMemorySchemaProvider {
    fn snapshot(&self, dataset_id: &str) -> Result<SchemaSnapshot> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| AgentError::Config("schema cache lock poisoned".to_string()))?;
        snapshots
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownDataset(dataset_id.to_string()))
    }
}
