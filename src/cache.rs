//! Plan → SQL cache
//!
//! Keyed per dataset by plan fingerprint and excluded join edges. Each
//! dataset holds one generation tagged with the schema snapshot it was
//! compiled against; a newer snapshot swaps the whole generation so a
//! reader never sees SQL compiled for an older schema next to a newer one.
//! Generations only move forward: a writer that finishes late with an
//! older snapshot is dropped.

use crate::planner::Plan;
use crate::schema::provider::SchemaSnapshot;
use crate::schema::ForeignKey;
use crate::synth::CandidateSql;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

struct Generation {
    schema_hash: String,
    version: u64,
    entries: DashMap<String, CandidateSql>,
}

impl Generation {
    fn new(schema: &SchemaSnapshot) -> Self {
        Self {
            schema_hash: schema.hash.clone(),
            version: schema.version,
            entries: DashMap::new(),
        }
    }

    /// Older than `schema`, or the same version under another hash
    fn superseded_by(&self, schema: &SchemaSnapshot) -> bool {
        self.schema_hash != schema.hash && schema.version >= self.version
    }
}

#[derive(Default)]
pub struct PlanSqlCache {
    generations: RwLock<HashMap<String, Arc<Generation>>>,
}

impl PlanSqlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(plan: &Plan, excluded_joins: &[ForeignKey]) -> String {
        let mut edges: Vec<&ForeignKey> = excluded_joins.iter().collect();
        edges.sort();
        let edges: Vec<String> = edges
            .iter()
            .map(|e| format!("{}.{}>{}.{}", e.from_table, e.from_column, e.to_table, e.to_column))
            .collect();
        format!("{}|{}", plan.fingerprint(), edges.join(","))
    }

    fn generation(&self, dataset_id: &str) -> Option<Arc<Generation>> {
        self.generations
            .read()
            .ok()
            .and_then(|map| map.get(dataset_id).cloned())
    }

    pub fn get(&self, dataset_id: &str, schema_hash: &str, key: &str) -> Option<CandidateSql> {
        let generation = self.generation(dataset_id)?;
        if generation.schema_hash != schema_hash {
            debug!("cache generation for {} is stale", dataset_id);
            return None;
        }
        generation.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, dataset_id: &str, schema: &SchemaSnapshot, key: String, candidate: CandidateSql) {
        let generation = match self.generation(dataset_id) {
            Some(current) if current.schema_hash == schema.hash => current,
            _ => {
                let mut map = match self.generations.write() {
                    Ok(map) => map,
                    Err(_) => return,
                };
                // another writer may have swapped already
                let entry = map
                    .entry(dataset_id.to_string())
                    .or_insert_with(|| Arc::new(Generation::new(schema)));
                if entry.superseded_by(schema) {
                    debug!("swapping cache generation for {}", dataset_id);
                    *entry = Arc::new(Generation::new(schema));
                } else if entry.schema_hash != schema.hash {
                    debug!(
                        "dropping cache entry for {} compiled against superseded schema v{}",
                        dataset_id, schema.version
                    );
                    return;
                }
                Arc::clone(entry)
            }
        };
        generation.entries.insert(key, candidate);
    }

    pub fn len(&self, dataset_id: &str) -> usize {
        self.generation(dataset_id).map_or(0, |g| g.entries.len())
    }

    pub fn is_empty(&self, dataset_id: &str) -> bool {
        self.len(dataset_id) == 0
    }
}
