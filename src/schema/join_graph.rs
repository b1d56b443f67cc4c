//! Join Graph Resolution
//!
//! Join paths come from the foreign-key graph only, never from generation.
//! Path choice is deterministic: shortest path first, then
//! 1. paths through tables the time dimension already needs,
//! 2. fewest joins,
//! 3. lexicographic table sequence.

use crate::error::{AgentError, Result};
use crate::schema::ForeignKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Upper bound on equally short candidate paths considered per resolution
const MAX_CANDIDATE_PATHS: usize = 256;

/// Cardinality of one traversal step, seen from the `from_table` side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Following a foreign key towards the referenced table
    ManyToOne,
    /// Walking a foreign key backwards; each left row may match many right rows
    OneToMany,
}

impl Cardinality {
    pub fn is_fan_out_safe(&self) -> bool {
        matches!(self, Cardinality::ManyToOne)
    }
}

/// One join in a resolved path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinStep {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub cardinality: Cardinality,
}

impl JoinStep {
    pub fn can_fan_out(&self) -> bool {
        !self.cardinality.is_fan_out_safe()
    }

    /// The foreign key this step traverses, in declared direction
    pub fn foreign_key(&self) -> ForeignKey {
        match self.cardinality {
            Cardinality::ManyToOne => ForeignKey {
                from_table: self.from_table.clone(),
                from_column: self.from_column.clone(),
                to_table: self.to_table.clone(),
                to_column: self.to_column.clone(),
            },
            Cardinality::OneToMany => ForeignKey {
                from_table: self.to_table.clone(),
                from_column: self.to_column.clone(),
                to_table: self.from_table.clone(),
                to_column: self.from_column.clone(),
            },
        }
    }
}

/// Tie-breaking inputs for path resolution
#[derive(Debug, Clone, Default)]
pub struct PathPreferences {
    /// Tables already required by the plan (e.g. the time dimension's table)
    pub preferred_tables: Vec<String>,
    /// Edges a semantic repair ruled out
    pub excluded_edges: Vec<ForeignKey>,
}

/// Undirected view over the foreign-key graph
#[derive(Debug, Clone, Default)]
pub struct JoinGraph {
    adjacency: BTreeMap<String, Vec<JoinStep>>,
}

impl JoinGraph {
    pub fn from_foreign_keys(foreign_keys: &[ForeignKey]) -> Self {
        let mut adjacency: BTreeMap<String, Vec<JoinStep>> = BTreeMap::new();
        for fk in foreign_keys {
            adjacency.entry(fk.from_table.clone()).or_default().push(JoinStep {
                from_table: fk.from_table.clone(),
                from_column: fk.from_column.clone(),
                to_table: fk.to_table.clone(),
                to_column: fk.to_column.clone(),
                cardinality: Cardinality::ManyToOne,
            });
            adjacency.entry(fk.to_table.clone()).or_default().push(JoinStep {
                from_table: fk.to_table.clone(),
                from_column: fk.to_column.clone(),
                to_table: fk.from_table.clone(),
                to_column: fk.from_column.clone(),
                cardinality: Cardinality::OneToMany,
            });
        }
        for steps in adjacency.values_mut() {
            steps.sort_by(|a, b| {
                (&a.to_table, &a.from_column, &a.to_column).cmp(&(&b.to_table, &b.from_column, &b.to_column))
            });
        }
        Self { adjacency }
    }

    fn neighbours<'a>(&'a self, table: &str, excluded: &'a [ForeignKey]) -> impl Iterator<Item = &'a JoinStep> {
        self.adjacency
            .get(table)
            .into_iter()
            .flatten()
            .filter(move |step| !excluded.contains(&step.foreign_key()))
    }

    /// All shortest paths from `from` to `to`
    pub fn shortest_paths(&self, from: &str, to: &str, excluded: &[ForeignKey]) -> Vec<Vec<JoinStep>> {
        if from == to {
            return vec![Vec::new()];
        }

        // BFS distances from the origin
        let mut distance: HashMap<&str, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        distance.insert(from, 0);
        queue.push_back(from);
        while let Some(table) = queue.pop_front() {
            let d = distance[table];
            for step in self.neighbours(table, excluded) {
                if !distance.contains_key(step.to_table.as_str()) {
                    distance.insert(step.to_table.as_str(), d + 1);
                    queue.push_back(step.to_table.as_str());
                }
            }
        }

        let target = match distance.get(to) {
            Some(d) => *d,
            None => return Vec::new(),
        };

        let mut paths = Vec::new();
        let mut current = Vec::new();
        self.collect_paths(from, to, target, &distance, excluded, &mut current, &mut paths);
        paths
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_paths(
        &self,
        table: &str,
        to: &str,
        target: usize,
        distance: &HashMap<&str, usize>,
        excluded: &[ForeignKey],
        current: &mut Vec<JoinStep>,
        paths: &mut Vec<Vec<JoinStep>>,
    ) {
        if paths.len() >= MAX_CANDIDATE_PATHS {
            return;
        }
        if table == to {
            paths.push(current.clone());
            return;
        }
        let depth = current.len();
        if depth >= target {
            return;
        }
        for step in self.neighbours(table, excluded) {
            if distance.get(step.to_table.as_str()) == Some(&(depth + 1)) {
                current.push(step.clone());
                self.collect_paths(&step.to_table, to, target, distance, excluded, current, paths);
                current.pop();
            }
        }
    }

    /// Resolve the single deterministic path between two tables
    pub fn resolve_path(&self, from: &str, to: &str, prefs: &PathPreferences) -> Result<Vec<JoinStep>> {
        let mut candidates = self.shortest_paths(from, to, &prefs.excluded_edges);
        if candidates.is_empty() {
            return Err(AgentError::Synthesis(format!(
                "No join path from '{}' to '{}' in the foreign-key graph",
                from, to
            )));
        }
        candidates.sort_by_key(|path| path_rank(path, &prefs.preferred_tables));
        Ok(candidates.swap_remove(0))
    }

    /// Resolve joins from a base table to every target table, deduplicated
    /// and ordered so each join's left table is already in scope.
    pub fn resolve_join_set(&self, base: &str, targets: &[&str], prefs: &PathPreferences) -> Result<Vec<JoinStep>> {
        let mut joined: Vec<JoinStep> = Vec::new();
        let mut in_scope: HashSet<String> = HashSet::new();
        in_scope.insert(base.to_string());

        for target in targets {
            if in_scope.contains(*target) {
                continue;
            }
            let path = self.resolve_path(base, target, prefs)?;
            for step in path {
                if in_scope.contains(&step.to_table) {
                    continue;
                }
                if !in_scope.contains(&step.from_table) {
                    return Err(AgentError::Synthesis(format!(
                        "Join from '{}' is not connected to tables already in scope",
                        step.from_table
                    )));
                }
                in_scope.insert(step.to_table.clone());
                joined.push(step);
            }
        }

        Ok(joined)
    }
}

/// Sort key: preferred-table coverage (more is better), join count, table names
fn path_rank(path: &[JoinStep], preferred: &[String]) -> (usize, usize, Vec<String>) {
    let touched: HashSet<&str> = path
        .iter()
        .flat_map(|s| [s.from_table.as_str(), s.to_table.as_str()])
        .collect();
    let missed = preferred.iter().filter(|t| !touched.contains(t.as_str())).count();
    let tables = path.iter().map(|s| s.to_table.clone()).collect();
    (missed, path.len(), tables)
}
