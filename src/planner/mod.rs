//! Planner
//!
//! Turns a question plus schema context into a structured analytical plan,
//! or asks for clarification. Strategies are pluggable; the keyword planner
//! is deterministic and always available as the fallback.

pub mod keyword;
pub mod llm_planner;
pub mod validator;

pub use keyword::KeywordPlanner;
pub use llm_planner::LlmPlanner;
pub use validator::{PlanValidator, PlanVerdict, ValidatedPlan};

use crate::error::Result;
use crate::schema::{
    Aggregation, ColumnRef, ForeignKey, RoleCandidate, RoleSource, SchemaContext, SchemaSnapshot, SemanticRole, TimeGrain,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[serde(rename = "topn")]
    TopN,
    Aggregate,
    Trend,
    Segment,
    Compare,
}

impl TaskType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "topn" | "top_n" | "top-n" => Some(TaskType::TopN),
            "aggregate" | "sql_retrieval" | "summary" => Some(TaskType::Aggregate),
            "trend" | "trend_analysis" => Some(TaskType::Trend),
            "segment" | "segmentation" => Some(TaskType::Segment),
            "compare" | "comparison" => Some(TaskType::Compare),
            _ => None,
        }
    }

    /// Task types with a canonical deterministic template
    pub fn has_template(&self) -> bool {
        matches!(self, TaskType::TopN | TaskType::Aggregate | TaskType::Trend)
    }

    pub fn requires_entity(&self) -> bool {
        matches!(self, TaskType::TopN | TaskType::Segment)
    }

    pub fn requires_time(&self) -> bool {
        matches!(self, TaskType::Trend | TaskType::Compare)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::TopN => "topn",
            TaskType::Aggregate => "aggregate",
            TaskType::Trend => "trend",
            TaskType::Segment => "segment",
            TaskType::Compare => "compare",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityScope {
    TopN,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareAgainst {
    None,
    Global,
    PreviousPeriod,
}

impl CompareAgainst {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "none" | "" => Some(CompareAgainst::None),
            "global" | "overall" | "average" => Some(CompareAgainst::Global),
            "previous_period" | "previous period" | "prior_period" => Some(CompareAgainst::PreviousPeriod),
            _ => None,
        }
    }
}

/// A plan slot resolved to one schema column, tagged with where the mapping came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotBinding {
    pub concept: String,
    pub table: String,
    pub column: String,
    pub source: RoleSource,
    pub confidence: f64,
}

impl SlotBinding {
    pub fn from_candidate(candidate: &RoleCandidate) -> Self {
        Self {
            concept: candidate.concept.clone(),
            table: candidate.table.clone(),
            column: candidate.column.clone(),
            source: candidate.source,
            confidence: candidate.confidence,
        }
    }

    pub fn column_ref(&self) -> ColumnRef {
        ColumnRef::new(&self.table, &self.column)
    }

    /// Output column alias for this binding
    pub fn alias(&self) -> String {
        sanitize_alias(&self.concept)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBinding {
    pub measure: SlotBinding,
    pub aggregation: Aggregation,
}

impl MetricBinding {
    /// Stable metric identifier, e.g. `revenue_sum`
    pub fn metric_id(&self) -> String {
        format!("{}_{}", sanitize_alias(&self.measure.concept), self.aggregation.as_str())
    }
}

pub(crate) fn sanitize_alias(raw: &str) -> String {
    let mut alias: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if alias.is_empty() || alias.starts_with(|c: char| c.is_ascii_digit()) {
        alias.insert(0, 'c');
    }
    alias
}

/// Structured analytical plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub question: String,
    pub task_type: TaskType,
    pub entity_dimension: Option<SlotBinding>,
    pub entity_scope: EntityScope,
    pub n: Option<u32>,
    pub metric: Option<MetricBinding>,
    pub time_dimension: Option<SlotBinding>,
    pub time_grain: TimeGrain,
    pub compare_against: CompareAgainst,
    pub planner_source: String,
    /// Schema version the bindings were grounded against
    pub schema_hash: String,
}

impl Plan {
    /// Every schema binding the plan references
    pub fn bindings(&self) -> Vec<&SlotBinding> {
        let mut out = Vec::new();
        if let Some(metric) = &self.metric {
            out.push(&metric.measure);
        }
        if let Some(entity) = &self.entity_dimension {
            out.push(entity);
        }
        if let Some(time) = &self.time_dimension {
            out.push(time);
        }
        out
    }

    pub fn metric_id(&self) -> Option<String> {
        self.metric.as_ref().map(|m| m.metric_id())
    }

    /// Cache key over the analytical content only (question text excluded)
    pub fn fingerprint(&self) -> String {
        let key = serde_json::json!({
            "task_type": self.task_type,
            "entity": self.entity_dimension.as_ref().map(|b| b.column_ref()),
            "scope": self.entity_scope,
            "n": self.n,
            "metric": self.metric.as_ref().map(|m| (m.measure.column_ref(), m.aggregation)),
            "time": self.time_dimension.as_ref().map(|b| b.column_ref()),
            "grain": self.time_grain,
            "compare": self.compare_against,
        });
        key.to_string()
    }
}

/// Returned instead of a plan when a required slot cannot be grounded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationNeeded {
    pub slot: String,
    pub term: Option<String>,
    pub reason: String,
    /// Concepts the dataset does offer for the slot
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanOutcome {
    Planned(Plan),
    Clarification(ClarificationNeeded),
}

/// Steering input from a semantic repair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanHint {
    pub excluded_bindings: Vec<ColumnRef>,
    /// Join edges the next synthesis must route around
    #[serde(default)]
    pub excluded_joins: Vec<ForeignKey>,
    pub reason: String,
}

impl PlanHint {
    /// Fold another repair's exclusions into this one
    pub fn merge(&mut self, other: PlanHint) {
        for binding in other.excluded_bindings {
            if !self.excluded_bindings.contains(&binding) {
                self.excluded_bindings.push(binding);
            }
        }
        for edge in other.excluded_joins {
            if !self.excluded_joins.contains(&edge) {
                self.excluded_joins.push(edge);
            }
        }
        self.reason = other.reason;
    }
}

/// Everything a strategy needs besides the schema
#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    pub question: &'a str,
    pub confidence_floor: f64,
    pub max_n: u32,
    pub hint: Option<&'a PlanHint>,
    pub trace_id: &'a str,
}

/// Pluggable planning strategy
#[async_trait]
pub trait PlanStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn propose(&self, input: &PlanInput<'_>, context: &SchemaContext) -> Result<PlanOutcome>;
}

/// Planner result plus anything the caller must surface
#[derive(Debug, Clone)]
pub struct PlannerReport {
    pub outcome: PlanOutcome,
    pub warnings: Vec<String>,
}

/// Runs the configured strategy, falling back to the keyword planner on failure
pub struct Planner {
    primary: Option<Arc<dyn PlanStrategy>>,
    fallback: KeywordPlanner,
}

impl Planner {
    pub fn new(primary: Option<Arc<dyn PlanStrategy>>) -> Self {
        Self {
            primary,
            fallback: KeywordPlanner::new(),
        }
    }

    pub async fn plan(&self, input: &PlanInput<'_>, snapshot: &SchemaSnapshot) -> Result<PlannerReport> {
        let mut warnings = Vec::new();

        let outcome = match &self.primary {
            Some(strategy) => match strategy.propose(input, &snapshot.context).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("[{}] planner strategy '{}' failed: {}", input.trace_id, strategy.name(), e);
                    warnings.push(format!("planner_fallback: {} failed ({})", strategy.name(), e));
                    self.fallback.propose(input, &snapshot.context).await?
                }
            },
            None => self.fallback.propose(input, &snapshot.context).await?,
        };

        let outcome = match outcome {
            PlanOutcome::Planned(mut plan) => {
                plan.schema_hash = snapshot.hash.clone();
                info!(
                    "[{}] planned {} metric={:?} entity={:?} grain={}",
                    input.trace_id,
                    plan.task_type,
                    plan.metric_id(),
                    plan.entity_dimension.as_ref().map(|b| b.concept.as_str()),
                    plan.time_grain
                );
                PlanOutcome::Planned(plan)
            }
            clarification => clarification,
        };

        Ok(PlannerReport { outcome, warnings })
    }
}

/// Result of grounding one slot against the context
pub(crate) enum Grounding {
    Bound(SlotBinding),
    Missing,
    BelowFloor(String),
}

/// Ranking used whenever several candidates fit: contract first, then
/// confidence, then table/column name for determinism.
pub(crate) fn candidate_order(a: &RoleCandidate, b: &RoleCandidate) -> std::cmp::Ordering {
    let source = |c: &RoleCandidate| matches!(c.source, RoleSource::Contract) as u8;
    source(b)
        .cmp(&source(a))
        .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
        .then_with(|| a.table.cmp(&b.table))
        .then_with(|| a.column.cmp(&b.column))
}

/// Ground a concept name (or `table.column`) produced by a generator
pub(crate) fn ground_concept(
    context: &SchemaContext,
    role: SemanticRole,
    name: &str,
    floor: f64,
    hint: Option<&PlanHint>,
) -> Grounding {
    let wanted = keyword::normalize_phrase(name);
    let dotted = name.split_once('.').map(|(t, c)| ColumnRef::new(t.trim(), c.trim()));

    let mut matches: Vec<&RoleCandidate> = context
        .candidates(role)
        .filter(|c| !is_excluded(c, hint))
        .filter(|c| {
            if let Some(col) = &dotted {
                return c.table == col.table && c.column == col.column;
            }
            c.surface_forms().iter().any(|f| keyword::normalize_phrase(f) == wanted)
                || keyword::normalize_phrase(&c.column) == wanted
        })
        .collect();
    if matches.is_empty() {
        return Grounding::Missing;
    }
    matches.sort_by(|a, b| candidate_order(a, b));
    match matches.iter().find(|c| c.confidence >= floor) {
        Some(c) => Grounding::Bound(SlotBinding::from_candidate(c)),
        None => Grounding::BelowFloor(matches[0].concept.clone()),
    }
}

/// Pick the time column for a plan: the metric's own table first
pub(crate) fn choose_time_binding(
    context: &SchemaContext,
    metric_table: Option<&str>,
    floor: f64,
    hint: Option<&PlanHint>,
) -> Option<SlotBinding> {
    let mut candidates: Vec<&RoleCandidate> = context
        .candidates(SemanticRole::Time)
        .filter(|c| c.confidence >= floor && !is_excluded(c, hint))
        .collect();
    candidates.sort_by(|a, b| {
        let local = |c: &RoleCandidate| Some(c.table.as_str()) == metric_table;
        local(b).cmp(&local(a)).then_with(|| candidate_order(a, b))
    });
    candidates.first().map(|c| SlotBinding::from_candidate(c))
}

pub(crate) fn is_excluded(candidate: &RoleCandidate, hint: Option<&PlanHint>) -> bool {
    hint.map(|h| h.excluded_bindings.contains(&candidate.column_ref()))
        .unwrap_or(false)
}

/// Concept names offered for a role, best first
pub(crate) fn offered_concepts(context: &SchemaContext, role: SemanticRole, floor: f64) -> Vec<String> {
    let mut candidates: Vec<&RoleCandidate> = context.candidates(role).filter(|c| c.confidence >= floor).collect();
    candidates.sort_by(|a, b| candidate_order(a, b));
    let mut names: Vec<String> = Vec::new();
    for c in candidates {
        if !names.contains(&c.concept) {
            names.push(c.concept.clone());
        }
        if names.len() == 5 {
            break;
        }
    }
    names
}
