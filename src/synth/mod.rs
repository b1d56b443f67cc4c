//! SQL Synthesizer
//!
//! Compiles a validated plan into candidate SQL over a join path resolved
//! from the foreign-key graph. Generation is a pluggable strategy; the
//! canonical templates are the deterministic fallback.
//!
//! An execution repair never re-plans: it keeps the plan and the join path
//! of the failed candidate and may only swap a misspelled identifier or
//! drop to a template.

pub mod compiler;
pub mod dialect;
pub mod identifiers;
pub mod llm_sql;
pub mod templates;

pub use compiler::PlanCompiler;
pub use dialect::{Dialect, QuerySpec, SqlRenderer};
pub use llm_sql::LlmSqlStrategy;
pub use templates::TemplateLibrary;

use crate::error::{AgentError, Result};
use crate::planner::{MetricBinding, ValidatedPlan};
use crate::repair::{FailureCategory, RepairType};
use crate::schema::join_graph::PathPreferences;
use crate::schema::{ColumnRef, ForeignKey, JoinStep, SchemaContext};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Minimum Jaro-Winkler similarity for an identifier swap
const SWAP_SIMILARITY: f64 = 0.75;

lazy_static! {
    static ref MISSING_COLUMN: Vec<Regex> = vec![
        Regex::new(r"no such column:\s*([a-z_][a-z0-9_\.]*)").unwrap(),
        Regex::new(r#"column\s+"?([a-z_][a-z0-9_\."]*?)"?\s+does not exist"#).unwrap(),
        Regex::new(r"unknown column\s+'([a-z_][a-z0-9_\.]*)'").unwrap(),
        Regex::new(r"column\s+'([a-z_][a-z0-9_\.]*)' is not allow-listed").unwrap(),
    ];
    static ref MISSING_TABLE: Vec<Regex> = vec![
        Regex::new(r"no such table:\s*([a-z_][a-z0-9_\.]*)").unwrap(),
        Regex::new(r#"relation\s+"?([a-z_][a-z0-9_\.]*)"?\s+does not exist"#).unwrap(),
        Regex::new(r"table\s+'([a-z_][a-z0-9_\.]*)'\s+doesn't exist").unwrap(),
        Regex::new(r"table\s+'([a-z_][a-z0-9_\.]*)' is not allow-listed").unwrap(),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Synthesized,
    DeterministicFallback,
}

/// A proposed statement plus everything the safety check needs to know about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSql {
    pub statement_text: String,
    pub referenced_tables: Vec<String>,
    pub referenced_columns: Vec<ColumnRef>,
    pub generation_mode: GenerationMode,
    pub join_path: Vec<JoinStep>,
    pub row_limit: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl CandidateSql {
    /// Wrap statement text, extracting the identifiers it references
    pub fn from_statement(statement: String, mode: GenerationMode, join_path: Vec<JoinStep>) -> Self {
        let ids = identifiers::extract(&statement);
        Self {
            referenced_tables: ids.table_names(),
            referenced_columns: ids.column_refs(),
            statement_text: statement,
            generation_mode: mode,
            join_path,
            row_limit: None,
            timeout_ms: None,
        }
    }
}

/// What went wrong with the previous candidate, when re-synthesizing
#[derive(Debug, Clone)]
pub struct PriorFailure {
    pub repair_type: RepairType,
    pub category: FailureCategory,
    pub detail: String,
    pub previous: CandidateSql,
}

/// Everything a strategy gets to build one statement
pub struct SynthesisInput<'a> {
    pub plan: &'a ValidatedPlan,
    pub context: &'a SchemaContext,
    pub prior: Option<&'a PriorFailure>,
    pub join_path: Vec<JoinStep>,
}

/// Pluggable statement generation
#[async_trait]
pub trait SqlStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn propose(&self, input: &SynthesisInput<'_>) -> Result<CandidateSql>;
}

/// Output column alias for a metric: the concept for sums, the metric id otherwise
pub(crate) fn metric_alias(metric: &MetricBinding) -> String {
    match metric.aggregation {
        crate::schema::Aggregation::Sum => metric.measure.alias(),
        _ => metric.metric_id(),
    }
}

pub struct SqlSynthesizer {
    strategy: Arc<dyn SqlStrategy>,
    templates: TemplateLibrary,
    synthesis_enabled: bool,
}

impl SqlSynthesizer {
    /// `strategy` defaults to the plan compiler
    pub fn new(dialect: Dialect, strategy: Option<Arc<dyn SqlStrategy>>, synthesis_enabled: bool) -> Self {
        Self {
            strategy: strategy.unwrap_or_else(|| Arc::new(PlanCompiler::new(dialect))),
            templates: TemplateLibrary::new(dialect),
            synthesis_enabled,
        }
    }

    /// Join path from the measure table to every other table the plan needs
    pub fn resolve_join_path(
        validated: &ValidatedPlan,
        context: &SchemaContext,
        excluded_joins: &[ForeignKey],
    ) -> Result<Vec<JoinStep>> {
        let plan = &validated.plan;
        let metric = plan
            .metric
            .as_ref()
            .ok_or_else(|| AgentError::Synthesis("plan has no metric".to_string()))?;
        let base = metric.measure.table.as_str();

        let mut targets: Vec<&str> = Vec::new();
        if let Some(entity) = &plan.entity_dimension {
            targets.push(entity.table.as_str());
        }
        let mut preferred = Vec::new();
        if let Some(time) = &plan.time_dimension {
            preferred.push(time.table.clone());
            if !targets.contains(&time.table.as_str()) {
                targets.push(time.table.as_str());
            }
        }
        let prefs = PathPreferences {
            preferred_tables: preferred,
            excluded_edges: excluded_joins.to_vec(),
        };
        context.join_graph().resolve_join_set(base, &targets, &prefs)
    }

    pub async fn synthesize(
        &self,
        plan: &ValidatedPlan,
        context: &SchemaContext,
        prior: Option<&PriorFailure>,
        excluded_joins: &[ForeignKey],
        row_limit: u32,
        timeout_ms: u64,
    ) -> Result<CandidateSql> {
        let execution_repair = prior.filter(|p| p.repair_type == RepairType::ExecutionRepair);
        let join_path = match execution_repair {
            Some(p) => p.previous.join_path.clone(),
            None => Self::resolve_join_path(plan, context, excluded_joins)?,
        };
        let input = SynthesisInput {
            plan,
            context,
            prior,
            join_path,
        };

        let mut candidate = match execution_repair {
            Some(p) => self.repair(&input, p)?,
            None => self.generate(&input).await?,
        };
        candidate.row_limit = Some(row_limit);
        candidate.timeout_ms = Some(timeout_ms);
        debug!("synthesized ({:?}):\n{}", candidate.generation_mode, candidate.statement_text);
        Ok(candidate)
    }

    async fn generate(&self, input: &SynthesisInput<'_>) -> Result<CandidateSql> {
        if self.synthesis_enabled {
            match self.strategy.propose(input).await {
                Ok(candidate) => return Ok(candidate),
                Err(e) => warn!("synthesis strategy '{}' failed: {}", self.strategy.name(), e),
            }
        }
        self.fallback(input)
    }

    fn fallback(&self, input: &SynthesisInput<'_>) -> Result<CandidateSql> {
        let statement = self.templates.render(input.plan, &input.join_path).ok_or_else(|| {
            AgentError::Synthesis(format!(
                "no deterministic template for {} plans",
                input.plan.plan.task_type
            ))
        })?;
        Ok(CandidateSql::from_statement(
            statement,
            GenerationMode::DeterministicFallback,
            input.join_path.clone(),
        ))
    }

    fn repair(&self, input: &SynthesisInput<'_>, prior: &PriorFailure) -> Result<CandidateSql> {
        if matches!(prior.category, FailureCategory::MissingColumn | FailureCategory::MissingTable) {
            if let Some(fixed) = swap_identifier(&prior.previous, &prior.detail, input.context) {
                info!("execution repair: swapped identifier ({})", prior.category);
                return Ok(fixed);
            }
        }
        if prior.previous.generation_mode == GenerationMode::Synthesized {
            info!("execution repair: switching to deterministic template ({})", prior.category);
            return self.fallback(input);
        }
        Err(AgentError::Synthesis(format!(
            "no execution repair left for {} after deterministic fallback",
            prior.category
        )))
    }
}

/// Replace the identifier an engine reported as missing with the closest allowed one
pub fn swap_identifier(previous: &CandidateSql, error_text: &str, context: &SchemaContext) -> Option<CandidateSql> {
    let lowered = error_text.to_lowercase();
    let ids = identifiers::extract(&previous.statement_text);

    let capture = |patterns: &[Regex]| -> Option<String> {
        patterns
            .iter()
            .find_map(|re| re.captures(&lowered).map(|c| c[1].trim_matches('"').to_string()))
    };

    let (pattern, replacement) = if let Some(missing) = capture(&MISSING_COLUMN) {
        let (qualifier, column) = match missing.rsplit_once('.') {
            Some((q, c)) => (Some(q.to_string()), c.to_string()),
            None => (None, missing.clone()),
        };
        let tables: Vec<String> = match qualifier.as_deref().and_then(|q| ids.resolve_qualifier(q)) {
            Some(table) => vec![table.to_string()],
            None => ids.table_names(),
        };
        let best = tables
            .iter()
            .filter_map(|t| context.table(t))
            .flat_map(|t| t.columns.iter().map(|c| c.name.clone()))
            .filter(|name| *name != column)
            .map(|name| (strsim::jaro_winkler(&column, &name), name))
            .filter(|(score, _)| *score >= SWAP_SIMILARITY)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))?;
        let pattern = match &qualifier {
            Some(q) => format!(r"(?i)\b{}\.{}\b", regex::escape(q), regex::escape(&column)),
            None => format!(r"(?i)\b{}\b", regex::escape(&column)),
        };
        let replacement = match &qualifier {
            Some(q) => format!("{}.{}", q, best.1),
            None => best.1,
        };
        (pattern, replacement)
    } else if let Some(missing) = capture(&MISSING_TABLE) {
        let table = missing.rsplit('.').next().unwrap_or(&missing).to_string();
        let best = context
            .tables
            .iter()
            .map(|t| (strsim::jaro_winkler(&table, &t.name), t.name.clone()))
            .filter(|(score, name)| *score >= SWAP_SIMILARITY && *name != table)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))?;
        (format!(r"(?i)\b{}\b", regex::escape(&table)), best.1)
    } else {
        return None;
    };

    let re = Regex::new(&pattern).ok()?;
    if !re.is_match(&previous.statement_text) {
        return None;
    }
    let statement = re.replace_all(&previous.statement_text, replacement.as_str()).into_owned();
    Some(CandidateSql::from_statement(
        statement,
        previous.generation_mode,
        previous.join_path.clone(),
    ))
}
