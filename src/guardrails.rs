//! Analytical Guardrails
//!
//! Post-execution correctness checks. Every check runs on every executed
//! candidate; a `block` finding is never downgraded by a later stage.

use crate::execution::ExecutionResult;
use crate::planner::validator::ValidatedPlan;
use crate::schema::{ForeignKey, SchemaContext};
use crate::synth::{identifiers, CandidateSql, Dialect};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

pub const FAN_OUT: &str = "fan_out";
pub const DUPLICATE_AGGREGATION: &str = "duplicate_aggregation";
pub const GRAIN_MISMATCH: &str = "grain_mismatch";
pub const NULL_KEY_COVERAGE: &str = "null_key_coverage";

/// Names of all checks, in evaluation order
pub const ALL_CHECKS: [&str; 4] = [FAN_OUT, DUPLICATE_AGGREGATION, GRAIN_MISMATCH, NULL_KEY_COVERAGE];

const PERIOD_ALIAS: &str = "period";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Block,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Block => write!(f, "block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailFinding {
    pub check_name: String,
    pub severity: Severity,
    pub detail: String,
    /// Join edges the finding implicates; fed back as a replanning hint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implicated_joins: Vec<ForeignKey>,
}

impl GuardrailFinding {
    fn new(check_name: &str, severity: Severity, detail: String) -> Self {
        Self {
            check_name: check_name.to_string(),
            severity,
            detail,
            implicated_joins: Vec::new(),
        }
    }

    pub fn is_block(&self) -> bool {
        self.severity == Severity::Block
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardrailThresholds {
    /// Rows per distinct grain key above which fan-out blocks
    pub fan_out: f64,
    pub null_warn_ratio: f64,
}

pub struct GuardrailEngine {
    dialect: Dialect,
    thresholds: GuardrailThresholds,
}

impl GuardrailEngine {
    pub fn new(dialect: Dialect, thresholds: GuardrailThresholds) -> Self {
        Self { dialect, thresholds }
    }

    pub fn evaluate(
        &self,
        validated: &ValidatedPlan,
        candidate: &CandidateSql,
        result: &ExecutionResult,
        context: &SchemaContext,
    ) -> Vec<GuardrailFinding> {
        let mut findings = Vec::new();
        findings.extend(self.check_fan_out(validated, candidate, result, context));
        findings.extend(self.check_duplicate_aggregation(validated, candidate));
        findings.extend(self.check_grain(validated, candidate));
        findings.extend(self.check_null_keys(validated, result));

        for finding in findings.iter().filter(|f| f.is_block()) {
            warn!("guardrail {} blocked: {}", finding.check_name, finding.detail);
        }
        findings
    }

    /// Output columns that make up the grain of the result
    fn grain_keys(&self, validated: &ValidatedPlan, result: &ExecutionResult) -> Vec<usize> {
        let plan = &validated.plan;
        let mut keys = Vec::new();
        if let Some(entity) = &plan.entity_dimension {
            let index = result
                .column_index(&entity.alias())
                .or_else(|| result.column_index(&entity.column));
            keys.extend(index);
        }
        if plan.time_dimension.is_some() && validated.effective_grain.is_specified() {
            keys.extend(result.column_index(PERIOD_ALIAS));
        }
        keys
    }

    fn check_fan_out(
        &self,
        validated: &ValidatedPlan,
        candidate: &CandidateSql,
        result: &ExecutionResult,
        context: &SchemaContext,
    ) -> Vec<GuardrailFinding> {
        let mut findings = Vec::new();

        let keys = self.grain_keys(validated, result);
        if !keys.is_empty() && result.row_count > 0 {
            let distinct: HashSet<String> = result
                .rows
                .iter()
                .map(|row| {
                    keys.iter()
                        .map(|&i| row.get(i).map(|v| v.to_string()).unwrap_or_default())
                        .collect::<Vec<_>>()
                        .join("\u{1f}")
                })
                .collect();
            let ratio = result.row_count as f64 / distinct.len().max(1) as f64;
            if ratio > self.thresholds.fan_out {
                findings.push(GuardrailFinding::new(
                    FAN_OUT,
                    Severity::Block,
                    format!(
                        "{} rows for {} distinct grain keys (ratio {:.2} > {:.2})",
                        result.row_count,
                        distinct.len(),
                        ratio,
                        self.thresholds.fan_out
                    ),
                ));
            }
        }

        if let Some(metric) = &validated.plan.metric {
            if metric.aggregation.is_additive() {
                let risky: Vec<_> = candidate.join_path.iter().filter(|s| s.can_fan_out()).collect();
                if !risky.is_empty() {
                    let edges: Vec<String> = risky
                        .iter()
                        .map(|s| format!("{}.{} -> {}.{}", s.from_table, s.from_column, s.to_table, s.to_column))
                        .collect();
                    let mut finding = GuardrailFinding::new(
                        FAN_OUT,
                        Severity::Block,
                        format!(
                            "{} of {} aggregated across one-to-many join {}",
                            metric.aggregation.as_str(),
                            metric.measure.column_ref(),
                            edges.join(", ")
                        ),
                    );
                    finding.implicated_joins = risky
                        .iter()
                        .map(|s| s.foreign_key())
                        .filter(|fk| context.foreign_keys.contains(fk))
                        .collect();
                    findings.push(finding);
                }
            }
        }

        findings
    }

    fn check_duplicate_aggregation(&self, validated: &ValidatedPlan, candidate: &CandidateSql) -> Vec<GuardrailFinding> {
        let mut findings = Vec::new();
        let ids = identifiers::extract(&candidate.statement_text);

        let repeated: Vec<String> = ids
            .table_counts()
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(table, count)| format!("{} ({}x)", table, count))
            .collect();
        if !repeated.is_empty() {
            findings.push(GuardrailFinding::new(
                DUPLICATE_AGGREGATION,
                Severity::Block,
                format!("table referenced more than once in FROM/JOIN: {}", repeated.join(", ")),
            ));
        }

        if let Some(metric) = &validated.plan.metric {
            let fact = &metric.measure.table;
            let back_edges: Vec<_> = candidate.join_path.iter().filter(|s| &s.to_table == fact).collect();
            if !back_edges.is_empty() {
                let mut finding = GuardrailFinding::new(
                    DUPLICATE_AGGREGATION,
                    Severity::Block,
                    format!("fact table {} is reached again through the join path", fact),
                );
                finding.implicated_joins = back_edges.iter().map(|s| s.foreign_key()).collect();
                findings.push(finding);
            }
        }

        findings
    }

    fn check_grain(&self, validated: &ValidatedPlan, candidate: &CandidateSql) -> Vec<GuardrailFinding> {
        let plan = &validated.plan;
        let wants_time = plan.time_dimension.is_some() && validated.effective_grain.is_specified();
        if plan.entity_dimension.is_none() && !wants_time {
            return Vec::new();
        }

        // bucket signatures carry their format literals, so the clause text keeps them
        let group_by = group_by_clauses(&candidate.statement_text.to_lowercase());
        let literal_free = identifiers::normalize(&group_by);
        if literal_free.trim().is_empty() {
            return vec![GuardrailFinding::new(
                GRAIN_MISMATCH,
                Severity::Warn,
                "query has no GROUP BY for the declared grain".to_string(),
            )];
        }
        // positional GROUP BY cannot be checked textually
        if literal_free
            .split(',')
            .all(|item| item.trim().chars().all(|c| c.is_ascii_digit()))
        {
            return Vec::new();
        }

        let mut missing = Vec::new();
        if let Some(entity) = &plan.entity_dimension {
            let column = entity.column.to_lowercase();
            let alias = entity.alias();
            if !contains_word(&literal_free, &column) && !contains_word(&literal_free, &alias) {
                missing.push(format!("entity {}", entity.column_ref()));
            }
        }
        if wants_time {
            let signature = self.dialect.bucket_signature(validated.effective_grain);
            if !group_by.contains(&signature) && !contains_word(&literal_free, PERIOD_ALIAS) {
                missing.push(format!("{} bucket", validated.effective_grain));
            }
        }

        if missing.is_empty() {
            Vec::new()
        } else {
            vec![GuardrailFinding::new(
                GRAIN_MISMATCH,
                Severity::Warn,
                format!("GROUP BY does not cover {}", missing.join(" and ")),
            )]
        }
    }

    fn check_null_keys(&self, validated: &ValidatedPlan, result: &ExecutionResult) -> Vec<GuardrailFinding> {
        if result.row_count == 0 {
            return Vec::new();
        }
        let mut findings = Vec::new();
        for index in self.grain_keys(validated, result) {
            let nulls = result
                .rows
                .iter()
                .filter(|row| row.get(index).map_or(true, |v| v.is_null()))
                .count();
            if nulls == 0 {
                continue;
            }
            let ratio = nulls as f64 / result.row_count as f64;
            let severity = if ratio > self.thresholds.null_warn_ratio {
                Severity::Warn
            } else {
                Severity::Info
            };
            findings.push(GuardrailFinding::new(
                NULL_KEY_COVERAGE,
                severity,
                format!(
                    "{} of {} rows have a null {} ({:.1}%)",
                    nulls,
                    result.row_count,
                    result.columns[index],
                    ratio * 100.0
                ),
            ));
        }
        findings
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token == word)
}

/// Byte offsets that fall inside single-quoted literals, quotes included
fn literal_mask(sql: &str) -> Vec<bool> {
    let mut mask = vec![false; sql.len()];
    let mut inside = false;
    for (i, ch) in sql.char_indices() {
        if ch == '\'' {
            inside = !inside;
            mask[i] = true;
        } else if inside {
            mask[i..i + ch.len_utf8()].iter_mut().for_each(|m| *m = true);
        }
    }
    mask
}

/// Text of every GROUP BY clause in a lowercased statement, literals kept.
/// Each clause ends at a closing paren of its own scope or at the next
/// clause keyword at the same depth; nothing inside a literal counts.
pub(crate) fn group_by_clauses(sql: &str) -> String {
    const ENDINGS: [&str; 6] = ["order by", "limit", "having", "window", "union", ";"];

    let mask = literal_mask(sql);
    let mut clauses = Vec::new();
    let mut consumed = 0;
    for (pos, keyword) in sql.match_indices("group by") {
        if pos < consumed || mask[pos] {
            continue;
        }
        let start = pos + keyword.len();
        let rest = &sql[start..];
        let mut depth = 0i32;
        let mut end = rest.len();
        for (i, ch) in rest.char_indices() {
            if mask[start + i] {
                continue;
            }
            match ch {
                '(' => depth += 1,
                ')' => {
                    if depth == 0 {
                        end = i;
                        break;
                    }
                    depth -= 1;
                }
                _ if depth == 0 => {
                    let tail = &rest[i..];
                    let at_boundary = i == 0 || !rest[..i].ends_with(|c: char| c.is_ascii_alphanumeric() || c == '_');
                    if at_boundary && ENDINGS.iter().any(|kw| tail.starts_with(kw)) {
                        end = i;
                        break;
                    }
                }
                _ => {}
            }
        }
        clauses.push(rest[..end].trim().to_string());
        consumed = start + end;
    }
    clauses.join(", ")
}
