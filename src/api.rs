//! Request and response types exchanged with callers

use crate::confidence::ConfidenceTier;
use crate::error::{AgentError, Result};
use crate::guardrails::{GuardrailFinding, ALL_CHECKS};
use crate::planner::ClarificationNeeded;
use crate::repair::RepairAttempt;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_QUESTION_CHARS: usize = 3;
pub const MAX_QUESTION_CHARS: usize = 1000;
pub const MAX_REQUEST_ROW_LIMIT: u32 = 2000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub question: String,
    pub dataset_id: String,
    #[serde(default)]
    pub row_limit: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl AnalysisRequest {
    pub fn new(question: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            dataset_id: dataset_id.into(),
            row_limit: None,
            timeout_ms: None,
        }
    }

    pub fn with_row_limit(mut self, row_limit: u32) -> Self {
        self.row_limit = Some(row_limit);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let chars = self.question.trim().chars().count();
        if !(MIN_QUESTION_CHARS..=MAX_QUESTION_CHARS).contains(&chars) {
            return Err(AgentError::InvalidRequest(format!(
                "question must be {}..={} characters, got {}",
                MIN_QUESTION_CHARS, MAX_QUESTION_CHARS, chars
            )));
        }
        if self.dataset_id.trim().is_empty() {
            return Err(AgentError::InvalidRequest("dataset_id is required".to_string()));
        }
        if let Some(limit) = self.row_limit {
            if !(1..=MAX_REQUEST_ROW_LIMIT).contains(&limit) {
                return Err(AgentError::InvalidRequest(format!(
                    "row_limit must be 1..={}, got {}",
                    MAX_REQUEST_ROW_LIMIT, limit
                )));
            }
        }
        if let Some(timeout) = self.timeout_ms {
            if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&timeout) {
                return Err(AgentError::InvalidRequest(format!(
                    "timeout_ms must be {}..={}, got {}",
                    MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS, timeout
                )));
            }
        }
        Ok(())
    }
}

/// Terminal state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Answered,
    Clarification,
    Unresolved,
    Cancelled,
    StaleSchema,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Answered => "answered",
            AnalysisStatus::Clarification => "clarification",
            AnalysisStatus::Unresolved => "unresolved",
            AnalysisStatus::Cancelled => "cancelled",
            AnalysisStatus::StaleSchema => "stale_schema",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairSummary {
    pub attempt_no: u32,
    pub repair_type: String,
    pub repair_reason: String,
    pub category: String,
}

impl From<&RepairAttempt> for RepairSummary {
    fn from(attempt: &RepairAttempt) -> Self {
        Self {
            attempt_no: attempt.attempt_no,
            repair_type: attempt.repair_type.to_string(),
            repair_reason: attempt.reason.clone(),
            category: attempt.category.to_string(),
        }
    }
}

/// Outcome of one guardrail check on the final attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectnessCheck {
    pub check_name: String,
    /// `pass`, `info`, `warn` or `block`
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// One entry per guardrail check; the worst finding decides the status
pub fn correctness_checks(findings: &[GuardrailFinding]) -> Vec<CorrectnessCheck> {
    ALL_CHECKS
        .iter()
        .map(|name| {
            let matching: Vec<&GuardrailFinding> = findings.iter().filter(|f| f.check_name == *name).collect();
            let status = matching
                .iter()
                .map(|f| f.severity)
                .max()
                .map_or_else(|| "pass".to_string(), |s| s.to_string());
            CorrectnessCheck {
                check_name: name.to_string(),
                status,
                details: matching.iter().map(|f| f.detail.clone()).collect(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub trace_id: String,
    pub status: AnalysisStatus,
    pub confidence_tier: ConfidenceTier,
    pub semantic_warnings: Vec<String>,
    pub correctness_checks: Vec<CorrectnessCheck>,
    pub blocked_by_guardrail: bool,
    pub repairs: Vec<RepairSummary>,
    pub sql: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub refusal_reason: Option<String>,
    pub missing_grounding: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationNeeded>,
}
