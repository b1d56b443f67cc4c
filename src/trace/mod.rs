//! Query traces
//!
//! One trace per request, assembled while the request runs and frozen at
//! finalization. Stores only ever append.

pub mod store;

pub use store::{InMemoryTraceStore, SqliteTraceStore};

use crate::api::{AnalysisRequest, AnalysisStatus};
use crate::confidence::ConfidenceTier;
use crate::error::Result;
use crate::execution::ExecutionResult;
use crate::guardrails::GuardrailFinding;
use crate::planner::Plan;
use crate::repair::RepairAttempt;
use crate::synth::CandidateSql;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTrace {
    pub trace_id: String,
    pub dataset_id: String,
    pub request: AnalysisRequest,
    pub schema_hash: Option<String>,
    pub plan_history: Vec<Plan>,
    pub sql_history: Vec<CandidateSql>,
    /// Result of the last execution, if any ran
    pub execution: Option<ExecutionResult>,
    pub findings: Vec<GuardrailFinding>,
    pub repairs: Vec<RepairAttempt>,
    pub semantic_warnings: Vec<String>,
    pub confidence_tier: ConfidenceTier,
    pub status: AnalysisStatus,
    pub final_sql: Option<String>,
    pub refusal_reason: Option<String>,
    pub cache_hit: bool,
    pub stage_timings: Vec<StageTiming>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl QueryTrace {
    pub fn latency_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0)
    }

    pub fn executed_ok(&self) -> bool {
        self.execution.as_ref().map_or(false, |e| e.is_ok())
    }
}

/// Append-only trace persistence
pub trait TraceStore: Send + Sync {
    /// Store a finalized trace. A `trace_id` that already exists is an error.
    fn append(&self, trace: &QueryTrace) -> Result<()>;

    fn get(&self, trace_id: &str) -> Result<Option<QueryTrace>>;

    /// All traces, oldest first
    fn list(&self) -> Result<Vec<QueryTrace>>;
}

/// Mutable trace under construction for one request
pub struct TraceRecorder {
    trace_id: String,
    request: AnalysisRequest,
    started_at: DateTime<Utc>,
    stage_started: Instant,
    schema_hash: Option<String>,
    plan_history: Vec<Plan>,
    sql_history: Vec<CandidateSql>,
    execution: Option<ExecutionResult>,
    findings: Vec<GuardrailFinding>,
    cache_hit: bool,
    stage_timings: Vec<StageTiming>,
}

/// Everything decided at the end of a request
pub struct TraceOutcome {
    pub status: AnalysisStatus,
    pub confidence_tier: ConfidenceTier,
    pub repairs: Vec<RepairAttempt>,
    pub semantic_warnings: Vec<String>,
    pub final_sql: Option<String>,
    pub refusal_reason: Option<String>,
}

impl TraceRecorder {
    pub fn new(trace_id: impl Into<String>, request: AnalysisRequest) -> Self {
        Self {
            trace_id: trace_id.into(),
            request,
            started_at: Utc::now(),
            stage_started: Instant::now(),
            schema_hash: None,
            plan_history: Vec::new(),
            sql_history: Vec::new(),
            execution: None,
            findings: Vec::new(),
            cache_hit: false,
            stage_timings: Vec::new(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Close the running stage under `stage` and start timing the next one
    pub fn stage_done(&mut self, stage: &str) {
        self.stage_timings.push(StageTiming {
            stage: stage.to_string(),
            elapsed_ms: self.stage_started.elapsed().as_millis() as u64,
        });
        self.stage_started = Instant::now();
    }

    pub fn set_schema_hash(&mut self, hash: &str) {
        self.schema_hash = Some(hash.to_string());
    }

    pub fn record_plan(&mut self, plan: &Plan) {
        self.plan_history.push(plan.clone());
    }

    pub fn record_sql(&mut self, candidate: &CandidateSql) {
        self.sql_history.push(candidate.clone());
    }

    pub fn record_execution(&mut self, result: &ExecutionResult) {
        self.execution = Some(result.clone());
    }

    pub fn record_findings(&mut self, findings: &[GuardrailFinding]) {
        self.findings.extend_from_slice(findings);
    }

    pub fn mark_cache_hit(&mut self) {
        self.cache_hit = true;
    }

    pub fn findings(&self) -> &[GuardrailFinding] {
        &self.findings
    }

    pub fn finish(self, outcome: TraceOutcome) -> QueryTrace {
        QueryTrace {
            trace_id: self.trace_id,
            dataset_id: self.request.dataset_id.clone(),
            request: self.request,
            schema_hash: self.schema_hash,
            plan_history: self.plan_history,
            sql_history: self.sql_history,
            execution: self.execution,
            findings: self.findings,
            repairs: outcome.repairs,
            semantic_warnings: outcome.semantic_warnings,
            confidence_tier: outcome.confidence_tier,
            status: outcome.status,
            final_sql: outcome.final_sql,
            refusal_reason: outcome.refusal_reason,
            cache_hit: self.cache_hit,
            stage_timings: self.stage_timings,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_trace(trace_id: &str, status: AnalysisStatus) -> QueryTrace {
    let mut recorder = TraceRecorder::new(trace_id, AnalysisRequest::new("top 5 countries by revenue", "retail"));
    recorder.stage_done("planning");
    recorder.finish(TraceOutcome {
        status,
        confidence_tier: ConfidenceTier::Medium,
        repairs: Vec::new(),
        semantic_warnings: Vec::new(),
        final_sql: None,
        refusal_reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_keeps_stage_order() {
        let mut recorder = TraceRecorder::new("t-1", AnalysisRequest::new("total revenue", "retail"));
        recorder.stage_done("planning");
        recorder.stage_done("validating");
        recorder.mark_cache_hit();
        let trace = recorder.finish(TraceOutcome {
            status: AnalysisStatus::Answered,
            confidence_tier: ConfidenceTier::High,
            repairs: Vec::new(),
            semantic_warnings: Vec::new(),
            final_sql: Some("SELECT 1".to_string()),
            refusal_reason: None,
        });
        let stages: Vec<&str> = trace.stage_timings.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, vec!["planning", "validating"]);
        assert!(trace.cache_hit);
        assert_eq!(trace.dataset_id, "retail");
        assert!(trace.finished_at >= trace.started_at);
    }
}
