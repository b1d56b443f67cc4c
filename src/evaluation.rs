//! Trace-derived evaluation
//!
//! Aggregate metrics and failure analytics computed from stored traces.

use crate::api::AnalysisStatus;
use crate::confidence::ConfidenceTier;
use crate::trace::QueryTrace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const TOP_FAILURE_EXAMPLES: usize = 10;

fn safe_ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    (numerator as f64 / denominator as f64 * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub execution_success_rate: f64,
    pub repair_rate: f64,
    pub clarification_rate: f64,
    pub refusal_rate: f64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub total_requests: usize,
    pub rates: Rates,
    pub avg_latency_ms: f64,
    pub tier_distribution: BTreeMap<String, usize>,
}

pub fn build_metrics(traces: &[QueryTrace]) -> EvaluationMetrics {
    let total = traces.len();
    let success = traces
        .iter()
        .filter(|t| t.status == AnalysisStatus::Answered && t.executed_ok())
        .count();
    let repaired = traces.iter().filter(|t| !t.repairs.is_empty()).count();
    let clarifications = traces
        .iter()
        .filter(|t| t.status == AnalysisStatus::Clarification)
        .count();
    let refusals = traces
        .iter()
        .filter(|t| matches!(t.status, AnalysisStatus::Unresolved | AnalysisStatus::StaleSchema))
        .count();
    let cache_hits = traces.iter().filter(|t| t.cache_hit).count();

    let avg_latency_ms = if total == 0 {
        0.0
    } else {
        let sum: i64 = traces.iter().map(|t| t.latency_ms()).sum();
        (sum as f64 / total as f64 * 1000.0).round() / 1000.0
    };

    let mut tier_distribution = BTreeMap::new();
    for tier in [ConfidenceTier::High, ConfidenceTier::Medium, ConfidenceTier::Low] {
        tier_distribution.insert(tier.to_string(), 0);
    }
    for trace in traces {
        *tier_distribution.entry(trace.confidence_tier.to_string()).or_insert(0) += 1;
    }

    EvaluationMetrics {
        total_requests: total,
        rates: Rates {
            execution_success_rate: safe_ratio(success, total),
            repair_rate: safe_ratio(repaired, total),
            clarification_rate: safe_ratio(clarifications, total),
            refusal_rate: safe_ratio(refusals, total),
            cache_hit_rate: safe_ratio(cache_hits, total),
        },
        avg_latency_ms,
        tier_distribution,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub overall_failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetBreakdown {
    pub dataset_id: String,
    pub total_requests: usize,
    pub failed_requests: usize,
    pub failure_rate: f64,
    pub total_repairs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureExample {
    pub trace_id: String,
    pub dataset_id: String,
    pub question: String,
    pub status: AnalysisStatus,
    pub reason: Option<String>,
    pub repairs_used: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalytics {
    pub summary: FailureSummary,
    /// Repair attempts counted by failure category
    pub error_taxonomy: BTreeMap<String, usize>,
    /// Non-answered terminal states counted by status
    pub outcome_breakdown: BTreeMap<String, usize>,
    pub dataset_breakdown: Vec<DatasetBreakdown>,
    pub top_failure_examples: Vec<FailureExample>,
}

fn is_failure(trace: &QueryTrace) -> bool {
    trace.status != AnalysisStatus::Answered
}

pub fn build_failure_analytics(traces: &[QueryTrace]) -> FailureAnalytics {
    let failures: Vec<&QueryTrace> = traces.iter().filter(|t| is_failure(t)).collect();

    let mut error_taxonomy = BTreeMap::new();
    for attempt in traces.iter().flat_map(|t| t.repairs.iter()) {
        *error_taxonomy.entry(attempt.category.to_string()).or_insert(0) += 1;
    }

    let mut outcome_breakdown = BTreeMap::new();
    for trace in &failures {
        *outcome_breakdown.entry(trace.status.to_string()).or_insert(0) += 1;
    }

    // (total, failed, repairs) per dataset
    let mut per_dataset: BTreeMap<&str, (usize, usize, usize)> = BTreeMap::new();
    for trace in traces {
        let entry = per_dataset.entry(trace.dataset_id.as_str()).or_insert((0, 0, 0));
        entry.0 += 1;
        if is_failure(trace) {
            entry.1 += 1;
        }
        entry.2 += trace.repairs.len();
    }

    let dataset_breakdown = per_dataset
        .into_iter()
        .map(|(dataset_id, (total, failed, repairs))| DatasetBreakdown {
            dataset_id: dataset_id.to_string(),
            total_requests: total,
            failed_requests: failed,
            failure_rate: safe_ratio(failed, total),
            total_repairs: repairs,
        })
        .collect();

    let top_failure_examples = failures
        .iter()
        .take(TOP_FAILURE_EXAMPLES)
        .map(|t| FailureExample {
            trace_id: t.trace_id.clone(),
            dataset_id: t.dataset_id.clone(),
            question: t.request.question.clone(),
            status: t.status,
            reason: t
                .refusal_reason
                .clone()
                .or_else(|| t.execution.as_ref().and_then(|e| e.error.clone())),
            repairs_used: t.repairs.len(),
        })
        .collect();

    FailureAnalytics {
        summary: FailureSummary {
            total_requests: traces.len(),
            failed_requests: failures.len(),
            overall_failure_rate: safe_ratio(failures.len(), traces.len()),
        },
        error_taxonomy,
        outcome_breakdown,
        dataset_breakdown,
        top_failure_examples,
    }
}
