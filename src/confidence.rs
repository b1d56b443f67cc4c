//! Confidence Resolver
//!
//! Computes the tier attached to every terminal outcome from how the plan
//! was grounded, what the guardrails found and how many semantic repairs
//! were needed.

use crate::guardrails::{GuardrailFinding, Severity};
use crate::planner::Plan;
use crate::schema::RoleSource;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceTier::Low => write!(f, "low"),
            ConfidenceTier::Medium => write!(f, "medium"),
            ConfidenceTier::High => write!(f, "high"),
        }
    }
}

/// Everything the resolver looks at
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceInputs<'a> {
    /// The plan that produced the answer; `None` for clarifications and refusals
    pub plan: Option<&'a Plan>,
    /// All findings raised anywhere in the request
    pub findings: &'a [GuardrailFinding],
    pub semantic_repairs: u32,
    pub unresolved: bool,
}

#[derive(Debug, Clone)]
pub struct ConfidenceResolver {
    high_confidence: f64,
}

impl ConfidenceResolver {
    pub fn new(high_confidence: f64) -> Self {
        Self { high_confidence }
    }

    pub fn resolve(&self, inputs: &ConfidenceInputs<'_>) -> ConfidenceTier {
        if inputs.unresolved || inputs.findings.iter().any(|f| f.severity == Severity::Block) {
            return ConfidenceTier::Low;
        }
        let plan = match inputs.plan {
            Some(plan) => plan,
            None => return ConfidenceTier::Low,
        };

        let bindings = plan.bindings();
        let fully_governed = !bindings.is_empty()
            && bindings
                .iter()
                .all(|b| b.source == RoleSource::Contract && b.confidence >= self.high_confidence);
        let clean = inputs.findings.is_empty();

        if fully_governed && clean && inputs.semantic_repairs == 0 {
            ConfidenceTier::High
        } else {
            ConfidenceTier::Medium
        }
    }
}
