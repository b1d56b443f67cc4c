//! Repair Controller
//!
//! Bounded budgets for execution and semantic repairs plus the
//! append-only attempt log. The agent loop asks the budget before every
//! retry; a refused request ends `Unresolved`.

pub mod classifier;

pub use classifier::{Classification, FailureCategory, FailureClassifier, FailureSignal, RepairType};

use crate::config::AgentConfig;
use serde::{Deserialize, Serialize};

/// One repair decision, as surfaced to the caller and the trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub attempt_no: u32,
    pub repair_type: RepairType,
    pub category: FailureCategory,
    pub reason: String,
    /// What changed for the next attempt (plan hint or SQL diff summary)
    pub delta: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairLimits {
    pub max_total: u32,
    pub max_execution: u32,
    pub max_semantic: u32,
}

impl RepairLimits {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_total: config.max_repair_attempts,
            max_execution: config.max_execution_repairs,
            max_semantic: config.max_semantic_repairs,
        }
    }
}

/// Per-request repair accounting
#[derive(Debug, Clone)]
pub struct RepairBudget {
    limits: RepairLimits,
    attempts: Vec<RepairAttempt>,
}

impl RepairBudget {
    pub fn new(limits: RepairLimits) -> Self {
        Self {
            limits,
            attempts: Vec::new(),
        }
    }

    fn used(&self, repair_type: RepairType) -> u32 {
        self.attempts.iter().filter(|a| a.repair_type == repair_type).count() as u32
    }

    /// Whether one more repair of this type fits every cap
    pub fn allows(&self, repair_type: RepairType) -> bool {
        let per_type = match repair_type {
            RepairType::ExecutionRepair => self.limits.max_execution,
            RepairType::SemanticRepair => self.limits.max_semantic,
        };
        (self.attempts.len() as u32) < self.limits.max_total && self.used(repair_type) < per_type
    }

    /// Record a granted repair; returns its attempt number
    pub fn record(&mut self, classification: &Classification, delta: Option<String>) -> u32 {
        let attempt_no = self.attempts.len() as u32 + 1;
        self.attempts.push(RepairAttempt {
            attempt_no,
            repair_type: classification.repair_type,
            category: classification.category,
            reason: classification.reason.clone(),
            delta,
        });
        attempt_no
    }

    /// Why the budget refused a repair of this type
    pub fn exhausted_reason(&self, repair_type: RepairType) -> String {
        if self.attempts.len() as u32 >= self.limits.max_total {
            format!("repair budget exhausted ({} of {} attempts used)", self.attempts.len(), self.limits.max_total)
        } else {
            let cap = match repair_type {
                RepairType::ExecutionRepair => self.limits.max_execution,
                RepairType::SemanticRepair => self.limits.max_semantic,
            };
            format!("{} budget exhausted ({} of {} used)", repair_type, self.used(repair_type), cap)
        }
    }

    pub fn semantic_repairs(&self) -> u32 {
        self.used(RepairType::SemanticRepair)
    }

    pub fn attempts(&self) -> &[RepairAttempt] {
        &self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(repair_type: RepairType) -> Classification {
        Classification {
            repair_type,
            category: match repair_type {
                RepairType::ExecutionRepair => FailureCategory::MissingColumn,
                RepairType::SemanticRepair => FailureCategory::GuardrailBlock,
            },
            reason: "test".to_string(),
        }
    }

    fn limits() -> RepairLimits {
        RepairLimits {
            max_total: 2,
            max_execution: 2,
            max_semantic: 1,
        }
    }

    #[test]
    fn test_semantic_cap() {
        let mut budget = RepairBudget::new(limits());
        assert!(budget.allows(RepairType::SemanticRepair));
        budget.record(&classification(RepairType::SemanticRepair), None);
        assert!(!budget.allows(RepairType::SemanticRepair));
        assert!(budget.allows(RepairType::ExecutionRepair));
        assert!(budget.exhausted_reason(RepairType::SemanticRepair).contains("semantic_repair"));
    }

    #[test]
    fn test_total_cap_wins() {
        let mut budget = RepairBudget::new(limits());
        assert_eq!(budget.record(&classification(RepairType::ExecutionRepair), None), 1);
        assert_eq!(budget.record(&classification(RepairType::ExecutionRepair), None), 2);
        assert!(!budget.allows(RepairType::ExecutionRepair));
        assert!(!budget.allows(RepairType::SemanticRepair));
        assert_eq!(budget.attempts().len(), 2);
    }
}
