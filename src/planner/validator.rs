//! Plan Validator
//!
//! Rejects plans that reference unmapped, ambiguous or low-confidence
//! concepts. Invalid plans route to clarification, never to synthesis.

use super::{CompareAgainst, EntityScope, Plan, SlotBinding, TaskType};
use crate::schema::{RoleCandidate, SchemaContext, SemanticRole, TimeGrain};
use serde::{Deserialize, Serialize};

/// A plan that passed validation, with the grain synthesis must use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedPlan {
    pub plan: Plan,
    pub effective_grain: TimeGrain,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanVerdict {
    Valid(ValidatedPlan),
    Invalid(Vec<String>),
}

impl PlanVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, PlanVerdict::Valid(_))
    }
}

#[derive(Debug, Clone)]
pub struct PlanValidator {
    confidence_floor: f64,
    max_n: u32,
}

impl PlanValidator {
    pub fn new(confidence_floor: f64, max_n: u32) -> Self {
        Self { confidence_floor, max_n }
    }

    pub fn validate(&self, plan: &Plan, context: &SchemaContext) -> PlanVerdict {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        // metric
        match &plan.metric {
            None => reasons.push("plan has no metric".to_string()),
            Some(metric) => {
                let binding = &metric.measure;
                if let Some(reason) = self.check_binding(binding, SemanticRole::Measure, context) {
                    reasons.push(reason);
                } else if let Some(column) = context.column(&binding.table, &binding.column) {
                    if !column.data_type.is_numeric() && !matches!(metric.aggregation, crate::schema::Aggregation::Count) {
                        reasons.push(format!(
                            "metric column {} is not numeric ({:?})",
                            binding.column_ref(),
                            column.data_type
                        ));
                    }
                }
            }
        }

        // entity
        match &plan.entity_dimension {
            Some(binding) => {
                if let Some(reason) = self.check_binding(binding, SemanticRole::Entity, context) {
                    reasons.push(reason);
                }
            }
            None if plan.task_type.requires_entity() => {
                reasons.push(format!("{} plan requires an entity dimension", plan.task_type));
            }
            None => {}
        }

        if plan.entity_scope == EntityScope::TopN || plan.task_type == TaskType::TopN {
            match plan.n {
                Some(n) if n >= 1 && n <= self.max_n => {}
                Some(n) => reasons.push(format!("n={} is outside [1, {}]", n, self.max_n)),
                None => reasons.push("top_n plan has no n".to_string()),
            }
        }

        // time
        let mut effective_grain = plan.time_grain;
        match &plan.time_dimension {
            Some(binding) => match self.check_binding(binding, SemanticRole::Time, context) {
                Some(reason) => reasons.push(reason),
                None => {
                    if let Some(candidate) = context.candidate_for(SemanticRole::Time, &binding.column_ref()) {
                        match self.check_grain(plan, candidate) {
                            Ok(Some((grain, warning))) => {
                                effective_grain = grain;
                                warnings.push(warning);
                            }
                            Ok(None) => {}
                            Err(reason) => reasons.push(reason),
                        }
                    }
                }
            },
            None => {
                if plan.task_type.requires_time() {
                    reasons.push(format!("{} plan requires a time dimension", plan.task_type));
                } else if plan.time_grain.is_specified() {
                    reasons.push(format!("time grain '{}' given without a time dimension", plan.time_grain));
                }
            }
        }

        if plan.task_type == TaskType::Compare && plan.compare_against == CompareAgainst::None {
            reasons.push("compare plan needs a baseline (global or previous_period)".to_string());
        }

        if reasons.is_empty() {
            PlanVerdict::Valid(ValidatedPlan {
                plan: plan.clone(),
                effective_grain,
                warnings,
            })
        } else {
            PlanVerdict::Invalid(reasons)
        }
    }

    fn check_binding(&self, binding: &SlotBinding, role: SemanticRole, context: &SchemaContext) -> Option<String> {
        let column = binding.column_ref();
        if !context.has_column(&column) {
            return Some(format!("{} binding '{}' references unknown column {}", role, binding.concept, column));
        }
        let candidate = match context.candidate_for(role, &column) {
            Some(c) => c,
            None => {
                return Some(format!(
                    "{} is not a mapped {} candidate for '{}'",
                    column, role, binding.concept
                ))
            }
        };
        if candidate.confidence < self.confidence_floor || binding.confidence < self.confidence_floor {
            return Some(format!(
                "{} binding '{}' has confidence {:.2} below floor {:.2}",
                role,
                binding.concept,
                candidate.confidence.min(binding.confidence),
                self.confidence_floor
            ));
        }
        None
    }

    /// `Ok(Some)` when an unspecified grain was filled from the column default
    fn check_grain(&self, plan: &Plan, time: &RoleCandidate) -> Result<Option<(TimeGrain, String)>, String> {
        if plan.time_grain.is_specified() {
            if !time.supports_grain(plan.time_grain) {
                return Err(format!(
                    "time grain '{}' is not supported by {}",
                    plan.time_grain,
                    time.column_ref()
                ));
            }
            return Ok(None);
        }
        if !plan.task_type.requires_time() {
            return Ok(None);
        }
        match time.default_grain {
            Some(grain) if time.supports_grain(grain) => Ok(Some((
                grain,
                format!(
                    "time grain not stated; using default '{}' declared for {}",
                    grain,
                    time.column_ref()
                ),
            ))),
            _ => Err(format!(
                "time grain not stated and {} declares no default grain",
                time.column_ref()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{KeywordPlanner, PlanInput, PlanOutcome};
    use crate::schema::fixtures::retail_context;

    fn plan(question: &str) -> Plan {
        let input = PlanInput {
            question,
            confidence_floor: 0.5,
            max_n: 100,
            hint: None,
            trace_id: "test",
        };
        match KeywordPlanner::new().plan_question(&input, &retail_context()) {
            PlanOutcome::Planned(p) => p,
            other => panic!("expected plan, got {:?}", other),
        }
    }

    #[test]
    fn test_topn_plan_is_valid() {
        let verdict = PlanValidator::new(0.5, 100).validate(&plan("top 5 countries by revenue"), &retail_context());
        match verdict {
            PlanVerdict::Valid(v) => {
                assert!(v.warnings.is_empty());
                assert_eq!(v.effective_grain, TimeGrain::Unspecified);
            }
            PlanVerdict::Invalid(r) => panic!("unexpected: {:?}", r),
        }
    }

    #[test]
    fn test_n_out_of_range() {
        let mut p = plan("top 5 countries by revenue");
        p.n = Some(500);
        let verdict = PlanValidator::new(0.5, 100).validate(&p, &retail_context());
        assert!(matches!(verdict, PlanVerdict::Invalid(ref r) if r[0].contains("outside")));

        p.n = None;
        assert!(!PlanValidator::new(0.5, 100).validate(&p, &retail_context()).is_valid());
    }

    #[test]
    fn test_unspecified_grain_uses_declared_default() {
        let verdict = PlanValidator::new(0.5, 100).validate(&plan("revenue over time"), &retail_context());
        match verdict {
            PlanVerdict::Valid(v) => {
                assert_eq!(v.effective_grain, TimeGrain::Month);
                assert_eq!(v.warnings.len(), 1);
            }
            PlanVerdict::Invalid(r) => panic!("unexpected: {:?}", r),
        }
    }

    #[test]
    fn test_unsupported_grain_rejected() {
        let verdict = PlanValidator::new(0.5, 100).validate(&plan("quarterly revenue trend"), &retail_context());
        assert!(matches!(verdict, PlanVerdict::Invalid(ref r) if r.iter().any(|m| m.contains("quarter"))));
    }

    #[test]
    fn test_binding_below_floor_rejected() {
        let verdict = PlanValidator::new(0.99, 100).validate(&plan("top 5 countries by revenue"), &retail_context());
        assert!(matches!(verdict, PlanVerdict::Invalid(ref r) if r.iter().any(|m| m.contains("below floor"))));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let mut p = plan("top 5 countries by revenue");
        if let Some(entity) = p.entity_dimension.as_mut() {
            entity.column = "nation".to_string();
        }
        let verdict = PlanValidator::new(0.5, 100).validate(&p, &retail_context());
        assert!(matches!(verdict, PlanVerdict::Invalid(ref r) if r[0].contains("unknown column")));
    }

    #[test]
    fn test_compare_without_baseline_rejected() {
        let mut p = plan("compare monthly revenue with the previous period");
        p.compare_against = CompareAgainst::None;
        assert!(!PlanValidator::new(0.5, 100).validate(&p, &retail_context()).is_valid());
    }
}
