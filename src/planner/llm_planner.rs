//! Model-backed planning strategy.
//!
//! The model only drafts slot names; every concept is grounded against the
//! schema context afterwards. Anything that does not ground becomes a
//! clarification, never a new binding.

use super::{
    choose_time_binding, ground_concept, offered_concepts, ClarificationNeeded, CompareAgainst, EntityScope,
    Grounding, MetricBinding, Plan, PlanInput, PlanOutcome, PlanStrategy, SlotBinding, TaskType,
};
use crate::error::{AgentError, Result};
use crate::llm::LlmClient;
use crate::schema::{Aggregation, SchemaContext, SemanticRole, TimeGrain};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Raw slot values as the model returned them
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanDraft {
    pub task_type: Option<String>,
    #[serde(default)]
    pub entity_scope: Option<String>,
    #[serde(default)]
    pub entity_dimension: Option<String>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub aggregation: Option<String>,
    #[serde(default)]
    pub time_dimension: Option<String>,
    #[serde(default)]
    pub time_grain: Option<String>,
    #[serde(default)]
    pub compare_against: Option<String>,
}

pub struct LlmPlanner {
    client: LlmClient,
}

impl LlmPlanner {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    fn build_prompt(input: &PlanInput<'_>, context: &SchemaContext) -> String {
        let describe = |role: SemanticRole| -> String {
            context
                .candidates(role)
                .filter(|c| c.confidence >= input.confidence_floor)
                .map(|c| format!("- {} ({}.{}; aliases: {})", c.concept, c.table, c.column, c.aliases.join(", ")))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let excluded = input
            .hint
            .map(|h| {
                h.excluded_bindings
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        format!(
            r#"You plan analytical SQL questions. Use ONLY the concepts listed below.
If the question names something not listed, put the user's word in the slot anyway.

Entities:
{}

Measures:
{}

Time columns:
{}

Do not use: [{}]

Question: "{}"

Return ONLY a JSON object:
{{
  "task_type": "topn|aggregate|trend|segment|compare",
  "entity_scope": "top_n|all",
  "entity_dimension": "concept or null",
  "n": 5,
  "metric": "concept",
  "aggregation": "sum|avg|count|min|max",
  "time_dimension": "concept or null",
  "time_grain": "day|week|month|quarter|year|unspecified",
  "compare_against": "none|global|previous_period"
}}"#,
            describe(SemanticRole::Entity),
            describe(SemanticRole::Measure),
            describe(SemanticRole::Time),
            excluded,
            input.question
        )
    }
}

#[async_trait]
impl PlanStrategy for LlmPlanner {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn propose(&self, input: &PlanInput<'_>, context: &SchemaContext) -> Result<PlanOutcome> {
        let prompt = Self::build_prompt(input, context);
        let value = self.client.generate_json(&prompt).await?;
        debug!("[{}] plan draft from {}: {}", input.trace_id, self.client.model(), value);
        let draft: PlanDraft = serde_json::from_value(value)
            .map_err(|e| AgentError::Llm(format!("Plan draft has unexpected shape: {}", e)))?;
        ground_draft(&draft, input, context)
    }
}

/// Bind every drafted concept to a schema candidate
pub fn ground_draft(draft: &PlanDraft, input: &PlanInput<'_>, context: &SchemaContext) -> Result<PlanOutcome> {
    let floor = input.confidence_floor;
    let task_type = draft
        .task_type
        .as_deref()
        .and_then(TaskType::parse)
        .ok_or_else(|| AgentError::Llm(format!("Unknown task type in plan draft: {:?}", draft.task_type)))?;

    let time_grain = match draft.time_grain.as_deref() {
        None => TimeGrain::Unspecified,
        Some(raw) => TimeGrain::parse(raw)
            .ok_or_else(|| AgentError::Llm(format!("Unknown time grain in plan draft: {}", raw)))?,
    };
    let compare_against = match draft.compare_against.as_deref() {
        None => CompareAgainst::None,
        Some(raw) => CompareAgainst::parse(raw)
            .ok_or_else(|| AgentError::Llm(format!("Unknown comparison in plan draft: {}", raw)))?,
    };

    let measure = match draft.metric.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        None => return Ok(clarify(context, "metric", None, SemanticRole::Measure, floor, "no metric named")),
        Some(name) => match ground_concept(context, SemanticRole::Measure, name, floor, input.hint) {
            Grounding::Bound(b) => b,
            Grounding::Missing => {
                return Ok(clarify(context, "metric", Some(name), SemanticRole::Measure, floor, "unknown measure"))
            }
            Grounding::BelowFloor(concept) => {
                return Ok(clarify(
                    context,
                    "metric",
                    Some(name),
                    SemanticRole::Measure,
                    floor,
                    &format!("measure maps to '{}' below the confidence floor {:.2}", concept, floor),
                ))
            }
        },
    };

    let entity_dimension = match non_null(draft.entity_dimension.as_deref()) {
        None if task_type.requires_entity() => {
            return Ok(clarify(
                context,
                "entity_dimension",
                None,
                SemanticRole::Entity,
                floor,
                "entity dimension required for this task",
            ))
        }
        None => None,
        Some(name) => match ground_concept(context, SemanticRole::Entity, name, floor, input.hint) {
            Grounding::Bound(b) => Some(b),
            Grounding::Missing => {
                return Ok(clarify(context, "entity_dimension", Some(name), SemanticRole::Entity, floor, "unknown entity"))
            }
            Grounding::BelowFloor(concept) => {
                return Ok(clarify(
                    context,
                    "entity_dimension",
                    Some(name),
                    SemanticRole::Entity,
                    floor,
                    &format!("entity maps to '{}' below the confidence floor {:.2}", concept, floor),
                ))
            }
        },
    };

    let time_dimension: Option<SlotBinding> = match non_null(draft.time_dimension.as_deref()) {
        Some(name) => match ground_concept(context, SemanticRole::Time, name, floor, input.hint) {
            Grounding::Bound(b) => Some(b),
            _ => return Ok(clarify(context, "time_dimension", Some(name), SemanticRole::Time, floor, "unknown time column")),
        },
        None if task_type.requires_time() || time_grain.is_specified() => {
            choose_time_binding(context, Some(&measure.table), floor, input.hint)
        }
        None => None,
    };

    let aggregation = match draft.aggregation.as_deref() {
        Some("avg") | Some("average") => Aggregation::Avg,
        Some("count") => Aggregation::Count,
        Some("min") => Aggregation::Min,
        Some("max") => Aggregation::Max,
        Some("sum") => Aggregation::Sum,
        _ => context
            .candidate_for(SemanticRole::Measure, &measure.column_ref())
            .and_then(|c| c.default_aggregation)
            .unwrap_or(Aggregation::Sum),
    };

    let entity_scope = match (task_type, draft.entity_scope.as_deref()) {
        (TaskType::TopN, _) | (_, Some("top_n")) | (_, Some("topn")) => EntityScope::TopN,
        _ => EntityScope::All,
    };

    Ok(PlanOutcome::Planned(Plan {
        question: input.question.to_string(),
        task_type,
        entity_dimension,
        entity_scope,
        n: draft.n,
        metric: Some(MetricBinding { measure, aggregation }),
        time_dimension,
        time_grain,
        compare_against,
        planner_source: "llm".to_string(),
        schema_hash: String::new(),
    }))
}

fn non_null(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null") && !s.eq_ignore_ascii_case("none"))
}

fn clarify(
    context: &SchemaContext,
    slot: &str,
    term: Option<&str>,
    role: SemanticRole,
    floor: f64,
    reason: &str,
) -> PlanOutcome {
    PlanOutcome::Clarification(ClarificationNeeded {
        slot: slot.to_string(),
        term: term.map(str::to_string),
        reason: match term {
            Some(t) => format!("{}: '{}'", reason, t),
            None => reason.to_string(),
        },
        candidates: offered_concepts(context, role, floor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::retail_context;
    use crate::schema::RoleSource;

    fn input(question: &str) -> PlanInput<'_> {
        PlanInput {
            question,
            confidence_floor: 0.5,
            max_n: 100,
            hint: None,
            trace_id: "test",
        }
    }

    fn draft(json: &str) -> PlanDraft {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_grounds_drafted_concepts() {
        let d = draft(r#"{"task_type":"topn","entity_dimension":"countries","n":5,"metric":"sales","aggregation":"sum","time_grain":"unspecified","compare_against":"none"}"#);
        let outcome = ground_draft(&d, &input("top 5 countries by revenue"), &retail_context()).unwrap();
        match outcome {
            PlanOutcome::Planned(plan) => {
                assert_eq!(plan.metric_id().as_deref(), Some("revenue_sum"));
                assert_eq!(plan.entity_dimension.unwrap().source, RoleSource::Contract);
                assert_eq!(plan.planner_source, "llm");
            }
            other => panic!("expected plan, got {:?}", other),
        }
    }

    #[test]
    fn test_invented_concept_becomes_clarification() {
        let d = draft(r#"{"task_type":"topn","entity_dimension":"supplier","n":5,"metric":"revenue"}"#);
        let outcome = ground_draft(&d, &input("top 5 suppliers by revenue"), &retail_context()).unwrap();
        assert!(matches!(outcome, PlanOutcome::Clarification(ref c) if c.slot == "entity_dimension"));
    }

    #[test]
    fn test_below_floor_clarification_names_mapped_concept() {
        let d = draft(r#"{"task_type":"topn","entity_dimension":"country","n":5,"metric":"sales"}"#);
        let mut strict = input("top 5 countries by sales");
        strict.confidence_floor = 0.99;
        match ground_draft(&d, &strict, &retail_context()).unwrap() {
            PlanOutcome::Clarification(c) => {
                assert_eq!(c.slot, "metric");
                assert_eq!(c.term.as_deref(), Some("sales"));
                assert!(c.reason.contains("'revenue'"), "{}", c.reason);
            }
            other => panic!("expected clarification, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_task_type_is_generation_error() {
        let d = draft(r#"{"task_type":"forecast","metric":"revenue"}"#);
        assert!(matches!(
            ground_draft(&d, &input("forecast revenue"), &retail_context()),
            Err(AgentError::Llm(_))
        ));
    }
}
