mod common;

use async_trait::async_trait;
use common::{retail_backend, retail_context, retail_schemas, DATASET};
use spyne_analyst::error::Result;
use spyne_analyst::synth::{CandidateSql, GenerationMode, SqlStrategy, SynthesisInput};
use spyne_analyst::{
    AgentConfig, AnalysisAgent, AnalysisRequest, AnalysisStatus, ConfidenceTier, InMemorySchemaProvider, TraceStore,
};
use std::sync::Arc;

/// Joins the fact table a second time, multiplying every customer's revenue
struct DoubleJoinStrategy;

#[async_trait]
impl SqlStrategy for DoubleJoinStrategy {
    fn name(&self) -> &'static str {
        "double_join"
    }

    async fn propose(&self, input: &SynthesisInput<'_>) -> Result<CandidateSql> {
        Ok(CandidateSql::from_statement(
            "SELECT t1.country AS country, SUM(t0.total_amount) AS revenue\n\
             FROM fact_sales AS t0\n\
             JOIN dim_customer AS t1 ON t0.customer_id = t1.customer_id\n\
             JOIN fact_sales AS t2 ON t2.customer_id = t1.customer_id\n\
             GROUP BY t1.country\n\
             ORDER BY revenue DESC\n\
             LIMIT 5"
                .to_string(),
            GenerationMode::Synthesized,
            input.join_path.clone(),
        ))
    }
}

#[tokio::test]
async fn test_double_joined_fact_is_blocked() {
    let backend = retail_backend();
    let agent = AnalysisAgent::builder(AgentConfig::default(), retail_schemas(&backend), backend)
        .sql_strategy(Arc::new(DoubleJoinStrategy))
        .build()
        .unwrap();

    let response = agent
        .analyze(AnalysisRequest::new("top 5 countries by revenue", DATASET))
        .await
        .unwrap();

    assert_eq!(response.status, AnalysisStatus::Unresolved);
    assert_eq!(response.confidence_tier, ConfidenceTier::Low);
    assert!(response.blocked_by_guardrail);
    assert!(response.sql.is_none());
    assert!(response.rows.is_empty());
    assert!(response.refusal_reason.unwrap().contains("semantic_repair budget exhausted"));

    let duplicate = response
        .correctness_checks
        .iter()
        .find(|c| c.check_name == "duplicate_aggregation")
        .unwrap();
    assert_eq!(duplicate.status, "block");
    assert!(duplicate.details[0].contains("fact_sales (2x)"));

    assert_eq!(response.repairs.len(), 1);
    assert_eq!(response.repairs[0].repair_type, "semantic_repair");
    assert_eq!(response.repairs[0].category, "guardrail_block");
    assert!(response
        .semantic_warnings
        .iter()
        .any(|w| w.starts_with("guardrail_block")));

    let trace = agent.traces().get(&response.trace_id).unwrap().unwrap();
    assert_eq!(trace.plan_history.len(), 2);
    assert_eq!(trace.status, AnalysisStatus::Unresolved);
    assert!(trace.findings.iter().any(|f| f.check_name == "duplicate_aggregation"));
}

#[tokio::test]
async fn test_unapproved_join_is_refused() {
    let backend = retail_backend();
    let mut context = retail_context(&backend);
    // only the product edge is governed; country needs the customer edge
    context.approved_joins = context
        .foreign_keys
        .iter()
        .filter(|fk| fk.to_table == "dim_product")
        .cloned()
        .collect();
    let schemas = Arc::new(InMemorySchemaProvider::new());
    schemas.publish(context).unwrap();

    let agent = AnalysisAgent::builder(AgentConfig::default(), schemas, backend)
        .build()
        .unwrap();
    let response = agent
        .analyze(AnalysisRequest::new("top 5 countries by revenue", DATASET))
        .await
        .unwrap();

    assert_eq!(response.status, AnalysisStatus::Unresolved);
    assert_eq!(response.confidence_tier, ConfidenceTier::Low);
    assert!(!response.blocked_by_guardrail);
    assert_eq!(response.repairs[0].category, "unapproved_join");
    assert!(response
        .missing_grounding
        .iter()
        .any(|m| m.contains("fact_sales.customer_id -> dim_customer.customer_id")));

    let trace = agent.traces().get(&response.trace_id).unwrap().unwrap();
    assert!(trace.execution.is_none());
}
