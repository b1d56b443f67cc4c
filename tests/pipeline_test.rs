mod common;

use async_trait::async_trait;
use common::{retail_agent, retail_backend, retail_context, retail_schemas, DATASET, UK_REVENUE};
use spyne_analyst::error::{AgentError, Result};
use spyne_analyst::evaluation::{build_failure_analytics, build_metrics};
use spyne_analyst::execution::QueryRows;
use spyne_analyst::schema::{SchemaSnapshot, SchemaProvider};
use spyne_analyst::synth::{CandidateSql, Dialect, GenerationMode, SqlStrategy, SynthesisInput};
use spyne_analyst::{
    AgentConfig, AnalysisAgent, AnalysisRequest, AnalysisStatus, ConfidenceTier, QueryBackend, SqliteBackend,
    SqliteTraceStore, TraceStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_top_countries_by_revenue_is_high_confidence() {
    let agent = retail_agent();
    let response = agent
        .analyze(AnalysisRequest::new("top 5 countries by revenue", DATASET))
        .await
        .unwrap();

    assert_eq!(response.status, AnalysisStatus::Answered);
    assert_eq!(response.confidence_tier, ConfidenceTier::High);
    assert!(!response.blocked_by_guardrail);
    assert!(response.repairs.is_empty());
    assert!(response.correctness_checks.iter().all(|c| c.status == "pass"));

    let sql = response.sql.as_deref().unwrap();
    assert!(sql.contains("JOIN dim_customer"));
    assert!(sql.contains("DESC"));
    assert!(sql.contains("LIMIT 5"));

    assert_eq!(response.columns, vec!["country", "revenue"]);
    assert_eq!(response.row_count, 4);
    assert_eq!(response.rows[0][0], serde_json::json!("United Kingdom"));
    let top = response.rows[0][1].as_f64().unwrap();
    assert!((top - UK_REVENUE).abs() < 1e-6);

    let trace = agent.traces().get(&response.trace_id).unwrap().unwrap();
    assert_eq!(trace.plan_history.len(), 1);
    assert_eq!(trace.plan_history[0].metric_id().as_deref(), Some("revenue_sum"));
    assert_eq!(trace.plan_history[0].n, Some(5));
}

#[tokio::test]
async fn test_monthly_trend_is_high_confidence() {
    let agent = retail_agent();
    let response = agent
        .analyze(AnalysisRequest::new("monthly revenue trend", DATASET))
        .await
        .unwrap();

    assert_eq!(response.status, AnalysisStatus::Answered);
    assert_eq!(response.confidence_tier, ConfidenceTier::High);
    assert_eq!(response.columns, vec!["period", "revenue"]);
    assert_eq!(response.row_count, 3);
    assert_eq!(response.rows[0][0], serde_json::json!("2011-01-01"));
    assert!(response.sql.as_deref().unwrap().contains("GROUP BY date(strftime("));
}

#[tokio::test]
async fn test_previous_period_compare_is_high_confidence() {
    let agent = retail_agent();
    let response = agent
        .analyze(AnalysisRequest::new("compare monthly revenue with the previous period", DATASET))
        .await
        .unwrap();

    assert_eq!(response.status, AnalysisStatus::Answered);
    assert_eq!(response.confidence_tier, ConfidenceTier::High);
    assert!(response.sql.as_deref().unwrap().contains("WITH series AS"));
    assert_eq!(response.row_count, 3);
    assert!(response.columns.contains(&"previous_revenue".to_string()));
    let previous = response.columns.iter().position(|c| c == "previous_revenue").unwrap();
    assert!(response.rows[0][previous].is_null());
    assert!(!response.rows[1][previous].is_null());
}

#[tokio::test]
async fn test_country_segmentation_is_high_confidence() {
    let agent = retail_agent();
    let response = agent
        .analyze(AnalysisRequest::new("country segmentation by revenue", DATASET))
        .await
        .unwrap();

    assert_eq!(response.status, AnalysisStatus::Answered);
    assert_eq!(response.confidence_tier, ConfidenceTier::High);
    assert!(response.sql.as_deref().unwrap().contains("NTILE(4)"));
    assert_eq!(response.row_count, 4);
    assert_eq!(response.rows[0][0], serde_json::json!("United Kingdom"));
    let segment = response.columns.iter().position(|c| c == "segment").unwrap();
    assert_eq!(response.rows[0][segment], serde_json::json!(1));
}

#[tokio::test]
async fn test_unknown_entity_asks_for_clarification() {
    let agent = retail_agent();
    let response = agent
        .analyze(AnalysisRequest::new("top 5 suppliers by revenue", DATASET))
        .await
        .unwrap();

    assert_eq!(response.status, AnalysisStatus::Clarification);
    assert_eq!(response.confidence_tier, ConfidenceTier::Low);
    assert!(response.sql.is_none());
    assert!(response.rows.is_empty());
    let clarification = response.clarification.unwrap();
    assert_eq!(clarification.term.as_deref(), Some("supplier"));
    assert!(response.missing_grounding.contains(&"supplier".to_string()));

    let trace = agent.traces().get(&response.trace_id).unwrap().unwrap();
    assert!(trace.sql_history.is_empty());
    assert!(trace.execution.is_none());
}

/// Writes the top-n query with a misspelled measure column
struct TypoStrategy;

#[async_trait]
impl SqlStrategy for TypoStrategy {
    fn name(&self) -> &'static str {
        "typo"
    }

    async fn propose(&self, input: &SynthesisInput<'_>) -> Result<CandidateSql> {
        Ok(CandidateSql::from_statement(
            "SELECT t1.country AS country, SUM(t0.total_amt) AS revenue\n\
             FROM fact_sales AS t0\n\
             JOIN dim_customer AS t1 ON t0.customer_id = t1.customer_id\n\
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
async fn test_unknown_column_repaired_under_same_plan() {
    let backend = retail_backend();
    let agent = AnalysisAgent::builder(AgentConfig::default(), retail_schemas(&backend), backend)
        .sql_strategy(Arc::new(TypoStrategy))
        .build()
        .unwrap();

    let response = agent
        .analyze(AnalysisRequest::new("top 5 countries by revenue", DATASET))
        .await
        .unwrap();

    assert_eq!(response.status, AnalysisStatus::Answered);
    assert_eq!(response.repairs.len(), 1);
    assert_eq!(response.repairs[0].repair_type, "execution_repair");
    assert_eq!(response.repairs[0].category, "missing_column");
    assert!(response.sql.as_deref().unwrap().contains("SUM(t0.total_amount)"));
    assert_eq!(response.rows[0][0], serde_json::json!("United Kingdom"));

    let trace = agent.traces().get(&response.trace_id).unwrap().unwrap();
    assert_eq!(trace.plan_history.len(), 1);
    assert_eq!(trace.sql_history.len(), 2);
    assert!(trace.sql_history[0].statement_text.contains("total_amt)"));
}

#[tokio::test]
async fn test_repeat_question_hits_plan_cache() {
    let agent = retail_agent();
    let first = agent
        .analyze(AnalysisRequest::new("revenue by country", DATASET))
        .await
        .unwrap();
    let second = agent
        .analyze(AnalysisRequest::new("revenue by country", DATASET))
        .await
        .unwrap();

    assert_eq!(first.status, AnalysisStatus::Answered);
    assert_eq!(first.sql, second.sql);
    assert_eq!(first.rows, second.rows);
    assert!(!agent.traces().get(&first.trace_id).unwrap().unwrap().cache_hit);
    assert!(agent.traces().get(&second.trace_id).unwrap().unwrap().cache_hit);
}

#[tokio::test]
async fn test_row_limit_truncates_result() {
    let agent = retail_agent();
    let response = agent
        .analyze(AnalysisRequest::new("revenue by country", DATASET).with_row_limit(2))
        .await
        .unwrap();
    assert_eq!(response.status, AnalysisStatus::Answered);
    assert_eq!(response.row_count, 2);
    assert!(response.truncated);
}

/// Serves one schema version for the first `flip_after` snapshots, then another
struct FlippingProvider {
    calls: AtomicUsize,
    flip_after: usize,
    before: SchemaSnapshot,
    after: SchemaSnapshot,
}

impl SchemaProvider for FlippingProvider {
    fn snapshot(&self, dataset_id: &str) -> Result<SchemaSnapshot> {
        if dataset_id != DATASET {
            return Err(AgentError::UnknownDataset(dataset_id.to_string()));
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(if call < self.flip_after {
            self.before.clone()
        } else {
            self.after.clone()
        })
    }
}

#[tokio::test]
async fn test_schema_change_mid_request_is_stale() {
    let backend = retail_backend();
    let before = retail_context(&backend);
    let mut after = before.clone();
    after.tables[0].row_count = Some(99);

    let provider = Arc::new(FlippingProvider {
        calls: AtomicUsize::new(0),
        flip_after: 2,
        before: SchemaSnapshot::new(before),
        after: SchemaSnapshot::new(after),
    });
    let agent = AnalysisAgent::builder(AgentConfig::default(), provider, backend)
        .build()
        .unwrap();

    let response = agent
        .analyze(AnalysisRequest::new("top 5 countries by revenue", DATASET))
        .await
        .unwrap();
    assert_eq!(response.status, AnalysisStatus::StaleSchema);
    assert_eq!(response.confidence_tier, ConfidenceTier::Low);
    assert!(response.sql.is_none());
    assert!(response.refusal_reason.unwrap().contains("Stale schema"));
}

/// Delays every query so cancellation can land mid-execution
struct SlowBackend {
    inner: SqliteBackend,
    delay: Duration,
}

#[async_trait]
impl QueryBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow-sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn run(&self, statement: &str, row_limit: u32, timeout: Duration) -> Result<QueryRows> {
        tokio::time::sleep(self.delay).await;
        self.inner.run(statement, row_limit, timeout).await
    }
}

#[tokio::test]
async fn test_cancellation_ends_request() {
    let inner = SqliteBackend::from_connection(common::retail_connection());
    let schemas = retail_schemas(&inner);
    let backend = Arc::new(SlowBackend {
        inner,
        delay: Duration::from_secs(5),
    });
    let agent = AnalysisAgent::builder(AgentConfig::default(), schemas, backend)
        .build()
        .unwrap();

    let token = agent.cancellation_token();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let response = agent
        .analyze_with_cancel(AnalysisRequest::new("top 5 countries by revenue", DATASET), token)
        .await
        .unwrap();
    assert_eq!(response.status, AnalysisStatus::Cancelled);
    assert!(response.rows.is_empty());

    let trace = agent.traces().get(&response.trace_id).unwrap().unwrap();
    assert_eq!(trace.status, AnalysisStatus::Cancelled);
}

#[tokio::test]
async fn test_bad_requests_fail_fast() {
    let agent = retail_agent();
    let err = agent.analyze(AnalysisRequest::new("hi", DATASET)).await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidRequest(_)));

    let err = agent
        .analyze(AnalysisRequest::new("top 5 countries by revenue", "finance"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::UnknownDataset(_)));
    assert!(agent.traces().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_traces_persist_and_feed_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("traces").join("traces.db");

    let backend = retail_backend();
    let store = Arc::new(SqliteTraceStore::open(&path).unwrap());
    let agent = AnalysisAgent::builder(AgentConfig::default(), retail_schemas(&backend), backend)
        .trace_store(store)
        .build()
        .unwrap();

    let answered = agent
        .analyze(AnalysisRequest::new("top 5 countries by revenue", DATASET))
        .await
        .unwrap();
    agent
        .analyze(AnalysisRequest::new("top 5 suppliers by revenue", DATASET))
        .await
        .unwrap();
    drop(agent);

    let reopened = SqliteTraceStore::open(&path).unwrap();
    let traces = reopened.list().unwrap();
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0].trace_id, answered.trace_id);
    assert_eq!(traces[0].final_sql, answered.sql);

    let metrics = build_metrics(&traces);
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.rates.execution_success_rate, 0.5);
    assert_eq!(metrics.rates.clarification_rate, 0.5);
    assert_eq!(metrics.tier_distribution["high"], 1);

    let failures = build_failure_analytics(&traces);
    assert_eq!(failures.summary.failed_requests, 1);
    assert_eq!(failures.outcome_breakdown["clarification"], 1);
    assert_eq!(failures.top_failure_examples[0].question, "top 5 suppliers by revenue");
}

/// Top-n query that spins through a large recursive CTE before answering
struct HeavyStrategy;

#[async_trait]
impl SqlStrategy for HeavyStrategy {
    fn name(&self) -> &'static str {
        "heavy"
    }

    async fn propose(&self, input: &SynthesisInput<'_>) -> Result<CandidateSql> {
        Ok(CandidateSql::from_statement(
            "SELECT t1.country AS country, SUM(t0.total_amount) AS revenue\n\
             FROM fact_sales AS t0\n\
             JOIN dim_customer AS t1 ON t0.customer_id = t1.customer_id\n\
             WHERE (WITH RECURSIVE spin AS (SELECT 1 AS x UNION ALL SELECT x + 1 FROM spin WHERE x < 10000000) \
             SELECT COUNT(*) FROM spin) > 0\n\
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
async fn test_timed_out_request_leaves_concurrent_request_running() {
    let backend = retail_backend();
    let agent = AnalysisAgent::builder(AgentConfig::default(), retail_schemas(&backend), backend)
        .sql_strategy(Arc::new(HeavyStrategy))
        .build()
        .unwrap();

    let (patient, hasty) = tokio::join!(
        agent.analyze(AnalysisRequest::new("top 5 countries by revenue", DATASET)),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            agent
                .analyze(AnalysisRequest::new("top 5 countries by revenue", DATASET).with_timeout_ms(50))
                .await
        },
    );
    let (patient, hasty) = (patient.unwrap(), hasty.unwrap());

    assert_eq!(hasty.status, AnalysisStatus::Unresolved);
    assert!(hasty.rows.is_empty());

    assert_eq!(patient.status, AnalysisStatus::Answered);
    assert!(patient.repairs.is_empty(), "{:?}", patient.repairs);
    assert!(patient.sql.as_deref().unwrap().contains("spin"));
    assert_eq!(patient.rows[0][0], serde_json::json!("United Kingdom"));
}
