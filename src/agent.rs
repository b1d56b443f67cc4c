//! Analysis Agent
//!
//! Drives one request through
//! `Planning → Validating → Synthesizing → SafetyCheck → Executing`
//! and the bounded repair loop, then resolves the confidence tier and
//! appends the trace. Execution failures go back to the synthesizer under
//! the same plan; semantic failures go back to the planner with a hint.

use crate::api::{correctness_checks, AnalysisRequest, AnalysisResponse, AnalysisStatus, RepairSummary};
use crate::cache::PlanSqlCache;
use crate::confidence::{ConfidenceInputs, ConfidenceResolver, ConfidenceTier};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::execution::{ExecutionResult, Executor, QueryBackend};
use crate::guardrails::{GuardrailEngine, GuardrailFinding, GuardrailThresholds};
use crate::planner::{
    ClarificationNeeded, Plan, PlanHint, PlanInput, PlanOutcome, PlanStrategy, PlanValidator, PlanVerdict, Planner,
};
use crate::repair::{FailureClassifier, FailureSignal, RepairBudget, RepairLimits, RepairType};
use crate::safety::{CheckedSql, SafetyValidator, SafetyVerdict};
use crate::schema::{ForeignKey, RoleSource, SchemaContext, SchemaProvider};
use crate::synth::{CandidateSql, Dialect, PriorFailure, SqlStrategy, SqlSynthesizer};
use crate::trace::{InMemoryTraceStore, TraceOutcome, TraceRecorder, TraceStore};
use itertools::Itertools;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Await `fut` unless the request is cancelled first
async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        out = fut => Ok(out),
    }
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}

/// Per-request mutable state
struct RequestRun {
    recorder: TraceRecorder,
    budget: RepairBudget,
    semantic_warnings: Vec<String>,
    hint: Option<PlanHint>,
    last_findings: Vec<GuardrailFinding>,
    row_limit: u32,
    timeout_ms: u64,
    cancel: CancellationToken,
}

impl RequestRun {
    fn trace_id(&self) -> String {
        self.recorder.trace_id().to_string()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    fn warn_semantic(&mut self, warning: String) {
        if !self.semantic_warnings.contains(&warning) {
            self.semantic_warnings.push(warning);
        }
    }

    /// What a refusal could not ground: the exclusions accumulated by repairs
    fn missing_grounding(&self) -> Vec<String> {
        match &self.hint {
            Some(hint) => hint
                .excluded_bindings
                .iter()
                .map(|b| b.to_string())
                .chain(hint.excluded_joins.iter().map(|j| {
                    format!("join {}.{} -> {}.{}", j.from_table, j.from_column, j.to_table, j.to_column)
                }))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// How a request ended, before the tier is resolved
enum Terminal {
    Answered {
        plan: Plan,
        checked: CheckedSql,
        result: ExecutionResult,
    },
    Clarification(ClarificationNeeded),
    Refused {
        status: AnalysisStatus,
        reason: String,
    },
}

impl Terminal {
    fn from_error(err: AgentError) -> Self {
        match err {
            AgentError::Cancelled => Terminal::Refused {
                status: AnalysisStatus::Cancelled,
                reason: err.to_string(),
            },
            AgentError::StaleSchema { .. } => Terminal::Refused {
                status: AnalysisStatus::StaleSchema,
                reason: err.to_string(),
            },
            AgentError::RetryBudgetExhausted(reason) => Terminal::Refused {
                status: AnalysisStatus::Unresolved,
                reason,
            },
            other => Terminal::Refused {
                status: AnalysisStatus::Unresolved,
                reason: other.to_string(),
            },
        }
    }
}

/// Builder for [`AnalysisAgent`]
pub struct AgentBuilder {
    config: AgentConfig,
    schemas: Arc<dyn SchemaProvider>,
    backend: Arc<dyn QueryBackend>,
    plan_strategy: Option<Arc<dyn PlanStrategy>>,
    sql_strategy: Option<Arc<dyn SqlStrategy>>,
    traces: Option<Arc<dyn TraceStore>>,
}

impl AgentBuilder {
    /// Model-backed (or any other) planning strategy; the keyword planner stays as fallback
    pub fn plan_strategy(mut self, strategy: Arc<dyn PlanStrategy>) -> Self {
        self.plan_strategy = Some(strategy);
        self
    }

    /// Replace the default plan compiler as the synthesis strategy
    pub fn sql_strategy(mut self, strategy: Arc<dyn SqlStrategy>) -> Self {
        self.sql_strategy = Some(strategy);
        self
    }

    pub fn trace_store(mut self, traces: Arc<dyn TraceStore>) -> Self {
        self.traces = Some(traces);
        self
    }

    pub fn build(self) -> Result<AnalysisAgent> {
        self.config.validate()?;
        let dialect = self.backend.dialect();
        info!(
            "Analysis agent ready: backend={} dialect={} synthesis={}",
            self.backend.name(),
            dialect,
            self.sql_strategy.as_ref().map_or("plan_compiler", |s| s.name())
        );
        Ok(AnalysisAgent {
            planner: Planner::new(self.plan_strategy),
            synthesizer: SqlSynthesizer::new(dialect, self.sql_strategy, self.config.synthesis_enabled),
            executor: Executor::new(self.backend),
            classifier: FailureClassifier::new(),
            confidence: ConfidenceResolver::new(self.config.high_confidence),
            cache: PlanSqlCache::new(),
            traces: self.traces.unwrap_or_else(|| Arc::new(InMemoryTraceStore::new())),
            permits: Arc::new(Semaphore::new(self.config.max_concurrent_requests)),
            shutdown: CancellationToken::new(),
            schemas: self.schemas,
            dialect,
            config: self.config,
        })
    }
}

pub struct AnalysisAgent {
    config: AgentConfig,
    schemas: Arc<dyn SchemaProvider>,
    planner: Planner,
    synthesizer: SqlSynthesizer,
    executor: Executor,
    classifier: FailureClassifier,
    confidence: ConfidenceResolver,
    cache: PlanSqlCache,
    traces: Arc<dyn TraceStore>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    dialect: Dialect,
}

impl AnalysisAgent {
    pub fn builder(config: AgentConfig, schemas: Arc<dyn SchemaProvider>, backend: Arc<dyn QueryBackend>) -> AgentBuilder {
        AgentBuilder {
            config,
            schemas,
            backend,
            plan_strategy: None,
            sql_strategy: None,
            traces: None,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn traces(&self) -> &Arc<dyn TraceStore> {
        &self.traces
    }

    /// A token that is cancelled with the agent but can also be cancelled on its own
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Cancel every in-flight request
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse> {
        let cancel = self.cancellation_token();
        self.analyze_with_cancel(request, cancel).await
    }

    /// Run one request. Invalid requests and unknown datasets fail fast;
    /// every other outcome, refusals included, is a traced response.
    pub async fn analyze_with_cancel(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResponse> {
        request.validate()?;
        self.schemas.snapshot(&request.dataset_id)?;

        let _permit = cancellable(&cancel, self.permits.acquire())
            .await?
            .map_err(|_| AgentError::Cancelled)?;

        let trace_id = Uuid::new_v4().to_string();
        info!("[{}] analyze '{}' on {}", trace_id, request.question, request.dataset_id);

        let mut run = RequestRun {
            recorder: TraceRecorder::new(trace_id, request.clone()),
            budget: RepairBudget::new(RepairLimits::from_config(&self.config)),
            semantic_warnings: Vec::new(),
            hint: None,
            last_findings: Vec::new(),
            row_limit: request
                .row_limit
                .unwrap_or(self.config.default_row_limit)
                .min(self.config.max_row_limit),
            timeout_ms: request
                .timeout_ms
                .unwrap_or(self.config.default_timeout_ms)
                .min(self.config.max_timeout_ms),
            cancel,
        };

        // a cancelled execution is abandoned with its future inside `cancellable`
        let terminal = match self.pipeline(&request, &mut run).await {
            Ok(terminal) => terminal,
            Err(e) => Terminal::from_error(e),
        };

        self.finalize(run, terminal)
    }

    async fn pipeline(&self, request: &AnalysisRequest, run: &mut RequestRun) -> Result<Terminal> {
        let dataset_id = request.dataset_id.as_str();
        let snapshot = self.schemas.snapshot(dataset_id)?;
        run.recorder.set_schema_hash(&snapshot.hash);
        let context = Arc::clone(&snapshot.context);

        let floor = self.config.confidence_floor_for(dataset_id);
        let validator = PlanValidator::new(floor, self.config.max_n);
        let safety = SafetyValidator::new(
            self.dialect,
            self.config.default_row_limit,
            self.config.max_row_limit,
            self.config.max_timeout_ms,
        );
        let guardrails = GuardrailEngine::new(
            self.dialect,
            GuardrailThresholds {
                fan_out: self.config.fan_out_threshold_for(dataset_id),
                null_warn_ratio: self.config.null_warn_ratio,
            },
        );
        let trace_id = run.trace_id();

        'plan: loop {
            run.check_cancelled()?;

            // Planning
            let input = PlanInput {
                question: &request.question,
                confidence_floor: floor,
                max_n: self.config.max_n,
                hint: run.hint.as_ref(),
                trace_id: &trace_id,
            };
            let report = cancellable(&run.cancel, self.planner.plan(&input, &snapshot)).await??;
            for warning in report.warnings {
                run.warn_semantic(warning);
            }
            run.recorder.stage_done("planning");

            let plan = match report.outcome {
                PlanOutcome::Planned(plan) => plan,
                PlanOutcome::Clarification(clarification) => {
                    info!("[{}] clarification needed for {}: {}", trace_id, clarification.slot, clarification.reason);
                    return Ok(Terminal::Clarification(clarification));
                }
            };
            run.recorder.record_plan(&plan);

            // Validating
            let validated = match validator.validate(&plan, &context) {
                PlanVerdict::Valid(validated) => validated,
                PlanVerdict::Invalid(reasons) => {
                    info!("[{}] plan invalid: {}", trace_id, reasons.join("; "));
                    return Ok(Terminal::Clarification(ClarificationNeeded {
                        slot: "plan".to_string(),
                        term: None,
                        reason: reasons.join("; "),
                        candidates: Vec::new(),
                    }));
                }
            };
            for warning in &validated.warnings {
                run.warn_semantic(warning.clone());
            }
            run.recorder.stage_done("validating");

            let mut prior: Option<PriorFailure> = None;
            loop {
                run.check_cancelled()?;

                let current = self.schemas.snapshot(dataset_id)?;
                if current.hash != validated.plan.schema_hash {
                    warn!("[{}] schema changed between planning and synthesis", trace_id);
                    return Err(AgentError::StaleSchema {
                        planned: short_hash(&validated.plan.schema_hash),
                        current: short_hash(&current.hash),
                    });
                }

                // Synthesizing
                let excluded = run.hint.as_ref().map(|h| h.excluded_joins.clone()).unwrap_or_default();
                let cache_key = PlanSqlCache::key(&validated.plan, &excluded);
                let cached = match prior {
                    None => self.cache.get(dataset_id, &snapshot.hash, &cache_key),
                    Some(_) => None,
                };
                let candidate = match cached {
                    Some(mut hit) => {
                        debug!("[{}] plan cache hit", trace_id);
                        run.recorder.mark_cache_hit();
                        hit.row_limit = Some(run.row_limit);
                        hit.timeout_ms = Some(run.timeout_ms);
                        hit
                    }
                    None => {
                        cancellable(
                            &run.cancel,
                            self.synthesizer.synthesize(
                                &validated,
                                &context,
                                prior.as_ref(),
                                &excluded,
                                run.row_limit,
                                run.timeout_ms,
                            ),
                        )
                        .await??
                    }
                };
                run.recorder.record_sql(&candidate);
                run.recorder.stage_done("synthesizing");

                let unapproved = unapproved_joins(&candidate, &context);
                if !unapproved.is_empty() {
                    let detail = format!(
                        "join path uses edges outside the approved contract: {}",
                        unapproved
                            .iter()
                            .map(|j| format!("{}.{} -> {}.{}", j.from_table, j.from_column, j.to_table, j.to_column))
                            .join(", ")
                    );
                    let hint = PlanHint {
                        excluded_bindings: Vec::new(),
                        excluded_joins: unapproved,
                        reason: detail.clone(),
                    };
                    self.semantic_repair(run, FailureSignal::UnapprovedJoin(detail), hint)?;
                    continue 'plan;
                }

                // SafetyCheck
                let checked = match safety.check(&candidate, &context) {
                    SafetyVerdict::Pass(checked) => checked,
                    SafetyVerdict::Reject(reason) => {
                        prior = Some(self.execution_repair(run, FailureSignal::SafetyRejected(reason), candidate)?);
                        continue;
                    }
                };
                run.recorder.stage_done("safety_check");

                // Executing
                let result = cancellable(&run.cancel, self.executor.execute(&checked)).await?;
                run.recorder.record_execution(&result);
                run.recorder.stage_done("executing");

                if let Some(error) = &result.error {
                    let signal = FailureSignal::ExecutionError(error.clone());
                    prior = Some(self.execution_repair(run, signal, candidate)?);
                    continue;
                }

                if result.row_count == 0 && grain_table_has_rows(&validated.plan, &context) {
                    let hint = PlanHint {
                        excluded_bindings: validated
                            .plan
                            .bindings()
                            .into_iter()
                            .filter(|b| b.source == RoleSource::Heuristic)
                            .map(|b| b.column_ref())
                            .collect(),
                        excluded_joins: Vec::new(),
                        reason: "empty result over a non-empty grain table".to_string(),
                    };
                    self.semantic_repair(run, FailureSignal::EmptyResult, hint)?;
                    continue 'plan;
                }

                // Guardrails
                let findings = guardrails.evaluate(&validated, &candidate, &result, &context);
                run.recorder.record_findings(&findings);
                run.recorder.stage_done("guardrails");
                run.last_findings = findings.clone();

                let blocks: Vec<&GuardrailFinding> = findings.iter().filter(|f| f.is_block()).collect();
                if !blocks.is_empty() {
                    let detail = blocks
                        .iter()
                        .map(|f| format!("{}: {}", f.check_name, f.detail))
                        .join("; ");
                    let excluded_joins: Vec<ForeignKey> = blocks
                        .iter()
                        .flat_map(|f| f.implicated_joins.iter().cloned())
                        .unique()
                        .collect();
                    let hint = PlanHint {
                        excluded_bindings: Vec::new(),
                        excluded_joins,
                        reason: detail.clone(),
                    };
                    self.semantic_repair(run, FailureSignal::GuardrailBlock(detail), hint)?;
                    continue 'plan;
                }

                self.cache.insert(dataset_id, &snapshot, cache_key, candidate);
                info!(
                    "[{}] answered: {} rows in {} ms",
                    trace_id, result.row_count, result.elapsed_ms
                );
                return Ok(Terminal::Answered {
                    plan: validated.plan,
                    checked,
                    result,
                });
            }
        }
    }

    fn execution_repair(&self, run: &mut RequestRun, signal: FailureSignal, previous: CandidateSql) -> Result<PriorFailure> {
        let classification = self.classifier.classify(&signal);
        if !run.budget.allows(RepairType::ExecutionRepair) {
            let reason = format!(
                "{}; last failure {}: {}",
                run.budget.exhausted_reason(RepairType::ExecutionRepair),
                classification.category,
                classification.reason
            );
            warn!("[{}] {}", run.trace_id(), reason);
            return Err(AgentError::RetryBudgetExhausted(reason));
        }
        let attempt = run
            .budget
            .record(&classification, Some("re-synthesize under the same plan".to_string()));
        info!(
            "[{}] execution_repair #{} ({}): {}",
            run.trace_id(),
            attempt,
            classification.category,
            classification.reason
        );
        Ok(PriorFailure {
            repair_type: classification.repair_type,
            category: classification.category,
            detail: classification.reason,
            previous,
        })
    }

    fn semantic_repair(&self, run: &mut RequestRun, signal: FailureSignal, hint: PlanHint) -> Result<()> {
        let classification = self.classifier.classify(&signal);
        run.warn_semantic(format!("{}: {}", classification.category, classification.reason));

        if !run.budget.allows(RepairType::SemanticRepair) {
            let reason = format!(
                "{}; last failure {}: {}",
                run.budget.exhausted_reason(RepairType::SemanticRepair),
                classification.category,
                classification.reason
            );
            warn!("[{}] {}", run.trace_id(), reason);
            match &mut run.hint {
                Some(existing) => existing.merge(hint),
                None => run.hint = Some(hint),
            }
            return Err(AgentError::RetryBudgetExhausted(reason));
        }

        let delta = format!(
            "replan excluding bindings [{}] and joins [{}]",
            hint.excluded_bindings.iter().join(", "),
            hint.excluded_joins
                .iter()
                .map(|j| format!("{}.{} -> {}.{}", j.from_table, j.from_column, j.to_table, j.to_column))
                .join(", ")
        );
        let attempt = run.budget.record(&classification, Some(delta));
        info!(
            "[{}] semantic_repair #{} ({}): {}",
            run.trace_id(),
            attempt,
            classification.category,
            classification.reason
        );
        match &mut run.hint {
            Some(existing) => existing.merge(hint),
            None => run.hint = Some(hint),
        }
        Ok(())
    }

    fn finalize(&self, mut run: RequestRun, terminal: Terminal) -> Result<AnalysisResponse> {
        let trace_id = run.trace_id();
        let all_findings = run.recorder.findings().to_vec();
        let blocked_by_guardrail = all_findings.iter().any(|f| f.is_block());
        let missing_from_repairs = run.missing_grounding();

        let (status, tier, sql, result, refusal_reason, missing_grounding, clarification) = match terminal {
            Terminal::Answered { plan, checked, result } => {
                let tier = self.confidence.resolve(&ConfidenceInputs {
                    plan: Some(&plan),
                    findings: &all_findings,
                    semantic_repairs: run.budget.semantic_repairs(),
                    unresolved: false,
                });
                (AnalysisStatus::Answered, tier, Some(checked.statement), Some(result), None, Vec::new(), None)
            }
            Terminal::Clarification(clarification) => {
                let mut missing = vec![clarification.term.clone().unwrap_or_else(|| clarification.slot.clone())];
                missing.extend(missing_from_repairs);
                (
                    AnalysisStatus::Clarification,
                    ConfidenceTier::Low,
                    None,
                    None,
                    Some(clarification.reason.clone()),
                    missing,
                    Some(clarification),
                )
            }
            Terminal::Refused { status, reason } => {
                warn!("[{}] refused ({}): {}", trace_id, status, reason);
                let tier = self.confidence.resolve(&ConfidenceInputs {
                    plan: None,
                    findings: &all_findings,
                    semantic_repairs: run.budget.semantic_repairs(),
                    unresolved: true,
                });
                (status, tier, None, None, Some(reason), missing_from_repairs, None)
            }
        };

        let attempts = run.budget.attempts().to_vec();
        let response = AnalysisResponse {
            trace_id: trace_id.clone(),
            status,
            confidence_tier: tier,
            semantic_warnings: run.semantic_warnings.clone(),
            correctness_checks: if run.last_findings.is_empty() && result.is_none() {
                Vec::new()
            } else {
                correctness_checks(&run.last_findings)
            },
            blocked_by_guardrail,
            repairs: attempts.iter().map(RepairSummary::from).collect(),
            sql: sql.clone(),
            columns: result.as_ref().map(|r| r.columns.clone()).unwrap_or_default(),
            rows: result.as_ref().map(|r| r.rows.clone()).unwrap_or_default(),
            row_count: result.as_ref().map_or(0, |r| r.row_count),
            truncated: result.as_ref().map_or(false, |r| r.truncated),
            refusal_reason: refusal_reason.clone(),
            missing_grounding,
            clarification,
        };

        run.recorder.stage_done("finalize");
        let trace = run.recorder.finish(TraceOutcome {
            status,
            confidence_tier: tier,
            repairs: attempts,
            semantic_warnings: run.semantic_warnings,
            final_sql: sql,
            refusal_reason,
        });
        self.traces.append(&trace)?;
        info!("[{}] finished: status={} tier={}", trace_id, status, tier);

        Ok(response)
    }
}

/// Join edges on the candidate's path that the contract does not approve.
/// A context without approved joins has no contract opinion.
fn unapproved_joins(candidate: &CandidateSql, context: &SchemaContext) -> Vec<ForeignKey> {
    if context.approved_joins.is_empty() {
        return Vec::new();
    }
    candidate
        .join_path
        .iter()
        .map(|step| step.foreign_key())
        .filter(|fk| !context.approved_joins.contains(fk))
        .unique()
        .collect()
}

/// Whether the table defining the result grain is known to hold rows
fn grain_table_has_rows(plan: &Plan, context: &SchemaContext) -> bool {
    let table = match (&plan.entity_dimension, &plan.metric) {
        (Some(entity), _) => &entity.table,
        (None, Some(metric)) => &metric.measure.table,
        (None, None) => return false,
    };
    context
        .table(table)
        .and_then(|t| t.row_count)
        .map_or(false, |rows| rows > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::retail_context;
    use crate::schema::{Cardinality, JoinStep};
    use crate::synth::GenerationMode;

    fn candidate_with_path() -> CandidateSql {
        CandidateSql::from_statement(
            "SELECT 1".to_string(),
            GenerationMode::Synthesized,
            vec![JoinStep {
                from_table: "fact_sales".to_string(),
                from_column: "customer_id".to_string(),
                to_table: "dim_customer".to_string(),
                to_column: "customer_id".to_string(),
                cardinality: Cardinality::ManyToOne,
            }],
        )
    }

    #[test]
    fn test_unapproved_joins_only_with_contract_opinion() {
        let mut context = retail_context();
        assert!(unapproved_joins(&candidate_with_path(), &context).is_empty());

        context.approved_joins = vec![context.foreign_keys[1].clone()];
        let unapproved = unapproved_joins(&candidate_with_path(), &context);
        assert_eq!(unapproved, vec![context.foreign_keys[0].clone()]);

        context.approved_joins = context.foreign_keys.clone();
        assert!(unapproved_joins(&candidate_with_path(), &context).is_empty());
    }

    #[test]
    fn test_terminal_from_error() {
        match Terminal::from_error(AgentError::RetryBudgetExhausted("semantic".to_string())) {
            Terminal::Refused { status, reason } => {
                assert_eq!(status, AnalysisStatus::Unresolved);
                assert_eq!(reason, "semantic");
            }
            _ => panic!("expected refusal"),
        }
        assert!(matches!(
            Terminal::from_error(AgentError::Cancelled),
            Terminal::Refused {
                status: AnalysisStatus::Cancelled,
                ..
            }
        ));
    }
}
