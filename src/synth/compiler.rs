//! Plan compiler: the default synthesis strategy.
//!
//! Deterministic; the same validated plan and join path always compile to
//! the same statement text.

use super::dialect::{Dialect, Dimension, MetricExpr, QueryShape, QuerySpec, SqlRenderer};
use super::{metric_alias, CandidateSql, GenerationMode, SqlStrategy, SynthesisInput};
use crate::error::{AgentError, Result};
use crate::planner::{CompareAgainst, TaskType, ValidatedPlan};
use crate::schema::JoinStep;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy)]
pub struct PlanCompiler {
    dialect: Dialect,
}

impl PlanCompiler {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn build_spec(&self, validated: &ValidatedPlan, joins: &[JoinStep]) -> Result<QuerySpec> {
        let plan = &validated.plan;
        let metric = plan
            .metric
            .as_ref()
            .ok_or_else(|| AgentError::Synthesis("plan has no metric".to_string()))?;
        let metric_alias = metric_alias(metric);

        let mut dimensions = Vec::new();
        let time_bucket = match (&plan.time_dimension, validated.effective_grain.is_specified()) {
            (Some(time), true) => Some(Dimension::TimeBucket {
                column: time.column_ref(),
                grain: validated.effective_grain,
                alias: "period".to_string(),
            }),
            _ => None,
        };
        if let Some(bucket) = &time_bucket {
            dimensions.push(bucket.clone());
        }
        let entity_alias = plan.entity_dimension.as_ref().map(|e| e.alias());
        if let Some(entity) = &plan.entity_dimension {
            dimensions.push(Dimension::Column {
                column: entity.column_ref(),
                alias: entity.alias(),
            });
        }

        let mut order_by: Vec<(String, bool)> = Vec::new();
        let mut limit = None;
        let shape = match plan.task_type {
            TaskType::TopN => {
                order_by.push((metric_alias.clone(), true));
                if let Some(alias) = &entity_alias {
                    order_by.push((alias.clone(), false));
                }
                limit = plan.n;
                QueryShape::Grouped
            }
            TaskType::Aggregate => {
                if time_bucket.is_some() {
                    order_by.push(("period".to_string(), false));
                }
                order_by.push((metric_alias.clone(), true));
                if let Some(alias) = &entity_alias {
                    order_by.push((alias.clone(), false));
                }
                QueryShape::Grouped
            }
            TaskType::Trend => {
                if time_bucket.is_none() {
                    return Err(AgentError::Synthesis("trend plan has no time bucket".to_string()));
                }
                order_by.push(("period".to_string(), false));
                if let Some(alias) = &entity_alias {
                    order_by.push((alias.clone(), false));
                }
                QueryShape::Grouped
            }
            TaskType::Segment => {
                order_by.push((metric_alias.clone(), true));
                if let Some(alias) = &entity_alias {
                    order_by.push((alias.clone(), false));
                }
                QueryShape::Quartiles
            }
            TaskType::Compare => {
                if time_bucket.is_none() {
                    return Err(AgentError::Synthesis("compare plan has no time bucket".to_string()));
                }
                if let Some(alias) = &entity_alias {
                    order_by.push((alias.clone(), false));
                }
                order_by.push(("period".to_string(), false));
                match plan.compare_against {
                    CompareAgainst::PreviousPeriod => QueryShape::PreviousPeriod,
                    CompareAgainst::Global => QueryShape::GlobalBaseline,
                    CompareAgainst::None => {
                        return Err(AgentError::Synthesis("compare plan has no baseline".to_string()))
                    }
                }
            }
        };

        Ok(QuerySpec {
            base_table: metric.measure.table.clone(),
            joins: joins.to_vec(),
            dimensions,
            metric: MetricExpr {
                aggregation: metric.aggregation,
                column: metric.measure.column_ref(),
                alias: metric_alias,
            },
            shape,
            order_by,
            limit,
        })
    }
}

#[async_trait]
impl SqlStrategy for PlanCompiler {
    fn name(&self) -> &'static str {
        "plan_compiler"
    }

    async fn propose(&self, input: &SynthesisInput<'_>) -> Result<CandidateSql> {
        let spec = self.build_spec(input.plan, &input.join_path)?;
        let statement = self.dialect.render(&spec);
        Ok(CandidateSql::from_statement(
            statement,
            GenerationMode::Synthesized,
            input.join_path.clone(),
        ))
    }
}
