//! Canonical fallback templates for topn, aggregate and trend plans.
//!
//! Fixed statement text with placeholders; only the identifiers, join
//! clause and bucket expression vary. Used when synthesis is disabled or
//! its previous output was rejected or failed to execute.

use super::dialect::Dialect;
use crate::planner::{TaskType, ValidatedPlan};
use crate::schema::JoinStep;
use std::collections::BTreeMap;

const TOPN_TEMPLATE: &str = "SELECT {entity} AS {entity_alias}, {metric} AS {metric_alias}
FROM {from}
GROUP BY {entity}
ORDER BY {metric_alias} DESC, {entity_alias} ASC
LIMIT {n}";

const AGGREGATE_TEMPLATE: &str = "SELECT {metric} AS {metric_alias}
FROM {from}";

const AGGREGATE_BY_TEMPLATE: &str = "SELECT {entity} AS {entity_alias}, {metric} AS {metric_alias}
FROM {from}
GROUP BY {entity}
ORDER BY {metric_alias} DESC, {entity_alias} ASC";

const TREND_TEMPLATE: &str = "SELECT {bucket} AS period, {metric} AS {metric_alias}
FROM {from}
GROUP BY {bucket}
ORDER BY period ASC";

#[derive(Debug, Clone, Copy)]
pub struct TemplateLibrary {
    dialect: Dialect,
}

impl TemplateLibrary {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Render the canonical statement for a plan, if its task type has one
    pub fn render(&self, validated: &ValidatedPlan, joins: &[JoinStep]) -> Option<String> {
        let plan = &validated.plan;
        let metric = plan.metric.as_ref()?;
        let base = metric.measure.table.as_str();

        let mut aliases: BTreeMap<&str, String> = BTreeMap::new();
        aliases.insert(base, "f".to_string());
        for (i, step) in joins.iter().enumerate() {
            aliases.entry(step.to_table.as_str()).or_insert_with(|| format!("d{}", i + 1));
        }
        let qualify = |table: &str, column: &str| format!("{}.{}", aliases.get(table).map(String::as_str).unwrap_or(table), column);

        let mut from = format!("{} f", base);
        for step in joins {
            from.push_str(&format!(
                "\nJOIN {} {} ON {} = {}",
                step.to_table,
                aliases.get(step.to_table.as_str()).map(String::as_str).unwrap_or(step.to_table.as_str()),
                qualify(&step.to_table, &step.to_column),
                qualify(&step.from_table, &step.from_column),
            ));
        }

        let metric_expr = self
            .dialect
            .rounded_aggregate(metric.aggregation, &qualify(&metric.measure.table, &metric.measure.column));
        let metric_alias = super::metric_alias(metric);

        let entity = plan
            .entity_dimension
            .as_ref()
            .map(|e| (qualify(&e.table, &e.column), e.alias()));

        let template = match (plan.task_type, &entity) {
            (TaskType::TopN, Some(_)) => TOPN_TEMPLATE,
            (TaskType::Aggregate, Some(_)) => AGGREGATE_BY_TEMPLATE,
            (TaskType::Aggregate, None) => AGGREGATE_TEMPLATE,
            (TaskType::Trend, _) if plan.entity_dimension.is_none() => TREND_TEMPLATE,
            _ => return None,
        };

        let mut sql = template
            .replace("{from}", &from)
            .replace("{metric}", &metric_expr)
            .replace("{metric_alias}", &metric_alias)
            .replace("{n}", &plan.n.unwrap_or(10).to_string());
        if let Some((expr, alias)) = &entity {
            sql = sql.replace("{entity}", expr).replace("{entity_alias}", alias);
        }
        if template == TREND_TEMPLATE {
            let time = plan.time_dimension.as_ref()?;
            let bucket = self
                .dialect
                .date_bucket(&qualify(&time.table, &time.column), validated.effective_grain);
            sql = sql.replace("{bucket}", &bucket);
        }
        Some(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{KeywordPlanner, PlanInput, PlanOutcome, PlanValidator, PlanVerdict};
    use crate::schema::fixtures::retail_context;
    use crate::schema::join_graph::PathPreferences;

    fn validated(question: &str) -> ValidatedPlan {
        let ctx = retail_context();
        let input = PlanInput {
            question,
            confidence_floor: 0.5,
            max_n: 100,
            hint: None,
            trace_id: "test",
        };
        let plan = match KeywordPlanner::new().plan_question(&input, &ctx) {
            PlanOutcome::Planned(p) => p,
            other => panic!("{:?}", other),
        };
        match PlanValidator::new(0.5, 100).validate(&plan, &ctx) {
            PlanVerdict::Valid(v) => v,
            PlanVerdict::Invalid(r) => panic!("{:?}", r),
        }
    }

    #[test]
    fn test_topn_template() {
        let ctx = retail_context();
        let joins = ctx
            .join_graph()
            .resolve_join_set("fact_sales", &["dim_customer"], &PathPreferences::default())
            .unwrap();
        let sql = TemplateLibrary::new(Dialect::Sqlite)
            .render(&validated("top 5 countries by revenue"), &joins)
            .unwrap();
        assert!(sql.contains("JOIN dim_customer d1 ON d1.customer_id = f.customer_id"));
        assert!(sql.contains("ORDER BY revenue DESC"));
        assert!(sql.ends_with("LIMIT 5"));
    }

    #[test]
    fn test_trend_template_uses_effective_grain() {
        let sql = TemplateLibrary::new(Dialect::Postgres)
            .render(&validated("revenue over time"), &[])
            .unwrap();
        assert!(sql.contains("date_trunc('month', f.invoice_timestamp)::date AS period"));
    }

    #[test]
    fn test_no_template_for_compare() {
        let plan = validated("compare monthly revenue with the previous period");
        assert!(TemplateLibrary::new(Dialect::Sqlite).render(&plan, &[]).is_none());
    }
}
