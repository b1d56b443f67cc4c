use super::{CandidateSql, GenerationMode, SqlStrategy, SynthesisInput};
use crate::error::{AgentError, Result};
use crate::llm::{extract_sql, LlmClient};
use crate::synth::Dialect;
use async_trait::async_trait;
use tracing::debug;

/// Model-backed synthesis. The model sees the plan, the allow-list and the
/// resolved join path; its output is re-extracted for identifiers and still
/// goes through the safety check like any other candidate.
pub struct LlmSqlStrategy {
    client: LlmClient,
    dialect: Dialect,
}

impl LlmSqlStrategy {
    pub fn new(client: LlmClient, dialect: Dialect) -> Self {
        Self { client, dialect }
    }

    fn build_prompt(&self, input: &SynthesisInput<'_>) -> Result<String> {
        let plan_json = serde_json::to_string_pretty(&input.plan.plan)?;
        let tables: Vec<String> = input
            .context
            .tables
            .iter()
            .map(|t| {
                let cols: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
                format!("- {}({})", t.name, cols.join(", "))
            })
            .collect();
        let joins: Vec<String> = input
            .join_path
            .iter()
            .map(|s| format!("- {}.{} = {}.{}", s.from_table, s.from_column, s.to_table, s.to_column))
            .collect();
        let retry = match input.prior {
            Some(prior) => format!(
                "\nThe previous attempt failed ({}): {}\nPrevious SQL:\n{}\n",
                prior.category, prior.detail, prior.previous.statement_text
            ),
            None => String::new(),
        };

        Ok(format!(
            r#"Write ONE read-only {dialect} SELECT statement for this analytical plan.
Use only these tables and columns:
{tables}

Join exactly along:
{joins}

Effective time grain: {grain}

Plan:
{plan}
{retry}
Qualify every column with a table alias. Return only SQL in a ```sql block."#,
            dialect = self.dialect,
            tables = tables.join("\n"),
            joins = if joins.is_empty() { "- (no joins)".to_string() } else { joins.join("\n") },
            grain = input.plan.effective_grain,
            plan = plan_json,
            retry = retry,
        ))
    }
}

#[async_trait]
impl SqlStrategy for LlmSqlStrategy {
    fn name(&self) -> &'static str {
        "llm_sql"
    }

    async fn propose(&self, input: &SynthesisInput<'_>) -> Result<CandidateSql> {
        let prompt = self.build_prompt(input)?;
        let raw = self.client.generate(&prompt).await?;
        let statement = extract_sql(&raw);
        if statement.is_empty() {
            return Err(AgentError::Llm("model returned no SQL".to_string()));
        }
        debug!("llm_sql proposed {} chars", statement.len());
        Ok(CandidateSql::from_statement(
            statement,
            GenerationMode::Synthesized,
            input.join_path.clone(),
        ))
    }
}
