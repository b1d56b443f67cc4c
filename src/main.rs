use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use spyne_analyst::evaluation::{build_failure_analytics, build_metrics};
use spyne_analyst::llm::LlmClient;
use spyne_analyst::planner::LlmPlanner;
use spyne_analyst::schema::{ForeignKey, TableSchema};
use spyne_analyst::synth::LlmSqlStrategy;
use spyne_analyst::{
    AgentConfig, AnalysisAgent, AnalysisRequest, InMemorySchemaProvider, PostgresBackend, QueryBackend, SchemaContext, SemanticContract,
    SqliteBackend, SqliteTraceStore, TraceStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spyne-analyst")]
#[command(about = "Governed natural-language analytics over relational data")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question against a SQLite or Postgres database
    Ask {
        /// The analytics question in natural language
        question: String,

        /// Path to the SQLite database (opened read-only)
        #[arg(long, conflicts_with = "postgres", required_unless_present = "postgres")]
        sqlite: Option<PathBuf>,

        /// Postgres connection URL; requires --schema
        #[arg(long)]
        postgres: Option<String>,

        /// Schema JSON (tables and foreign keys); introspected from SQLite when omitted
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Semantic contract JSON overlaid on the heuristic roles
        #[arg(long)]
        contract: Option<PathBuf>,

        /// Dataset id used for tracing and per-dataset tuning
        #[arg(long, default_value = "default")]
        dataset: String,

        #[arg(long)]
        row_limit: Option<u32>,

        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Persist the trace to this SQLite file
        #[arg(long)]
        trace_db: Option<PathBuf>,

        /// Let the configured model write SQL instead of the plan compiler
        #[arg(long)]
        llm_sql: bool,
    },
    /// Print evaluation metrics and failure analytics from stored traces
    Report {
        #[arg(long)]
        trace_db: PathBuf,
    },
}

#[derive(Deserialize)]
struct SchemaFile {
    tables: Vec<TableSchema>,
    #[serde(default)]
    foreign_keys: Vec<ForeignKey>,
}

fn load_schema(path: &Path, dataset: &str) -> Result<SchemaContext> {
    let file: SchemaFile = read_json(path)?;
    Ok(SchemaContext::new(dataset, file.tables, file.foreign_keys))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().command {
        Command::Ask {
            question,
            sqlite,
            postgres,
            schema,
            contract,
            dataset,
            row_limit,
            timeout_ms,
            trace_db,
            llm_sql,
        } => {
            let config = AgentConfig::from_env()?;

            let (backend, context): (Arc<dyn QueryBackend>, SchemaContext) = match (&sqlite, &postgres) {
                (Some(path), _) => {
                    let backend = SqliteBackend::open_read_only(path, config.max_concurrent_requests)?;
                    let context = match &schema {
                        Some(schema_path) => load_schema(schema_path, &dataset)?,
                        None => backend.introspect(&dataset)?,
                    };
                    (Arc::new(backend) as Arc<dyn QueryBackend>, context)
                }
                (None, Some(url)) => {
                    let schema_path = schema
                        .as_ref()
                        .context("--postgres needs --schema (tables and foreign keys)")?;
                    let context = load_schema(schema_path, &dataset)?;
                    let backend = PostgresBackend::connect(url, config.max_concurrent_requests as u32).await?;
                    (Arc::new(backend) as Arc<dyn QueryBackend>, context)
                }
                (None, None) => anyhow::bail!("one of --sqlite or --postgres is required"),
            };
            let mut context = context.with_heuristic_roles();
            if let Some(path) = &contract {
                let contract: SemanticContract = read_json(path)?;
                context = context.with_contract(contract);
            }

            let schemas = Arc::new(InMemorySchemaProvider::new());
            let hash = schemas.publish(context)?;
            info!("Published schema for {} ({})", dataset, &hash[..12.min(hash.len())]);

            let mut builder = AnalysisAgent::builder(config.clone(), schemas, backend.clone());
            if let Some(settings) = &config.llm {
                let client = LlmClient::from_settings(settings);
                builder = builder.plan_strategy(Arc::new(LlmPlanner::new(client.clone())));
                if llm_sql {
                    builder = builder.sql_strategy(Arc::new(LlmSqlStrategy::new(client, backend.dialect())));
                }
            }
            if let Some(path) = &trace_db {
                builder = builder.trace_store(Arc::new(SqliteTraceStore::open(path)?));
            }
            let agent = builder.build()?;

            let mut request = AnalysisRequest::new(question, dataset);
            request.row_limit = row_limit;
            request.timeout_ms = timeout_ms;

            let response = tokio::select! {
                response = agent.analyze(request) => response?,
                _ = tokio::signal::ctrl_c() => {
                    agent.shutdown();
                    anyhow::bail!("interrupted");
                }
            };
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Report { trace_db } => {
            let store = SqliteTraceStore::open(&trace_db)?;
            let traces = store.list()?;
            let report = serde_json::json!({
                "metrics": build_metrics(&traces),
                "failure_analytics": build_failure_analytics(&traces),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
