//! Governed natural-language analytics over relational data.
//!
//! A question becomes a structured [`planner::Plan`] grounded in a schema
//! snapshot, the plan is validated and compiled to read-only SQL, the SQL
//! passes a safety gate and runs against a [`execution::QueryBackend`], and
//! the result is checked by analytical guardrails before a confidence tier
//! is attached. Failures feed a bounded repair loop; every request leaves
//! an append-only [`trace::QueryTrace`].

pub mod agent;
pub mod api;
pub mod cache;
pub mod confidence;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod execution;
pub mod guardrails;
pub mod llm;
pub mod planner;
pub mod repair;
pub mod safety;
pub mod schema;
pub mod synth;
pub mod trace;

pub use agent::{AgentBuilder, AnalysisAgent};
pub use api::{AnalysisRequest, AnalysisResponse, AnalysisStatus};
pub use confidence::ConfidenceTier;
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use execution::{PostgresBackend, QueryBackend, SqliteBackend};
pub use schema::{InMemorySchemaProvider, SchemaContext, SchemaProvider, SemanticContract};
pub use trace::{InMemoryTraceStore, QueryTrace, SqliteTraceStore, TraceStore};
