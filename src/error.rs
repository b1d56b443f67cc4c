use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Safety rejected: {0}")]
    SafetyRejected(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Retry budget exhausted: {0}")]
    RetryBudgetExhausted(String),

    #[error("Stale schema: planned against {planned}, current is {current}")]
    StaleSchema { planned: String, current: String },

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("SQL synthesis error: {0}")]
    Synthesis(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Trace store error: {0}")]
    Trace(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<sqlx::Error> for AgentError {
    fn from(err: sqlx::Error) -> Self {
        AgentError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Llm(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
