use crate::config::LlmSettings;
use crate::error::{AgentError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use tracing::debug;

lazy_static! {
    static ref FENCED_JSON: Regex = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap();
}

/// Client for an Ollama-compatible `/api/generate` endpoint
#[derive(Clone)]
pub struct LlmClient {
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self::new(&settings.base_url, &settings.model, Duration::from_secs(settings.timeout_secs))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Raw completion text for a prompt
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {"temperature": 0}
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("LLM API call failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::Llm(format!("LLM API returned {}", response.status())));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["response"]
            .as_str()
            .ok_or_else(|| AgentError::Llm("No content in LLM response".to_string()))?;

        debug!("LLM ({}) returned {} chars", self.model, content.len());
        Ok(content.to_string())
    }

    /// Completion parsed as a single JSON object
    pub async fn generate_json(&self, prompt: &str) -> Result<serde_json::Value> {
        let content = self.generate(prompt).await?;
        extract_json_object(&content)
            .ok_or_else(|| AgentError::Llm("LLM response did not contain a JSON object".to_string()))
    }
}

/// Pull a JSON object out of model output, fenced or inline
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    if let Some(captures) = FENCED_JSON.captures(text) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&captures[1]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&text[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

/// Pull SQL out of model output: a ```sql fence if present, else the text
pub fn extract_sql(text: &str) -> String {
    lazy_static! {
        static ref FENCED_SQL: Regex = Regex::new(r"(?s)```(?:sql)?\s*(.*?)```").unwrap();
    }
    match FENCED_SQL.captures(text) {
        Some(captures) => captures[1].trim().to_string(),
        None => text.trim().to_string(),
    }
}
