//! External collaborator seams
//!
//! The fabric core treats the natural-language translator and the analytical
//! query executor as external services behind thin interfaces. Translation
//! and formatting are CPU-bound and blocking; callers dispatch them through
//! `tokio::task::spawn_blocking` so the inbox event loop never stalls.

use crate::error::{FabricError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Natural-language translation seam.
///
/// `translate` turns a user question into a structured query string;
/// `format` turns result rows back into natural language. Both are blocking.
pub trait Translator: Send + Sync {
    fn translate(&self, question: &str) -> Result<String>;
    fn format(&self, question: &str, rows: &[Value]) -> Result<String>;
}

/// Trivial translator that passes the question through unchanged and dumps
/// rows as JSON. Lets a fabric run end-to-end without a language model.
pub struct PassthroughTranslator;

impl Translator for PassthroughTranslator {
    fn translate(&self, question: &str) -> Result<String> {
        Ok(question.trim().to_string())
    }

    fn format(&self, _question: &str, rows: &[Value]) -> Result<String> {
        serde_json::to_string(rows).map_err(FabricError::from)
    }
}

/// Structured-query execution seam
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Value>>;
}

/// Executes queries against the external tool endpoint
/// (`GET {base}/tool/consulta?sql=...`, rows under `resultado`)
pub struct ToolClient {
    base_url: String,
    http: reqwest::Client,
}

impl ToolClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl QueryExecutor for ToolClient {
    async fn execute(&self, sql: &str) -> Result<Vec<Value>> {
        let response = self
            .http
            .get(format!("{}/tool/consulta", self.base_url))
            .query(&[("sql", sql)])
            .send()
            .await
            .map_err(|e| FabricError::Tool(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FabricError::Tool(format!(
                "tool endpoint returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| FabricError::Tool(e.to_string()))?;
        Ok(body
            .get("resultado")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}
