//! Structured-output LLM capability.
//!
//! Every LLM-backed stage (recognition, rewriting, HyDE, reranking) goes
//! through one call shape: a prompt plus a JSON schema in, a JSON value or
//! an [`LlmError`] out. Providers enforce `timeout` themselves and report
//! [`LlmError::Timeout`] when it elapses.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::LlmError;

/// A single structured completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Short stage name, used as the schema name and in logs.
    pub task: &'static str,
    pub prompt: String,
    /// JSON schema the output must satisfy.
    pub schema: Value,
    pub timeout: Duration,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &LlmRequest) -> Result<Value, LlmError>;
}

/// Provider used when no LLM is configured. Every call is unavailable,
/// which sends each LLM stage down its fallback path.
pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &LlmRequest) -> Result<Value, LlmError> {
        Err(LlmError::Unavailable("llm provider is disabled".to_string()))
    }
}

/// Read an array field, or fail the whole payload as malformed.
pub(crate) fn array_field<'a>(value: &'a Value, field: &str) -> Result<&'a Vec<Value>, LlmError> {
    value
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Malformed(format!("missing array field '{}'", field)))
}

/// A trimmed, non-empty string field of an entry.
pub(crate) fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
