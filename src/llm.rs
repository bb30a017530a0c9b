//! HTTP LLM providers for structured output.
//!
//! - **[`OpenAIChat`]**: `POST /v1/chat/completions` with a
//!   `json_schema` response format. Works against any OpenAI-compatible
//!   server through `llm.url`.
//! - **[`OllamaChat`]**: `POST /api/chat` with the schema passed as
//!   `format`.
//!
//! The whole call, retries included, runs under the request's timeout;
//! when it elapses the provider returns [`LlmError::Timeout`]. Retrying
//! inside a stage deadline uses a short backoff (100 ms, 200 ms, …).

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use context_relay_core::error::LlmError;
use context_relay_core::llm::{DisabledLlm, LlmProvider, LlmRequest};

use crate::config::LlmConfig;

const SYSTEM_PROMPT: &str =
    "You are a retrieval assistant. Reply with a single JSON object that matches the given schema.";

#[derive(Clone, Copy)]
enum Flavor {
    OpenAI,
    Ollama,
}

struct HttpChat {
    flavor: Flavor,
    model: String,
    url: String,
    api_key: Option<String>,
    max_retries: u32,
    temperature: f32,
    client: reqwest::Client,
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(100 << (attempt - 1).min(4))
}

/// Structured payload inside a chat reply.
fn parse_content(flavor: Flavor, reply: &Value) -> Result<Value, LlmError> {
    let content = match flavor {
        Flavor::OpenAI => reply
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str),
        Flavor::Ollama => reply.pointer("/message/content").and_then(Value::as_str),
    }
    .ok_or_else(|| LlmError::Malformed("reply has no message content".to_string()))?;
    let value: Value = serde_json::from_str(content.trim())
        .map_err(|e| LlmError::Malformed(format!("content is not JSON: {}", e)))?;
    if !value.is_object() {
        return Err(LlmError::Malformed("content is not a JSON object".to_string()));
    }
    Ok(value)
}

impl HttpChat {
    fn body(&self, request: &LlmRequest) -> Value {
        let messages = json!([
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": request.prompt }
        ]);
        match self.flavor {
            Flavor::OpenAI => json!({
                "model": self.model,
                "messages": messages,
                "temperature": self.temperature,
                "response_format": {
                    "type": "json_schema",
                    "json_schema": { "name": request.task, "schema": request.schema }
                }
            }),
            Flavor::Ollama => json!({
                "model": self.model,
                "messages": messages,
                "stream": false,
                "format": request.schema,
                "options": { "temperature": self.temperature }
            }),
        }
    }

    async fn call(&self, request: &LlmRequest) -> Result<Value, LlmError> {
        let body = self.body(request);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            let mut http = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                http = http.header("Authorization", format!("Bearer {}", key));
            }

            match http.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let reply: Value = response
                            .json()
                            .await
                            .map_err(|e| LlmError::Malformed(e.to_string()))?;
                        return parse_content(self.flavor, &reply);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("HTTP {}: {}", status, text));
                        continue;
                    }
                    return Err(LlmError::Unavailable(format!("HTTP {}: {}", status, text)));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(LlmError::Unavailable(
            last_err.unwrap_or_else(|| "llm call failed after retries".to_string()),
        ))
    }
}

#[async_trait]
impl LlmProvider for HttpChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &LlmRequest) -> Result<Value, LlmError> {
        let budget_ms = request.timeout.as_millis() as u64;
        match tokio::time::timeout(request.timeout, self.call(request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(task = request.task, budget_ms, "llm call timed out");
                Err(LlmError::Timeout(budget_ms))
            }
        }
    }
}

/// OpenAI-compatible chat provider. Requires `OPENAI_API_KEY`.
pub struct OpenAIChat;

impl OpenAIChat {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or("https://api.openai.com");
        build(
            config,
            Flavor::OpenAI,
            format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            Some(api_key),
        )
    }
}

/// Local Ollama chat provider.
pub struct OllamaChat;

impl OllamaChat {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
        let base = config.url.as_deref().unwrap_or("http://localhost:11434");
        build(
            config,
            Flavor::Ollama,
            format!("{}/api/chat", base.trim_end_matches('/')),
            None,
        )
    }
}

fn build(
    config: &LlmConfig,
    flavor: Flavor,
    url: String,
    api_key: Option<String>,
) -> Result<Arc<dyn LlmProvider>> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow!("llm.model required when provider is '{}'", config.provider))?;
    Ok(Arc::new(HttpChat {
        flavor,
        model,
        url,
        api_key,
        max_retries: config.max_retries,
        temperature: config.temperature,
        client: reqwest::Client::builder().build()?,
    }))
}

pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => OpenAIChat::new(config),
        "ollama" => OllamaChat::new(config),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_content_is_parsed_as_json() {
        let reply = json!({ "choices": [{ "message": { "content": "{\"passages\": [\"a\"]}" } }] });
        let v = parse_content(Flavor::OpenAI, &reply).unwrap();
        assert_eq!(v["passages"][0], "a");
    }

    #[test]
    fn non_json_content_is_malformed() {
        let reply = json!({ "message": { "content": "sure! here you go" } });
        assert!(matches!(
            parse_content(Flavor::Ollama, &reply),
            Err(LlmError::Malformed(_))
        ));
        let array = json!({ "message": { "content": "[1, 2]" } });
        assert!(matches!(
            parse_content(Flavor::Ollama, &array),
            Err(LlmError::Malformed(_))
        ));
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        assert_eq!(retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(200));
        assert_eq!(retry_delay(9), Duration::from_millis(1600));
    }

    #[test]
    fn disabled_provider_selected_by_default() {
        let llm = create_llm(&LlmConfig::default()).unwrap();
        assert_eq!(llm.model_name(), "disabled");
    }
}
