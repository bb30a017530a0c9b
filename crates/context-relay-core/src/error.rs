//! Error taxonomy for the retrieval path.
//!
//! Stage-local problems never surface as errors: they are recorded as
//! [`StageFailure`]s in the query stats and the stage contributes an
//! empty result. Only [`RetrievalError`] reaches the caller.

use serde::Serialize;
use thiserror::Error;

/// Errors that abort a query.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Lexical, vector and graph signals were all unreachable.
    #[error("all retrieval signals unavailable: {0}")]
    AllSignalsUnavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("persona configuration unavailable for '{persona}': {source}")]
    Persona {
        persona: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("conversation store failed: {0}")]
    Store(#[source] anyhow::Error),
}

/// Failure modes of an [`LlmProvider`](crate::llm::LlmProvider) call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm call timed out after {0} ms")]
    Timeout(u64),
    #[error("llm provider unavailable: {0}")]
    Unavailable(String),
    #[error("llm output did not match schema: {0}")]
    Malformed(String),
}

/// Pipeline stage names, used in stats and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Recognition,
    Rewriting,
    Hyde,
    Lexical,
    Vector,
    Graph,
    Rerank,
    Conversation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Recognition => "recognition",
            Stage::Rewriting => "rewriting",
            Stage::Hyde => "hyde",
            Stage::Lexical => "lexical",
            Stage::Vector => "vector",
            Stage::Graph => "graph",
            Stage::Rerank => "rerank",
            Stage::Conversation => "conversation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Error,
    Malformed,
}

/// A swallowed stage error, kept for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(stage: Stage, budget_ms: u64) -> Self {
        Self::new(
            stage,
            FailureKind::Timeout,
            format!("{} exceeded {} ms", stage.as_str(), budget_ms),
        )
    }

    pub fn from_llm(stage: Stage, err: &LlmError) -> Self {
        let kind = match err {
            LlmError::Timeout(_) => FailureKind::Timeout,
            LlmError::Unavailable(_) => FailureKind::Error,
            LlmError::Malformed(_) => FailureKind::Malformed,
        };
        Self::new(stage, kind, err.to_string())
    }
}
