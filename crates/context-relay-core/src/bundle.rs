//! Request and response shapes of a retrieval query.

use serde::{Deserialize, Serialize};

use crate::analytics::QueryStats;
use crate::error::RetrievalError;
use crate::models::{Chunk, Citation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    /// No rewriting, HyDE or reranking; shallow graph walk, smaller pool.
    Fast,
    #[default]
    Comprehensive,
}

/// Per-request stage toggles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub use_query_rewriting: bool,
    #[serde(rename = "useHyDE", alias = "useHyde")]
    pub use_hyde: bool,
    pub use_reranking: bool,
    pub use_graph_expansion: bool,
    /// Overrides the persona's `final_k` when set.
    pub max_chunks: Option<usize>,
    pub performance_mode: PerformanceMode,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_query_rewriting: true,
            use_hyde: true,
            use_reranking: true,
            use_graph_expansion: true,
            max_chunks: None,
            performance_mode: PerformanceMode::Comprehensive,
        }
    }
}

impl QueryOptions {
    /// Options after applying the performance mode.
    pub fn effective(&self) -> Self {
        match self.performance_mode {
            PerformanceMode::Comprehensive => self.clone(),
            PerformanceMode::Fast => Self {
                use_query_rewriting: false,
                use_hyde: false,
                use_reranking: false,
                ..self.clone()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    pub persona_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id_filter: Option<Vec<String>>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, persona_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            persona_id: persona_id.into(),
            conversation_id: None,
            document_id_filter: None,
            options: QueryOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.query.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest("query must not be empty".into()));
        }
        if self.persona_id.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest("personaId must not be empty".into()));
        }
        if self.options.max_chunks == Some(0) {
            return Err(RetrievalError::InvalidRequest("maxChunks must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOrigin {
    Retrieved,
    Carried,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    /// Rerank score when present, fused score otherwise, carry score for
    /// carried chunks.
    pub score: f64,
    pub origin: ChunkOrigin,
}

impl ContextChunk {
    pub fn retrieved(chunk: Chunk, score: f64) -> Self {
        Self {
            chunk,
            score,
            origin: ChunkOrigin::Retrieved,
        }
    }

    pub fn carried(chunk: Chunk, score: f64) -> Self {
        Self {
            chunk,
            score,
            origin: ChunkOrigin::Carried,
        }
    }
}

/// What the answer generator receives.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBundle {
    pub chunks: Vec<ContextChunk>,
    pub citations: Vec<Citation>,
    pub stats: QueryStats,
    pub has_relevant_content: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Conversation turn this bundle belongs to, 0 without a conversation.
    pub turn: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_accepts_wire_shape() {
        let req: QueryRequest = serde_json::from_value(json!({
            "query": "what is leia?",
            "personaId": "eng",
            "documentIdFilter": ["d1"],
            "options": { "useHyDE": false, "performanceMode": "fast", "maxChunks": 4 }
        }))
        .unwrap();
        assert_eq!(req.persona_id, "eng");
        assert!(!req.options.use_hyde);
        assert!(req.options.use_query_rewriting);
        assert_eq!(req.options.max_chunks, Some(4));
        assert_eq!(req.options.performance_mode, PerformanceMode::Fast);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn fast_mode_disables_llm_stages() {
        let opts = QueryOptions {
            performance_mode: PerformanceMode::Fast,
            ..Default::default()
        }
        .effective();
        assert!(!opts.use_query_rewriting && !opts.use_hyde && !opts.use_reranking);
        assert!(opts.use_graph_expansion);
    }

    #[test]
    fn empty_query_is_rejected() {
        let req = QueryRequest::new("   ", "p");
        assert!(matches!(req.validate(), Err(RetrievalError::InvalidRequest(_))));
    }
}
