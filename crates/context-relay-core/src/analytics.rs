//! Per-query statistics and the analytics sink interface.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StageFailure;
use crate::recognizer::Intent;

/// A retrieval tier that contributed to a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Lexical,
    Vector,
    Graph,
    Rewrite,
    Hyde,
    Rerank,
    Carryover,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Lexical => "lexical",
            Tier::Vector => "vector",
            Tier::Graph => "graph",
            Tier::Rewrite => "rewrite",
            Tier::Hyde => "hyde",
            Tier::Rerank => "rerank",
            Tier::Carryover => "carryover",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub query_type: Intent,
    pub average_similarity: f64,
    pub retrieval_time_ms: u64,
    pub tiers_used: Vec<Tier>,
    /// Names of the recognized entities.
    pub entities_used: Vec<String>,
    pub graph_expansions: usize,
    pub reranking_used: bool,
    pub cache_hit: bool,
    pub stage_failures: Vec<StageFailure>,
}

impl Default for QueryStats {
    fn default() -> Self {
        Self {
            query_type: Intent::Unknown,
            average_similarity: 0.0,
            retrieval_time_ms: 0,
            tiers_used: Vec::new(),
            entities_used: Vec::new(),
            graph_expansions: 0,
            reranking_used: false,
            cache_hit: false,
            stage_failures: Vec::new(),
        }
    }
}

impl QueryStats {
    pub fn add_tier(&mut self, tier: Tier) {
        if !self.tiers_used.contains(&tier) {
            self.tiers_used.push(tier);
            self.tiers_used.sort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Answered,
    NoRelevantContent,
    Failed,
}

impl QueryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::Answered => "answered",
            QueryOutcome::NoRelevantContent => "no_relevant_content",
            QueryOutcome::Failed => "failed",
        }
    }
}

/// One analytics event per query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub persona_id: String,
    pub conversation_id: Option<String>,
    /// Hex digest of the normalized query; raw text is never recorded.
    pub query_hash: String,
    pub outcome: QueryOutcome,
    pub chunk_count: usize,
    pub stats: QueryStats,
    pub recorded_at: DateTime<Utc>,
}

/// Receives one [`QueryRecord`] per query.
///
/// Implementations must not block the caller; delivery is best effort.
pub trait AnalyticsSink: Send + Sync {
    fn record(&self, record: QueryRecord);
}

/// Drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl AnalyticsSink for NoopSink {
    fn record(&self, _record: QueryRecord) {}
}
