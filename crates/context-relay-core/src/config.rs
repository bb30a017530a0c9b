//! Persona-scoped retrieval tuning.
//!
//! [`RetrievalConfig`] is owned by the persona configuration provider and
//! only read here. Values arrive unvalidated; [`RetrievalConfig::sanitized`]
//! clamps every bounded quantity and logs what it changed, so a bad
//! persona record degrades ranking quality instead of failing queries.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Minimum raw vector similarity for the dual gate.
    pub vector_threshold: f64,
    /// Minimum distinct query terms a chunk must contain for the dual gate.
    pub min_keyword_hits: u32,
    /// Distinct documents required before the bundle counts as relevant.
    pub min_supporting_documents: u32,
    pub vector_weight: f64,
    pub lexical_weight: f64,
    pub graph_weight: f64,
    /// Graph-sourced candidates below this boost are dropped.
    pub graph_boost_threshold: f64,
    pub decay_factor: f64,
    pub max_carried_sources: usize,
    pub turn_ttl: u32,
    /// Carried sources whose score falls below this are evicted.
    pub carry_floor: f64,
    pub rerank_enabled: bool,
    pub rerank_model: String,
    pub candidate_pool_size: usize,
    pub rerank_top_n: usize,
    pub final_k: usize,
    pub max_supporting_chunks: usize,
    pub max_rewrites: usize,
    pub max_hyde_passages: usize,
    pub max_expansion_keywords: usize,
    pub graph_max_depth: usize,
    pub min_edge_confidence: f64,
    pub max_graph_terms: usize,
    pub max_graph_documents: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_threshold: 0.35,
            min_keyword_hits: 1,
            min_supporting_documents: 1,
            vector_weight: 0.7,
            lexical_weight: 0.3,
            graph_weight: 0.2,
            graph_boost_threshold: 0.05,
            decay_factor: 0.7,
            max_carried_sources: 5,
            turn_ttl: 3,
            carry_floor: 0.05,
            rerank_enabled: true,
            rerank_model: "llm".to_string(),
            candidate_pool_size: 40,
            rerank_top_n: 15,
            final_k: 8,
            max_supporting_chunks: 2,
            max_rewrites: 3,
            max_hyde_passages: 3,
            max_expansion_keywords: 5,
            graph_max_depth: 2,
            min_edge_confidence: 0.3,
            max_graph_terms: 8,
            max_graph_documents: 10,
        }
    }
}

fn clamp_unit(name: &str, value: f64) -> f64 {
    if value.is_nan() {
        warn!(field = name, "retrieval value is NaN, using 0.0");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&value) {
        let clamped = value.clamp(0.0, 1.0);
        warn!(field = name, value, clamped, "retrieval value out of [0, 1], clamped");
        return clamped;
    }
    value
}

fn at_least_one(name: &str, value: usize) -> usize {
    if value == 0 {
        warn!(field = name, "retrieval count is 0, raised to 1");
        return 1;
    }
    value
}

impl RetrievalConfig {
    /// Return a copy with every bounded value forced into range.
    pub fn sanitized(&self) -> Self {
        let mut c = self.clone();
        c.vector_threshold = clamp_unit("vector_threshold", c.vector_threshold);
        c.vector_weight = clamp_unit("vector_weight", c.vector_weight);
        c.lexical_weight = clamp_unit("lexical_weight", c.lexical_weight);
        c.graph_weight = clamp_unit("graph_weight", c.graph_weight);
        c.graph_boost_threshold = clamp_unit("graph_boost_threshold", c.graph_boost_threshold);
        c.decay_factor = clamp_unit("decay_factor", c.decay_factor);
        c.carry_floor = clamp_unit("carry_floor", c.carry_floor);
        c.min_edge_confidence = clamp_unit("min_edge_confidence", c.min_edge_confidence);
        c.candidate_pool_size = at_least_one("candidate_pool_size", c.candidate_pool_size);
        c.rerank_top_n = at_least_one("rerank_top_n", c.rerank_top_n);
        c.final_k = at_least_one("final_k", c.final_k);
        c
    }
}
