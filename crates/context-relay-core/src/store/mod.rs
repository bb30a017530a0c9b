//! Collaborator abstractions for the retrieval core.
//!
//! The engine reads chunks through [`ChunkIndex`], walks the knowledge
//! graph through [`KnowledgeGraph`], keeps multi-turn carry-over state
//! in a [`ConversationStore`] and resolves tuning through a
//! [`PersonaConfigProvider`]. Every trait is object safe and
//! `Send + Sync` so the app crate can hold them behind `Arc<dyn _>`.
//!
//! # Operations
//!
//! | Trait | Method | Purpose |
//! |-------|--------|---------|
//! | [`ChunkIndex`] | `keyword_search` | Ranked keyword scoring with hit counts |
//! | [`ChunkIndex`] | `vector_search` | Nearest-neighbor similarity |
//! | [`ChunkIndex`] | `get_chunks` | Materialize carried-over chunks |
//! | [`ChunkIndex`] | `representative_chunks` | Chunks for graph-linked documents |
//! | [`KnowledgeGraph`] | `match_entities` | Alias/name substring lookup |
//! | [`KnowledgeGraph`] | `edges_for` | Incoming and outgoing edges of a node |
//! | [`ConversationStore`] | `get_sources` / `upsert_sources` | Carry-over state |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::models::{Alias, Chunk, ConversationSource, Entity, KnowledgeEdge, NodeRef};

/// Persona scope plus the optional "stay within these sources" allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct SearchFilters {
    pub persona_id: String,
    pub document_ids: Option<Vec<String>>,
}

impl SearchFilters {
    pub fn for_persona(persona_id: &str) -> Self {
        Self {
            persona_id: persona_id.to_string(),
            document_ids: None,
        }
    }

    pub fn allows(&self, document_id: &str) -> bool {
        match &self.document_ids {
            Some(ids) => ids.iter().any(|id| id == document_id),
            None => true,
        }
    }
}

/// A chunk with one modality's raw score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// BM25-style score for keyword search, similarity for vector search.
    pub score: f64,
    /// Distinct query terms present in the chunk (0 for vector results).
    pub keyword_hits: u32,
}

/// Read-only lexical + vector index over chunks.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    async fn keyword_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>>;

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Fetch chunks by id, preserving the order of `ids`; unknown ids are skipped.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// The first `per_document` chunks (by position) of each document.
    async fn representative_chunks(
        &self,
        filters: &SearchFilters,
        document_ids: &[String],
        per_document: usize,
    ) -> Result<Vec<Chunk>>;
}

/// An alias or canonical name found inside a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityMatch {
    pub entity: Entity,
    /// The surface form that matched (alias text or canonical name).
    pub matched: String,
    pub alias_confidence: f64,
    /// Byte range of the match in the lowercased query.
    pub span: (usize, usize),
}

/// Knowledge graph read surface.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn match_entities(&self, persona_id: &str, query: &str) -> Result<Vec<EntityMatch>>;

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;

    /// Outgoing and incoming edges touching `node`.
    async fn edges_for(&self, node: &NodeRef) -> Result<Vec<KnowledgeEdge>>;

    async fn aliases_for(&self, entity_id: &str) -> Result<Vec<Alias>>;
}

/// Carry-over state of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationSnapshot {
    /// Last completed turn, 0 for a new conversation.
    pub turn: u32,
    pub sources: Vec<ConversationSource>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_sources(&self, conversation_id: &str) -> Result<ConversationSnapshot>;

    /// Persist the turn counter, upsert `sources` and delete `evicted`.
    async fn upsert_sources(
        &self,
        conversation_id: &str,
        turn: u32,
        sources: &[ConversationSource],
        evicted: &[String],
    ) -> Result<()>;

    /// Set the pinned flag, creating the source if it does not exist yet.
    async fn set_pinned(&self, conversation_id: &str, document_id: &str, pinned: bool)
        -> Result<()>;
}

#[async_trait]
pub trait PersonaConfigProvider: Send + Sync {
    async fn retrieval_config(&self, persona_id: &str) -> Result<RetrievalConfig>;
}

/// Locate `needle` in `haystack` on word boundaries.
///
/// Both inputs must already be lowercased. Returns the byte range of the
/// first boundary-aligned occurrence.
pub fn find_word_span(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some((start, end));
        }
        from = start + haystack[start..].chars().next().map_or(1, char::len_utf8);
    }
    None
}

/// Lowercased alphanumeric terms of a query, deduplicated, in order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in query.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        let term = raw.to_lowercase();
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Number of distinct `terms` present in `text`.
pub fn count_keyword_hits(text: &str, terms: &[String]) -> u32 {
    let lower = text.to_lowercase();
    terms
        .iter()
        .filter(|t| find_word_span(&lower, t).is_some())
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_span_respects_boundaries() {
        assert_eq!(find_word_span("what is openai doing", "openai"), Some((8, 14)));
        assert_eq!(find_word_span("openaix and openai", "openai"), Some((12, 18)));
        assert_eq!(find_word_span("reopenai", "openai"), None);
        assert_eq!(find_word_span("anything", ""), None);
    }

    #[test]
    fn query_terms_dedupe_and_lowercase() {
        assert_eq!(
            query_terms("What is GPT-4? gpt rocks"),
            vec!["what", "is", "gpt", "4", "rocks"]
        );
    }

    #[test]
    fn keyword_hits_count_distinct_terms() {
        let terms = query_terms("rust cargo python");
        assert_eq!(count_keyword_hits("Rust uses cargo. Rust!", &terms), 2);
        assert_eq!(count_keyword_hits("nothing here", &terms), 0);
    }

    #[test]
    fn filters_allowlist() {
        let mut f = SearchFilters::for_persona("p");
        assert!(f.allows("d1"));
        f.document_ids = Some(vec!["d2".to_string()]);
        assert!(!f.allows("d1"));
        assert!(f.allows("d2"));
    }
}
