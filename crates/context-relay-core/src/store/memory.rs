//! In-memory store for tests and embedded use.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Keyword search is
//! a term-frequency scan, vector search is brute-force cosine similarity.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::RetrievalConfig;
use crate::embedding::cosine_similarity;
use crate::models::{Alias, Chunk, ConversationSource, Entity, KnowledgeEdge, NodeRef};

use super::{
    count_keyword_hits, find_word_span, query_terms, ChunkIndex, ConversationSnapshot,
    ConversationStore, EntityMatch, KnowledgeGraph, PersonaConfigProvider, ScoredChunk,
    SearchFilters,
};

struct StoredChunk {
    persona_id: String,
    chunk: Chunk,
    vector: Option<Vec<f32>>,
}

struct StoredEntity {
    persona_id: String,
    entity: Entity,
}

/// In-memory implementation of every store trait.
pub struct InMemoryStore {
    chunks: RwLock<Vec<StoredChunk>>,
    entities: RwLock<HashMap<String, StoredEntity>>,
    aliases: RwLock<Vec<Alias>>,
    edges: RwLock<Vec<KnowledgeEdge>>,
    conversations: RwLock<HashMap<String, ConversationSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            entities: RwLock::new(HashMap::new()),
            aliases: RwLock::new(Vec::new()),
            edges: RwLock::new(Vec::new()),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_chunk(&self, persona_id: &str, chunk: Chunk, vector: Option<Vec<f32>>) {
        let mut chunks = self.chunks.write().unwrap();
        chunks.retain(|sc| sc.chunk.id != chunk.id);
        chunks.push(StoredChunk {
            persona_id: persona_id.to_string(),
            chunk,
            vector,
        });
    }

    pub fn add_entity(&self, persona_id: &str, entity: Entity) {
        self.entities.write().unwrap().insert(
            entity.id.clone(),
            StoredEntity {
                persona_id: persona_id.to_string(),
                entity,
            },
        );
    }

    pub fn add_alias(&self, alias: Alias) {
        self.aliases.write().unwrap().push(alias);
    }

    pub fn add_edge(&self, edge: KnowledgeEdge) {
        self.edges.write().unwrap().push(edge);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn in_scope(sc: &StoredChunk, filters: &SearchFilters) -> bool {
    sc.persona_id == filters.persona_id && filters.allows(&sc.chunk.document_id)
}

fn sort_desc(candidates: &mut [ScoredChunk]) {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

#[async_trait]
impl ChunkIndex for InMemoryStore {
    async fn keyword_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.chunks.read().unwrap();
        let mut candidates: Vec<ScoredChunk> = chunks
            .iter()
            .filter(|sc| in_scope(sc, filters))
            .filter_map(|sc| {
                let hits = count_keyword_hits(&sc.chunk.content, &terms);
                if hits == 0 {
                    return None;
                }
                let lower = sc.chunk.content.to_lowercase();
                let tf: usize = terms.iter().map(|t| lower.matches(t.as_str()).count()).sum();
                Some(ScoredChunk {
                    chunk: sc.chunk.clone(),
                    score: tf as f64,
                    keyword_hits: hits,
                })
            })
            .collect();
        sort_desc(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let chunks = self.chunks.read().unwrap();
        let mut candidates: Vec<ScoredChunk> = chunks
            .iter()
            .filter(|sc| in_scope(sc, filters))
            .filter_map(|sc| {
                sc.vector.as_ref().map(|v| ScoredChunk {
                    chunk: sc.chunk.clone(),
                    score: cosine_similarity(query_vec, v) as f64,
                    keyword_hits: 0,
                })
            })
            .collect();
        sort_desc(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| chunks.iter().find(|sc| &sc.chunk.id == id))
            .map(|sc| sc.chunk.clone())
            .collect())
    }

    async fn representative_chunks(
        &self,
        filters: &SearchFilters,
        document_ids: &[String],
        per_document: usize,
    ) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().unwrap();
        let mut out = Vec::new();
        for doc_id in document_ids {
            let mut doc_chunks: Vec<&Chunk> = chunks
                .iter()
                .filter(|sc| in_scope(sc, filters) && &sc.chunk.document_id == doc_id)
                .map(|sc| &sc.chunk)
                .collect();
            doc_chunks.sort_by_key(|c| c.chunk_index);
            out.extend(doc_chunks.into_iter().take(per_document).cloned());
        }
        Ok(out)
    }
}

#[async_trait]
impl KnowledgeGraph for InMemoryStore {
    async fn match_entities(&self, persona_id: &str, query: &str) -> Result<Vec<EntityMatch>> {
        let lower = query.to_lowercase();
        let entities = self.entities.read().unwrap();
        let aliases = self.aliases.read().unwrap();
        let mut matches = Vec::new();

        for stored in entities.values().filter(|s| s.persona_id == persona_id) {
            let name = stored.entity.name.to_lowercase();
            if let Some(span) = find_word_span(&lower, &name) {
                matches.push(EntityMatch {
                    entity: stored.entity.clone(),
                    matched: stored.entity.name.clone(),
                    alias_confidence: 1.0,
                    span,
                });
            }
        }
        for alias in aliases.iter() {
            let Some(stored) = entities.get(&alias.entity_id) else {
                continue;
            };
            if stored.persona_id != persona_id {
                continue;
            }
            if let Some(span) = find_word_span(&lower, &alias.alias.to_lowercase()) {
                matches.push(EntityMatch {
                    entity: stored.entity.clone(),
                    matched: alias.alias.clone(),
                    alias_confidence: alias.confidence,
                    span,
                });
            }
        }
        matches.sort_by(|a, b| a.span.cmp(&b.span).then_with(|| a.entity.id.cmp(&b.entity.id)));
        Ok(matches)
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .read()
            .unwrap()
            .get(id)
            .map(|s| s.entity.clone()))
    }

    async fn edges_for(&self, node: &NodeRef) -> Result<Vec<KnowledgeEdge>> {
        let edges = self.edges.read().unwrap();
        Ok(edges
            .iter()
            .filter(|e| &e.src == node || &e.dst == node)
            .cloned()
            .collect())
    }

    async fn aliases_for(&self, entity_id: &str) -> Result<Vec<Alias>> {
        let aliases = self.aliases.read().unwrap();
        Ok(aliases
            .iter()
            .filter(|a| a.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn get_sources(&self, conversation_id: &str) -> Result<ConversationSnapshot> {
        Ok(self
            .conversations
            .read()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_sources(
        &self,
        conversation_id: &str,
        turn: u32,
        sources: &[ConversationSource],
        evicted: &[String],
    ) -> Result<()> {
        let mut conversations = self.conversations.write().unwrap();
        let snapshot = conversations.entry(conversation_id.to_string()).or_default();
        snapshot.turn = turn;
        snapshot
            .sources
            .retain(|s| !evicted.contains(&s.document_id));
        for source in sources {
            match snapshot
                .sources
                .iter_mut()
                .find(|s| s.document_id == source.document_id)
            {
                Some(existing) => *existing = source.clone(),
                None => snapshot.sources.push(source.clone()),
            }
        }
        Ok(())
    }

    async fn set_pinned(
        &self,
        conversation_id: &str,
        document_id: &str,
        pinned: bool,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().unwrap();
        let snapshot = conversations.entry(conversation_id.to_string()).or_default();
        match snapshot
            .sources
            .iter_mut()
            .find(|s| s.document_id == document_id)
        {
            Some(source) => source.pinned = pinned,
            None => {
                let mut source = ConversationSource::fresh(document_id, snapshot.turn, Vec::new());
                source.pinned = pinned;
                snapshot.sources.push(source);
            }
        }
        Ok(())
    }
}

/// Fixed persona → config map with a fallback default.
pub struct StaticPersonas {
    default: RetrievalConfig,
    personas: HashMap<String, RetrievalConfig>,
}

impl StaticPersonas {
    pub fn new(default: RetrievalConfig) -> Self {
        Self {
            default,
            personas: HashMap::new(),
        }
    }

    pub fn with(mut self, persona_id: &str, config: RetrievalConfig) -> Self {
        self.personas.insert(persona_id.to_string(), config);
        self
    }
}

#[async_trait]
impl PersonaConfigProvider for StaticPersonas {
    async fn retrieval_config(&self, persona_id: &str) -> Result<RetrievalConfig> {
        Ok(self
            .personas
            .get(persona_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}
