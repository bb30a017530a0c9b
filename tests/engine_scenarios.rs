//! End-to-end engine scenarios over the in-memory store.
//!
//! Each test builds an [`Engine`] from `InMemoryStore` plus a scripted LLM
//! and a keyword embedder, then checks one observable behavior of a query:
//! graph injection, relevance gating, carry-over, stage timeouts, fast
//! mode, caching and the all-signals-down error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use context_relay::cache::ResultCache;
use context_relay::config::{CacheConfig, StageConfig};
use context_relay::engine::Engine;
use context_relay_core::analytics::{AnalyticsSink, NoopSink, QueryOutcome, QueryRecord, Tier};
use context_relay_core::bundle::{ChunkOrigin, PerformanceMode, QueryOptions, QueryRequest};
use context_relay_core::config::RetrievalConfig;
use context_relay_core::embedding::Embedder;
use context_relay_core::error::{FailureKind, LlmError, RetrievalError, Stage};
use context_relay_core::llm::{LlmProvider, LlmRequest};
use context_relay_core::models::{
    Alias, Chunk, Entity, EntityKind, KnowledgeEdge, NodeRef, RelationType,
};
use context_relay_core::store::memory::{InMemoryStore, StaticPersonas};
use context_relay_core::store::{
    ChunkIndex, EntityMatch, KnowledgeGraph, ScoredChunk, SearchFilters,
};

const PERSONA: &str = "research";

// ─── doubles ─────────────────────────────────────────────────────────────

enum Reply {
    Json(Value),
    Sleep(Duration),
}

/// LLM keyed by `LlmRequest::task`. Unscripted tasks are unavailable.
#[derive(Default)]
struct ScriptedLlm {
    replies: HashMap<&'static str, Reply>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedLlm {
    fn reply(mut self, task: &'static str, value: Value) -> Self {
        self.replies.insert(task, Reply::Json(value));
        self
    }

    fn sleep(mut self, task: &'static str, ms: u64) -> Self {
        self.replies.insert(task, Reply::Sleep(Duration::from_millis(ms)));
        self
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<Value, LlmError> {
        self.calls.lock().unwrap().push(request.task);
        match self.replies.get(request.task) {
            Some(Reply::Json(v)) => Ok(v.clone()),
            Some(Reply::Sleep(d)) => {
                tokio::time::sleep(*d).await;
                Err(LlmError::Unavailable("woke up too late".to_string()))
            }
            None => Err(LlmError::Unavailable(format!("{} not scripted", request.task))),
        }
    }
}

/// One axis per topic word plus one for anything else.
struct KeywordEmbedder;

const TOPICS: [&str; 3] = ["rust", "banana", "openai"];

fn keyword_vector(text: &str) -> Vec<f32> {
    let t = text.to_lowercase();
    let mut v: Vec<f32> = TOPICS
        .iter()
        .map(|topic| if t.contains(topic) { 1.0 } else { 0.0 })
        .collect();
    v.push(if v.iter().any(|x| *x > 0.0) { 0.0 } else { 1.0 });
    v
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }
    fn dims(&self) -> usize {
        TOPICS.len() + 1
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }
}

/// Index and graph that are always down.
struct DownStore;

#[async_trait]
impl ChunkIndex for DownStore {
    async fn keyword_search(&self, _q: &str, _f: &SearchFilters, _l: usize) -> Result<Vec<ScoredChunk>> {
        bail!("index offline")
    }
    async fn vector_search(&self, _v: &[f32], _f: &SearchFilters, _l: usize) -> Result<Vec<ScoredChunk>> {
        bail!("index offline")
    }
    async fn get_chunks(&self, _ids: &[String]) -> Result<Vec<Chunk>> {
        bail!("index offline")
    }
    async fn representative_chunks(
        &self,
        _f: &SearchFilters,
        _docs: &[String],
        _per: usize,
    ) -> Result<Vec<Chunk>> {
        bail!("index offline")
    }
}

#[async_trait]
impl KnowledgeGraph for DownStore {
    async fn match_entities(&self, _persona: &str, _query: &str) -> Result<Vec<EntityMatch>> {
        bail!("graph offline")
    }
    async fn get_entity(&self, _id: &str) -> Result<Option<Entity>> {
        bail!("graph offline")
    }
    async fn edges_for(&self, _node: &NodeRef) -> Result<Vec<KnowledgeEdge>> {
        bail!("graph offline")
    }
    async fn aliases_for(&self, _entity_id: &str) -> Result<Vec<Alias>> {
        bail!("graph offline")
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<QueryRecord>>);

impl AnalyticsSink for RecordingSink {
    fn record(&self, record: QueryRecord) {
        self.0.lock().unwrap().push(record);
    }
}

// ─── fixtures ────────────────────────────────────────────────────────────

fn chunk(id: &str, doc: &str, index: i64, content: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        document_id: doc.to_string(),
        content: content.to_string(),
        token_count: content.split_whitespace().count() as u32,
        chunk_index: index,
        page_start: Some(1),
        page_end: Some(1),
        section: None,
    }
}

fn entity(id: &str, name: &str, kind: EntityKind) -> Entity {
    Entity {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        description: String::new(),
        authority: 0.8,
        mention_count: 3,
    }
}

fn edge(id: &str, src: NodeRef, dst: NodeRef, relation: RelationType, weight: f64) -> KnowledgeEdge {
    KnowledgeEdge {
        id: id.to_string(),
        src,
        dst,
        relation,
        weight,
        evidence_text: None,
        evidence_document_id: None,
    }
}

fn add(store: &InMemoryStore, c: Chunk) {
    let v = keyword_vector(&c.content);
    store.add_chunk(PERSONA, c, Some(v));
}

/// A small corpus: rust, bananas, and an OpenAI product graph.
fn corpus() -> InMemoryStore {
    let s = InMemoryStore::new();
    add(&s, chunk("rust-0", "doc-rust", 0, "Rust ownership moves values between bindings."));
    add(&s, chunk("rust-1", "doc-rust", 1, "The Rust borrow checker enforces aliasing rules."));
    add(&s, chunk("banana-0", "doc-banana", 0, "Bananas are rich in potassium."));
    add(&s, chunk("openai-0", "doc-openai", 0, "OpenAI was founded in 2015 as a research lab."));
    // only reachable through the graph: no query term and no useful vector
    s.add_chunk(
        PERSONA,
        chunk("gpt4-0", "doc-gpt4", 0, "A large multimodal model released in March 2023."),
        None,
    );

    s.add_entity(PERSONA, entity("openai", "OpenAI", EntityKind::Organization));
    s.add_entity(PERSONA, entity("gpt4", "GPT-4", EntityKind::Product));
    s.add_entity(PERSONA, entity("dalle", "DALL-E", EntityKind::Product));
    s.add_chunk(
        PERSONA,
        chunk("dalle-0", "doc-dalle", 0, "An image generator driven by text prompts."),
        None,
    );
    s.add_edge(edge(
        "e1",
        NodeRef::Entity("openai".to_string()),
        NodeRef::Entity("gpt4".to_string()),
        RelationType::Develops,
        0.9,
    ));
    s.add_edge(edge(
        "e2",
        NodeRef::Document("doc-gpt4".to_string()),
        NodeRef::Entity("gpt4".to_string()),
        RelationType::Mentions,
        0.9,
    ));
    s.add_edge(edge(
        "e3",
        NodeRef::Entity("openai".to_string()),
        NodeRef::Entity("dalle".to_string()),
        RelationType::Develops,
        0.8,
    ));
    s.add_edge(edge(
        "e4",
        NodeRef::Document("doc-dalle".to_string()),
        NodeRef::Entity("dalle".to_string()),
        RelationType::Mentions,
        0.8,
    ));
    s
}

fn engine_with(store: Arc<InMemoryStore>, llm: Arc<dyn LlmProvider>, cfg: RetrievalConfig) -> Engine {
    Engine::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(StaticPersonas::new(cfg)),
        Arc::new(KeywordEmbedder),
        llm,
    )
}

fn engine(llm: Arc<dyn LlmProvider>) -> Engine {
    engine_with(Arc::new(corpus()), llm, RetrievalConfig::default())
}

fn request(query: &str) -> QueryRequest {
    QueryRequest {
        query: query.to_string(),
        persona_id: PERSONA.to_string(),
        conversation_id: None,
        document_id_filter: None,
        options: QueryOptions::default(),
    }
}

fn in_conversation(query: &str, conversation: &str) -> QueryRequest {
    QueryRequest {
        conversation_id: Some(conversation.to_string()),
        ..request(query)
    }
}

fn documents(bundle: &context_relay_core::bundle::ContextBundle) -> Vec<&str> {
    let mut docs: Vec<&str> = bundle.chunks.iter().map(|c| c.chunk.document_id.as_str()).collect();
    docs.dedup();
    docs
}

// ─── scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn graph_linked_document_is_injected() {
    let engine = engine(Arc::new(ScriptedLlm::default()));
    let bundle = engine
        .query(&request("What products has OpenAI developed?"), &NoopSink)
        .await
        .unwrap();

    assert!(bundle.has_relevant_content);
    assert!(documents(&bundle).contains(&"doc-gpt4"));
    assert!(documents(&bundle).contains(&"doc-dalle"));
    assert!(bundle.stats.tiers_used.contains(&Tier::Graph));
    assert!(bundle.stats.graph_expansions > 0);
    assert_eq!(bundle.stats.entities_used, vec!["OpenAI"]);
    assert!(bundle.citations.iter().any(|c| c.document_id == "doc-gpt4"));
}

#[tokio::test]
async fn slow_recognition_keeps_graph_matches() {
    let llm = ScriptedLlm::default().sleep("entity_recognition", 500);
    let slow = engine(Arc::new(llm)).with_stages(StageConfig {
        recognition_ms: 50,
        ..StageConfig::default()
    });
    let bundle = slow
        .query(&request("What products has OpenAI developed?"), &NoopSink)
        .await
        .unwrap();

    assert_eq!(bundle.stats.entities_used, vec!["OpenAI"]);
    assert!(bundle
        .stats
        .stage_failures
        .iter()
        .any(|f| f.stage == Stage::Recognition && f.kind == FailureKind::Timeout));
    assert!(documents(&bundle).contains(&"doc-gpt4"));
    assert!(documents(&bundle).contains(&"doc-dalle"));
    assert!(bundle.stats.tiers_used.contains(&Tier::Graph));
}

#[tokio::test]
async fn irrelevant_matches_are_gated_out() {
    let engine = engine(Arc::new(ScriptedLlm::default()));
    let bundle = engine
        .query(&request("rust ownership"), &NoopSink)
        .await
        .unwrap();

    assert!(bundle.has_relevant_content);
    assert_eq!(documents(&bundle), vec!["doc-rust"]);
    assert_eq!(bundle.citations.len(), 1);
    assert_eq!(bundle.citations[0].marker, "[1]");
}

#[tokio::test]
async fn no_matches_report_no_relevant_content() {
    let sink = RecordingSink::default();
    let engine = engine(Arc::new(ScriptedLlm::default()));
    let bundle = engine
        .query(&request("quantum chromodynamics"), &sink)
        .await
        .unwrap();

    assert!(!bundle.has_relevant_content);
    assert!(bundle.chunks.is_empty());
    assert!(bundle.citations.is_empty());

    let records = sink.0.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].outcome, QueryOutcome::NoRelevantContent));
}

#[tokio::test]
async fn sources_carry_over_to_the_next_turn() {
    let engine = engine(Arc::new(ScriptedLlm::default()));

    let first = engine
        .query(&in_conversation("rust ownership", "c1"), &NoopSink)
        .await
        .unwrap();
    assert_eq!(first.turn, 1);
    assert!(first.chunks.iter().all(|c| c.origin == ChunkOrigin::Retrieved));

    let second = engine
        .query(&in_conversation("bananas", "c1"), &NoopSink)
        .await
        .unwrap();
    assert_eq!(second.turn, 2);
    assert_eq!(second.conversation_id.as_deref(), Some("c1"));
    assert!(second.stats.tiers_used.contains(&Tier::Carryover));

    let carried: Vec<&str> = second
        .chunks
        .iter()
        .filter(|c| c.origin == ChunkOrigin::Carried)
        .map(|c| c.chunk.document_id.as_str())
        .collect();
    assert!(!carried.is_empty());
    assert!(carried.iter().all(|d| *d == "doc-rust"));
    // this turn's retrieval comes first
    assert_eq!(second.chunks[0].chunk.document_id, "doc-banana");

    let snapshot = engine.sources("c1").await.unwrap();
    assert_eq!(snapshot.turn, 2);
    let rust = snapshot
        .sources
        .iter()
        .find(|s| s.document_id == "doc-rust")
        .unwrap();
    assert_eq!(rust.turns_inactive, 1);
    assert!(rust.carry_score < 1.0);
}

#[tokio::test]
async fn unused_source_decays_then_is_evicted() {
    let engine = engine(Arc::new(ScriptedLlm::default()));
    engine
        .query(&in_conversation("rust ownership", "c3"), &NoopSink)
        .await
        .unwrap();
    for _ in 0..3 {
        engine
            .query(&in_conversation("bananas", "c3"), &NoopSink)
            .await
            .unwrap();
    }

    let snapshot = engine.sources("c3").await.unwrap();
    assert_eq!(snapshot.turn, 4);
    let rust = snapshot
        .sources
        .iter()
        .find(|s| s.document_id == "doc-rust")
        .unwrap();
    assert_eq!(rust.turns_inactive, 3);
    assert!((rust.carry_score - 0.343).abs() < 1e-9);

    let fifth = engine
        .query(&in_conversation("bananas", "c3"), &NoopSink)
        .await
        .unwrap();
    assert!(fifth.chunks.iter().all(|c| c.chunk.document_id != "doc-rust"));
    let snapshot = engine.sources("c3").await.unwrap();
    assert!(snapshot.sources.iter().all(|s| s.document_id != "doc-rust"));
}

#[tokio::test]
async fn concurrent_turns_on_one_conversation_are_serialized() {
    let engine = engine(Arc::new(ScriptedLlm::default()));
    let first = in_conversation("rust ownership", "c5");
    let second = in_conversation("bananas", "c5");
    let (a, b) = tokio::join!(
        engine.query(&first, &NoopSink),
        engine.query(&second, &NoopSink)
    );

    let mut turns = vec![a.unwrap().turn, b.unwrap().turn];
    turns.sort();
    assert_eq!(turns, vec![1, 2]);

    let snapshot = engine.sources("c5").await.unwrap();
    assert_eq!(snapshot.turn, 2);
    assert!(snapshot.sources.iter().any(|s| s.document_id == "doc-rust"));
    assert!(snapshot.sources.iter().any(|s| s.document_id == "doc-banana"));
    // idle conversations do not keep a lock around
    assert_eq!(engine.active_conversations(), 0);
}

#[tokio::test]
async fn pinned_document_is_carried_without_prior_retrieval() {
    let engine = engine(Arc::new(ScriptedLlm::default()));
    engine.set_pinned("c2", "doc-openai", true).await.unwrap();
    assert_eq!(engine.active_conversations(), 0);

    let bundle = engine
        .query(&in_conversation("rust ownership", "c2"), &NoopSink)
        .await
        .unwrap();
    assert!(bundle
        .chunks
        .iter()
        .any(|c| c.chunk.document_id == "doc-openai" && c.origin == ChunkOrigin::Carried));
}

#[tokio::test]
async fn slow_reranker_falls_back_to_fused_order() {
    let llm = ScriptedLlm::default().sleep("rerank", 500);
    let slow = engine(Arc::new(llm)).with_stages(StageConfig {
        rerank_ms: 20,
        ..StageConfig::default()
    });
    let bundle = slow
        .query(&request("rust borrow checker"), &NoopSink)
        .await
        .unwrap();

    assert!(!bundle.stats.reranking_used);
    assert!(!bundle.stats.tiers_used.contains(&Tier::Rerank));
    assert!(bundle
        .stats
        .stage_failures
        .iter()
        .any(|f| f.stage == Stage::Rerank && f.kind == FailureKind::Timeout));
    assert_eq!(documents(&bundle), vec!["doc-rust"]);

    let unranked = engine(Arc::new(ScriptedLlm::default()));
    let mut req = request("rust borrow checker");
    req.options.use_reranking = false;
    let fused = unranked.query(&req, &NoopSink).await.unwrap();
    let order = |b: &context_relay_core::bundle::ContextBundle| -> Vec<String> {
        b.chunks.iter().map(|c| c.chunk.id.clone()).collect()
    };
    assert_eq!(order(&bundle), order(&fused));
}

#[tokio::test]
async fn reranker_scores_replace_fused_scores() {
    let llm = ScriptedLlm::default().reply(
        "rerank",
        json!({ "scores": [ { "index": 0, "score": 0.2 }, { "index": 1, "score": 0.95 } ] }),
    );
    let engine = engine(Arc::new(llm));
    let bundle = engine
        .query(&request("rust borrow checker"), &NoopSink)
        .await
        .unwrap();

    assert!(bundle.stats.reranking_used);
    assert!(bundle.stats.tiers_used.contains(&Tier::Rerank));
    assert!((bundle.chunks[0].score - 0.95).abs() < 1e-9);
}

#[tokio::test]
async fn rewrites_add_a_retrieval_tier() {
    let llm = ScriptedLlm::default().reply(
        "query_rewriting",
        json!({
            "rewrites": [
                { "query": "potassium sources", "focus": "nutrition", "reasoning": "synonym" }
            ],
            "expansion_terms": ["potassium"]
        }),
    );
    let engine = engine(Arc::new(llm));
    let bundle = engine
        .query(&request("what fruit helps with cramps?"), &NoopSink)
        .await
        .unwrap();

    assert!(bundle.stats.tiers_used.contains(&Tier::Rewrite));
    assert!(documents(&bundle).contains(&"doc-banana"));
}

#[tokio::test]
async fn fast_mode_skips_llm_expansion_and_rerank() {
    let llm = Arc::new(ScriptedLlm::default());
    let engine = engine(llm.clone());
    let mut req = request("rust ownership");
    req.options.performance_mode = PerformanceMode::Fast;

    let bundle = engine.query(&req, &NoopSink).await.unwrap();
    assert!(bundle.has_relevant_content);
    assert!(!bundle.stats.reranking_used);

    let calls = llm.calls();
    assert!(!calls.contains(&"query_rewriting"));
    assert!(!calls.contains(&"hyde"));
    assert!(!calls.contains(&"rerank"));
}

#[tokio::test]
async fn document_filter_limits_results() {
    let engine = engine(Arc::new(ScriptedLlm::default()));
    let mut req = request("What has OpenAI developed in rust?");
    req.document_id_filter = Some(vec!["doc-openai".to_string()]);

    let bundle = engine.query(&req, &NoopSink).await.unwrap();
    assert!(!bundle.chunks.is_empty());
    assert!(bundle.chunks.iter().all(|c| c.chunk.document_id == "doc-openai"));
}

#[tokio::test]
async fn repeat_query_is_served_from_cache() {
    let llm = Arc::new(ScriptedLlm::default());
    let engine = engine(llm.clone()).with_cache(ResultCache::new(&CacheConfig::default()));

    let first = engine.query(&request("rust ownership"), &NoopSink).await.unwrap();
    assert!(!first.stats.cache_hit);
    let calls_after_first = llm.calls().len();

    let second = engine.query(&request("  Rust   OWNERSHIP "), &NoopSink).await.unwrap();
    assert!(second.stats.cache_hit);
    assert_eq!(llm.calls().len(), calls_after_first);
    assert_eq!(documents(&first), documents(&second));
}

#[tokio::test]
async fn all_signals_down_is_an_error() {
    let sink = RecordingSink::default();
    let down = Arc::new(DownStore);
    let conversations = Arc::new(InMemoryStore::new());
    let engine = Engine::new(
        down.clone(),
        down,
        conversations,
        Arc::new(StaticPersonas::new(RetrievalConfig::default())),
        Arc::new(KeywordEmbedder),
        Arc::new(ScriptedLlm::default()),
    );

    let err = engine.query(&request("rust ownership"), &sink).await.unwrap_err();
    assert!(matches!(err, RetrievalError::AllSignalsUnavailable(_)));

    let records = sink.0.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].outcome, QueryOutcome::Failed));
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let engine = engine(Arc::new(ScriptedLlm::default()));
    let err = engine.query(&request("   "), &NoopSink).await.unwrap_err();
    assert!(matches!(err, RetrievalError::InvalidRequest(_)));
}
