//! Query orchestration.
//!
//! One [`Engine::query`] call runs the whole pipeline:
//!
//! ```text
//! phase 1 (concurrent)   recognition → graph expansion │ rewriting │ HyDE │ first dual pass
//! phase 2                variant dual pass
//! phase 3 (if in budget) graph-term lexical pass │ linked-document injection
//!                        cap → fuse → rerank
//!                        ── result cache boundary ──
//!                        conversation merge → citations → stats → analytics
//! ```
//!
//! Every stage future runs under its own `tokio::time::timeout`. A stage
//! that times out or errors contributes nothing and leaves a
//! [`StageFailure`] in the stats; the query only fails when lexical,
//! vector and graph signals are all unavailable.
//!
//! Turns of one conversation are serialized through a per-conversation
//! async mutex, so concurrent requests on the same conversation cannot
//! interleave their read-modify-write of carry-over state.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use context_relay_core::analytics::{AnalyticsSink, QueryOutcome, QueryRecord, QueryStats, Tier};
use context_relay_core::bundle::{ContextBundle, ContextChunk, PerformanceMode, QueryOptions, QueryRequest};
use context_relay_core::citation;
use context_relay_core::config::RetrievalConfig;
use context_relay_core::conversation::{self, CarryParams, ConversationState, UsedDocument};
use context_relay_core::embedding::Embedder;
use context_relay_core::error::{FailureKind, RetrievalError, Stage, StageFailure};
use context_relay_core::expansion::{self, Hyde, Rewriting};
use context_relay_core::fusion::{self, FusedCandidate};
use context_relay_core::graph::{self, GraphExpansion, GraphParams};
use context_relay_core::llm::LlmProvider;
use context_relay_core::models::{ConversationSource, SearchCandidate, Signal};
use context_relay_core::recognizer::{self, Recognition, RecognizerParams};
use context_relay_core::rerank::{self, LlmReranker, RerankOutcome};
use context_relay_core::retriever::{self, CandidatePool, GraphSupport, PassResult, RetrievalPlan, SignalOutcome};
use context_relay_core::store::{
    ChunkIndex, ConversationSnapshot, ConversationStore, KnowledgeGraph, PersonaConfigProvider,
    SearchFilters,
};

use crate::cache::{self, CachedRetrieval, ResultCache};
use crate::config::{Config, ConfigPersonas, StageConfig};
use crate::embedding::create_embedder;
use crate::llm::create_llm;
use crate::retry::{RetryingGraph, RetryingIndex};
use crate::sqlite_store::SqliteStore;

/// Chunks fetched per graph-linked document.
const LINKED_CHUNKS_PER_DOCUMENT: usize = 2;

/// Run `fut` under `budget`; on expiry report a timeout for `stage`.
///
/// A future that misses its budget is dropped, not left running.
async fn within<T>(stage: Stage, budget: Duration, fut: impl Future<Output = T>) -> Result<T, StageFailure> {
    match tokio::time::timeout(budget, fut).await {
        Ok(v) => Ok(v),
        Err(_) => {
            let budget_ms = budget.as_millis() as u64;
            warn!(stage = stage.as_str(), budget_ms, "stage timed out");
            Err(StageFailure::timeout(stage, budget_ms))
        }
    }
}

fn skipped_pass() -> PassResult {
    PassResult {
        pool: CandidatePool::new(),
        lexical: SignalOutcome::Skipped,
        vector: SignalOutcome::Skipped,
        failures: Vec::new(),
    }
}

fn timed_out_pass(budget: Duration, lexical: bool, vector: bool) -> PassResult {
    let budget_ms = budget.as_millis() as u64;
    let mut pass = skipped_pass();
    if lexical {
        pass.lexical = SignalOutcome::Failed(format!("lexical search exceeded {} ms", budget_ms));
        pass.failures.push(StageFailure::timeout(Stage::Lexical, budget_ms));
    }
    if vector {
        pass.vector = SignalOutcome::Failed(format!("vector search exceeded {} ms", budget_ms));
        pass.failures.push(StageFailure::timeout(Stage::Vector, budget_ms));
    }
    pass
}

fn is_failed(outcome: &SignalOutcome) -> bool {
    matches!(outcome, SignalOutcome::Failed(_))
}

/// Documents of this turn's retrieved chunks, first-appearance order.
fn used_documents(chunks: &[ContextChunk]) -> Vec<UsedDocument> {
    let mut used: Vec<UsedDocument> = Vec::new();
    for c in chunks {
        match used.iter_mut().find(|u| u.document_id == c.chunk.document_id) {
            Some(u) => u.chunk_ids.push(c.chunk.id.clone()),
            None => used.push(UsedDocument {
                document_id: c.chunk.document_id.clone(),
                chunk_ids: vec![c.chunk.id.clone()],
            }),
        }
    }
    used
}

fn distinct_documents(chunks: &[ContextChunk]) -> usize {
    chunks
        .iter()
        .map(|c| c.chunk.document_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

fn tiers_of(candidates: &[FusedCandidate], stats: &mut QueryStats) {
    for c in candidates {
        if c.lexical.is_some() {
            stats.add_tier(Tier::Lexical);
        }
        if c.vector.is_some() {
            stats.add_tier(Tier::Vector);
        }
        if c.graph_boost.is_some() {
            stats.add_tier(Tier::Graph);
        }
    }
}

pub struct Engine {
    index: Arc<dyn ChunkIndex>,
    graph: Arc<dyn KnowledgeGraph>,
    conversations: Arc<dyn ConversationStore>,
    personas: Arc<dyn PersonaConfigProvider>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmProvider>,
    stages: StageConfig,
    cache: ResultCache,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Per-query settings resolved from the persona and the request.
struct Plan<'a> {
    query: &'a str,
    cfg: RetrievalConfig,
    options: QueryOptions,
    filters: SearchFilters,
    pool_limit: usize,
    k: usize,
    deadline: Instant,
}

impl Plan<'_> {
    fn fast(&self) -> bool {
        self.options.performance_mode == PerformanceMode::Fast
    }
}

impl Engine {
    /// Index and graph reads are wrapped in retry-once decorators.
    pub fn new(
        index: Arc<dyn ChunkIndex>,
        graph: Arc<dyn KnowledgeGraph>,
        conversations: Arc<dyn ConversationStore>,
        personas: Arc<dyn PersonaConfigProvider>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            index: Arc::new(RetryingIndex::new(index)),
            graph: Arc::new(RetryingGraph::new(graph)),
            conversations,
            personas,
            embedder,
            llm,
            stages: StageConfig::default(),
            cache: ResultCache::disabled(),
            locks: DashMap::new(),
        }
    }

    /// Engine over a SQLite store with the configured providers.
    pub fn from_config(config: &Config, store: Arc<SqliteStore>) -> anyhow::Result<Self> {
        let personas = ConfigPersonas::from_config(config)?;
        let embedder = create_embedder(&config.embedding)?;
        let llm = create_llm(&config.llm)?;
        Ok(Self::new(
            store.clone(),
            store.clone(),
            store,
            Arc::new(personas),
            embedder,
            llm,
        )
        .with_stages(config.stages)
        .with_cache(ResultCache::new(&config.cache)))
    }

    pub fn with_stages(mut self, stages: StageConfig) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    /// Conversations with a turn in flight.
    pub fn active_conversations(&self) -> usize {
        self.locks.len()
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once only the map still holds it, that is,
    /// once no turn is waiting on this conversation.
    fn release_lock(&self, conversation_id: &str) {
        self.locks
            .remove_if(conversation_id, |_, m| Arc::strong_count(m) == 1);
    }

    /// Answer `request` with a context bundle and report one analytics record.
    pub async fn query(
        &self,
        request: &QueryRequest,
        sink: &dyn AnalyticsSink,
    ) -> Result<ContextBundle, RetrievalError> {
        let started = Instant::now();
        let result = self.run(request, started).await;

        let (outcome, chunk_count, stats) = match &result {
            Ok(bundle) if bundle.has_relevant_content => {
                (QueryOutcome::Answered, bundle.chunks.len(), bundle.stats.clone())
            }
            Ok(bundle) => (
                QueryOutcome::NoRelevantContent,
                bundle.chunks.len(),
                bundle.stats.clone(),
            ),
            Err(e) => {
                warn!(persona = %request.persona_id, error = %e, "query failed");
                let stats = QueryStats {
                    retrieval_time_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                };
                (QueryOutcome::Failed, 0, stats)
            }
        };
        sink.record(QueryRecord {
            persona_id: request.persona_id.clone(),
            conversation_id: request.conversation_id.clone(),
            query_hash: cache::query_hash(&request.query),
            outcome,
            chunk_count,
            stats,
            recorded_at: Utc::now(),
        });
        result
    }

    async fn run(&self, request: &QueryRequest, started: Instant) -> Result<ContextBundle, RetrievalError> {
        request.validate()?;
        let cfg = self
            .personas
            .retrieval_config(&request.persona_id)
            .await
            .map_err(|source| RetrievalError::Persona {
                persona: request.persona_id.clone(),
                source,
            })?
            .sanitized();

        let options = request.options.effective();
        let fast = options.performance_mode == PerformanceMode::Fast;
        let pool_limit = if fast {
            (cfg.candidate_pool_size / 2).max(1)
        } else {
            cfg.candidate_pool_size
        };
        let plan = Plan {
            query: request.query.trim(),
            k: options.max_chunks.unwrap_or(cfg.final_k).max(1),
            filters: SearchFilters {
                persona_id: request.persona_id.clone(),
                document_ids: request.document_id_filter.clone(),
            },
            cfg,
            options,
            pool_limit,
            deadline: started + self.stages.budget(),
        };

        let key = cache::cache_key(plan.query, &plan.filters, &plan.options);
        let retrieved = match self.cache.get(&key) {
            Some(mut hit) => {
                debug!(persona = %plan.filters.persona_id, "result cache hit");
                hit.stats.cache_hit = true;
                hit
            }
            None => {
                let fresh = self.retrieve(&plan).await?;
                if cacheable(&fresh.stats.stage_failures) {
                    self.cache.insert(key, fresh.clone());
                }
                fresh
            }
        };
        let CachedRetrieval { chunks, mut stats } = retrieved;

        let (merged, turn) = match &request.conversation_id {
            Some(conversation_id) => {
                self.carry_over(conversation_id, chunks, &plan, &mut stats)
                    .await?
            }
            None => (chunks, 0),
        };

        let (chunks, citations) = citation::assemble(merged, plan.cfg.max_supporting_chunks);
        let required = (plan.cfg.min_supporting_documents as usize).max(1);
        let has_relevant_content = distinct_documents(&chunks) >= required;
        stats.retrieval_time_ms = started.elapsed().as_millis() as u64;

        info!(
            persona = %plan.filters.persona_id,
            chunks = chunks.len(),
            citations = citations.len(),
            relevant = has_relevant_content,
            turn,
            cache_hit = stats.cache_hit,
            elapsed_ms = stats.retrieval_time_ms,
            "query complete"
        );

        Ok(ContextBundle {
            chunks,
            citations,
            stats,
            has_relevant_content,
            conversation_id: request.conversation_id.clone(),
            turn,
        })
    }

    /// Everything up to and including reranking. Independent of any
    /// conversation, so the result is cacheable.
    async fn retrieve(&self, plan: &Plan<'_>) -> Result<CachedRetrieval, RetrievalError> {
        let mut stats = QueryStats::default();
        let mut failures: Vec<StageFailure> = Vec::new();
        let (cfg, options, filters, query) = (&plan.cfg, &plan.options, &plan.filters, plan.query);
        let search_budget = self.stages.search();

        // Phase 1: recognition then graph expansion, alongside rewriting,
        // HyDE and the first dual pass.
        let recognizer_params = RecognizerParams {
            max_keywords: cfg.max_expansion_keywords,
            timeout: self.stages.recognition(),
        };
        let graph_params = GraphParams {
            max_depth: if plan.fast() { 1 } else { cfg.graph_max_depth },
            min_edge_confidence: cfg.min_edge_confidence,
            max_terms: cfg.max_graph_terms,
            max_documents: cfg.max_graph_documents,
            ..Default::default()
        };
        let entity_fut = async {
            let recognition = self.recognize(query, &filters.persona_id, &recognizer_params).await;
            if !options.use_graph_expansion || recognition.entities.is_empty() {
                return (recognition, Ok(GraphExpansion::default()));
            }
            let expansion = within(
                Stage::Graph,
                self.stages.graph(),
                graph::expand(
                    self.graph.as_ref(),
                    &recognition.entities,
                    query,
                    filters,
                    &graph_params,
                ),
            )
            .await;
            (recognition, expansion)
        };
        let rewrite_fut = async {
            if !options.use_query_rewriting {
                return Ok(Rewriting::default());
            }
            within(
                Stage::Rewriting,
                self.stages.rewriting(),
                expansion::rewrite(self.llm.as_ref(), query, cfg.max_rewrites, self.stages.rewriting()),
            )
            .await
        };
        let hyde_fut = async {
            if !options.use_hyde {
                return Ok(Hyde::default());
            }
            within(
                Stage::Hyde,
                self.stages.hyde(),
                expansion::hyde(self.llm.as_ref(), query, cfg.max_hyde_passages, self.stages.hyde()),
            )
            .await
        };
        let first_plan = RetrievalPlan::original(query);
        let first_fut = tokio::time::timeout(
            search_budget,
            retriever::retrieve(
                self.index.as_ref(),
                self.embedder.as_ref(),
                &first_plan,
                filters,
                plan.pool_limit,
            ),
        );
        let ((mut recognition, expansion), rewriting, hyde, first) =
            tokio::join!(entity_fut, rewrite_fut, hyde_fut, first_fut);

        failures.append(&mut recognition.failures);
        let mut rewriting = rewriting.unwrap_or_else(|f| {
            failures.push(f);
            Rewriting::default()
        });
        failures.extend(rewriting.failure.take());
        let mut hyde = hyde.unwrap_or_else(|f| {
            failures.push(f);
            Hyde::default()
        });
        failures.extend(hyde.failure.take());
        let mut first = first.unwrap_or_else(|_| timed_out_pass(search_budget, true, true));
        failures.append(&mut first.failures);

        let mut graph_down = recognition_graph_down(&failures);
        let mut expansion = match expansion {
            Ok(e) => e,
            Err(f) => {
                failures.push(f);
                graph_down = true;
                GraphExpansion::default()
            }
        };
        if !expansion.failures.is_empty() && expansion.documents.is_empty() && expansion.related.is_empty() {
            graph_down = true;
        }
        failures.append(&mut expansion.failures);
        stats.graph_expansions = expansion.expansion_count();

        stats.query_type = recognition.intent;
        stats.entities_used = recognition
            .entities
            .iter()
            .map(|e| e.entity.name.clone())
            .collect();
        if !rewriting.rewrites.is_empty() {
            stats.add_tier(Tier::Rewrite);
        }
        if !hyde.passages.is_empty() {
            stats.add_tier(Tier::Hyde);
        }

        // Phase 2: the variant dual pass over rewrites, keywords and HyDE.
        let mut variants_plan = RetrievalPlan::default();
        for rw in &rewriting.rewrites {
            variants_plan.add_lexical(&rw.query);
            variants_plan.add_vector(&rw.query);
        }
        if !rewriting.expansion_terms.is_empty() {
            variants_plan.add_lexical(&rewriting.expansion_terms.join(" "));
        }
        if !recognition.keywords.is_empty() {
            variants_plan.add_lexical(&recognition.keywords.join(" "));
        }
        for passage in &hyde.passages {
            variants_plan.add_vector(passage);
        }

        let mut variants = if variants_plan.is_empty() {
            skipped_pass()
        } else {
            let lexical = !variants_plan.lexical_queries.is_empty();
            let vector = !variants_plan.vector_seeds.is_empty();
            tokio::time::timeout(
                search_budget,
                retriever::retrieve(
                    self.index.as_ref(),
                    self.embedder.as_ref(),
                    &variants_plan,
                    filters,
                    plan.pool_limit,
                ),
            )
            .await
            .unwrap_or_else(|_| timed_out_pass(search_budget, lexical, vector))
        };
        failures.append(&mut variants.failures);

        let mut pool = first.pool;
        pool.merge(variants.pool);
        let mut lexical = first.lexical.combine(variants.lexical);
        let vector = first.vector.combine(variants.vector);

        // Phase 3
        let has_graph_work = !expansion.terms.is_empty() || !expansion.documents.is_empty();
        let remaining = plan.deadline.saturating_duration_since(Instant::now());
        if has_graph_work && remaining > Duration::ZERO {
            let budget = remaining.min(search_budget);
            let (terms_pass, failure) = self.graph_phase(plan, &expansion, &mut pool, budget).await;
            failures.extend(failure);
            if let Some(mut pass) = terms_pass {
                failures.append(&mut pass.failures);
                pool.merge(pass.pool);
                lexical = lexical.combine(pass.lexical);
            }
        } else if has_graph_work {
            debug!("query budget spent, skipping graph injection");
        }

        if is_failed(&lexical) && is_failed(&vector) && graph_down {
            let reasons: Vec<String> = failures
                .iter()
                .map(|f| format!("{}: {}", f.stage.as_str(), f.message))
                .collect();
            return Err(RetrievalError::AllSignalsUnavailable(reasons.join("; ")));
        }

        // Fusion and rerank
        let fused = fusion::fuse(pool.capped(plan.pool_limit).into_candidates(), cfg);
        debug!(fused = fused.len(), "fusion complete");

        let rerank_budget = self.stages.rerank();
        let outcome = if options.use_reranking && cfg.rerank_enabled && !fused.is_empty() {
            let fallback = fused.clone();
            let reranker = LlmReranker::new(self.llm.as_ref());
            within(
                Stage::Rerank,
                rerank_budget,
                rerank::rerank(&reranker, query, fused, cfg.rerank_top_n, plan.k, rerank_budget),
            )
            .await
            .unwrap_or_else(|f| {
                let mut out = RerankOutcome::passthrough(fallback, plan.k);
                out.failure = Some(f);
                out
            })
        } else {
            RerankOutcome::passthrough(fused, plan.k)
        };
        failures.extend(outcome.failure);
        stats.stage_failures = failures;
        if outcome.used {
            stats.reranking_used = true;
            stats.add_tier(Tier::Rerank);
        }

        let candidates = outcome.candidates;
        tiers_of(&candidates, &mut stats);
        stats.average_similarity = fusion::average_similarity(&candidates);
        let chunks = candidates
            .into_iter()
            .map(|c| {
                let score = c.rerank_score.unwrap_or(c.combined);
                ContextChunk::retrieved(c.chunk, score)
            })
            .collect();

        Ok(CachedRetrieval { chunks, stats })
    }

    /// Graph candidate lookup, then the LLM judgement under its own
    /// budget. A slow LLM leaves the graph matches in place.
    async fn recognize(&self, query: &str, persona_id: &str, params: &RecognizerParams) -> Recognition {
        let found = within(
            Stage::Graph,
            self.stages.graph(),
            recognizer::candidates(self.graph.as_ref(), persona_id, query),
        )
        .await
        .and_then(|r| r);
        let found = match found {
            Ok(found) => found,
            Err(failure) => {
                let mut r = Recognition::empty();
                r.failures.push(failure);
                return r;
            }
        };
        within(
            Stage::Recognition,
            self.stages.recognition(),
            recognizer::judge(self.llm.as_ref(), query, &found, params),
        )
        .await
        .unwrap_or_else(|failure| recognizer::graph_only(&found, failure))
    }

    /// Graph-term lexical pass plus linked-document injection, concurrently.
    async fn graph_phase(
        &self,
        plan: &Plan<'_>,
        expansion: &GraphExpansion,
        pool: &mut CandidatePool,
        budget: Duration,
    ) -> (Option<PassResult>, Option<StageFailure>) {
        let mut terms_plan = RetrievalPlan::default();
        for term in &expansion.terms {
            terms_plan.add_lexical(term);
        }
        let terms_fut = async {
            if terms_plan.is_empty() {
                return None;
            }
            Some(
                tokio::time::timeout(
                    budget,
                    retriever::retrieve(
                        self.index.as_ref(),
                        self.embedder.as_ref(),
                        &terms_plan,
                        &plan.filters,
                        plan.pool_limit,
                    ),
                )
                .await
                .unwrap_or_else(|_| timed_out_pass(budget, true, false)),
            )
        };

        let doc_ids: Vec<String> = expansion
            .documents
            .iter()
            .map(|d| d.document_id.clone())
            .collect();
        let linked_fut = async {
            if doc_ids.is_empty() {
                return Ok(Ok(Vec::new()));
            }
            within(
                Stage::Graph,
                budget,
                self.index
                    .representative_chunks(&plan.filters, &doc_ids, LINKED_CHUNKS_PER_DOCUMENT),
            )
            .await
        };
        let (terms_pass, linked) = tokio::join!(terms_fut, linked_fut);

        let boosts: HashMap<String, GraphSupport> = expansion
            .documents
            .iter()
            .map(|d| {
                (
                    d.document_id.clone(),
                    GraphSupport {
                        boost: d.score,
                        entity_id: d.via_entity.clone(),
                    },
                )
            })
            .collect();

        let mut failure = None;
        match linked {
            Ok(Ok(chunks)) => {
                for chunk in chunks {
                    if let Some(support) = boosts.get(&chunk.document_id) {
                        pool.add(SearchCandidate {
                            chunk,
                            signal: Signal::Graph {
                                boost: support.boost,
                                entity_id: support.entity_id.clone(),
                            },
                        });
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "linked document lookup failed");
                failure = Some(StageFailure::new(
                    Stage::Graph,
                    FailureKind::Error,
                    e.to_string(),
                ));
            }
            Err(f) => failure = Some(f),
        }

        let mut terms_pass = terms_pass;
        if let Some(pass) = terms_pass.as_mut() {
            pass.pool.apply_document_boosts(&boosts);
        }
        pool.apply_document_boosts(&boosts);
        (terms_pass, failure)
    }

    /// Advance the conversation one turn and merge its carried chunks.
    async fn carry_over(
        &self,
        conversation_id: &str,
        retrieved: Vec<ContextChunk>,
        plan: &Plan<'_>,
        stats: &mut QueryStats,
    ) -> Result<(Vec<ContextChunk>, u32), RetrievalError> {
        let lock = self.conversation_lock(conversation_id);
        let result = {
            let _guard = lock.lock().await;
            self.advance_turn(conversation_id, retrieved, plan, stats).await
        };
        drop(lock);
        self.release_lock(conversation_id);
        result
    }

    /// Read-modify-write of one conversation's carry-over state. Callers
    /// hold the conversation's lock.
    async fn advance_turn(
        &self,
        conversation_id: &str,
        retrieved: Vec<ContextChunk>,
        plan: &Plan<'_>,
        stats: &mut QueryStats,
    ) -> Result<(Vec<ContextChunk>, u32), RetrievalError> {
        let snapshot = self
            .conversations
            .get_sources(conversation_id)
            .await
            .map_err(RetrievalError::Store)?;
        let mut state = ConversationState::from(snapshot);
        let used = used_documents(&retrieved);
        let transition = state.advance(&used, &plan.filters, &CarryParams::from(&plan.cfg));

        let carried = self.materialize(&transition.carried, &plan.filters, stats).await;
        if !carried.is_empty() {
            stats.add_tier(Tier::Carryover);
        }

        self.conversations
            .upsert_sources(conversation_id, transition.turn, &state.sources(), &transition.evicted)
            .await
            .map_err(RetrievalError::Store)?;

        Ok((conversation::merge(retrieved, carried), transition.turn))
    }

    /// Load the chunks behind carried sources. A source without recorded
    /// chunk ids (pinned before it was ever retrieved) falls back to the
    /// document's leading chunks.
    async fn materialize(
        &self,
        sources: &[ConversationSource],
        filters: &SearchFilters,
        stats: &mut QueryStats,
    ) -> Vec<ContextChunk> {
        if sources.is_empty() {
            return Vec::new();
        }
        let ids: Vec<String> = sources.iter().flat_map(|s| s.chunk_ids.clone()).collect();
        let bare: Vec<String> = sources
            .iter()
            .filter(|s| s.chunk_ids.is_empty())
            .map(|s| s.document_id.clone())
            .collect();
        let scores: HashMap<&str, f64> = sources
            .iter()
            .map(|s| (s.document_id.as_str(), s.carry_score))
            .collect();

        let loaded = async {
            let mut chunks = if ids.is_empty() {
                Vec::new()
            } else {
                self.index.get_chunks(&ids).await?
            };
            if !bare.is_empty() {
                chunks.extend(
                    self.index
                        .representative_chunks(filters, &bare, LINKED_CHUNKS_PER_DOCUMENT)
                        .await?,
                );
            }
            anyhow::Ok(chunks)
        };
        match loaded.await {
            Ok(chunks) => chunks
                .into_iter()
                .filter_map(|chunk| {
                    let score = *scores.get(chunk.document_id.as_str())?;
                    Some(ContextChunk::carried(chunk, score))
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to load carried chunks");
                stats.stage_failures.push(StageFailure::new(
                    Stage::Conversation,
                    FailureKind::Error,
                    e.to_string(),
                ));
                Vec::new()
            }
        }
    }

    pub async fn sources(&self, conversation_id: &str) -> Result<ConversationSnapshot, RetrievalError> {
        self.conversations
            .get_sources(conversation_id)
            .await
            .map_err(RetrievalError::Store)
    }

    /// Pin or unpin a document for a conversation. Serialized with its turns.
    pub async fn set_pinned(
        &self,
        conversation_id: &str,
        document_id: &str,
        pinned: bool,
    ) -> Result<(), RetrievalError> {
        let lock = self.conversation_lock(conversation_id);
        let result = {
            let _guard = lock.lock().await;
            self.conversations
                .set_pinned(conversation_id, document_id, pinned)
                .await
                .map_err(RetrievalError::Store)
        };
        drop(lock);
        self.release_lock(conversation_id);
        result
    }
}

/// Results degraded by a timeout or a store outage are not cached. LLM
/// errors that are not timeouts (a disabled or misbehaving provider) are
/// stable across repeats, so those results still are.
fn cacheable(failures: &[StageFailure]) -> bool {
    failures.iter().all(|f| {
        f.kind != FailureKind::Timeout
            && !matches!(f.stage, Stage::Lexical | Stage::Vector | Stage::Graph | Stage::Conversation)
    })
}

/// The recognizer reports entity lookup failures against the graph stage.
fn recognition_graph_down(failures: &[StageFailure]) -> bool {
    failures.iter().any(|f| f.stage == Stage::Graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_relay_core::models::Chunk;

    fn ctx(id: &str, doc: &str) -> ContextChunk {
        ContextChunk::retrieved(
            Chunk {
                id: id.to_string(),
                document_id: doc.to_string(),
                content: String::new(),
                token_count: 0,
                chunk_index: 0,
                page_start: None,
                page_end: None,
                section: None,
            },
            0.5,
        )
    }

    #[test]
    fn used_documents_group_chunks_in_order() {
        let used = used_documents(&[ctx("a1", "a"), ctx("b1", "b"), ctx("a2", "a")]);
        assert_eq!(used.len(), 2);
        assert_eq!(used[0].document_id, "a");
        assert_eq!(used[0].chunk_ids, vec!["a1", "a2"]);
        assert_eq!(used[1].chunk_ids, vec!["b1"]);
    }

    #[test]
    fn timed_out_pass_marks_requested_signals() {
        let pass = timed_out_pass(Duration::from_millis(5), true, false);
        assert!(is_failed(&pass.lexical));
        assert_eq!(pass.vector, SignalOutcome::Skipped);
        assert_eq!(pass.failures.len(), 1);
    }

    #[tokio::test]
    async fn stage_timeout_reports_failure() {
        let r = within(Stage::Hyde, Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
        .await;
        let f = r.unwrap_err();
        assert_eq!(f.stage, Stage::Hyde);
        assert_eq!(f.message, "hyde exceeded 5 ms");
    }
}
