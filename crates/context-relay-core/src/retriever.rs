//! Dual (lexical + vector) retrieval and candidate pooling.
//!
//! A [`RetrievalPlan`] lists every lexical query and every vector seed
//! for one pass: the original query, rewrites, keyword bundles and HyDE
//! passages. [`retrieve`] issues all of them concurrently and pools the
//! results by chunk id, keeping the maximum score per signal.

use std::collections::HashMap;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::error::{FailureKind, Stage, StageFailure};
use crate::models::{Chunk, SearchCandidate, Signal};
use crate::store::{ChunkIndex, ScoredChunk, SearchFilters};

/// Graph-derived support for a pooled chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSupport {
    /// Linked-document score from the graph walk, in `[0, 1]`.
    pub boost: f64,
    /// Entity whose edge produced the boost.
    pub entity_id: String,
}

/// Everything the pool knows about one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PooledCandidate {
    pub chunk: Chunk,
    /// Best raw lexical score over every lexical query that hit the chunk.
    pub lexical: Option<f64>,
    /// Most distinct query terms matched by any single lexical query.
    pub keyword_hits: u32,
    /// Best cosine similarity over every vector seed.
    pub vector: Option<f64>,
    pub graph: Option<GraphSupport>,
}

impl PooledCandidate {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            lexical: None,
            keyword_hits: 0,
            vector: None,
            graph: None,
        }
    }

    pub fn is_graph_sourced(&self) -> bool {
        self.graph.is_some()
    }
}

fn rank_desc(a: Option<f64>, b: Option<f64>) -> std::cmp::Ordering {
    b.unwrap_or(f64::NEG_INFINITY)
        .total_cmp(&a.unwrap_or(f64::NEG_INFINITY))
}

fn max_opt(current: Option<f64>, incoming: f64) -> Option<f64> {
    Some(current.map_or(incoming, |c| c.max(incoming)))
}

/// Candidates pooled across queries and signals, deduplicated by chunk id.
///
/// Each signal keeps its maximum across everything added, so pooling the
/// same chunk from several queries never inflates its score.
///
/// # Example
///
/// ```rust
/// use context_relay_core::models::{Chunk, SearchCandidate, Signal};
/// use context_relay_core::retriever::CandidatePool;
///
/// let chunk = Chunk {
///     id: "c1".to_string(),
///     document_id: "d1".to_string(),
///     content: "ownership and borrowing".to_string(),
///     token_count: 3,
///     chunk_index: 0,
///     page_start: None,
///     page_end: None,
///     section: None,
/// };
/// let mut pool = CandidatePool::new();
/// pool.add(SearchCandidate {
///     chunk: chunk.clone(),
///     signal: Signal::Lexical { score: 2.0, keyword_hits: 1 },
/// });
/// pool.add(SearchCandidate {
///     chunk: chunk.clone(),
///     signal: Signal::Lexical { score: 3.5, keyword_hits: 2 },
/// });
/// pool.add(SearchCandidate { chunk, signal: Signal::Vector { similarity: 0.8 } });
///
/// assert_eq!(pool.len(), 1);
/// let pooled = pool.get("c1").unwrap();
/// assert_eq!(pooled.lexical, Some(3.5));
/// assert_eq!(pooled.keyword_hits, 2);
/// assert_eq!(pooled.vector, Some(0.8));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    entries: HashMap<String, PooledCandidate>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The pooled entry for `chunk_id`, if any signal produced it.
    pub fn get(&self, chunk_id: &str) -> Option<&PooledCandidate> {
        self.entries.get(chunk_id)
    }

    /// Fold one signal's candidate into the pool, keeping the maximum
    /// per signal. A graph signal replaces the current one only when its
    /// boost is stronger.
    pub fn add(&mut self, candidate: SearchCandidate) {
        let entry = self
            .entries
            .entry(candidate.chunk.id.clone())
            .or_insert_with(|| PooledCandidate::new(candidate.chunk));
        match candidate.signal {
            Signal::Lexical {
                score,
                keyword_hits,
            } => {
                entry.lexical = max_opt(entry.lexical, score);
                entry.keyword_hits = entry.keyword_hits.max(keyword_hits);
            }
            Signal::Vector { similarity } => {
                entry.vector = max_opt(entry.vector, similarity);
            }
            Signal::Graph { boost, entity_id } => {
                let stronger = entry.graph.as_ref().map_or(true, |g| boost > g.boost);
                if stronger {
                    entry.graph = Some(GraphSupport { boost, entity_id });
                }
            }
        }
    }

    /// Fold every entry of `other` into this pool, signal by signal.
    pub fn merge(&mut self, other: CandidatePool) {
        for (_, pooled) in other.entries {
            self.merge_pooled(pooled);
        }
    }

    fn merge_pooled(&mut self, pooled: PooledCandidate) {
        let PooledCandidate {
            chunk,
            lexical,
            keyword_hits,
            vector,
            graph,
        } = pooled;
        if let Some(score) = lexical {
            self.add(SearchCandidate {
                chunk: chunk.clone(),
                signal: Signal::Lexical {
                    score,
                    keyword_hits,
                },
            });
        }
        if let Some(similarity) = vector {
            self.add(SearchCandidate {
                chunk: chunk.clone(),
                signal: Signal::Vector { similarity },
            });
        }
        if let Some(g) = graph {
            self.add(SearchCandidate {
                chunk,
                signal: Signal::Graph {
                    boost: g.boost,
                    entity_id: g.entity_id,
                },
            });
        }
    }

    /// Attach graph boosts to every pooled chunk of a linked document.
    pub fn apply_document_boosts(&mut self, boosts: &HashMap<String, GraphSupport>) {
        for pooled in self.entries.values_mut() {
            if let Some(support) = boosts.get(&pooled.chunk.document_id) {
                let stronger = pooled
                    .graph
                    .as_ref()
                    .map_or(true, |g| support.boost > g.boost);
                if stronger {
                    pooled.graph = Some(support.clone());
                }
            }
        }
    }

    /// Bound the pool to `limit` chunks before fusion.
    ///
    /// Graph-supported chunks are always kept. The rest are taken by
    /// alternating between the vector-ranked and lexical-ranked orders, so
    /// neither signal can crowd the other out. Deterministic for equal input.
    pub fn capped(self, limit: usize) -> CandidatePool {
        if self.entries.len() <= limit {
            return self;
        }
        let mut keep: Vec<String> = Vec::new();
        let mut by_vector: Vec<&PooledCandidate> = Vec::new();
        let mut by_lexical: Vec<&PooledCandidate> = Vec::new();
        for p in self.entries.values() {
            if p.is_graph_sourced() {
                keep.push(p.chunk.id.clone());
                continue;
            }
            if p.vector.is_some() {
                by_vector.push(p);
            }
            if p.lexical.is_some() {
                by_lexical.push(p);
            }
        }
        by_vector.sort_by(|a, b| rank_desc(a.vector, b.vector).then_with(|| a.chunk.id.cmp(&b.chunk.id)));
        by_lexical
            .sort_by(|a, b| rank_desc(a.lexical, b.lexical).then_with(|| a.chunk.id.cmp(&b.chunk.id)));

        let budget = limit.saturating_sub(keep.len());
        let mut taken = 0;
        let (mut vi, mut li) = (0, 0);
        while taken < budget && (vi < by_vector.len() || li < by_lexical.len()) {
            for (list, idx) in [(&by_vector, &mut vi), (&by_lexical, &mut li)] {
                while *idx < list.len() {
                    let id = &list[*idx].chunk.id;
                    *idx += 1;
                    if !keep.contains(id) {
                        keep.push(id.clone());
                        taken += 1;
                        break;
                    }
                }
                if taken >= budget {
                    break;
                }
            }
        }

        let mut entries = self.entries;
        entries.retain(|id, _| keep.contains(id));
        CandidatePool { entries }
    }

    /// Pooled entries sorted by chunk id, ready for fusion.
    pub fn into_candidates(self) -> Vec<PooledCandidate> {
        let mut out: Vec<PooledCandidate> = self.entries.into_values().collect();
        out.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
        out
    }

    pub fn candidates(&self) -> impl Iterator<Item = &PooledCandidate> {
        self.entries.values()
    }
}

/// The queries issued in one retrieval pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalPlan {
    pub lexical_queries: Vec<String>,
    /// Texts embedded and sent to vector search.
    pub vector_seeds: Vec<String>,
}

impl RetrievalPlan {
    /// The user's query against both modalities.
    pub fn original(query: &str) -> Self {
        Self {
            lexical_queries: vec![query.to_string()],
            vector_seeds: vec![query.to_string()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lexical_queries.is_empty() && self.vector_seeds.is_empty()
    }

    fn push_unique(list: &mut Vec<String>, text: &str) {
        let t = text.trim();
        if !t.is_empty() && !list.iter().any(|q| q.eq_ignore_ascii_case(t)) {
            list.push(t.to_string());
        }
    }

    /// Add a lexical query. Blank text and case-insensitive duplicates
    /// are ignored.
    pub fn add_lexical(&mut self, text: &str) {
        Self::push_unique(&mut self.lexical_queries, text);
    }

    pub fn add_vector(&mut self, text: &str) {
        Self::push_unique(&mut self.vector_seeds, text);
    }
}

/// Whether a signal produced anything usable in a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum SignalOutcome {
    /// Nothing was asked of this signal.
    Skipped,
    /// At least one call succeeded, possibly with zero hits.
    Ok,
    /// Every call failed; holds the last error.
    Failed(String),
}

impl SignalOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, SignalOutcome::Ok)
    }

    /// Combine outcomes across passes: any success wins.
    pub fn combine(self, other: SignalOutcome) -> SignalOutcome {
        match (self, other) {
            (SignalOutcome::Ok, _) | (_, SignalOutcome::Ok) => SignalOutcome::Ok,
            (SignalOutcome::Failed(e), _) | (_, SignalOutcome::Failed(e)) => {
                SignalOutcome::Failed(e)
            }
            _ => SignalOutcome::Skipped,
        }
    }
}

/// Pooled hits of one pass plus how each modality fared.
#[derive(Debug, Clone)]
pub struct PassResult {
    pub pool: CandidatePool,
    pub lexical: SignalOutcome,
    pub vector: SignalOutcome,
    pub failures: Vec<StageFailure>,
}

fn fold_results(
    stage: Stage,
    results: Vec<anyhow::Result<Vec<ScoredChunk>>>,
    failures: &mut Vec<StageFailure>,
) -> (Vec<ScoredChunk>, SignalOutcome) {
    if results.is_empty() {
        return (Vec::new(), SignalOutcome::Skipped);
    }
    let mut hits = Vec::new();
    let mut any_ok = false;
    let mut last_err = None;
    for r in results {
        match r {
            Ok(mut h) => {
                any_ok = true;
                hits.append(&mut h);
            }
            Err(e) => {
                warn!(stage = stage.as_str(), error = %e, "search failed");
                failures.push(StageFailure::new(stage, FailureKind::Error, e.to_string()));
                last_err = Some(e.to_string());
            }
        }
    }
    let outcome = if any_ok {
        SignalOutcome::Ok
    } else {
        SignalOutcome::Failed(last_err.unwrap_or_default())
    };
    (hits, outcome)
}

async fn vector_pass(
    index: &dyn ChunkIndex,
    embedder: &dyn Embedder,
    seeds: &[String],
    filters: &SearchFilters,
    limit: usize,
) -> Vec<anyhow::Result<Vec<ScoredChunk>>> {
    if seeds.is_empty() {
        return Vec::new();
    }
    let vectors = match embedder.embed(seeds).await {
        Ok(v) => v,
        Err(e) => return vec![Err(e.context("query embedding failed"))],
    };
    join_all(
        vectors
            .iter()
            .map(|v| index.vector_search(v, filters, limit)),
    )
    .await
}

/// Run every query of `plan` against both modalities concurrently.
///
/// Lexical queries go to [`ChunkIndex::keyword_search`]; vector seeds are
/// embedded in one batch and each vector goes to
/// [`ChunkIndex::vector_search`]. Every call is limited to
/// `per_query_limit` hits under `filters`.
///
/// Never fails as a whole. A failed call is logged, recorded in
/// [`PassResult::failures`] and leaves its modality [`SignalOutcome::Failed`]
/// only when no other call of that modality succeeded. An embedding
/// failure fails the vector side of the pass.
pub async fn retrieve(
    index: &dyn ChunkIndex,
    embedder: &dyn Embedder,
    plan: &RetrievalPlan,
    filters: &SearchFilters,
    per_query_limit: usize,
) -> PassResult {
    let lexical = join_all(
        plan.lexical_queries
            .iter()
            .map(|q| index.keyword_search(q, filters, per_query_limit)),
    );
    let vector = vector_pass(index, embedder, &plan.vector_seeds, filters, per_query_limit);
    let (lexical_results, vector_results) = futures::join!(lexical, vector);

    let mut failures = Vec::new();
    let (lexical_hits, lexical_outcome) =
        fold_results(Stage::Lexical, lexical_results, &mut failures);
    let (vector_hits, vector_outcome) = fold_results(Stage::Vector, vector_results, &mut failures);

    let mut pool = CandidatePool::new();
    for hit in lexical_hits {
        pool.add(SearchCandidate {
            chunk: hit.chunk,
            signal: Signal::Lexical {
                score: hit.score,
                keyword_hits: hit.keyword_hits,
            },
        });
    }
    for hit in vector_hits {
        pool.add(SearchCandidate {
            chunk: hit.chunk,
            signal: Signal::Vector {
                similarity: hit.score,
            },
        });
    }
    debug!(
        lexical_queries = plan.lexical_queries.len(),
        vector_seeds = plan.vector_seeds.len(),
        pooled = pool.len(),
        "retrieval pass complete"
    );

    PassResult {
        pool,
        lexical: lexical_outcome,
        vector: vector_outcome,
        failures,
    }
}
