//! Knowledge-graph query expansion.
//!
//! Breadth-first walk from the recognized entities over incoming and
//! outgoing edges, using an explicit worklist keyed by node id. A node
//! is walked again only when a strictly better path reaches it, and the
//! walk is bounded by depth and by a node budget, so cycles in the graph
//! cannot make it run away.
//!
//! Scoring: an entity reached at depth `d` through edges `w1..wd` from a
//! seed with confidence `c` scores `c * w1 * .. * wd / d`. When several
//! paths reach the same node the maximum wins, never the sum, and the
//! winning path is the one its documents and neighbours are scored from.
//! A document linked to an entity scoring `s` by an edge of weight `w`
//! scores `s * w`.
//!
//! # Example
//!
//! ```rust
//! use context_relay_core::graph::{expand, GraphParams};
//! use context_relay_core::models::{Entity, EntityKind, KnowledgeEdge, NodeRef, RelationType};
//! use context_relay_core::recognizer::RecognizedEntity;
//! use context_relay_core::store::memory::InMemoryStore;
//! use context_relay_core::store::SearchFilters;
//!
//! let org = Entity {
//!     id: "acme".to_string(),
//!     name: "Acme".to_string(),
//!     kind: EntityKind::Organization,
//!     description: String::new(),
//!     authority: 1.0,
//!     mention_count: 1,
//! };
//! let store = InMemoryStore::new();
//! store.add_entity("p", org.clone());
//! store.add_edge(KnowledgeEdge {
//!     id: "e1".to_string(),
//!     src: NodeRef::Document("doc-acme".to_string()),
//!     dst: NodeRef::Entity("acme".to_string()),
//!     relation: RelationType::Mentions,
//!     weight: 0.5,
//!     evidence_text: None,
//!     evidence_document_id: None,
//! });
//!
//! let seed = RecognizedEntity { entity: org, confidence: 1.0, span: (0, 4), matched: "acme".to_string() };
//! let out = futures::executor::block_on(expand(
//!     &store,
//!     &[seed],
//!     "acme",
//!     &SearchFilters::for_persona("p"),
//!     &GraphParams::default(),
//! ));
//! assert_eq!(out.documents[0].document_id, "doc-acme");
//! assert_eq!(out.documents[0].score, 0.5);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{FailureKind, Stage, StageFailure};
use crate::models::{Entity, NodeRef, RelationType};
use crate::recognizer::RecognizedEntity;
use crate::store::{query_terms, KnowledgeGraph, SearchFilters};

#[derive(Debug, Clone)]
pub struct GraphParams {
    pub max_depth: usize,
    pub min_edge_confidence: f64,
    pub max_terms: usize,
    pub max_documents: usize,
    /// Upper bound on nodes taken off the worklist.
    pub max_nodes: usize,
}

impl Default for GraphParams {
    fn default() -> Self {
        Self {
            max_depth: 2,
            min_edge_confidence: 0.3,
            max_terms: 8,
            max_documents: 10,
            max_nodes: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedEntity {
    pub entity: Entity,
    pub score: f64,
    pub depth: usize,
    pub via: RelationType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedDocument {
    pub document_id: String,
    pub score: f64,
    /// Entity whose edge produced the best score.
    pub via_entity: String,
    pub relation: RelationType,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphExpansion {
    pub related: Vec<RelatedEntity>,
    pub documents: Vec<LinkedDocument>,
    pub terms: Vec<String>,
    /// Nodes expanded during the walk.
    pub visited: usize,
    #[serde(skip)]
    pub failures: Vec<StageFailure>,
}

impl GraphExpansion {
    /// Related entities plus linked documents.
    pub fn expansion_count(&self) -> usize {
        self.related.len() + self.documents.len()
    }
}

/// Best path found so far to an entity.
#[derive(Clone, Copy)]
struct Path {
    /// Product of seed confidence and edge weights along the path.
    weight: f64,
    depth: usize,
}

impl Path {
    /// Seeds keep their confidence; deeper nodes are damped by depth.
    fn score(&self) -> f64 {
        if self.depth == 0 {
            self.weight
        } else {
            self.weight / self.depth as f64
        }
    }
}

struct Best {
    score: f64,
    depth: usize,
    via: RelationType,
}

/// Walk the graph from `seeds` and collect related entities, linked
/// documents and extra lexical terms for `query`.
///
/// Edges weaker than `min_edge_confidence` are ignored, entities are
/// never followed past `max_depth`, and documents outside `filters` are
/// dropped. Related entities and documents come back strongest first,
/// ties broken by id.
///
/// Never fails: store errors are recorded in
/// [`GraphExpansion::failures`] and the walk continues with what it has.
pub async fn expand(
    graph: &dyn KnowledgeGraph,
    seeds: &[RecognizedEntity],
    query: &str,
    filters: &SearchFilters,
    params: &GraphParams,
) -> GraphExpansion {
    let mut out = GraphExpansion::default();
    if seeds.is_empty() || params.max_depth == 0 {
        return out;
    }

    let seed_ids: HashSet<&str> = seeds.iter().map(|s| s.entity.id.as_str()).collect();
    let mut paths: HashMap<String, Path> = HashMap::new();
    let mut queued: HashSet<String> = HashSet::new();
    let mut expanded_at: HashMap<String, f64> = HashMap::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for seed in seeds {
        if queued.insert(seed.entity.id.clone()) {
            paths.insert(
                seed.entity.id.clone(),
                Path {
                    weight: seed.confidence.clamp(0.0, 1.0),
                    depth: 0,
                },
            );
            queue.push_back(seed.entity.id.clone());
        }
    }

    let mut best_entities: HashMap<String, Best> = HashMap::new();
    let mut best_documents: HashMap<String, LinkedDocument> = HashMap::new();
    let mut expanded = 0usize;

    while let Some(entity_id) = queue.pop_front() {
        queued.remove(&entity_id);
        // Always the best path known when the node is expanded, not the
        // one that first enqueued it.
        let Some(path) = paths.get(&entity_id).copied() else {
            continue;
        };
        let here = path.score();
        if expanded_at.get(&entity_id).is_some_and(|s| *s >= here) {
            continue;
        }
        if expanded >= params.max_nodes {
            debug!(max_nodes = params.max_nodes, "graph walk hit node budget");
            break;
        }
        expanded += 1;
        expanded_at.insert(entity_id.clone(), here);

        let node = NodeRef::Entity(entity_id.clone());
        let edges = match graph.edges_for(&node).await {
            Ok(e) => e,
            Err(e) => {
                warn!(entity = %entity_id, error = %e, "edge lookup failed");
                out.failures
                    .push(StageFailure::new(Stage::Graph, FailureKind::Error, e.to_string()));
                continue;
            }
        };

        for edge in edges {
            if edge.weight < params.min_edge_confidence {
                continue;
            }
            let Some(other) = edge.other_end(&node) else {
                continue;
            };
            match other {
                NodeRef::Document(doc_id) => {
                    if !filters.allows(doc_id) {
                        continue;
                    }
                    let score = here * edge.weight;
                    let better = best_documents
                        .get(doc_id)
                        .map_or(true, |d| score > d.score);
                    if better {
                        best_documents.insert(
                            doc_id.clone(),
                            LinkedDocument {
                                document_id: doc_id.clone(),
                                score,
                                via_entity: entity_id.clone(),
                                relation: edge.relation,
                            },
                        );
                    }
                }
                NodeRef::Entity(next_id) => {
                    let candidate = Path {
                        weight: path.weight * edge.weight,
                        depth: path.depth + 1,
                    };
                    if candidate.depth > params.max_depth || seed_ids.contains(next_id.as_str()) {
                        continue;
                    }
                    let score = candidate.score();
                    let better = best_entities
                        .get(next_id)
                        .map_or(true, |b| score > b.score);
                    if !better {
                        continue;
                    }
                    best_entities.insert(
                        next_id.clone(),
                        Best {
                            score,
                            depth: candidate.depth,
                            via: edge.relation,
                        },
                    );
                    paths.insert(next_id.clone(), candidate);
                    // re-expand an already walked node so its documents and
                    // neighbours see the stronger path
                    if queued.insert(next_id.clone()) {
                        queue.push_back(next_id.clone());
                    }
                }
            }
        }
    }
    out.visited = expanded;

    let mut related = Vec::new();
    for (id, best) in best_entities {
        match graph.get_entity(&id).await {
            Ok(Some(entity)) => related.push(RelatedEntity {
                entity,
                score: best.score,
                depth: best.depth,
                via: best.via,
            }),
            Ok(None) => debug!(entity = %id, "edge points at missing entity"),
            Err(e) => out
                .failures
                .push(StageFailure::new(Stage::Graph, FailureKind::Error, e.to_string())),
        }
    }
    related.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });

    let mut documents: Vec<LinkedDocument> = best_documents.into_values().collect();
    documents.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    documents.truncate(params.max_documents);

    out.terms = collect_terms(graph, &related, query, params.max_terms, &mut out.failures).await;
    out.related = related;
    out.documents = documents;
    debug!(
        related = out.related.len(),
        documents = out.documents.len(),
        terms = out.terms.len(),
        visited = out.visited,
        "graph expansion complete"
    );
    out
}

/// Related-entity names and primary aliases not already in the query.
async fn collect_terms(
    graph: &dyn KnowledgeGraph,
    related: &[RelatedEntity],
    query: &str,
    max_terms: usize,
    failures: &mut Vec<StageFailure>,
) -> Vec<String> {
    let query_words = query_terms(query);
    let mut terms: Vec<String> = Vec::new();
    let push = |terms: &mut Vec<String>, text: &str| {
        let words = query_terms(text);
        if words.is_empty() || words.iter().all(|w| query_words.contains(w)) {
            return;
        }
        if !terms.iter().any(|t| t.eq_ignore_ascii_case(text)) {
            terms.push(text.to_string());
        }
    };

    for r in related {
        if terms.len() >= max_terms {
            break;
        }
        push(&mut terms, &r.entity.name);
        match graph.aliases_for(&r.entity.id).await {
            Ok(aliases) => {
                for a in aliases.iter().filter(|a| a.is_primary) {
                    push(&mut terms, &a.alias);
                }
            }
            Err(e) => failures.push(StageFailure::new(Stage::Graph, FailureKind::Error, e.to_string())),
        }
    }
    terms.truncate(max_terms);
    terms
}
