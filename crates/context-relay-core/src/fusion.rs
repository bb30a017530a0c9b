//! Cross-signal fusion.
//!
//! # Scoring
//!
//! 1. Min-max normalize lexical scores and vector similarities to `[0, 1]`
//!    over the pool members that carry that signal.
//! 2. `combined = min(1, w_v × vector + w_l × lexical + w_g × graph_boost)`.
//! 3. Gate: a candidate whose raw vector similarity is below
//!    `vector_threshold` *and* whose keyword hits are below
//!    `min_keyword_hits` is dropped. Graph-sourced candidates bypass that
//!    gate but must reach `graph_boost_threshold`.
//! 4. Sort by combined (desc), raw vector (desc), chunk id (asc).

use std::cmp::Ordering;

use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::models::Chunk;
use crate::retriever::PooledCandidate;

/// Raw and normalized score for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalScore {
    pub raw: f64,
    pub normalized: f64,
}

/// A pooled candidate after fusion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedCandidate {
    pub chunk: Chunk,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical: Option<SignalScore>,
    pub keyword_hits: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<SignalScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_boost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_entity: Option<String>,
    /// Set by the reranker when it scored this candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
    pub combined: f64,
}

impl FusedCandidate {
    /// Raw cosine similarity, before normalization.
    pub fn vector_raw(&self) -> Option<f64> {
        self.vector.map(|s| s.raw)
    }
}

/// Observed `(min, max)` of a score set, `None` when empty.
fn score_range(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

/// Min-max normalize `value` within `range`.
///
/// If every score in the set is equal, it normalizes to `1.0`.
pub fn normalize_score(value: f64, (s_min, s_max): (f64, f64)) -> f64 {
    if (s_max - s_min).abs() < f64::EPSILON {
        1.0
    } else {
        ((value - s_min) / (s_max - s_min)).clamp(0.0, 1.0)
    }
}

/// Min-max normalize a whole score set.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    match score_range(scores.iter().copied()) {
        Some(range) => scores.iter().map(|s| normalize_score(*s, range)).collect(),
        None => Vec::new(),
    }
}

/// The total order used for final rankings.
pub fn fused_order(a: &FusedCandidate, b: &FusedCandidate) -> Ordering {
    b.combined
        .total_cmp(&a.combined)
        .then_with(|| {
            let av = a.vector_raw().unwrap_or(f64::NEG_INFINITY);
            let bv = b.vector_raw().unwrap_or(f64::NEG_INFINITY);
            bv.total_cmp(&av)
        })
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

fn passes_gate(c: &PooledCandidate, cfg: &RetrievalConfig) -> bool {
    if let Some(g) = &c.graph {
        return g.boost >= cfg.graph_boost_threshold;
    }
    let vector_ok = c.vector.is_some_and(|v| v >= cfg.vector_threshold);
    let lexical_ok = c.keyword_hits >= cfg.min_keyword_hits;
    vector_ok || lexical_ok
}

/// Fuse pooled candidates into one deterministic ranking.
///
/// Applies the relevance gate, normalizes each signal over the whole
/// pool (gated-out candidates still count toward the observed range) and
/// scores the survivors as described in the module docs. The result is
/// sorted by [`fused_order`], so equal input always yields the same
/// order.
///
/// `cfg` is expected to be sanitized already; weights are used as given.
pub fn fuse(pool: Vec<PooledCandidate>, cfg: &RetrievalConfig) -> Vec<FusedCandidate> {
    let lexical_range = score_range(pool.iter().filter_map(|c| c.lexical));
    let vector_range = score_range(pool.iter().filter_map(|c| c.vector));

    let mut fused: Vec<FusedCandidate> = pool
        .into_iter()
        .filter(|c| passes_gate(c, cfg))
        .map(|c| {
            let lexical = c.lexical.zip(lexical_range).map(|(raw, range)| SignalScore {
                raw,
                normalized: normalize_score(raw, range),
            });
            let vector = c.vector.zip(vector_range).map(|(raw, range)| SignalScore {
                raw,
                normalized: normalize_score(raw, range),
            });
            let graph_boost = c.graph.as_ref().map(|g| g.boost.clamp(0.0, 1.0));
            let combined = (cfg.vector_weight * vector.map_or(0.0, |s| s.normalized)
                + cfg.lexical_weight * lexical.map_or(0.0, |s| s.normalized)
                + cfg.graph_weight * graph_boost.unwrap_or(0.0))
            .min(1.0);
            FusedCandidate {
                chunk: c.chunk,
                lexical,
                keyword_hits: c.keyword_hits,
                vector,
                graph_boost,
                graph_entity: c.graph.map(|g| g.entity_id),
                rerank_score: None,
                combined,
            }
        })
        .collect();

    fused.sort_by(fused_order);
    fused
}

/// Mean raw vector similarity of the candidates that have one.
pub fn average_similarity(candidates: &[FusedCandidate]) -> f64 {
    let sims: Vec<f64> = candidates.iter().filter_map(FusedCandidate::vector_raw).collect();
    if sims.is_empty() {
        0.0
    } else {
        sims.iter().sum::<f64>() / sims.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::tests::chunk;
    use crate::retriever::GraphSupport;

    fn pooled(id: &str, lexical: Option<(f64, u32)>, vector: Option<f64>) -> PooledCandidate {
        PooledCandidate {
            chunk: chunk(id, &format!("doc-{id}"), "text"),
            lexical: lexical.map(|(s, _)| s),
            keyword_hits: lexical.map_or(0, |(_, h)| h),
            vector,
            graph: None,
        }
    }

    fn ids(fused: &[FusedCandidate]) -> Vec<&str> {
        fused.iter().map(|f| f.chunk.id.as_str()).collect()
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let result = normalize_scores(&[5.0]);
        assert_eq!(result.len(), 1);
        assert!((result[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let result = normalize_scores(&[10.0, 5.0, 0.0]);
        assert!((result[0] - 1.0).abs() < 1e-9);
        assert!((result[1] - 0.5).abs() < 1e-9);
        assert!((result[2] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        for score in normalize_scores(&[3.0, 3.0]) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scores_always_in_unit() {
        for score in normalize_scores(&[-5.0, 100.0, 42.0]) {
            assert!((0.0..=1.0).contains(&score), "score {score} not in [0, 1]");
        }
    }

    #[test]
    fn low_vector_and_no_keyword_hits_is_excluded() {
        let cfg = RetrievalConfig::default();
        let pool = vec![
            pooled("weak", None, Some(0.20)),
            pooled("strong", None, Some(0.80)),
            pooled("lexical", Some((2.0, 1)), Some(0.10)),
        ];
        let fused = fuse(pool, &cfg);
        assert_eq!(ids(&fused), vec!["strong", "lexical"]);
    }

    #[test]
    fn graph_sourced_candidates_use_boost_gate() {
        let cfg = RetrievalConfig::default();
        let mut linked = pooled("linked", None, None);
        linked.graph = Some(GraphSupport {
            boost: 0.4,
            entity_id: "e".to_string(),
        });
        let mut faint = pooled("faint", None, Some(0.05));
        faint.graph = Some(GraphSupport {
            boost: 0.01,
            entity_id: "e".to_string(),
        });
        let fused = fuse(vec![linked, faint], &cfg);
        assert_eq!(ids(&fused), vec!["linked"]);
        assert!((fused[0].combined - 0.2 * 0.4).abs() < 1e-9);
        assert_eq!(fused[0].graph_entity.as_deref(), Some("e"));
    }

    #[test]
    fn combined_score_is_weighted_and_capped() {
        let cfg = RetrievalConfig {
            vector_weight: 0.7,
            lexical_weight: 0.3,
            graph_weight: 0.2,
            ..Default::default()
        };
        let mut top = pooled("top", Some((9.0, 3)), Some(0.9));
        top.graph = Some(GraphSupport {
            boost: 1.0,
            entity_id: "e".to_string(),
        });
        let low = pooled("low", Some((1.0, 1)), Some(0.5));
        let fused = fuse(vec![low, top], &cfg);
        assert_eq!(ids(&fused), vec!["top", "low"]);
        assert!((fused[0].combined - 1.0).abs() < 1e-9);
        assert!((fused[1].combined - 0.0).abs() < 1e-9);
        assert_eq!(fused[0].vector.unwrap().raw, 0.9);
    }

    #[test]
    fn ties_break_on_raw_vector_then_id() {
        let cfg = RetrievalConfig::default();
        // Equal lexical scores normalize to 1.0 for all three.
        let pool = vec![
            pooled("c", Some((1.0, 1)), None),
            pooled("b", Some((1.0, 1)), None),
            pooled("a", Some((1.0, 1)), None),
        ];
        let fused = fuse(pool, &cfg);
        assert_eq!(ids(&fused), vec!["a", "b", "c"]);
    }

    #[test]
    fn fusion_is_deterministic_across_input_orders() {
        let cfg = RetrievalConfig::default();
        let make = || {
            vec![
                pooled("x", Some((3.0, 2)), Some(0.6)),
                pooled("y", Some((3.0, 2)), Some(0.6)),
                pooled("z", None, Some(0.9)),
                pooled("w", Some((5.0, 1)), None),
            ]
        };
        let forward = fuse(make(), &cfg);
        let mut reversed_pool = make();
        reversed_pool.reverse();
        let reversed = fuse(reversed_pool, &cfg);
        assert_eq!(ids(&forward), ids(&reversed));
        assert_eq!(forward, reversed);
    }

    #[test]
    fn average_similarity_ignores_lexical_only() {
        let cfg = RetrievalConfig::default();
        let fused = fuse(
            vec![
                pooled("a", None, Some(0.8)),
                pooled("b", None, Some(0.4)),
                pooled("c", Some((1.0, 1)), None),
            ],
            &cfg,
        );
        assert!((average_similarity(&fused) - 0.6).abs() < 1e-9);
        assert_eq!(average_similarity(&[]), 0.0);
    }
}
