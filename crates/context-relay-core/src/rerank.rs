//! Reranking of the fused head.
//!
//! The reranker only ever reorders: a score for an index outside the
//! submitted list is ignored, so nothing can be added.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{LlmError, Stage, StageFailure};
use crate::fusion::FusedCandidate;
use crate::llm::{array_field, LlmProvider, LlmRequest};

/// Characters of each passage shown to the judge.
const PASSAGE_PREVIEW_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankScore {
    /// Position in the submitted list.
    pub index: usize,
    pub score: f64,
}

/// Scores `(query, passage)` pairs.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    async fn score(
        &self,
        query: &str,
        passages: &[&str],
        timeout: Duration,
    ) -> Result<Vec<RerankScore>, LlmError>;
}

/// Listwise relevance judge backed by an [`LlmProvider`].
pub struct LlmReranker<'a> {
    llm: &'a dyn LlmProvider,
}

impl<'a> LlmReranker<'a> {
    pub fn new(llm: &'a dyn LlmProvider) -> Self {
        Self { llm }
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(PASSAGE_PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl Reranker for LlmReranker<'_> {
    fn name(&self) -> &str {
        self.llm.model_name()
    }

    async fn score(
        &self,
        query: &str,
        passages: &[&str],
        timeout: Duration,
    ) -> Result<Vec<RerankScore>, LlmError> {
        let mut listing = String::new();
        for (i, p) in passages.iter().enumerate() {
            listing.push_str(&format!("[{i}] {}\n\n", preview(p)));
        }
        let request = LlmRequest {
            task: "rerank",
            prompt: format!(
                "Rate how well each passage answers the query on a scale from 0 to 1. \
                 Only use the indices shown.\n\nQuery: \"{query}\"\n\nPassages:\n{listing}\
                 Respond with JSON only."
            ),
            schema: json!({
                "type": "object",
                "properties": {
                    "scores": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "index": { "type": "integer" },
                                "score": { "type": "number" }
                            },
                            "required": ["index", "score"]
                        }
                    }
                },
                "required": ["scores"]
            }),
            timeout,
        };
        let output = self.llm.complete(&request).await?;
        let entries = array_field(&output, "scores")?;
        Ok(entries
            .iter()
            .filter_map(|e| {
                let index = e.get("index").and_then(Value::as_u64)? as usize;
                let score = e.get("score").and_then(Value::as_f64)?;
                score.is_finite().then_some(RerankScore {
                    index,
                    score: score.clamp(0.0, 1.0),
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankOutcome {
    pub candidates: Vec<FusedCandidate>,
    pub used: bool,
    #[serde(skip)]
    pub failure: Option<StageFailure>,
}

impl RerankOutcome {
    /// Fused order untouched, truncated to `k`.
    pub fn passthrough(mut fused: Vec<FusedCandidate>, k: usize) -> Self {
        fused.truncate(k);
        Self {
            candidates: fused,
            used: false,
            failure: None,
        }
    }
}

/// Reorder the first `top_n` of `fused` and return the best `k`.
///
/// Scored candidates come first by descending rerank score (ties keep
/// fused order); unscored ones follow in fused order. Any failure keeps
/// the fused ordering.
pub async fn rerank(
    reranker: &dyn Reranker,
    query: &str,
    mut fused: Vec<FusedCandidate>,
    top_n: usize,
    k: usize,
    timeout: Duration,
) -> RerankOutcome {
    if fused.is_empty() || top_n == 0 {
        return RerankOutcome::passthrough(fused, k);
    }
    let head_len = top_n.min(fused.len());
    let passages: Vec<&str> = fused[..head_len]
        .iter()
        .map(|c| c.chunk.content.as_str())
        .collect();

    let scores = match reranker.score(query, &passages, timeout).await {
        Ok(s) => s,
        Err(e) => {
            warn!(reranker = reranker.name(), error = %e, "rerank failed, keeping fused order");
            let mut out = RerankOutcome::passthrough(fused, k);
            out.failure = Some(StageFailure::from_llm(Stage::Rerank, &e));
            return out;
        }
    };

    let mut by_index: HashMap<usize, f64> = HashMap::new();
    for s in scores {
        if s.index >= head_len {
            debug!(index = s.index, "ignoring rerank score for unknown passage");
            continue;
        }
        by_index
            .entry(s.index)
            .and_modify(|v| *v = v.max(s.score))
            .or_insert(s.score);
    }
    if by_index.is_empty() {
        return RerankOutcome::passthrough(fused, k);
    }

    let tail = fused.split_off(head_len);
    let mut scored: Vec<(usize, FusedCandidate)> = Vec::new();
    let mut unscored: Vec<FusedCandidate> = Vec::new();
    for (i, mut c) in fused.into_iter().enumerate() {
        match by_index.get(&i) {
            Some(score) => {
                c.rerank_score = Some(*score);
                scored.push((i, c));
            }
            None => unscored.push(c),
        }
    }
    scored.sort_by(|(ia, a), (ib, b)| {
        let sa = a.rerank_score.unwrap_or(0.0);
        let sb = b.rerank_score.unwrap_or(0.0);
        sb.total_cmp(&sa).then_with(|| ia.cmp(ib))
    });

    let mut candidates: Vec<FusedCandidate> = scored.into_iter().map(|(_, c)| c).collect();
    candidates.extend(unscored);
    candidates.extend(tail);
    candidates.truncate(k);
    RerankOutcome {
        candidates,
        used: true,
        failure: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::retriever::tests::chunk;
    use futures::executor::block_on;
    use std::collections::HashSet;

    fn fused(id: &str, combined: f64) -> FusedCandidate {
        FusedCandidate {
            chunk: chunk(id, &format!("doc-{id}"), &format!("passage {id}")),
            lexical: None,
            keyword_hits: 0,
            vector: None,
            graph_boost: None,
            graph_entity: None,
            rerank_score: None,
            combined,
        }
    }

    fn pool() -> Vec<FusedCandidate> {
        vec![fused("a", 0.9), fused("b", 0.8), fused("c", 0.7), fused("d", 0.6)]
    }

    fn ids(c: &[FusedCandidate]) -> Vec<&str> {
        c.iter().map(|f| f.chunk.id.as_str()).collect()
    }

    struct Fixed(Vec<RerankScore>);

    #[async_trait]
    impl Reranker for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn score(&self, _q: &str, _p: &[&str], _t: Duration) -> Result<Vec<RerankScore>, LlmError> {
            Ok(self.0.clone())
        }
    }

    struct TimesOut;

    #[async_trait]
    impl Reranker for TimesOut {
        fn name(&self) -> &str {
            "slow"
        }
        async fn score(&self, _q: &str, _p: &[&str], t: Duration) -> Result<Vec<RerankScore>, LlmError> {
            Err(LlmError::Timeout(t.as_millis() as u64))
        }
    }

    const T: Duration = Duration::from_millis(1500);

    #[test]
    fn reorders_head_and_keeps_unscored_in_fused_order() {
        let r = Fixed(vec![
            RerankScore { index: 2, score: 0.95 },
            RerankScore { index: 0, score: 0.5 },
        ]);
        let out = block_on(rerank(&r, "q", pool(), 3, 10, T));
        assert!(out.used);
        assert_eq!(ids(&out.candidates), vec!["c", "a", "b", "d"]);
        assert_eq!(out.candidates[0].rerank_score, Some(0.95));
    }

    #[test]
    fn unknown_indices_never_add_candidates() {
        let r = Fixed(vec![
            RerankScore { index: 7, score: 1.0 },
            RerankScore { index: 1, score: 0.9 },
        ]);
        let before: HashSet<String> = pool().into_iter().map(|c| c.chunk.id).collect();
        let out = block_on(rerank(&r, "q", pool(), 4, 10, T));
        let after: HashSet<String> = out.candidates.iter().map(|c| c.chunk.id.clone()).collect();
        assert!(after.is_subset(&before));
        assert_eq!(out.candidates.len(), 4);
        assert_eq!(out.candidates[0].chunk.id, "b");
    }

    #[test]
    fn timeout_keeps_fused_order_and_reports_unused() {
        let out = block_on(rerank(&TimesOut, "q", pool(), 4, 3, T));
        assert!(!out.used);
        assert_eq!(ids(&out.candidates), vec!["a", "b", "c"]);
        assert_eq!(out.failure.unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn results_truncate_to_k() {
        let r = Fixed(vec![RerankScore { index: 3, score: 1.0 }]);
        let out = block_on(rerank(&r, "q", pool(), 4, 2, T));
        assert_eq!(ids(&out.candidates), vec!["d", "a"]);
    }

    #[test]
    fn llm_reranker_parses_and_clamps_scores() {
        struct Judge;

        #[async_trait]
        impl LlmProvider for Judge {
            fn model_name(&self) -> &str {
                "judge"
            }
            async fn complete(&self, request: &LlmRequest) -> Result<Value, LlmError> {
                assert_eq!(request.task, "rerank");
                assert!(request.prompt.contains("[1] passage b"));
                Ok(json!({ "scores": [
                    { "index": 1, "score": 3.0 },
                    { "index": "x", "score": 0.2 },
                    { "index": 0, "score": 0.4 }
                ]}))
            }
        }

        let judge = Judge;
        let reranker = LlmReranker::new(&judge);
        let scores = block_on(reranker.score("q", &["passage a", "passage b"], T)).unwrap();
        assert_eq!(
            scores,
            vec![
                RerankScore { index: 1, score: 1.0 },
                RerankScore { index: 0, score: 0.4 }
            ]
        );
    }
}
