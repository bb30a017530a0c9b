//! Query entity recognition.
//!
//! Two passes: a knowledge-graph substring lookup proposes candidate
//! entities, then an LLM confirms and disambiguates them and adds an
//! intent label plus expansion keywords. The LLM pass is optional in
//! effect: on any failure the graph matches are used alone with intent
//! [`Intent::Unknown`].

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{FailureKind, LlmError, Stage, StageFailure};
use crate::llm::{array_field, str_field, LlmProvider, LlmRequest};
use crate::models::Entity;
use crate::store::{EntityMatch, KnowledgeGraph};

/// Coarse query intent, reported as the query type in stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Factual,
    Comparison,
    Exploratory,
    Procedural,
    Definition,
    Unknown,
}

impl Intent {
    /// Case-insensitive; anything unrecognized is [`Intent::Unknown`].
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "factual" => Intent::Factual,
            "comparison" => Intent::Comparison,
            "exploratory" => Intent::Exploratory,
            "procedural" => Intent::Procedural,
            "definition" => Intent::Definition,
            _ => Intent::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Factual => "factual",
            Intent::Comparison => "comparison",
            Intent::Exploratory => "exploratory",
            Intent::Procedural => "procedural",
            Intent::Definition => "definition",
            Intent::Unknown => "unknown",
        }
    }
}

/// An entity the query refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedEntity {
    pub entity: Entity,
    /// In `[0, 1]`; seeds the graph walk's path weights.
    pub confidence: f64,
    /// Byte range in the lowercased query.
    pub span: (usize, usize),
    pub matched: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub entities: Vec<RecognizedEntity>,
    pub intent: Intent,
    /// Expansion keywords, never repeating a recognized entity's name.
    pub keywords: Vec<String>,
    /// False when the graph matches were used alone.
    pub llm_used: bool,
    #[serde(skip)]
    pub failures: Vec<StageFailure>,
}

impl Recognition {
    pub fn empty() -> Self {
        Self {
            entities: Vec::new(),
            intent: Intent::Unknown,
            keywords: Vec::new(),
            llm_used: false,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecognizerParams {
    pub max_keywords: usize,
    pub timeout: Duration,
}

fn match_score(m: &EntityMatch) -> f64 {
    (m.alias_confidence * (0.5 + 0.5 * m.entity.authority.clamp(0.0, 1.0))).clamp(0.0, 1.0)
}

/// One candidate per entity, keeping its best-scoring match.
fn dedupe_candidates(matches: Vec<EntityMatch>) -> Vec<RecognizedEntity> {
    let mut best: HashMap<String, RecognizedEntity> = HashMap::new();
    for m in matches {
        let score = match_score(&m);
        let replace = best
            .get(&m.entity.id)
            .map_or(true, |existing| score > existing.confidence);
        if replace {
            best.insert(
                m.entity.id.clone(),
                RecognizedEntity {
                    entity: m.entity,
                    confidence: score,
                    span: m.span,
                    matched: m.matched,
                },
            );
        }
    }
    let mut out: Vec<RecognizedEntity> = best.into_values().collect();
    sort_entities(&mut out);
    out
}

fn sort_entities(entities: &mut [RecognizedEntity]) {
    entities.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
}

/// Without an LLM to disambiguate, an overlapping surface form keeps
/// only its strongest entity.
fn resolve_ambiguity(candidates: &[RecognizedEntity]) -> Vec<RecognizedEntity> {
    let mut kept: Vec<RecognizedEntity> = Vec::new();
    for c in candidates {
        let overlaps = kept
            .iter()
            .any(|k| c.span.0 < k.span.1 && k.span.0 < c.span.1);
        if !overlaps {
            kept.push(c.clone());
        }
    }
    kept
}

fn build_prompt(query: &str, candidates: &[RecognizedEntity], max_keywords: usize) -> String {
    let mut listing = String::new();
    for c in candidates {
        listing.push_str(&format!(
            "- id={} name=\"{}\" kind={} matched=\"{}\" description=\"{}\"\n",
            c.entity.id,
            c.entity.name,
            c.entity.kind.as_str(),
            c.matched,
            c.entity.description.replace('\n', " ")
        ));
    }
    if listing.is_empty() {
        listing.push_str("(none)\n");
    }
    format!(
        "You analyze search queries against a private knowledge base.\n\
         Query: \"{query}\"\n\n\
         Candidate entities found by name matching:\n{listing}\n\
         Tasks:\n\
         1. Keep only candidates the query actually refers to; give each a confidence in [0,1].\n\
         2. Classify the intent as one of: factual, comparison, exploratory, procedural, definition.\n\
         3. Suggest up to {max_keywords} search keywords not already covered by the kept entities.\n\
         Respond with JSON only."
    )
}

fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "confidence": { "type": "number" }
                    },
                    "required": ["id", "confidence"]
                }
            },
            "intent": { "type": "string" },
            "keywords": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["entities", "intent", "keywords"]
    })
}

/// Merge the LLM's judgement with the graph candidates.
///
/// Only candidate ids are accepted back, so the LLM can drop or re-rank
/// entities but never invent one.
fn apply_judgement(
    candidates: &[RecognizedEntity],
    output: &Value,
    max_keywords: usize,
) -> Result<Recognition, LlmError> {
    let judged = array_field(output, "entities")?;
    let mut entities = Vec::new();
    for entry in judged {
        let Some(id) = str_field(entry, "id") else {
            continue;
        };
        let Some(candidate) = candidates.iter().find(|c| c.entity.id == id) else {
            debug!(id, "llm returned unknown entity id, ignored");
            continue;
        };
        if entities
            .iter()
            .any(|e: &RecognizedEntity| e.entity.id == candidate.entity.id)
        {
            continue;
        }
        let confidence = entry
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(candidate.confidence)
            .clamp(0.0, 1.0);
        let mut e = candidate.clone();
        e.confidence = confidence;
        entities.push(e);
    }
    sort_entities(&mut entities);

    let intent = output
        .get("intent")
        .and_then(Value::as_str)
        .map(Intent::parse)
        .unwrap_or(Intent::Unknown);

    let covered: Vec<String> = entities
        .iter()
        .flat_map(|e| [e.entity.name.to_lowercase(), e.matched.to_lowercase()])
        .collect();
    let mut keywords: Vec<String> = Vec::new();
    if let Some(raw) = output.get("keywords").and_then(Value::as_array) {
        for kw in raw.iter().filter_map(Value::as_str) {
            let kw = kw.trim();
            let lower = kw.to_lowercase();
            if kw.is_empty() || covered.contains(&lower) {
                continue;
            }
            if keywords.iter().any(|k| k.to_lowercase() == lower) {
                continue;
            }
            keywords.push(kw.to_string());
            if keywords.len() >= max_keywords {
                break;
            }
        }
    }

    Ok(Recognition {
        entities,
        intent,
        keywords,
        llm_used: true,
        failures: Vec::new(),
    })
}

/// Knowledge-graph candidates for `query`, one per entity, strongest first.
///
/// A store error is returned as a [`Stage::Graph`] failure.
pub async fn candidates(
    graph: &dyn KnowledgeGraph,
    persona_id: &str,
    query: &str,
) -> Result<Vec<RecognizedEntity>, StageFailure> {
    match graph.match_entities(persona_id, query).await {
        Ok(m) => Ok(dedupe_candidates(m)),
        Err(e) => {
            warn!(error = %e, "entity lookup failed");
            Err(StageFailure::new(Stage::Graph, FailureKind::Error, e.to_string()))
        }
    }
}

/// Recognition from graph candidates alone, used whenever the LLM pass
/// is unavailable. Overlapping surface forms keep their strongest entity
/// and `failure` is recorded.
pub fn graph_only(candidates: &[RecognizedEntity], failure: StageFailure) -> Recognition {
    Recognition {
        entities: resolve_ambiguity(candidates),
        intent: Intent::Unknown,
        keywords: Vec::new(),
        llm_used: false,
        failures: vec![failure],
    }
}

/// LLM pass over `candidates`: confirm, re-score, label intent and
/// propose expansion keywords. Falls back to [`graph_only`] on any
/// provider or output error.
pub async fn judge(
    llm: &dyn LlmProvider,
    query: &str,
    candidates: &[RecognizedEntity],
    params: &RecognizerParams,
) -> Recognition {
    let request = LlmRequest {
        task: "entity_recognition",
        prompt: build_prompt(query, candidates, params.max_keywords),
        schema: schema(),
        timeout: params.timeout,
    };

    let outcome = match llm.complete(&request).await {
        Ok(output) => apply_judgement(candidates, &output, params.max_keywords),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(r) => {
            debug!(
                entities = r.entities.len(),
                intent = r.intent.as_str(),
                keywords = r.keywords.len(),
                "recognition complete"
            );
            r
        }
        Err(e) => {
            debug!(error = %e, "recognition llm pass failed, using graph matches");
            graph_only(candidates, StageFailure::from_llm(Stage::Recognition, &e))
        }
    }
}

/// Recognize entities, intent and expansion keywords for `query`.
///
/// Never fails: graph errors yield an empty recognition, LLM errors fall
/// back to the graph matches. Both are reported in `failures`. Callers
/// that enforce a deadline on the LLM step should drive [`candidates`]
/// and [`judge`] themselves so a slow LLM cannot discard the graph
/// matches.
pub async fn recognize(
    graph: &dyn KnowledgeGraph,
    llm: &dyn LlmProvider,
    persona_id: &str,
    query: &str,
    params: &RecognizerParams,
) -> Recognition {
    match candidates(graph, persona_id, query).await {
        Ok(found) => judge(llm, query, &found, params).await,
        Err(failure) => {
            let mut r = Recognition::empty();
            r.failures.push(failure);
            r
        }
    }
}
