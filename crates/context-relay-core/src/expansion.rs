//! Query rewriting and hypothetical-document (HyDE) generation.
//!
//! Both sub-operations are independent LLM calls. Output is validated
//! entry by entry: a malformed rewrite or passage is dropped while its
//! siblings survive. Any call-level failure returns an empty result for
//! that sub-operation only.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{LlmError, Stage, StageFailure};
use crate::llm::{array_field, str_field, LlmProvider, LlmRequest};

/// Longest HyDE passage kept, in characters.
pub const MAX_PASSAGE_CHARS: usize = 1200;

/// An alternative phrasing of the user's query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rewrite {
    pub query: String,
    /// What aspect of the query this phrasing emphasizes.
    pub focus: String,
    /// Logged only.
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Rewriting {
    pub rewrites: Vec<Rewrite>,
    pub expansion_terms: Vec<String>,
    #[serde(skip)]
    pub failure: Option<StageFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Hyde {
    pub passages: Vec<String>,
    #[serde(skip)]
    pub failure: Option<StageFailure>,
}

fn rewrite_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "rewrites": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "focus": { "type": "string" },
                        "reasoning": { "type": "string" }
                    },
                    "required": ["query", "focus", "reasoning"]
                }
            },
            "expansion_terms": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["rewrites", "expansion_terms"]
    })
}

fn hyde_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "passages": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["passages"]
    })
}

fn parse_rewrites(query: &str, output: &Value, max: usize) -> Result<Rewriting, LlmError> {
    let entries = array_field(output, "rewrites")?;
    let original = query.trim().to_lowercase();
    let mut rewrites: Vec<Rewrite> = Vec::new();
    for entry in entries {
        let Some(text) = str_field(entry, "query") else {
            debug!("dropping rewrite without query text");
            continue;
        };
        let lower = text.to_lowercase();
        if lower == original || rewrites.iter().any(|r| r.query.to_lowercase() == lower) {
            continue;
        }
        rewrites.push(Rewrite {
            query: text.to_string(),
            focus: str_field(entry, "focus").unwrap_or("general").to_string(),
            reasoning: str_field(entry, "reasoning").unwrap_or_default().to_string(),
        });
        if rewrites.len() >= max {
            break;
        }
    }

    let mut expansion_terms: Vec<String> = Vec::new();
    if let Some(terms) = output.get("expansion_terms").and_then(Value::as_array) {
        for term in terms.iter().filter_map(Value::as_str).map(str::trim) {
            if !term.is_empty() && !expansion_terms.iter().any(|t| t.eq_ignore_ascii_case(term)) {
                expansion_terms.push(term.to_string());
            }
        }
    }

    Ok(Rewriting {
        rewrites,
        expansion_terms,
        failure: None,
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn parse_passages(output: &Value, max: usize) -> Result<Vec<String>, LlmError> {
    let entries = array_field(output, "passages")?;
    Ok(entries
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| truncate_chars(p, MAX_PASSAGE_CHARS))
        .take(max)
        .collect())
}

/// Produce up to `max_rewrites` alternative phrasings plus expansion terms.
pub async fn rewrite(
    llm: &dyn LlmProvider,
    query: &str,
    max_rewrites: usize,
    timeout: Duration,
) -> Rewriting {
    if max_rewrites == 0 {
        return Rewriting::default();
    }
    let request = LlmRequest {
        task: "query_rewriting",
        prompt: format!(
            "Rewrite the search query below into up to {max_rewrites} alternative phrasings that \
             would match relevant passages in technical documents. Each rewrite names its focus \
             (e.g. synonym, broader, narrower, technical) and a one-line reasoning. Also list a few \
             semantic expansion terms.\n\nQuery: \"{query}\"\n\nRespond with JSON only."
        ),
        schema: rewrite_schema(),
        timeout,
    };
    let result = match llm.complete(&request).await {
        Ok(output) => parse_rewrites(query, &output, max_rewrites),
        Err(e) => Err(e),
    };
    match result {
        Ok(r) => {
            for rw in &r.rewrites {
                debug!(query = %rw.query, focus = %rw.focus, reasoning = %rw.reasoning, "rewrite");
            }
            r
        }
        Err(e) => {
            debug!(error = %e, "query rewriting failed");
            Rewriting {
                failure: Some(StageFailure::from_llm(Stage::Rewriting, &e)),
                ..Default::default()
            }
        }
    }
}

/// Produce up to `max_passages` short passages that would answer `query`.
///
/// Passages are only ever embedded as search seeds.
pub async fn hyde(
    llm: &dyn LlmProvider,
    query: &str,
    max_passages: usize,
    timeout: Duration,
) -> Hyde {
    if max_passages == 0 {
        return Hyde::default();
    }
    let request = LlmRequest {
        task: "hyde",
        prompt: format!(
            "Write {max_passages} short, factual-sounding passages (2-4 sentences each) as they \
             might appear in a technical document that answers the question below. Do not hedge.\n\n\
             Question: \"{query}\"\n\nRespond with JSON only."
        ),
        schema: hyde_schema(),
        timeout,
    };
    let result = match llm.complete(&request).await {
        Ok(output) => parse_passages(&output, max_passages),
        Err(e) => Err(e),
    };
    match result {
        Ok(passages) => Hyde {
            passages,
            failure: None,
        },
        Err(e) => {
            debug!(error = %e, "hyde generation failed");
            Hyde {
                passages: Vec::new(),
                failure: Some(StageFailure::from_llm(Stage::Hyde, &e)),
            }
        }
    }
}
