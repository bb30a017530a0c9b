//! CLI commands that run against a configured engine.
//!
//! `relay query` prints a compact, human-readable bundle by default and
//! the full JSON bundle with `--json`. Logs go to stderr, so `--json`
//! output can be piped.

use anyhow::Result;
use std::sync::Arc;

use context_relay_core::bundle::{ContextBundle, PerformanceMode, QueryOptions, QueryRequest};

use crate::analytics::{create_sink, SqliteSink};
use crate::config::Config;
use crate::db;
use crate::engine::Engine;
use crate::sqlite_store::SqliteStore;

const PREVIEW_CHARS: usize = 160;

pub struct QueryArgs {
    pub query: String,
    pub persona: Option<String>,
    pub conversation: Option<String>,
    pub documents: Vec<String>,
    pub fast: bool,
    pub max_chunks: Option<usize>,
    pub json: bool,
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}…", &flat[..idx]),
        None => flat,
    }
}

fn print_bundle(bundle: &ContextBundle) {
    if !bundle.has_relevant_content {
        println!("No relevant content found.");
    }
    for citation in &bundle.citations {
        let pages = match (citation.page_start, citation.page_end) {
            (Some(s), Some(e)) if s != e => format!(" pp. {}-{}", s, e),
            (Some(s), _) => format!(" p. {}", s),
            _ => String::new(),
        };
        println!("{} {}{}", citation.marker, citation.document_id, pages);
        println!("    {}", citation.fact_summary);
    }
    if !bundle.chunks.is_empty() {
        println!();
    }
    for chunk in &bundle.chunks {
        println!(
            "  {:.3}  {:<9} {}  {}",
            chunk.score,
            format!("{:?}", chunk.origin).to_lowercase(),
            chunk.chunk.id,
            preview(&chunk.chunk.content)
        );
    }
    let tiers: Vec<&str> = bundle.stats.tiers_used.iter().map(|t| t.as_str()).collect();
    println!();
    println!(
        "type: {}  tiers: {}  graph: {}  reranked: {}  cached: {}  {} ms",
        bundle.stats.query_type.as_str(),
        if tiers.is_empty() { "-".to_string() } else { tiers.join(",") },
        bundle.stats.graph_expansions,
        bundle.stats.reranking_used,
        bundle.stats.cache_hit,
        bundle.stats.retrieval_time_ms
    );
    if let Some(conversation) = &bundle.conversation_id {
        println!("conversation: {}  turn: {}", conversation, bundle.turn);
    }
    for failure in &bundle.stats.stage_failures {
        println!("  ! {}: {}", failure.stage.as_str(), failure.message);
    }
}

async fn open(config: &Config) -> Result<(Engine, sqlx::SqlitePool)> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    Ok((Engine::from_config(config, store)?, pool))
}

pub async fn run_query(config: &Config, args: QueryArgs) -> Result<()> {
    let (engine, pool) = open(config).await?;

    let options = QueryOptions {
        max_chunks: args.max_chunks,
        performance_mode: if args.fast {
            PerformanceMode::Fast
        } else {
            PerformanceMode::Comprehensive
        },
        ..Default::default()
    };
    let request = QueryRequest {
        query: args.query,
        persona_id: args
            .persona
            .unwrap_or_else(|| config.server.default_persona.clone()),
        conversation_id: args.conversation,
        document_id_filter: (!args.documents.is_empty()).then_some(args.documents),
        options,
    };

    let bundle = if config.analytics.sink == "sqlite" {
        // The process exits right after, so drain the writer first.
        let (sink, _writer) = SqliteSink::start(pool, config.analytics.buffer);
        let result = engine.query(&request, &sink).await;
        sink.flush().await?;
        result?
    } else {
        let sink = create_sink(&config.analytics, &pool)?;
        engine.query(&request, sink.as_ref()).await?
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&bundle)?);
    } else {
        print_bundle(&bundle);
    }
    Ok(())
}

pub async fn run_sources(config: &Config, conversation_id: &str, json: bool) -> Result<()> {
    let (engine, _pool) = open(config).await?;
    let snapshot = engine.sources(conversation_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    if snapshot.sources.is_empty() {
        println!("No carried sources (turn {}).", snapshot.turn);
        return Ok(());
    }
    println!("turn {}", snapshot.turn);
    for s in &snapshot.sources {
        println!(
            "  {:<36} score {:.3}  last turn {}  inactive {}{}",
            s.document_id,
            s.carry_score,
            s.last_used_turn,
            s.turns_inactive,
            if s.pinned { "  pinned" } else { "" }
        );
    }
    Ok(())
}

pub async fn run_pin(config: &Config, conversation_id: &str, document_id: &str, pinned: bool) -> Result<()> {
    let (engine, _pool) = open(config).await?;
    engine.set_pinned(conversation_id, document_id, pinned).await?;
    println!(
        "{} {} in conversation {}",
        if pinned { "Pinned" } else { "Unpinned" },
        document_id,
        conversation_id
    );
    Ok(())
}
