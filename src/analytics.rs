//! Analytics sinks.
//!
//! | `[analytics] sink` | Sink |
//! |--------------------|------|
//! | `"log"` | [`LogSink`]: one structured `tracing` event per query |
//! | `"sqlite"` | [`SqliteSink`]: rows in `query_analytics`, written off the request path |
//! | `"disabled"` | [`NoopSink`] |
//!
//! [`AnalyticsSink::record`] is synchronous and must never block a query,
//! so the SQLite sink only enqueues; a background worker does the insert.
//! A full queue drops the record with a warning.

use std::sync::Arc;

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use context_relay_core::analytics::{AnalyticsSink, NoopSink, QueryRecord};

use crate::config::AnalyticsConfig;

pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn record(&self, record: QueryRecord) {
        let tiers: Vec<&str> = record.stats.tiers_used.iter().map(|t| t.as_str()).collect();
        info!(
            target: "context_relay::analytics",
            persona = %record.persona_id,
            conversation = record.conversation_id.as_deref().unwrap_or("-"),
            query_hash = %record.query_hash,
            outcome = record.outcome.as_str(),
            query_type = record.stats.query_type.as_str(),
            chunks = record.chunk_count,
            retrieval_ms = record.stats.retrieval_time_ms,
            avg_similarity = record.stats.average_similarity,
            tiers = %tiers.join(","),
            graph_expansions = record.stats.graph_expansions,
            reranked = record.stats.reranking_used,
            cache_hit = record.stats.cache_hit,
            failures = record.stats.stage_failures.len(),
            "query recorded"
        );
    }
}

enum Message {
    Record(Box<QueryRecord>),
    Flush(oneshot::Sender<()>),
}

/// Enqueues records for a background SQLite writer.
#[derive(Clone)]
pub struct SqliteSink {
    tx: mpsc::Sender<Message>,
}

impl SqliteSink {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn start(pool: SqlitePool, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(run_writer(pool, rx));
        (Self { tx }, handle)
    }

    /// Wait until every record enqueued before this call is written.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).await.is_err() {
            bail!("analytics writer has stopped");
        }
        done_rx.await?;
        Ok(())
    }
}

impl AnalyticsSink for SqliteSink {
    fn record(&self, record: QueryRecord) {
        if let Err(e) = self.tx.try_send(Message::Record(Box::new(record))) {
            warn!(error = %e, "analytics queue full, record dropped");
        }
    }
}

async fn run_writer(pool: SqlitePool, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Record(record) => {
                if let Err(e) = insert_record(&pool, &record).await {
                    warn!(error = %e, "failed to write analytics record");
                }
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("analytics writer stopped");
}

async fn insert_record(pool: &SqlitePool, record: &QueryRecord) -> Result<()> {
    let stats_json = serde_json::to_string(&record.stats)?;
    sqlx::query(
        "INSERT INTO query_analytics (recorded_at, persona_id, conversation_id, query_hash, \
         outcome, query_type, chunk_count, retrieval_time_ms, average_similarity, \
         reranking_used, cache_hit, stats_json) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.recorded_at.to_rfc3339())
    .bind(&record.persona_id)
    .bind(&record.conversation_id)
    .bind(&record.query_hash)
    .bind(record.outcome.as_str())
    .bind(record.stats.query_type.as_str())
    .bind(record.chunk_count as i64)
    .bind(record.stats.retrieval_time_ms as i64)
    .bind(record.stats.average_similarity)
    .bind(record.stats.reranking_used)
    .bind(record.stats.cache_hit)
    .bind(stats_json)
    .execute(pool)
    .await?;
    Ok(())
}

/// Build the configured sink. The SQLite writer's join handle is
/// detached; it stops when the last sink clone is dropped.
pub fn create_sink(config: &AnalyticsConfig, pool: &SqlitePool) -> Result<Arc<dyn AnalyticsSink>> {
    match config.sink.as_str() {
        "log" => Ok(Arc::new(LogSink)),
        "disabled" => Ok(Arc::new(NoopSink)),
        "sqlite" => {
            let (sink, _handle) = SqliteSink::start(pool.clone(), config.buffer);
            Ok(Arc::new(sink))
        }
        other => bail!("Unknown analytics sink: {}", other),
    }
}
