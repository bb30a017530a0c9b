//! Retry-once decorators for the index and graph collaborators.
//!
//! A transient SQLite busy error or a dropped connection should not cost
//! a whole signal, so every read is attempted twice with a short pause.
//! Anything that fails twice is returned to the engine, which records it
//! as a stage failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use context_relay_core::models::{Alias, Chunk, Entity, KnowledgeEdge, NodeRef};
use context_relay_core::store::{ChunkIndex, EntityMatch, KnowledgeGraph, ScoredChunk, SearchFilters};

pub const RETRY_DELAY: Duration = Duration::from_millis(100);

async fn once_more<T, F, Fut>(op: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Ok(v) => Ok(v),
        Err(e) => {
            debug!(op, error = %e, "retrying after failure");
            tokio::time::sleep(RETRY_DELAY).await;
            call().await
        }
    }
}

pub struct RetryingIndex<I: ?Sized> {
    inner: Arc<I>,
}

impl<I: ?Sized> RetryingIndex<I> {
    pub fn new(inner: Arc<I>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<I: ChunkIndex + ?Sized> ChunkIndex for RetryingIndex<I> {
    async fn keyword_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        once_more("keyword_search", || self.inner.keyword_search(query, filters, limit)).await
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        once_more("vector_search", || self.inner.vector_search(query_vec, filters, limit)).await
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        once_more("get_chunks", || self.inner.get_chunks(ids)).await
    }

    async fn representative_chunks(
        &self,
        filters: &SearchFilters,
        document_ids: &[String],
        per_document: usize,
    ) -> Result<Vec<Chunk>> {
        once_more("representative_chunks", || {
            self.inner
                .representative_chunks(filters, document_ids, per_document)
        })
        .await
    }
}

pub struct RetryingGraph<G: ?Sized> {
    inner: Arc<G>,
}

impl<G: ?Sized> RetryingGraph<G> {
    pub fn new(inner: Arc<G>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<G: KnowledgeGraph + ?Sized> KnowledgeGraph for RetryingGraph<G> {
    async fn match_entities(&self, persona_id: &str, query: &str) -> Result<Vec<EntityMatch>> {
        once_more("match_entities", || self.inner.match_entities(persona_id, query)).await
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        once_more("get_entity", || self.inner.get_entity(id)).await
    }

    async fn edges_for(&self, node: &NodeRef) -> Result<Vec<KnowledgeEdge>> {
        once_more("edges_for", || self.inner.edges_for(node)).await
    }

    async fn aliases_for(&self, entity_id: &str) -> Result<Vec<Alias>> {
        once_more("aliases_for", || self.inner.aliases_for(entity_id)).await
    }
}
