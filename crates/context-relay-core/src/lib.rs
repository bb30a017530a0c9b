//! # Context Relay Core
//!
//! Runtime-agnostic retrieval logic for Context Relay: data models,
//! collaborator traits, entity recognition, query expansion, dual
//! retrieval, graph expansion, fusion, reranking, conversation
//! carry-over and citation assembly.
//!
//! Nothing here depends on tokio, sqlx or the network. Stage deadlines,
//! retries and caching are applied by the embedding application.

pub mod analytics;
pub mod bundle;
pub mod citation;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod expansion;
pub mod fusion;
pub mod graph;
pub mod llm;
pub mod models;
pub mod recognizer;
pub mod rerank;
pub mod retriever;
pub mod store;
