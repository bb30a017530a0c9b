//! # Context Relay
//!
//! Multi-stage hybrid retrieval and multi-turn context engine.
//!
//! Context Relay answers a natural-language query against an already
//! chunked and embedded private corpus with a ranked, de-duplicated,
//! citable context bundle. The retrieval stages live in
//! `context-relay-core`; this crate wires them to SQLite, HTTP model
//! providers, a CLI and an HTTP API.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌───────────────────────────────┐
//!  query ─────────▶│            Engine             │
//!                  │ recognize · rewrite · HyDE    │
//!                  │ lexical+vector · graph walk   │
//!                  │ fuse · rerank · carry-over    │
//!                  └──────┬──────────────┬─────────┘
//!                         │              │
//!                  ┌──────▼─────┐  ┌─────▼──────┐
//!                  │   SQLite   │  │  LLM/embed │
//!                  │ FTS5 + vec │  │  (HTTP)    │
//!                  └────────────┘  └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! relay init                                       # create database
//! relay query "what does OpenAI build?" --persona research
//! relay serve                                      # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Chunk index, knowledge graph and conversation store on SQLite |
//! | [`embedding`] | HTTP embedding providers |
//! | [`llm`] | HTTP structured-output LLM providers |
//! | [`retry`] | Retry-once decorators for store reads |
//! | [`cache`] | Result cache |
//! | [`analytics`] | Analytics sinks |
//! | [`engine`] | Query orchestration |
//! | [`query_cmd`] | `query`, `sources` and `pin` commands |
//! | [`server`] | HTTP server |

pub mod analytics;
pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod llm;
pub mod migrate;
pub mod query_cmd;
pub mod retry;
pub mod server;
pub mod sqlite_store;
