//! HTTP API tests driving the router in-process.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use context_relay::config::Config;
use context_relay::engine::Engine;
use context_relay::server::{router, AppState};
use context_relay::sqlite_store::SqliteStore;
use context_relay::{db, migrate};
use context_relay_core::analytics::NoopSink;
use context_relay_core::models::Chunk;

async fn app() -> (TempDir, Router) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db(tmp.path().join("relay.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));

    store.insert_document("doc-rust", "default", None).await.unwrap();
    store
        .insert_chunk(
            &Chunk {
                id: "rust-0".to_string(),
                document_id: "doc-rust".to_string(),
                content: "Rust ownership prevents data races.".to_string(),
                token_count: 5,
                chunk_index: 0,
                page_start: Some(3),
                page_end: Some(4),
                section: Some("Ownership".to_string()),
            },
            None,
        )
        .await
        .unwrap();

    let engine = Arc::new(Engine::from_config(&config, store.clone()).unwrap());
    let state = AppState::new(engine, store, Arc::new(NoopSink), "default");
    (tmp, router(state))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let (_tmp, app) = app().await;
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn query_returns_a_cited_bundle() {
    let (_tmp, app) = app().await;
    let (status, body) = send(
        &app,
        "POST",
        "/query",
        Some(json!({ "query": "rust ownership", "personaId": "default" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hasRelevantContent"], true);
    assert_eq!(body["citations"][0]["marker"], "[1]");
    assert_eq!(body["citations"][0]["pageStart"], 3);
    assert_eq!(body["turn"], 0);
}

#[tokio::test]
async fn invalid_queries_use_the_error_contract() {
    let (_tmp, app) = app().await;

    let (status, body) = send(&app, "POST", "/query", Some(json!({ "query": "  ", "personaId": "default" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = send(&app, "POST", "/query", Some(json!({ "personaId": "default" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("invalid request body"));
}

#[tokio::test]
async fn bridge_conversation_flow() {
    let (_tmp, app) = app().await;

    let (status, created) = send(&app, "POST", "/bridge", Some(json!({ "action": "new_conversation" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["personaId"], "default");
    let id = created["conversationId"].as_str().unwrap().to_string();

    let (status, bundle) = send(
        &app,
        "POST",
        "/bridge",
        Some(json!({ "action": "reply_to_conversation", "conversationId": id, "query": "rust ownership" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bundle["turn"], 1);
    assert_eq!(bundle["conversationId"], id.as_str());

    let (status, snapshot) = send(&app, "GET", &format!("/conversations/{}/sources", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["turn"], 1);
    assert_eq!(snapshot["sources"][0]["documentId"], "doc-rust");
}

#[tokio::test]
async fn unknown_conversations_are_not_found() {
    let (_tmp, app) = app().await;

    let (status, body) = send(
        &app,
        "POST",
        "/bridge",
        Some(json!({ "action": "reply_to_conversation", "conversationId": "nope", "query": "rust" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = send(&app, "GET", "/conversations/nope/sources", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", "/conversations/nope/pin", Some(json!({ "documentId": "doc-rust" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_bridge_action_is_rejected() {
    let (_tmp, app) = app().await;
    let (status, body) = send(&app, "POST", "/bridge", Some(json!({ "action": "delete_everything" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn pin_marks_a_source() {
    let (_tmp, app) = app().await;
    let (_, created) = send(&app, "POST", "/bridge", Some(json!({ "action": "new_conversation" }))).await;
    let id = created["conversationId"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/conversations/{}/pin", id),
        Some(json!({ "documentId": "doc-rust" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pinned"], true);

    let (_, snapshot) = send(&app, "GET", &format!("/conversations/{}/sources", id), None).await;
    assert_eq!(snapshot["sources"][0]["pinned"], true);
}
