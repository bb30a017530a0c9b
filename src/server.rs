//! HTTP API for the retrieval engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/query` | One retrieval query, returns a context bundle |
//! | `POST` | `/bridge` | Conversation bridge: `new_conversation`, `reply_to_conversation` |
//! | `GET`  | `/conversations/{id}/sources` | Carry-over state of a conversation |
//! | `POST` | `/conversations/{id}/pin` | Pin or unpin a document |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unavailable` (503),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use context_relay_core::analytics::AnalyticsSink;
use context_relay_core::bundle::{ContextBundle, QueryOptions, QueryRequest};
use context_relay_core::error::RetrievalError;
use context_relay_core::store::ConversationSnapshot;

use crate::analytics::create_sink;
use crate::config::Config;
use crate::db;
use crate::engine::Engine;
use crate::sqlite_store::SqliteStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
    /// Conversation registry used by the bridge.
    store: Arc<SqliteStore>,
    sink: Arc<dyn AnalyticsSink>,
    default_persona: String,
}

impl AppState {
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<SqliteStore>,
        sink: Arc<dyn AnalyticsSink>,
        default_persona: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            store,
            sink,
            default_persona: default_persona.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/query", post(handle_query))
        .route("/bridge", post(handle_bridge))
        .route("/conversations/{id}/sources", get(handle_sources))
        .route("/conversations/{id}/pin", post(handle_pin))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let engine = Arc::new(Engine::from_config(config, store.clone())?);
    let sink = create_sink(&config.analytics, &pool)?;
    let state = AppState::new(engine, store, sink, config.server.default_persona.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "relay server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        match &err {
            RetrievalError::InvalidRequest(_) => bad_request(err.to_string()),
            RetrievalError::AllSignalsUnavailable(_) => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "unavailable",
                message: err.to_string(),
            },
            RetrievalError::Persona { .. } | RetrievalError::Store(_) => {
                error!(error = ?err, "request failed");
                internal(err.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = ?err, "request failed");
        internal(err.to_string())
    }
}

/// Body decoding with the error contract instead of Axum's plain-text rejection.
fn decode<T: DeserializeOwned>(body: Value) -> Result<T, AppError> {
    serde_json::from_value(body).map_err(|e| bad_request(format!("invalid request body: {}", e)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /query ============

async fn handle_query(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ContextBundle>, AppError> {
    let request: QueryRequest = decode(body)?;
    let bundle = state.engine.query(&request, state.sink.as_ref()).await?;
    Ok(Json(bundle))
}

// ============ POST /bridge ============

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum BridgeRequest {
    #[serde(rename_all = "camelCase")]
    NewConversation {
        #[serde(default)]
        persona_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ReplyToConversation {
        conversation_id: String,
        query: String,
        #[serde(default)]
        document_id_filter: Option<Vec<String>>,
        #[serde(default)]
        options: QueryOptions,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewConversationResponse {
    conversation_id: String,
    persona_id: String,
}

async fn handle_bridge(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    match decode::<BridgeRequest>(body)? {
        BridgeRequest::NewConversation { persona_id } => {
            let persona_id = persona_id
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| state.default_persona.clone());
            let conversation_id = uuid::Uuid::new_v4().to_string();
            state
                .store
                .create_conversation(&conversation_id, &persona_id)
                .await?;
            info!(conversation = %conversation_id, persona = %persona_id, "conversation created");
            Ok(Json(NewConversationResponse {
                conversation_id,
                persona_id,
            })
            .into_response())
        }
        BridgeRequest::ReplyToConversation {
            conversation_id,
            query,
            document_id_filter,
            options,
        } => {
            let persona = state
                .store
                .conversation_persona(&conversation_id)
                .await?
                .ok_or_else(|| not_found(format!("conversation not found: {}", conversation_id)))?;
            let request = QueryRequest {
                query,
                persona_id: persona.unwrap_or_else(|| state.default_persona.clone()),
                conversation_id: Some(conversation_id),
                document_id_filter,
                options,
            };
            let bundle = state.engine.query(&request, state.sink.as_ref()).await?;
            Ok(Json(bundle).into_response())
        }
    }
}

// ============ Conversations ============

async fn handle_sources(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationSnapshot>, AppError> {
    if state.store.conversation_persona(&id).await?.is_none() {
        return Err(not_found(format!("conversation not found: {}", id)));
    }
    Ok(Json(state.engine.sources(&id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinRequest {
    document_id: String,
    #[serde(default = "default_pinned")]
    pinned: bool,
}

fn default_pinned() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PinResponse {
    conversation_id: String,
    document_id: String,
    pinned: bool,
}

async fn handle_pin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<PinResponse>, AppError> {
    let pin: PinRequest = decode(body)?;
    if pin.document_id.trim().is_empty() {
        return Err(bad_request("documentId must not be empty"));
    }
    if state.store.conversation_persona(&id).await?.is_none() {
        return Err(not_found(format!("conversation not found: {}", id)));
    }
    state
        .engine
        .set_pinned(&id, &pin.document_id, pin.pinned)
        .await?;
    Ok(Json(PinResponse {
        conversation_id: id,
        document_id: pin.document_id,
        pinned: pin.pinned,
    }))
}
