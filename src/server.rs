//! HTTP search service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/search` | Ranked search over the published shards |
//! | `POST` | `/summarize` | Search, then summarize the top hits |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `GET /search` takes `q`, `from`, `to`, `agencies` and `meetings`
//! (comma-separated), and `size`. A query without tokens answers
//! `200` with no hits and never reads the index.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "size must be > 0" } }
//! ```
//!
//! Failed searches additionally carry the empty result fields
//! (`hits: []`, `count: 0`, `query`, `tokens`) so clients can render them
//! unchanged.
//!
//! Error codes: `bad_request` (400), `not_found` (404, no index or no shard
//! loaded), `summarizer_disabled` (400), `summarizer_error` (502).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the service sits behind
//! a static front end served from another origin.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{Config, SearchConfig};
use crate::error::{SearchError, SummarizeError};
use crate::loader::ShardSource;
use crate::search::{execute, open_index, split_list, SearchQuery, SearchResponse};
use crate::summarize::{create_summarizer, summarize_hits, Summarizer, SummaryResponse};
use crate::tokenize::tokenize;

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    source: Arc<dyn ShardSource>,
    summarizer: Arc<dyn Summarizer>,
}

impl AppState {
    /// State backed by the configured shard location and summarizer.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let source = open_index(&config)?;
        let summarizer = create_summarizer(&config.summarizer)?;
        Ok(Self::new(Arc::new(config), source, summarizer))
    }

    pub fn new(
        config: Arc<Config>,
        source: Arc<dyn ShardSource>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            config,
            source,
            summarizer,
        }
    }
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState::from_config(config.clone())?;
    let app = build_router(state);

    tracing::info!(
        bind = %bind_addr,
        index = %config.index_location(),
        summarizer = %config.summarizer.provider,
        "starting server"
    );
    println!("kaigi search listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// The application router with CORS applied.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", get(handle_search))
        .route("/summarize", post(handle_summarize))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
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

/// Error body for `/search`: the empty result plus the error.
#[derive(Serialize)]
struct SearchErrorBody {
    hits: Vec<serde_json::Value>,
    count: usize,
    query: String,
    tokens: Vec<String>,
    error: ErrorDetail,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn detail(self) -> (StatusCode, ErrorDetail) {
        (
            self.status,
            ErrorDetail {
                code: self.code,
                message: self.message,
            },
        )
    }

    /// Render as a `/search` failure echoing `query`.
    fn for_search(self, query: &str) -> Response {
        let (status, error) = self.detail();
        let body = SearchErrorBody {
            hits: Vec::new(),
            count: 0,
            query: query.to_string(),
            tokens: tokenize(query).into_iter().collect(),
            error,
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = self.detail();
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::InvalidQuery(msg) => bad_request(msg),
            e @ (SearchError::IndexUnavailable(_) | SearchError::NoShardsLoaded { .. }) => {
                not_found(e.to_string())
            }
        }
    }
}

impl From<SummarizeError> for AppError {
    fn from(err: SummarizeError) -> Self {
        match err {
            e @ SummarizeError::Disabled => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "summarizer_disabled".to_string(),
                message: e.to_string(),
            },
            other => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "summarizer_error".to_string(),
                message: other.to_string(),
            },
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /search ============

/// Raw query-string parameters. Everything is optional and validated in
/// [`SearchParams::into_query`].
#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    agencies: Option<String>,
    #[serde(default)]
    meetings: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

impl SearchParams {
    fn into_query(self, search: &SearchConfig) -> Result<SearchQuery, AppError> {
        let mut query = SearchQuery::new(self.q.unwrap_or_default(), search);
        if let Some(from) = self.from.filter(|s| !s.is_empty()) {
            query.from = from;
        }
        if let Some(to) = self.to.filter(|s| !s.is_empty()) {
            query.to = to;
        }
        if let Some(agencies) = self.agencies {
            query.agencies = split_list(&agencies);
        }
        if let Some(meetings) = self.meetings {
            query.meetings = split_list(&meetings);
        }
        if let Some(size) = self.size.filter(|s| !s.is_empty()) {
            query.size = size
                .parse()
                .map_err(|_| bad_request(format!("size must be a positive integer, got {:?}", size)))?;
        }
        query.validate()?;
        Ok(query)
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let text = params.q.clone().unwrap_or_default();
    // A blank query answers empty whatever the other parameters say.
    if tokenize(&text).is_empty() {
        return Json(SearchResponse::empty(&text)).into_response();
    }
    let query = match params.into_query(&state.config.search) {
        Ok(q) => q,
        Err(e) => return e.for_search(&text),
    };

    match execute(Arc::clone(&state.source), &query, &state.config.search).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => AppError::from(e).for_search(&query.text),
    }
}

// ============ POST /summarize ============

#[derive(Debug, Deserialize)]
struct SummarizeBody {
    q: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    agencies: BTreeSet<String>,
    #[serde(default)]
    meetings: BTreeSet<String>,
    #[serde(default)]
    size: Option<usize>,
}

#[derive(Serialize)]
struct SummarizeResult {
    query: String,
    /// Search matches before truncation.
    count: usize,
    #[serde(flatten)]
    summary: SummaryResponse,
}

async fn handle_summarize(
    State(state): State<AppState>,
    body: Result<Json<SummarizeBody>, JsonRejection>,
) -> Result<Json<SummarizeResult>, AppError> {
    let Json(body) = body.map_err(|e| bad_request(e.body_text()))?;

    if !state.config.summarizer.is_enabled() {
        return Err(SummarizeError::Disabled.into());
    }

    let search = &state.config.search;
    let mut query = SearchQuery::new(body.q, search);
    query.from = body.from.unwrap_or(query.from);
    query.to = body.to.unwrap_or(query.to);
    query.agencies = body.agencies;
    query.meetings = body.meetings;
    query.size = body.size.unwrap_or(query.size);

    let response = execute(Arc::clone(&state.source), &query, search).await?;
    let summary = summarize_hits(
        state.summarizer.as_ref(),
        &query.text,
        &response.hits,
        state.config.summarizer.max_chunks,
    )
    .await?;

    Ok(Json(SummarizeResult {
        query: query.text,
        count: response.count,
        summary,
    }))
}
