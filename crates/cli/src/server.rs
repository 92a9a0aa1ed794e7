use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use finrag_core::ingest::IngestRequest;
use finrag_core::pipeline::{self, AskOptions, Services};
use providers::alphavantage::AvClient;
use providers::ProviderError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct AppState {
    pub services: Services,
    /// Serializes ingest, reindex and clear; reads run concurrently.
    write_lock: Mutex<()>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            write_lock: Mutex::new(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ProviderError>() {
            Some(ProviderError::RateLimited(msg)) => ApiError::RateLimited(msg.clone()),
            Some(ProviderError::MissingApiKey) => ApiError::BadRequest(err.to_string()),
            Some(ProviderError::Api(msg)) => ApiError::Upstream(msg.clone()),
            _ => ApiError::Internal(format!("{:#}", err)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone()),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ingest", post(ingest))
        .route("/api/reindex", post(reindex))
        .route("/api/ask", post(ask))
        .route("/api/search", post(search))
        .route("/api/symbols", get(symbols))
        .route("/api/index", delete(clear))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(services: Services, bind: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("listening on http://{}", listener.local_addr()?);
    let app = router(Arc::new(AppState::new(services)));
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    #[serde(flatten)]
    pub request: IngestRequest,
    /// Overrides the configured Alpha Vantage key for this call.
    pub api_key: Option<String>,
}

async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let cfg = &state.services.config.alpha_vantage;
    let client = AvClient::new(cfg.client_config(body.api_key.as_deref()))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let request = body.request.normalized();
    if request.stocks.is_empty() && request.crypto.is_empty() {
        return Err(ApiError::BadRequest(
            "provide at least one stock or crypto symbol".into(),
        ));
    }
    let _guard = state.write_lock.lock().await;
    let summary = pipeline::ingest(&state.services, &client, request).await?;
    Ok(Json(summary))
}

async fn reindex(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let _guard = state.write_lock.lock().await;
    let summary = pipeline::reindex(&state.services).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct AskBody {
    pub question: String,
    #[serde(flatten)]
    pub options: AskOptions,
}

async fn ask(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AskBody>,
) -> Result<impl IntoResponse, ApiError> {
    let question = body.question.trim();
    if question.is_empty() {
        return Err(ApiError::BadRequest("question must not be empty".into()));
    }
    let answer = pipeline::ask(&state.services, question, &body.options).await?;
    Ok(Json(answer))
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub query: String,
    pub k: Option<usize>,
    pub symbol: Option<String>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let query = body.query.trim();
    if query.is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }
    let hits = pipeline::search(&state.services, query, body.k, body.symbol.as_deref()).await?;
    Ok(Json(hits))
}

async fn symbols(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let symbols = pipeline::symbols(&state.services).await?;
    Ok(Json(json!({ "symbols": symbols })))
}

async fn clear(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let _guard = state.write_lock.lock().await;
    let summary = pipeline::clear(&state.services).await?;
    Ok(Json(summary))
}
