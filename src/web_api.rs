use std::any::Any;
use std::future::Future;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::storage::{SharedStore, StorageError, run_blocking};
use crate::types::{DEFAULT_PAGE_LIMIT, EventFilter, IndexerStats, StoredEvent};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Storage(e) => {
                error!("Storage error while serving request: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        error_response(status, self.to_string())
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

#[derive(Clone)]
pub struct AppState {
    store: SharedStore,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub contract: Option<String>,
    pub event: Option<String>,
    pub from_block: Option<String>,
    pub to_block: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub success: bool,
    pub count: usize,
    pub events: Vec<StoredEvent>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEventsResponse {
    pub success: bool,
    pub transaction_hash: String,
    pub count: usize,
    pub events: Vec<StoredEvent>,
}

#[derive(Serialize)]
pub struct ContractEventsResponse {
    pub success: bool,
    pub contract: String,
    pub count: usize,
    pub events: Vec<StoredEvent>,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub success: bool,
    pub stats: IndexerStats,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub status: &'static str,
    pub timestamp: String,
}

pub fn create_web_api(store: SharedStore) -> Router {
    let app_state = AppState { store };

    Router::new()
        .route("/events", get(events_handler))
        .route("/events/tx/{tx_hash}", get(transaction_events_handler))
        .route("/events/contract/{contract_name}", get(contract_events_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_check_handler))
        .fallback(not_found_handler)
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(panic_response))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Serve the API until `shutdown` resolves.
pub async fn serve<F>(bind_address: &str, router: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_address).await?;
    info!("Query API listening on {}", listener.local_addr()?);

    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;
    info!("Query API stopped");
    Ok(())
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Request handler panicked: {}", detail);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
}

/// Empty query values count as absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Largest value the SQL backend can bind.
const MAX_QUERY_INT: u64 = i64::MAX as u64;

fn parse_u64(name: &str, value: Option<String>) -> Result<Option<u64>, ApiError> {
    non_empty(value)
        .map(|v| match v.parse::<u64>() {
            Ok(n) if n <= MAX_QUERY_INT => Ok(n),
            Ok(_) => Err(ApiError::BadRequest(format!("invalid `{}`: '{}' is out of range", name, v))),
            Err(_) => Err(ApiError::BadRequest(format!("invalid `{}`: '{}' is not a non-negative integer", name, v))),
        })
        .transpose()
}

async fn events_handler(State(state): State<AppState>, Query(query): Query<EventsQuery>) -> ApiResult<EventsResponse> {
    let filter = EventFilter {
        contract_name: non_empty(query.contract),
        event_name: non_empty(query.event),
        from_block: parse_u64("fromBlock", query.from_block)?,
        to_block: parse_u64("toBlock", query.to_block)?,
        limit: parse_u64("limit", query.limit)?.unwrap_or(DEFAULT_PAGE_LIMIT),
        offset: parse_u64("offset", query.offset)?.unwrap_or(0),
    };

    let events = run_blocking(&state.store, move |s| s.get_events(&filter)).await?;

    Ok(Json(EventsResponse { success: true, count: events.len(), events }))
}

async fn transaction_events_handler(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> ApiResult<TransactionEventsResponse> {
    let tx_hash = tx_hash.to_lowercase();
    let events = run_blocking(&state.store, {
        let tx_hash = tx_hash.clone();
        move |s| s.get_events_by_transaction(&tx_hash)
    })
    .await?;

    Ok(Json(TransactionEventsResponse { success: true, transaction_hash: tx_hash, count: events.len(), events }))
}

async fn contract_events_handler(
    State(state): State<AppState>,
    Path(contract_name): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<ContractEventsResponse> {
    let limit = parse_u64("limit", page.limit)?.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = parse_u64("offset", page.offset)?.unwrap_or(0);

    let events = run_blocking(&state.store, {
        let contract_name = contract_name.clone();
        move |s| s.get_events_by_contract(&contract_name, limit, offset)
    })
    .await?;

    Ok(Json(ContractEventsResponse { success: true, contract: contract_name, count: events.len(), events }))
}

async fn stats_handler(State(state): State<AppState>) -> ApiResult<StatsResponse> {
    let stats = run_blocking(&state.store, |s| s.get_stats()).await?;
    Ok(Json(StatsResponse { success: true, stats }))
}

async fn health_check_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        success: true,
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    })
}

async fn not_found_handler() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}
