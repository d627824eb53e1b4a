use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use crmsync_core::models::{
    Conflict, ConflictChoice, ConflictId, ConflictStatus, ConnectionId, ContactId, RunId, SyncRun,
};
use crmsync_core::services::{ConflictResolution, SyncService, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{verify_bearer, verify_webhook_secret};
use crate::config::ApiConfig;
use crate::error::AppError;

const DEFAULT_PAGE: usize = 20;
const MAX_PAGE: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub service: SyncService,
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/connections/{id}/sync/full", post(trigger_full_sync))
        .route("/connections/{id}/sync/delta", post(trigger_delta_sync))
        .route(
            "/connections/{id}/records/{local_id}/sync",
            post(trigger_record_sync),
        )
        .route("/connections/{id}/status", get(connection_status))
        .route("/connections/{id}/runs", get(list_runs))
        .route("/connections/{id}/conflicts", get(list_conflicts))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/conflicts/{id}/resolve", post(resolve_conflict))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    // Authenticated by the shared webhook secret instead of the API token
    let webhook_routes = Router::new().route("/webhooks/{connection_id}", post(ingest_webhook));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes.merge(webhook_routes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    verify_bearer(request.headers(), &state.config.api_token)?;
    Ok(next.run(request).await)
}

fn parse_id<T: FromStr>(kind: &str, value: &str) -> Result<T, AppError> {
    value
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid {kind} id: {value}")))
}

fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    scheduler: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: crmsync_core::util::unix_millis_now() / 1_000,
        scheduler: state.config.run_scheduler,
    })
}

#[derive(Debug, Serialize)]
struct TriggeredRun {
    run_id: RunId,
}

async fn trigger_full_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TriggeredRun>), AppError> {
    let connection_id: ConnectionId = parse_id("connection", &id)?;
    let run_id = state.service.trigger_full_sync(&connection_id).await?;
    Ok((StatusCode::ACCEPTED, Json(TriggeredRun { run_id })))
}

async fn trigger_delta_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TriggeredRun>), AppError> {
    let connection_id: ConnectionId = parse_id("connection", &id)?;
    let run_id = state.service.trigger_delta_sync(&connection_id).await?;
    Ok((StatusCode::ACCEPTED, Json(TriggeredRun { run_id })))
}

async fn trigger_record_sync(
    State(state): State<AppState>,
    Path((id, local_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<TriggeredRun>), AppError> {
    let connection_id: ConnectionId = parse_id("connection", &id)?;
    let local_id: ContactId = parse_id("contact", &local_id)?;
    let run_id = state
        .service
        .trigger_single_record_sync(&connection_id, &local_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TriggeredRun { run_id })))
}

async fn connection_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SyncStatus>, AppError> {
    let connection_id: ConnectionId = parse_id("connection", &id)?;
    Ok(Json(state.service.get_sync_status(&connection_id).await?))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<SyncRun>>, AppError> {
    let connection_id: ConnectionId = parse_id("connection", &id)?;
    let runs = state
        .service
        .list_recent_runs(&connection_id, page_size(query.limit))
        .await?;
    Ok(Json(runs))
}

#[derive(Debug, Deserialize)]
struct ConflictsQuery {
    /// A conflict status, or `all`; open conflicts when omitted
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ConflictsQuery>,
) -> Result<Json<Vec<Conflict>>, AppError> {
    let connection_id: ConnectionId = parse_id("connection", &id)?;
    let status = match query.status.as_deref() {
        None => Some(ConflictStatus::Open),
        Some("all") => None,
        Some(status) => Some(status.parse().map_err(AppError::BadRequest)?),
    };

    let store = state.service.store();
    store.require_connection(&connection_id).await?;
    let conflicts = store
        .list_conflicts(&connection_id, status, page_size(query.limit))
        .await?;
    Ok(Json(conflicts))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    run_id: RunId,
    cancelling: bool,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), AppError> {
    let run_id: RunId = parse_id("run", &run_id)?;
    if !state.service.cancel_run(&run_id).await {
        return Err(AppError::NotFound(format!(
            "run {run_id} is not in flight on this instance"
        )));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            run_id,
            cancelling: true,
        }),
    ))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(choice): Json<ConflictChoice>,
) -> Result<Json<ConflictResolution>, AppError> {
    let conflict_id: ConflictId = parse_id("conflict", &id)?;
    Ok(Json(
        state.service.resolve_conflict(&conflict_id, choice).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookAccepted {
    queued: usize,
}

async fn ingest_webhook(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<WebhookAccepted>), AppError> {
    verify_webhook_secret(
        &headers,
        query.secret.as_deref(),
        state.config.webhook_secret.as_deref(),
    )?;
    let connection_id: ConnectionId = parse_id("connection", &connection_id)?;
    let queued = state
        .service
        .ingest_webhook(&connection_id, &payload)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(WebhookAccepted { queued })))
}
