// HTTP surface of the daemon.
//
// Every `/sync` route requires a bearer token. Project-scoped routes are only
// served to the project's owner, the user who opened it.

pub mod auth;
pub mod cors;
pub mod error;
mod events;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use trisync_common::types::{FileId, ProjectId, ResolutionStrategy};
use uuid::Uuid;

use crate::service::{SyncBackend, SyncService};

use self::auth::{require_bearer_auth, AuthenticatedUser, JwtAccessTokenService};
use self::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    ApiError, ErrorCode,
};

const MAX_REQUEST_BODY_BYTES: usize = 4 * 1024 * 1024;
/// Bounds on `intervalMs` for background sync.
const MIN_INTERVAL_MS: u64 = 1_000;
const MAX_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

pub struct ApiState<B: SyncBackend> {
    pub service: Arc<SyncService<B>>,
}

impl<B: SyncBackend> Clone for ApiState<B> {
    fn clone(&self) -> Self {
        Self { service: Arc::clone(&self.service) }
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn build_router<B: SyncBackend>(
    service: Arc<SyncService<B>>,
    jwt_service: Arc<JwtAccessTokenService>,
    cors_origins: Option<&str>,
) -> Router {
    let state = ApiState { service };

    let sync_routes = Router::new()
        .route("/sync/status", get(sync_status::<B>))
        .route("/sync/conflicts", get(list_conflicts::<B>))
        .route("/sync/conflicts/{file_id}/resolve", post(resolve_conflict::<B>))
        .route("/sync/background/start", post(start_background::<B>))
        .route("/sync/background/stop", post(stop_background::<B>))
        .route("/sync/project", post(manual_sync::<B>))
        .route("/sync/engine/status", get(engine_status::<B>))
        .route("/sync/projects/open", post(open_project::<B>))
        .route("/sync/projects/close", post(close_project::<B>))
        .route("/sync/watcher/reconnect", post(reconnect_watcher::<B>))
        .route("/sync/files", get(list_files::<B>))
        .route("/sync/events", get(events::events_ws::<B>))
        .with_state(state)
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth));

    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(sync_routes))
        .layer(cors::cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ApiError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

// ── Request helpers ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectQuery {
    project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRequest {
    project_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    project_id: String,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenRequest {
    project_id: String,
    container_id: Option<String>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    strategy: String,
    content: Option<String>,
}

fn parse_project(raw: &str) -> Result<ProjectId, ApiError> {
    ProjectId::parse(raw).map_err(|e| ApiError::validation(e.to_string()))
}

fn parse_interval(interval_ms: Option<u64>) -> Result<Option<Duration>, ApiError> {
    match interval_ms {
        None => Ok(None),
        Some(ms) if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&ms) => {
            Ok(Some(Duration::from_millis(ms)))
        }
        Some(ms) => Err(ApiError::validation(format!(
            "intervalMs must be between {MIN_INTERVAL_MS} and {MAX_INTERVAL_MS}, got {ms}"
        ))),
    }
}

/// Parse `raw` and require that `user` owns the open project.
fn owned_project<B: SyncBackend>(
    state: &ApiState<B>,
    user: AuthenticatedUser,
    raw: &str,
) -> Result<ProjectId, ApiError> {
    let project_id = parse_project(raw)?;
    match state.service.owner_of(&project_id) {
        Some(owner) if owner == user.user_id => Ok(project_id),
        Some(_) => Err(ApiError::from_code(ErrorCode::Forbidden)),
        None => Err(ApiError::new(ErrorCode::NotFound, format!("project {project_id} is not open"))),
    }
}

// ── Handlers ────────────────────────────────────────────────────────

async fn sync_status<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult {
    let status = match query.project_id.as_deref() {
        Some(raw) => {
            let project_id = owned_project(&state, user, raw)?;
            json!(state.service.status(&project_id))
        }
        None => json!(state.service.statuses_for(user.user_id)),
    };
    Ok(Json(json!({ "success": true, "status": status })))
}

async fn list_conflicts<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult {
    let projects = match query.project_id.as_deref() {
        Some(raw) => vec![owned_project(&state, user, raw)?],
        None => {
            state.service.statuses_for(user.user_id).into_iter().map(|s| s.project_id).collect()
        }
    };

    let mut conflicts = Vec::new();
    for project_id in &projects {
        conflicts.extend(state.service.list_conflicts(project_id)?);
    }
    Ok(Json(json!({ "success": true, "conflicts": conflicts })))
}

async fn resolve_conflict<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(file_id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult {
    let strategy = ResolutionStrategy::parse(&request.strategy)
        .ok_or_else(|| ApiError::validation(format!("unknown strategy `{}`", request.strategy)))?;
    let file_id = FileId(file_id);

    let conflict = state.service.find_conflict(&file_id)?.ok_or_else(|| {
        ApiError::new(ErrorCode::NotFound, format!("no open conflict for file {file_id}"))
    })?;
    owned_project(&state, user, conflict.project_id.as_str())?;

    let conflict = state.service.resolve_conflict(file_id, strategy, request.content).await?;
    Ok(Json(json!({ "success": true, "conflict": conflict })))
}

async fn start_background<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<StartRequest>,
) -> ApiResult {
    let project_id = owned_project(&state, user, &request.project_id)?;
    let interval = parse_interval(request.interval_ms)?;
    state.service.start_background(&project_id, interval);
    Ok(Json(json!({ "success": true, "status": state.service.status(&project_id) })))
}

async fn stop_background<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<ProjectRequest>,
) -> ApiResult {
    let project_id = owned_project(&state, user, &request.project_id)?;
    let stopped = state.service.stop_background(&project_id);
    Ok(Json(json!({ "success": true, "stopped": stopped })))
}

async fn manual_sync<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<ProjectRequest>,
) -> ApiResult {
    let project_id = owned_project(&state, user, &request.project_id)?;
    let result = state.service.manual_sync(&project_id).await;
    if let Some(error) = &result.error {
        return Err(ApiError::from(error));
    }
    Ok(Json(json!({ "success": true, "stats": result.stats, "timestamp": result.timestamp })))
}

async fn engine_status<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult {
    Ok(Json(json!({ "success": true, "engine": state.service.engine_status(user.user_id) })))
}

async fn open_project<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<OpenRequest>,
) -> ApiResult {
    let project_id = parse_project(&request.project_id)?;
    if state.service.owner_of(&project_id).is_some_and(|owner| owner != user.user_id) {
        return Err(ApiError::from_code(ErrorCode::Forbidden));
    }
    let interval = parse_interval(request.interval_ms)?;
    if request.container_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err(ApiError::validation("containerId must not be empty"));
    }

    let status = state
        .service
        .open_project(user.user_id, &project_id, request.container_id, interval)
        .await?;
    Ok(Json(json!({ "success": true, "status": status })))
}

async fn close_project<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<ProjectRequest>,
) -> ApiResult {
    let project_id = owned_project(&state, user, &request.project_id)?;
    let closed = state.service.close_project(&project_id);
    Ok(Json(json!({ "success": true, "closed": closed })))
}

async fn reconnect_watcher<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<ProjectRequest>,
) -> ApiResult {
    let project_id = owned_project(&state, user, &request.project_id)?;
    state.service.reconnect_watcher(&project_id)?;
    Ok(Json(json!({ "success": true })))
}

async fn list_files<B: SyncBackend>(
    State(state): State<ApiState<B>>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult {
    let raw = query.project_id.ok_or_else(|| ApiError::validation("projectId is required"))?;
    let project_id = owned_project(&state, user, &raw)?;
    let files = state.service.files(&project_id)?;
    Ok(Json(json!({ "success": true, "files": files })))
}
