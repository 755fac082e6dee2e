use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::{FarmError, Result};
use crate::farm::protocol::{
    AddJobRequest, AddJobResponse, AssignRequest, ErrorBody, GetJobRequest, GetJobResponse,
    HeartbeatRequest, HeartbeatResponse, JobCompleteRequest, JobCompleteResponse, QueueResponse,
    RegisterRequest, RegisterResponse, StatusResponse,
};
use crate::farm::registry::FarmRegistry;
use crate::scheduler::job::JobId;

/// `FarmError` as an HTTP response with a JSON `{ "error": ... }` body.
#[derive(Debug)]
pub struct ApiError(pub FarmError);

impl From<FarmError> for ApiError {
    fn from(err: FarmError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FarmError::Validation(_) => StatusCode::BAD_REQUEST,
            FarmError::JobNotFound(_) | FarmError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            FarmError::DuplicateJob(_)
            | FarmError::InvalidState { .. }
            | FarmError::InvalidTransition { .. } => StatusCode::CONFLICT,
            FarmError::NodeOffline(_) => StatusCode::GONE,
            other => {
                tracing::error!(error = %other, "Farm request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
struct ServerState {
    registry: Arc<FarmRegistry>,
}

/// All farm endpoints. Bundle uploads may be up to `max_bundle_bytes`.
pub fn router(registry: Arc<FarmRegistry>, max_bundle_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let transfers = Router::new()
        .route(
            "/api/transfer/{id}",
            put(upload_bundle_handler).get(download_bundle_handler),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_bundle_bytes));

    Router::new()
        .route("/api/register", post(register_handler))
        .route("/api/heartbeat", post(heartbeat_handler))
        .route("/api/get_job", post(get_job_handler))
        .route("/api/job_complete", post(job_complete_handler))
        .route("/api/status", get(status_handler))
        .route("/api/add_job", post(add_job_handler))
        .route("/api/queue", get(queue_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_handler))
        .route("/api/jobs/{id}/assign", post(assign_handler))
        .route("/api/jobs/{id}/retry", post(retry_handler))
        .route("/api/jobs/{id}", delete(remove_handler))
        .merge(transfers)
        .layer(cors)
        .with_state(ServerState { registry })
}

/// Serve the farm API until `cancel` fires. Failing to bind is returned
/// to the caller; the master cannot run without its port.
pub async fn run_server(
    registry: Arc<FarmRegistry>,
    addr: SocketAddr,
    max_bundle_bytes: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind farm server");
        FarmError::Io(e)
    })?;
    tracing::info!(addr = %addr, "Farm master listening");

    let app = router(registry, max_bundle_bytes);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    tracing::info!("Farm server stopped");
    Ok(())
}

async fn register_handler(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let address = peer.ip().to_string();
    Json(state.registry.register(req, &address).await)
}

async fn heartbeat_handler(
    State(state): State<ServerState>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    Ok(Json(state.registry.heartbeat(req).await?))
}

async fn get_job_handler(
    State(state): State<ServerState>,
    Json(req): Json<GetJobRequest>,
) -> ApiResult<Json<GetJobResponse>> {
    let job = state.registry.get_job(&req.node_id).await?;
    Ok(Json(GetJobResponse { job }))
}

async fn job_complete_handler(
    State(state): State<ServerState>,
    Json(req): Json<JobCompleteRequest>,
) -> ApiResult<Json<JobCompleteResponse>> {
    let accepted = state
        .registry
        .job_complete(&req.node_id, &req.job_id, req.outcome)
        .await?;
    Ok(Json(JobCompleteResponse { accepted }))
}

async fn status_handler(State(state): State<ServerState>) -> Json<StatusResponse> {
    Json(state.registry.status().await)
}

async fn add_job_handler(
    State(state): State<ServerState>,
    Json(req): Json<AddJobRequest>,
) -> ApiResult<Json<AddJobResponse>> {
    let job_id = state.registry.add_job(req).await?;
    Ok(Json(AddJobResponse { job_id }))
}

async fn queue_handler(State(state): State<ServerState>) -> Json<QueueResponse> {
    Json(state.registry.queue().await)
}

async fn cancel_handler(
    State(state): State<ServerState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.request_cancel(&id).await?;
    Ok(Json(json!({})))
}

async fn assign_handler(
    State(state): State<ServerState>,
    Path(id): Path<JobId>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.assign(&id, req.node_id).await?;
    Ok(Json(json!({})))
}

async fn retry_handler(
    State(state): State<ServerState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.retry(&id).await?;
    Ok(Json(json!({})))
}

async fn remove_handler(
    State(state): State<ServerState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.remove(&id).await?;
    Ok(Json(json!({})))
}

async fn upload_bundle_handler(
    State(state): State<ServerState>,
    Path(id): Path<JobId>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let store = state
        .registry
        .transfers()
        .ok_or_else(|| FarmError::Transfer("this master does not accept bundles".to_string()))?;
    store.put(&id, &body).await?;
    tracing::info!(job_id = %id, bytes = body.len(), "Bundle uploaded");
    Ok(Json(json!({ "bytes": body.len() })))
}

async fn download_bundle_handler(
    State(state): State<ServerState>,
    Path(id): Path<JobId>,
) -> ApiResult<Response> {
    let bytes = match state.registry.transfers() {
        Some(store) => store.get(&id).await?,
        None => None,
    };
    match bytes {
        Some(bytes) => Ok(([(header::CONTENT_TYPE, "application/zip")], bytes).into_response()),
        None => Err(FarmError::JobNotFound(id).into()),
    }
}
