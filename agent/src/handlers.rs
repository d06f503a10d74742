// agent/src/handlers.rs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use common::{
    AckOutcome, RunKey, StatusUpdate, StatusUpdateAcknowledgementMessage, StreamSummary,
    TeardownResponse, UpdateOutcome,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::manager::StatusUpdateError;
use crate::process::ManagerHandle;

pub fn build_router(handle: ManagerHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/executor/status", post(executor_status))
        .route("/api/v1/acknowledgements", post(acknowledgement))
        .route("/api/v1/streams", get(list_streams))
        .route("/api/v1/runs/:framework/:executor/:run", delete(teardown_run))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// El executor reporta un cambio de estado (onTaskStatus)
async fn executor_status(
    State(handle): State<ManagerHandle>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<UpdateOutcome>, StatusCode> {
    handle.update(update).await.map(Json).map_err(status_for)
}

// ACK del scheduler para el update en vuelo
async fn acknowledgement(
    State(handle): State<ManagerHandle>,
    Json(msg): Json<StatusUpdateAcknowledgementMessage>,
) -> Result<Json<AckOutcome>, StatusCode> {
    handle
        .acknowledgement(msg.into())
        .await
        .map(Json)
        .map_err(status_for)
}

async fn list_streams(
    State(handle): State<ManagerHandle>,
) -> Result<Json<Vec<StreamSummary>>, StatusCode> {
    handle.snapshot().await.map(Json).map_err(status_for)
}

// Teardown externo del run: no espera a que los streams terminen
async fn teardown_run(
    State(handle): State<ManagerHandle>,
    Path((framework, executor, run)): Path<(String, String, String)>,
) -> Result<Json<TeardownResponse>, StatusCode> {
    let run = RunKey::new(framework, executor, run);
    let streams_removed = handle.cleanup_run(run).await.map_err(status_for)?;
    Ok(Json(TeardownResponse { streams_removed }))
}

fn status_for(err: StatusUpdateError) -> StatusCode {
    warn!("request rechazado: {}", err);
    match err {
        StatusUpdateError::Malformed { .. } => StatusCode::BAD_REQUEST,
        StatusUpdateError::Checkpoint { .. } | StatusUpdateError::RunFailed { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        StatusUpdateError::RecoveryAfterStart
        | StatusUpdateError::Discovery(_)
        | StatusUpdateError::Stopped => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
