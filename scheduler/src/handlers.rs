// scheduler/src/handlers.rs

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{SchedulerTaskView, StatusUpdateAcknowledgementMessage, StatusUpdateMessage};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status-updates", post(receive_status_update))
        .route("/api/v1/tasks", get(list_tasks))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Update reenviado por un agente: se registra y se confirma en segundo plano
async fn receive_status_update(
    State(state): State<AppState>,
    Json(msg): Json<StatusUpdateMessage>,
) -> StatusCode {
    let update = msg.update;
    let duplicate = state.record(&update);
    if duplicate {
        debug!(
            "update {} de {} repetido (reintento del agente)",
            update.uuid, update.task
        );
    } else {
        info!(
            "tarea {} -> {} (latest_state={:?}, update {})",
            update.task, update.state, update.latest_state, update.uuid
        );
    }

    // los duplicados también se confirman: el ACK anterior pudo perderse
    let ack = StatusUpdateAcknowledgementMessage {
        uuid: update.uuid,
        task: update.task,
    };
    let url = format!(
        "{}/api/v1/acknowledgements",
        msg.agent_url.trim_end_matches('/')
    );
    let client = state.http.clone();
    tokio::spawn(async move {
        match client.post(&url).json(&ack).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("ACK {} entregado a {}", ack.uuid, url);
            }
            Ok(resp) => warn!("agente devolvió {} para el ACK {}", resp.status(), ack.uuid),
            Err(e) => warn!("no se pudo mandar el ACK {} a {}: {:?}", ack.uuid, url, e),
        }
    });

    StatusCode::ACCEPTED
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<SchedulerTaskView>> {
    Json(state.views())
}
