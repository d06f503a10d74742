mod handlers;
mod state;

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("scheduler=debug,tower_http=info")
        .init();

    let bind = env::var("SCHEDULER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    // un agente colgado no puede acumular envíos de ACK para siempre
    let ack_timeout_ms: u64 = match env::var("SCHEDULER_ACK_TIMEOUT_MS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("valor inválido para SCHEDULER_ACK_TIMEOUT_MS: {:?}", raw))?,
        Err(_) => 5000,
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(ack_timeout_ms.max(1)))
        .build()
        .context("no se pudo crear el cliente HTTP")?;

    let state = AppState::new(http);
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", bind))?;
    info!("scheduler escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
