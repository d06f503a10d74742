mod checkpoint;
mod config;
mod handlers;
mod manager;
mod process;
mod retry;
mod stream;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::checkpoint::FsCheckpointStore;
use crate::config::AgentConfig;
use crate::manager::StatusUpdateManager;
use crate::retry::TokioClock;
use crate::transport::HttpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("agent=debug,tower_http=info")
        .init();

    let cfg = AgentConfig::from_env()?;
    info!(
        "agente {} (work dir {}), scheduler en {}",
        cfg.agent_url,
        cfg.work_dir.display(),
        cfg.scheduler_url
    );

    let store = FsCheckpointStore::new(&cfg.work_dir)
        .with_context(|| format!("no se pudo preparar {}", cfg.work_dir.display()))?;
    let client = Client::builder()
        .timeout(cfg.http_timeout)
        .build()
        .context("no se pudo crear el cliente HTTP")?;
    let transport = HttpTransport::new(client, &cfg.scheduler_url, &cfg.agent_url);

    let (term_tx, mut term_rx) = mpsc::unbounded_channel();
    let mut manager =
        StatusUpdateManager::new(store, Arc::new(transport), Arc::new(TokioClock), cfg.retry)
            .with_termination_notifier(term_tx);

    // 1) Recuperar lo que quedó en el checkpoint antes de aceptar tráfico
    let report = manager.recover()?;
    info!(
        "recuperación: {} runs, {} streams, {} updates en vuelo",
        report.runs, report.streams, report.in_flight
    );
    for (run, reason) in &report.failed {
        warn!("run {} queda fallado: {}", run, reason);
    }

    // 2) Avisos de terminación (acá solo se registran)
    tokio::spawn(async move {
        while let Some(task) = term_rx.recv().await {
            info!("tarea {} terminada y confirmada por el scheduler", task);
        }
    });

    // 3) Loop del manager + HTTP
    let (handle, _join) = process::spawn(manager, cfg.retry_tick, cfg.event_queue_capacity);
    let app = handlers::build_router(handle);

    let listener = TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", cfg.bind))?;
    info!("agente escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
