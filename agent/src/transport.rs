// agent/src/transport.rs

use common::{StatusUpdate, StatusUpdateMessage};
use reqwest::Client;
use tracing::{debug, warn};

/// Envío hacia el scheduler. Es fire-and-forget: una falla de envío es
/// equivalente a un mensaje perdido y la cubre el reintento.
pub trait Transport: Send + Sync {
    fn forward(&self, update: StatusUpdate);
}

pub struct HttpTransport {
    client: Client,
    scheduler_url: String,
    agent_url: String,
}

impl HttpTransport {
    pub fn new(client: Client, scheduler_url: impl Into<String>, agent_url: impl Into<String>) -> Self {
        Self {
            client,
            scheduler_url: scheduler_url.into(),
            agent_url: agent_url.into(),
        }
    }
}

impl Transport for HttpTransport {
    fn forward(&self, update: StatusUpdate) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "sin runtime de tokio, no se envía el update {} (se reintentará)",
                update.uuid
            );
            return;
        };

        let client = self.client.clone();
        let url = format!("{}/api/v1/status-updates", self.scheduler_url);
        let message = StatusUpdateMessage {
            update,
            agent_url: self.agent_url.clone(),
        };

        runtime.spawn(async move {
            let uuid = message.update.uuid;
            match client.post(&url).json(&message).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("update {} entregado a {}", uuid, url);
                }
                Ok(resp) => {
                    warn!(
                        "scheduler devolvió status {} para el update {}",
                        resp.status(),
                        uuid
                    );
                }
                Err(e) => {
                    warn!("no se pudo enviar el update {} a {}: {:?}", uuid, url, e);
                }
            }
        });
    }
}

#[cfg(test)]
pub use recording::RecordingTransport;
