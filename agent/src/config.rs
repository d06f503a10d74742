// agent/src/config.rs

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::retry::{RetryPolicy, STATUS_UPDATE_RETRY_INTERVAL_MAX, STATUS_UPDATE_RETRY_INTERVAL_MIN};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind: String,
    /// URL con la que el scheduler llega al agente para mandar los ACKs.
    pub agent_url: String,
    pub work_dir: PathBuf,
    pub scheduler_url: String,
    pub retry: RetryPolicy,
    pub retry_tick: Duration,
    pub event_queue_capacity: usize,
    /// Tope por request hacia el scheduler; un envío colgado cuenta como perdido.
    pub http_timeout: Duration,
}

impl AgentConfig {
    /// Lee la configuración desde variables de entorno.
    /// - En Docker: SCHEDULER_URL=http://scheduler:8080, AGENT_URL=http://agent:8081
    /// - Sin variables: todo en localhost, work dir en ./agent-work
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = lookup("AGENT_BIND").unwrap_or_else(|| "0.0.0.0:8081".to_string());
        let port = bind.rsplit(':').next().unwrap_or("8081").to_string();

        let agent_url = lookup("AGENT_URL").unwrap_or_else(|| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string());
            format!("http://{}:{}", host, port)
        });

        let work_dir = lookup("AGENT_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./agent-work"));

        let scheduler_url =
            lookup("SCHEDULER_URL").unwrap_or_else(|| "http://localhost:8080".to_string());

        let min = parse_or(&lookup, "STATUS_UPDATE_RETRY_INTERVAL_MIN_MS", None)?
            .map(Duration::from_millis)
            .unwrap_or(STATUS_UPDATE_RETRY_INTERVAL_MIN);
        let max = parse_or(&lookup, "STATUS_UPDATE_RETRY_INTERVAL_MAX_MS", None)?
            .map(Duration::from_millis)
            .unwrap_or(STATUS_UPDATE_RETRY_INTERVAL_MAX);
        if min.is_zero() {
            bail!("STATUS_UPDATE_RETRY_INTERVAL_MIN_MS tiene que ser mayor a 0");
        }
        if max < min {
            bail!(
                "STATUS_UPDATE_RETRY_INTERVAL_MAX_MS ({:?}) es menor que el mínimo ({:?})",
                max,
                min
            );
        }

        let tick_ms: u64 = parse_or(&lookup, "STATUS_UPDATE_RETRY_TICK_MS", Some(500))?.unwrap_or(500);
        if tick_ms == 0 {
            bail!("STATUS_UPDATE_RETRY_TICK_MS tiene que ser mayor a 0");
        }

        let event_queue_capacity: usize =
            parse_or(&lookup, "AGENT_EVENT_QUEUE_CAPACITY", Some(1024))?.unwrap_or(1024);
        if event_queue_capacity == 0 {
            bail!("AGENT_EVENT_QUEUE_CAPACITY tiene que ser mayor a 0");
        }

        let http_timeout_ms: u64 =
            parse_or(&lookup, "AGENT_HTTP_TIMEOUT_MS", Some(5000))?.unwrap_or(5000);
        if http_timeout_ms == 0 {
            bail!("AGENT_HTTP_TIMEOUT_MS tiene que ser mayor a 0");
        }

        Ok(Self {
            bind,
            agent_url: agent_url.trim_end_matches('/').to_string(),
            work_dir,
            scheduler_url: scheduler_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::new(min, max),
            retry_tick: Duration::from_millis(tick_ms),
            event_queue_capacity,
            http_timeout: Duration::from_millis(http_timeout_ms),
        })
    }
}

// Un valor presente pero inválido es error de arranque, no se cae al default.
fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Option<T>,
) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("valor inválido para {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
