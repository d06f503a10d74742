use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    RunKey, SchedulerTaskView, StatusUpdate, StreamSummary, TaskState, TeardownResponse,
    UpdateOutcome,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// - En Docker: AGENT_URL=http://agent:8081, SCHEDULER_URL=http://scheduler:8080
/// - Local: defaults en localhost
#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el agente y el scheduler")]
struct Cli {
    #[arg(long, env = "AGENT_URL", default_value = "http://localhost:8081")]
    agent_url: String,

    #[arg(long, env = "SCHEDULER_URL", default_value = "http://localhost:8080")]
    scheduler_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reporta un estado de tarea al agente, como lo haría el executor
    Report {
        #[arg(long)]
        framework: String,
        #[arg(long)]
        executor: String,
        #[arg(long)]
        run: String,
        #[arg(long)]
        task: String,
        /// RUNNING, FINISHED, TASK_KILLED, ...
        #[arg(value_name = "ESTADO")]
        state: TaskState,
        /// Reusa un uuid (para simular un reenvío del executor)
        #[arg(long)]
        uuid: Option<Uuid>,
        #[arg(long)]
        message: Option<String>,
    },
    /// Lista los streams del agente
    Streams,
    /// Lista lo que el scheduler sabe de cada tarea
    Tasks,
    /// Desmonta un run en el agente
    Teardown {
        #[arg(long)]
        framework: String,
        #[arg(long)]
        executor: String,
        #[arg(long)]
        run: String,
    },
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        bail!("el servidor respondió {}", status);
    }
    resp.json().await.context("respuesta JSON inválida")
}

fn opt<T: std::fmt::Debug>(v: Option<T>) -> String {
    v.map(|v| format!("{:?}", v)).unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let agent_url = cli.agent_url.trim_end_matches('/');
    let scheduler_url = cli.scheduler_url.trim_end_matches('/');

    match cli.command {
        Commands::Report {
            framework,
            executor,
            run,
            task,
            state,
            uuid,
            message,
        } => {
            let mut update = StatusUpdate::new(RunKey::new(framework, executor, run).task(task), state);
            if let Some(uuid) = uuid {
                update.uuid = uuid;
            }
            if let Some(message) = message {
                update = update.with_message(message);
            }

            let url = format!("{}/api/v1/executor/status", agent_url);
            let resp = client.post(&url).json(&update).send().await?;
            let outcome: UpdateOutcome = read_json(resp).await?;

            println!("Update enviado:");
            println!("  uuid: {}", update.uuid);
            println!("  tarea: {}", update.task);
            println!("  estado: {}", update.state);
            println!("  resultado: {:?}", outcome);
            if !outcome.is_accepted() {
                println!("  (el agente no lo va a reenviar)");
            }
        }
        Commands::Streams => {
            let url = format!("{}/api/v1/streams", agent_url);
            let streams: Vec<StreamSummary> = read_json(client.get(&url).send().await?).await?;

            if streams.is_empty() {
                println!("El agente no tiene streams");
            }
            for s in streams {
                println!("{} [{:?}, gen {}]", s.task, s.phase, s.generation);
                println!("  en vuelo: {} ({})", opt(s.in_flight), opt(s.in_flight_state));
                println!("  pendientes: {}", s.pending);
                println!("  último estado: {}", opt(s.latest_state));
                println!("  confirmados: {}", s.acknowledged);
            }
        }
        Commands::Tasks => {
            let url = format!("{}/api/v1/tasks", scheduler_url);
            let tasks: Vec<SchedulerTaskView> = read_json(client.get(&url).send().await?).await?;

            if tasks.is_empty() {
                println!("El scheduler no recibió updates");
            }
            for t in tasks {
                println!("{}", t.task);
                println!("  estado: {} (latest_state {})", t.last_state, opt(t.latest_state));
                println!("  updates recibidos: {} ({} duplicados)", t.updates_received, t.duplicates);
                println!("  último uuid: {}", t.last_update_uuid);
            }
        }
        Commands::Teardown {
            framework,
            executor,
            run,
        } => {
            let url = format!(
                "{}/api/v1/runs/{}/{}/{}",
                agent_url, framework, executor, run
            );
            let resp: TeardownResponse = read_json(client.delete(&url).send().await?).await?;
            println!(
                "Run {}/{}/{} desmontado ({} streams)",
                framework, executor, run, resp.streams_removed
            );
        }
    }

    Ok(())
}
