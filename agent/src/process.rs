// agent/src/process.rs
//
// Loop que es dueño del manager. Todo lo que lo toca (updates del executor,
// ACKs del scheduler, ticks de reintento, teardown) pasa por acá de a un
// evento por vez.

use std::time::Duration;

use common::{AckOutcome, Acknowledgement, RunKey, StatusUpdate, StreamSummary, UpdateOutcome};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::manager::{StatusUpdateError, StatusUpdateManager};

type Reply<T> = oneshot::Sender<T>;

pub enum Event {
    Update {
        update: StatusUpdate,
        reply: Reply<Result<UpdateOutcome, StatusUpdateError>>,
    },
    Acknowledgement {
        ack: Acknowledgement,
        reply: Reply<Result<AckOutcome, StatusUpdateError>>,
    },
    Snapshot {
        reply: Reply<Vec<StreamSummary>>,
    },
    CleanupRun {
        run: RunKey,
        reply: Reply<Result<usize, StatusUpdateError>>,
    },
}

/// Puerta de entrada al loop. Se clona en cada handler HTTP.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Event>,
}

impl ManagerHandle {
    pub async fn update(&self, update: StatusUpdate) -> Result<UpdateOutcome, StatusUpdateError> {
        let (reply, rx) = oneshot::channel();
        self.call(Event::Update { update, reply }, rx).await?
    }

    pub async fn acknowledgement(&self, ack: Acknowledgement) -> Result<AckOutcome, StatusUpdateError> {
        let (reply, rx) = oneshot::channel();
        self.call(Event::Acknowledgement { ack, reply }, rx).await?
    }

    pub async fn snapshot(&self) -> Result<Vec<StreamSummary>, StatusUpdateError> {
        let (reply, rx) = oneshot::channel();
        self.call(Event::Snapshot { reply }, rx).await
    }

    pub async fn cleanup_run(&self, run: RunKey) -> Result<usize, StatusUpdateError> {
        let (reply, rx) = oneshot::channel();
        self.call(Event::CleanupRun { run, reply }, rx).await?
    }

    async fn call<T>(&self, event: Event, rx: oneshot::Receiver<T>) -> Result<T, StatusUpdateError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| StatusUpdateError::Stopped)?;
        rx.await.map_err(|_| StatusUpdateError::Stopped)
    }
}

/// Arranca el loop en una tarea de tokio. Termina cuando se sueltan todos
/// los handles.
pub fn spawn(
    manager: StatusUpdateManager,
    tick: Duration,
    capacity: usize,
) -> (ManagerHandle, tokio::task::JoinHandle<StatusUpdateManager>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let join = tokio::spawn(run(manager, rx, tick));
    (ManagerHandle { tx }, join)
}

async fn run(
    mut manager: StatusUpdateManager,
    mut rx: mpsc::Receiver<Event>,
    tick: Duration,
) -> StatusUpdateManager {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                handle(&mut manager, event);
            }
            _ = ticker.tick() => {
                let resent = manager.retry_due();
                if resent > 0 {
                    debug!("tick de reintentos: {} updates reenviados", resent);
                }
            }
        }
    }

    info!("loop del status update manager detenido: {:?}", manager.stats());
    manager
}

// Si el que pidió ya no espera la respuesta, se descarta.
fn handle(manager: &mut StatusUpdateManager, event: Event) {
    match event {
        Event::Update { update, reply } => {
            let _ = reply.send(manager.update(update));
        }
        Event::Acknowledgement { ack, reply } => {
            let _ = reply.send(manager.acknowledgement(ack));
        }
        Event::Snapshot { reply } => {
            let _ = reply.send(manager.snapshot());
        }
        Event::CleanupRun { run, reply } => {
            let _ = reply.send(manager.cleanup_run(&run));
        }
    }
}
