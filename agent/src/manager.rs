// agent/src/manager.rs
//
// Status update manager: recibe updates del executor, los persiste, los
// manda al scheduler de a uno por tarea y avanza cada stream cuando llega
// el ACK del update en vuelo.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use common::{
    AckOutcome, Acknowledgement, RunKey, StatusUpdate, StreamSummary, TaskIdentity, UpdateOutcome,
};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore};
use crate::retry::{Clock, RetryPolicy, RetryScheduler};
use crate::stream::{Admission, StatusUpdateStream};
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum StatusUpdateError {
    #[error("identidad de tarea inválida ({task}): {reason}")]
    Malformed { task: String, reason: String },

    #[error("no se pudo hacer durable el checkpoint del run {run}: {source}")]
    Checkpoint {
        run: RunKey,
        #[source]
        source: CheckpointError,
    },

    #[error("el run {run} quedó fallado y no acepta más operaciones: {reason}")]
    RunFailed { run: RunKey, reason: String },

    #[error("la recuperación solo puede correr antes de procesar updates")]
    RecoveryAfterStart,

    #[error("no se pudieron listar los runs con checkpoint: {0}")]
    Discovery(#[source] CheckpointError),

    #[error("el manager se detuvo")]
    Stopped,
}

/// Contadores de operación.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub updates_accepted: u64,
    pub duplicates: u64,
    pub dropped_terminated: u64,
    pub forwarded: u64,
    pub retries: u64,
    pub acks_applied: u64,
    pub unexpected_acks: u64,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub runs: usize,
    pub streams: usize,
    pub in_flight: usize,
    /// Runs con marca de teardown: no se reconstruyen ni se reintentan.
    pub torn_down: usize,
    pub failed: Vec<(RunKey, String)>,
}

pub struct StatusUpdateManager {
    streams: HashMap<TaskIdentity, StatusUpdateStream>,
    store: Box<dyn CheckpointStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    retry: RetryScheduler,
    // runs cuyo checkpoint dejó de ser confiable
    failed_runs: HashMap<RunKey, String>,
    terminations: Option<UnboundedSender<TaskIdentity>>,
    started: bool,
    stats: ManagerStats,
}

impl StatusUpdateManager {
    pub fn new(
        store: impl CheckpointStore + 'static,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            streams: HashMap::new(),
            store: Box::new(store),
            transport,
            clock,
            retry: RetryScheduler::new(policy),
            failed_runs: HashMap::new(),
            terminations: None,
            started: false,
            stats: ManagerStats::default(),
        }
    }

    /// Canal por el que se avisa `notifyTerminated` al resto del agente.
    pub fn with_termination_notifier(mut self, tx: UnboundedSender<TaskIdentity>) -> Self {
        self.terminations = Some(tx);
        self
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    pub fn stream(&self, task: &TaskIdentity) -> Option<&StatusUpdateStream> {
        self.streams.get(task)
    }

    pub fn retry(&self) -> &RetryScheduler {
        &self.retry
    }

    pub fn snapshot(&self) -> Vec<StreamSummary> {
        let mut out: Vec<StreamSummary> = self.streams.values().map(|s| s.summary()).collect();
        out.sort_by(|a, b| a.task.cmp(&b.task));
        out
    }

    /* ---------------- updates ---------------- */

    pub fn update(&mut self, update: StatusUpdate) -> Result<UpdateOutcome, StatusUpdateError> {
        self.started = true;
        validate_identity(&update.task)?;

        let run = update.task.run();
        // un run desmontado no tiene streams; la marca vive en el checkpoint
        if !self.streams.contains_key(&update.task) && self.is_torn_down(&run)? {
            self.stats.dropped_terminated += 1;
            debug!(
                "run {} ya fue desmontado, se descarta el update {} ({})",
                run, update.uuid, update.state
            );
            return Ok(UpdateOutcome::DroppedTerminated);
        }
        self.ensure_healthy(&run)?;

        let admission = self
            .streams
            .get(&update.task)
            .map(|s| s.admit(&update))
            .unwrap_or(Admission::Fresh);

        if admission == Admission::Duplicate {
            self.stats.duplicates += 1;
            debug!(
                "update duplicado {} ({}) para {}, se descarta",
                update.uuid, update.state, update.task
            );
            return Ok(UpdateOutcome::DroppedDuplicate);
        }

        // durable antes de encolar
        self.persist(
            &run,
            CheckpointRecord::Update {
                update: update.clone(),
            },
        )?;
        self.stats.updates_accepted += 1;

        let task = update.task.clone();
        let stream = match self.streams.entry(task.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().is_terminated() {
                    let next = e.get().successor();
                    info!(
                        "tarea {} ya había terminado; update {} ({}) abre la generación {}",
                        task,
                        update.uuid,
                        update.state,
                        next.generation()
                    );
                    e.insert(next);
                }
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(StatusUpdateStream::new(task.clone())),
        };

        let uuid = update.uuid;
        let state = update.state;
        match stream.push(update) {
            Some(outgoing) => {
                info!("enviando update {} ({}) de {}", uuid, state, task);
                self.forward(outgoing);
                self.retry.arm(&task, self.clock.now());
                Ok(UpdateOutcome::AcceptedAndSent)
            }
            None => {
                debug!("update {} ({}) de {} queda en cola", uuid, state, task);
                Ok(UpdateOutcome::AcceptedAndQueued)
            }
        }
    }

    /* ---------------- acknowledgements ---------------- */

    pub fn acknowledgement(&mut self, ack: Acknowledgement) -> Result<AckOutcome, StatusUpdateError> {
        self.started = true;
        let run = ack.task.run();
        self.ensure_healthy(&run)?;

        let Some(stream) = self.streams.get(&ack.task) else {
            self.stats.unexpected_acks += 1;
            debug!("ACK {} para tarea desconocida {}, se ignora", ack.uuid, ack.task);
            return Ok(AckOutcome::IgnoredNoStream);
        };

        if !stream.expects(ack.uuid) {
            self.stats.unexpected_acks += 1;
            debug!(
                "ACK inesperado {} para {} (en vuelo: {:?}), se ignora",
                ack.uuid,
                ack.task,
                stream.in_flight().map(|u| u.uuid)
            );
            return Ok(AckOutcome::IgnoredUnexpected);
        }

        self.persist(
            &run,
            CheckpointRecord::Ack {
                task_id: ack.task.task_id.clone(),
                uuid: ack.uuid,
            },
        )?;

        let applied = self
            .streams
            .get_mut(&ack.task)
            .and_then(|s| s.acknowledge(ack.uuid));
        let Some(applied) = applied else {
            return Ok(AckOutcome::IgnoredUnexpected);
        };
        self.stats.acks_applied += 1;

        if applied.terminated {
            self.retry.cancel(&ack.task);
            info!(
                "tarea {} terminada: {} confirmado",
                ack.task, applied.acknowledged.state
            );
            for dropped in &applied.dropped {
                info!(
                    "descartando update {} ({}) encolado detrás del terminal de {}",
                    dropped.uuid, dropped.state, ack.task
                );
            }
            self.notify_terminated(&ack.task);
        } else if let Some(next) = applied.next {
            info!("enviando update {} ({}) de {}", next.uuid, next.state, ack.task);
            self.forward(next);
            self.retry.arm(&ack.task, self.clock.now());
        } else {
            self.retry.cancel(&ack.task);
        }

        Ok(AckOutcome::Applied)
    }

    /* ---------------- reintentos ---------------- */

    /// Reenvía los updates en vuelo cuyo timer venció. Mismo uuid, con el
    /// último estado conocido refrescado. Nunca vuelve a persistir.
    pub fn retry_due(&mut self) -> usize {
        let now = self.clock.now();
        let mut resent = 0;

        for task in self.retry.due(now) {
            let outgoing = self.streams.get(&task).and_then(|s| s.outgoing());
            match outgoing {
                Some(update) => {
                    debug!(
                        "reintentando update {} ({}) de {}, latest_state={:?}",
                        update.uuid, update.state, task, update.latest_state
                    );
                    self.forward(update);
                    self.retry.backoff(&task, now);
                    self.stats.retries += 1;
                    resent += 1;
                }
                None => self.retry.cancel(&task),
            }
        }
        resent
    }

    /* ---------------- recuperación ---------------- */

    /// Reconstruye los streams desde el checkpoint. Un run con log ilegible
    /// queda fallado; los demás se recuperan igual.
    pub fn recover(&mut self) -> Result<RecoveryReport, StatusUpdateError> {
        if self.started {
            return Err(StatusUpdateError::RecoveryAfterStart);
        }
        self.started = true;

        let runs = self.store.runs().map_err(StatusUpdateError::Discovery)?;
        let now = self.clock.now();
        let mut report = RecoveryReport::default();

        for run in runs {
            match self.store.is_torn_down(&run) {
                Ok(true) => {
                    info!("run {} fue desmontado, no se recupera", run);
                    report.torn_down += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("no se pudo leer la marca de teardown de {}: {}", run, e);
                    self.fail_run(&run, e.to_string());
                    report.failed.push((run, e.to_string()));
                    continue;
                }
            }

            let rebuilt = self
                .store
                .replay(&run)
                .and_then(|records| replay_run(&run, records));

            match rebuilt {
                Ok(streams) => {
                    report.runs += 1;
                    for (task, stream) in streams {
                        if stream.in_flight().is_some() {
                            // vence en el próximo tick, no se reenvía acá
                            self.retry.arm_now(&task, now);
                            report.in_flight += 1;
                        }
                        report.streams += 1;
                        self.streams.insert(task, stream);
                    }
                    info!("run {} recuperado", run);
                }
                Err(e) => {
                    error!("no se pudo recuperar el run {}: {}", run, e);
                    self.fail_run(&run, e.to_string());
                    report.failed.push((run, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /* ---------------- teardown ---------------- */

    /// Un colaborador externo desmonta el run: se cancelan sus timers, se
    /// libera el handle del checkpoint y queda una marca durable. Lo que
    /// llegue después se descarta, también después de reiniciar.
    pub fn cleanup_run(&mut self, run: &RunKey) -> Result<usize, StatusUpdateError> {
        validate_components(&run.to_string(), &run.components())?;

        if let Err(source) = self.store.tear_down(run) {
            error!("no se pudo marcar el teardown del run {}: {}", run, source);
            self.fail_run(run, source.to_string());
            return Err(StatusUpdateError::Checkpoint {
                run: run.clone(),
                source,
            });
        }

        let before = self.streams.len();
        self.streams.retain(|task, _| task.run() != *run);
        self.retry.cancel_run(run);
        self.failed_runs.remove(run);

        let removed = before - self.streams.len();
        info!("run {} desmontado ({} streams)", run, removed);
        Ok(removed)
    }

    /* ---------------- internos ---------------- */

    fn is_torn_down(&self, run: &RunKey) -> Result<bool, StatusUpdateError> {
        self.store
            .is_torn_down(run)
            .map_err(|source| StatusUpdateError::Checkpoint {
                run: run.clone(),
                source,
            })
    }

    fn ensure_healthy(&self, run: &RunKey) -> Result<(), StatusUpdateError> {
        match self.failed_runs.get(run) {
            Some(reason) => Err(StatusUpdateError::RunFailed {
                run: run.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn persist(&mut self, run: &RunKey, record: CheckpointRecord) -> Result<(), StatusUpdateError> {
        if let Err(source) = self.store.append(run, &record) {
            error!("falló el checkpoint del run {}: {}", run, source);
            self.fail_run(run, source.to_string());
            return Err(StatusUpdateError::Checkpoint {
                run: run.clone(),
                source,
            });
        }
        Ok(())
    }

    fn fail_run(&mut self, run: &RunKey, reason: String) {
        self.failed_runs.insert(run.clone(), reason);
        self.retry.cancel_run(run);
    }

    fn forward(&mut self, update: StatusUpdate) {
        self.stats.forwarded += 1;
        self.transport.forward(update);
    }

    fn notify_terminated(&self, task: &TaskIdentity) {
        if let Some(tx) = &self.terminations {
            if tx.send(task.clone()).is_err() {
                warn!("nadie escucha las terminaciones, se pierde el aviso de {}", task);
            }
        }
    }
}

/// Rechaza identidades que no pueden direccionar un log en disco.
fn validate_identity(task: &TaskIdentity) -> Result<(), StatusUpdateError> {
    validate_components(&task.to_string(), &task.components())
}

fn validate_components(what: &str, values: &[&str]) -> Result<(), StatusUpdateError> {
    let names = ["framework_id", "executor_id", "run_id", "task_id"];
    for (name, value) in names.iter().zip(values.iter().copied()) {
        let reason = if value.is_empty() {
            Some(format!("{name} vacío"))
        } else if value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
            Some(format!("{name} no puede usarse como componente de ruta: {value:?}"))
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(StatusUpdateError::Malformed {
                task: what.to_string(),
                reason,
            });
        }
    }
    Ok(())
}

/// Reaplica el log de un run en orden de escritura. Un ACK que no coincide
/// con el update en vuelo reconstruido es corrupción: no se adivina.
pub fn replay_run(
    run: &RunKey,
    records: Vec<CheckpointRecord>,
) -> Result<HashMap<TaskIdentity, StatusUpdateStream>, CheckpointError> {
    let corrupt = |line: usize, reason: String| CheckpointError::Corrupt {
        log: run.to_string(),
        line,
        reason,
    };

    let mut streams: HashMap<TaskIdentity, StatusUpdateStream> = HashMap::new();
    for (idx, record) in records.into_iter().enumerate() {
        let line = idx + 1;
        match record {
            CheckpointRecord::Update { update } => {
                if update.task.run() != *run {
                    return Err(corrupt(
                        line,
                        format!("el update {} pertenece a {}", update.uuid, update.task),
                    ));
                }
                let stream = streams
                    .entry(update.task.clone())
                    .or_insert_with(|| StatusUpdateStream::new(update.task.clone()));
                match stream.admit(&update) {
                    Admission::Fresh => {}
                    Admission::Terminated => *stream = stream.successor(),
                    Admission::Duplicate => {
                        return Err(corrupt(line, format!("update {} repetido", update.uuid)));
                    }
                }
                stream.push(update);
            }
            CheckpointRecord::Ack { task_id, uuid } => {
                let task = run.task(task_id);
                let applied = streams.get_mut(&task).and_then(|s| s.acknowledge(uuid));
                if applied.is_none() {
                    return Err(corrupt(
                        line,
                        format!("ACK {uuid} no coincide con el update en vuelo de {task}"),
                    ));
                }
            }
        }
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{FsCheckpointStore, InMemoryCheckpointStore};
    use crate::retry::ManualClock;
    use crate::transport::RecordingTransport;
    use common::{StreamPhase, TaskState};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use uuid::Uuid;

    const INTERVAL: Duration = Duration::from_secs(10);

    struct Harness {
        manager: StatusUpdateManager,
        store: InMemoryCheckpointStore,
        transport: RecordingTransport,
        clock: ManualClock,
        terminated: UnboundedReceiver<TaskIdentity>,
    }

    fn harness_with(store: InMemoryCheckpointStore) -> Harness {
        let transport = RecordingTransport::new();
        let clock = ManualClock::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = StatusUpdateManager::new(
            store.clone(),
            Arc::new(transport.clone()),
            Arc::new(clock.clone()),
            RetryPolicy::new(INTERVAL, INTERVAL * 8),
        )
        .with_termination_notifier(tx);
        Harness {
            manager,
            store,
            transport,
            clock,
            terminated: rx,
        }
    }

    fn harness() -> Harness {
        harness_with(InMemoryCheckpointStore::new())
    }

    fn run() -> RunKey {
        RunKey::new("fw-1", "exec-1", "run-1")
    }

    fn task() -> TaskIdentity {
        run().task("task-1")
    }

    fn update(state: TaskState) -> StatusUpdate {
        StatusUpdate::new(task(), state)
    }

    fn ack(u: &StatusUpdate) -> Acknowledgement {
        Acknowledgement {
            uuid: u.uuid,
            task: u.task.clone(),
        }
    }

    fn uuids(sent: &[StatusUpdate]) -> Vec<Uuid> {
        sent.iter().map(|u| u.uuid).collect()
    }

    #[test]
    fn checkpoint_guarda_update_y_ack() {
        let mut h = harness();
        let running = update(TaskState::Running);

        assert_eq!(
            h.manager.update(running.clone()).unwrap(),
            UpdateOutcome::AcceptedAndSent
        );
        assert_eq!(h.manager.acknowledgement(ack(&running)).unwrap(), AckOutcome::Applied);

        assert_eq!(
            h.store.records(&run()),
            vec![
                CheckpointRecord::Update {
                    update: running.clone()
                },
                CheckpointRecord::Ack {
                    task_id: "task-1".into(),
                    uuid: running.uuid
                },
            ]
        );
        assert_eq!(h.manager.stream(&task()).unwrap().phase(), StreamPhase::Empty);
        assert!(h.manager.retry().deadline(&task()).is_none());
    }

    #[test]
    fn el_envio_adjunta_el_ultimo_estado() {
        let mut h = harness();
        let running = update(TaskState::Running);
        h.manager.update(running.clone()).unwrap();

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].uuid, running.uuid);
        assert_eq!(sent[0].latest_state, Some(TaskState::Running));
    }

    #[test]
    fn duplicado_no_reenvia_ni_persiste() {
        let mut h = harness();
        let running = update(TaskState::Running);
        h.manager.update(running.clone()).unwrap();

        // mismo uuid, aunque cambie el estado
        let mut dup = running.clone();
        dup.state = TaskState::Finished;
        assert_eq!(h.manager.update(dup).unwrap(), UpdateOutcome::DroppedDuplicate);
        assert_eq!(
            h.manager.update(running.clone()).unwrap(),
            UpdateOutcome::DroppedDuplicate
        );

        assert_eq!(h.transport.sent().len(), 1);
        assert_eq!(h.store.append_count(), 1);
        assert_eq!(h.manager.stats().duplicates, 2);
    }

    #[test]
    fn reintenta_tras_exactamente_un_intervalo() {
        let mut h = harness();
        let running = update(TaskState::Running);
        h.manager.update(running.clone()).unwrap();
        h.transport.take();

        h.clock.advance(INTERVAL - Duration::from_millis(1));
        assert_eq!(h.manager.retry_due(), 0);
        assert!(h.transport.sent().is_empty());

        h.clock.advance(Duration::from_millis(1));
        assert_eq!(h.manager.retry_due(), 1);

        let resent = h.transport.take();
        assert_eq!(uuids(&resent), vec![running.uuid]);
        assert_eq!(resent[0].state, TaskState::Running);
        // reintentar no vuelve a escribir el log
        assert_eq!(h.store.append_count(), 1);
    }

    #[test]
    fn reintentos_usan_backoff() {
        let mut h = harness();
        h.manager.update(update(TaskState::Running)).unwrap();

        h.clock.advance(INTERVAL);
        assert_eq!(h.manager.retry_due(), 1);

        // el siguiente espera el doble
        h.clock.advance(INTERVAL);
        assert_eq!(h.manager.retry_due(), 0);
        h.clock.advance(INTERVAL);
        assert_eq!(h.manager.retry_due(), 1);
        assert_eq!(h.manager.stats().retries, 2);
    }

    #[test]
    fn ack_duplicado_de_un_reintento_se_ignora() {
        let mut h = harness();
        let running = update(TaskState::Running);
        h.manager.update(running.clone()).unwrap();

        // se pierde el primer envío, llega el reintento y su ACK
        h.clock.advance(INTERVAL);
        h.manager.retry_due();
        assert_eq!(h.manager.acknowledgement(ack(&running)).unwrap(), AckOutcome::Applied);

        let finished = update(TaskState::Finished);
        assert_eq!(
            h.manager.update(finished.clone()).unwrap(),
            UpdateOutcome::AcceptedAndSent
        );
        let appends = h.store.append_count();

        // el ACK repetido del RUNNING no debe tocar al FINISHED en vuelo
        assert_eq!(
            h.manager.acknowledgement(ack(&running)).unwrap(),
            AckOutcome::IgnoredUnexpected
        );
        let stream = h.manager.stream(&task()).unwrap();
        assert_eq!(stream.in_flight().map(|u| u.uuid), Some(finished.uuid));
        assert!(!stream.is_terminated());
        assert_eq!(h.store.append_count(), appends);
    }

    #[test]
    fn ack_con_uuid_aleatorio_se_ignora() {
        let mut h = harness();
        let running = update(TaskState::Running);
        let finished = update(TaskState::Finished);
        h.manager.update(running.clone()).unwrap();
        h.manager.update(finished.clone()).unwrap();
        let before = h.manager.stream(&task()).unwrap().clone();
        h.transport.take();

        let random = Acknowledgement {
            uuid: Uuid::new_v4(),
            task: task(),
        };
        assert_eq!(
            h.manager.acknowledgement(random).unwrap(),
            AckOutcome::IgnoredUnexpected
        );

        // no desbloquea el update encolado
        assert_eq!(h.manager.stream(&task()).unwrap(), &before);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.manager.stats().unexpected_acks, 1);
    }

    #[test]
    fn ack_para_tarea_desconocida() {
        let mut h = harness();
        let ghost = Acknowledgement {
            uuid: Uuid::new_v4(),
            task: run().task("nadie"),
        };
        assert_eq!(
            h.manager.acknowledgement(ghost).unwrap(),
            AckOutcome::IgnoredNoStream
        );
        assert_eq!(h.store.append_count(), 0);
    }

    #[test]
    fn terminal_duplicado_antes_del_ack_se_descarta() {
        let mut h = harness();
        let finished = update(TaskState::Finished);
        let killed = update(TaskState::Killed);

        h.manager.update(finished.clone()).unwrap();
        // se pierde el ACK del FINISHED; llega KILLED
        assert_eq!(
            h.manager.update(killed.clone()).unwrap(),
            UpdateOutcome::AcceptedAndQueued
        );

        // el reintento sigue siendo FINISHED
        h.clock.advance(INTERVAL);
        h.manager.retry_due();
        let sent = h.transport.take();
        assert_eq!(uuids(&sent), vec![finished.uuid, finished.uuid]);
        assert_eq!(sent[1].state, TaskState::Finished);

        assert_eq!(h.manager.acknowledgement(ack(&finished)).unwrap(), AckOutcome::Applied);

        // KILLED nunca se envía y el stream queda terminado
        assert!(h.transport.sent().is_empty());
        let stream = h.manager.stream(&task()).unwrap();
        assert_eq!(stream.phase(), StreamPhase::Terminated);
        assert_eq!(stream.pending().count(), 0);
        assert!(h.manager.retry().deadline(&task()).is_none());
        assert_eq!(h.terminated.try_recv().unwrap(), task());

        // y ningún tick posterior lo manda
        h.clock.advance(INTERVAL * 10);
        assert_eq!(h.manager.retry_due(), 0);
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn terminal_despues_del_ack_se_reenvia() {
        let mut h = harness();
        let finished = update(TaskState::Finished);
        h.manager.update(finished.clone()).unwrap();
        h.manager.acknowledgement(ack(&finished)).unwrap();
        h.transport.take();

        let killed = update(TaskState::Killed);
        assert_eq!(
            h.manager.update(killed.clone()).unwrap(),
            UpdateOutcome::AcceptedAndSent
        );
        let sent = h.transport.take();
        assert_eq!(uuids(&sent), vec![killed.uuid]);
        assert_eq!(sent[0].state, TaskState::Killed);

        let stream = h.manager.stream(&task()).unwrap();
        assert_eq!(stream.generation(), 1);
        assert_eq!(stream.phase(), StreamPhase::Active);

        assert_eq!(h.manager.acknowledgement(ack(&killed)).unwrap(), AckOutcome::Applied);
        assert_eq!(h.terminated.try_recv().unwrap(), task());
        assert_eq!(h.terminated.try_recv().unwrap(), task());
    }

    #[test]
    fn terminal_confirmado_no_acepta_repeticiones() {
        let mut h = harness();
        let running = update(TaskState::Running);
        let finished = update(TaskState::Finished);
        h.manager.update(running.clone()).unwrap();
        h.manager.acknowledgement(ack(&running)).unwrap();
        h.manager.update(finished.clone()).unwrap();
        h.manager.acknowledgement(ack(&finished)).unwrap();
        h.transport.take();

        for again in [running.clone(), finished.clone()] {
            assert_eq!(
                h.manager.update(again).unwrap(),
                UpdateOutcome::DroppedDuplicate
            );
        }
        let stream = h.manager.stream(&task()).unwrap();
        assert_eq!(stream.phase(), StreamPhase::Terminated);
        assert_eq!(stream.generation(), 0);
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn update_duplicado_antes_del_ack_y_luego_reintento() {
        let mut h = harness();
        let running = update(TaskState::Running);
        h.manager.update(running.clone()).unwrap();

        // el executor reenvía el mismo update antes del ACK
        assert_eq!(
            h.manager.update(running.clone()).unwrap(),
            UpdateOutcome::DroppedDuplicate
        );
        assert_eq!(h.transport.sent().len(), 1);

        h.clock.advance(INTERVAL);
        h.manager.retry_due();
        let sent = h.transport.take();
        assert_eq!(uuids(&sent), vec![running.uuid, running.uuid]);
        assert_eq!(sent[1].state, TaskState::Running);
    }

    #[test]
    fn reintento_lleva_el_ultimo_estado_encolado() {
        let mut h = harness();
        let running = update(TaskState::Running);
        h.manager.update(running.clone()).unwrap();
        h.manager.update(update(TaskState::Finished)).unwrap();
        h.transport.take();

        h.clock.advance(INTERVAL);
        h.manager.retry_due();

        let sent = h.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].uuid, running.uuid);
        assert_eq!(sent[0].state, TaskState::Running);
        assert_eq!(sent[0].latest_state, Some(TaskState::Finished));
    }

    #[test]
    fn mismo_uuid_despues_del_ack_es_duplicado() {
        let mut h = harness();
        let u1 = update(TaskState::Running);
        h.manager.update(u1.clone()).unwrap();
        h.manager.acknowledgement(ack(&u1)).unwrap();

        let u2 = u1.clone();
        assert_eq!(h.manager.update(u2).unwrap(), UpdateOutcome::DroppedDuplicate);
        assert_eq!(uuids(&h.transport.sent()), vec![u1.uuid]);
    }

    #[test]
    fn ack_promueve_el_siguiente_en_orden_fifo() {
        let mut h = harness();
        let staging = update(TaskState::Staging);
        let running = update(TaskState::Running);
        let finished = update(TaskState::Finished);
        for u in [&staging, &running, &finished] {
            h.manager.update(u.clone()).unwrap();
        }
        h.manager.acknowledgement(ack(&staging)).unwrap();
        h.manager.acknowledgement(ack(&running)).unwrap();
        h.manager.acknowledgement(ack(&finished)).unwrap();

        assert_eq!(
            uuids(&h.transport.sent()),
            vec![staging.uuid, running.uuid, finished.uuid]
        );
        assert_eq!(h.manager.stats().acks_applied, 3);
    }

    #[test]
    fn falla_de_checkpoint_es_fatal_para_el_run() {
        let mut h = harness();
        h.store.set_fail_appends(true);

        let err = h.manager.update(update(TaskState::Running)).unwrap_err();
        assert!(matches!(err, StatusUpdateError::Checkpoint { .. }), "{err}");
        assert!(h.transport.sent().is_empty());
        assert!(h.manager.stream(&task()).is_none());

        // aunque el disco vuelva, el run ya no es confiable
        h.store.set_fail_appends(false);
        let err = h.manager.update(update(TaskState::Running)).unwrap_err();
        assert!(matches!(err, StatusUpdateError::RunFailed { .. }), "{err}");

        // otros runs siguen funcionando
        let other = StatusUpdate::new(RunKey::new("fw-1", "exec-1", "run-2").task("t"), TaskState::Running);
        assert_eq!(h.manager.update(other).unwrap(), UpdateOutcome::AcceptedAndSent);
    }

    #[test]
    fn falla_al_persistir_el_ack_no_avanza_el_stream() {
        let mut h = harness();
        let running = update(TaskState::Running);
        h.manager.update(running.clone()).unwrap();
        h.manager.update(update(TaskState::Finished)).unwrap();
        h.transport.take();

        h.store.set_fail_appends(true);
        assert!(h.manager.acknowledgement(ack(&running)).is_err());
        let stream = h.manager.stream(&task()).unwrap();
        assert_eq!(stream.in_flight().map(|u| u.uuid), Some(running.uuid));
        assert!(h.transport.sent().is_empty());

        // tampoco se reintenta un run fallado
        h.clock.advance(INTERVAL);
        assert_eq!(h.manager.retry_due(), 0);
    }

    #[test]
    fn identidad_invalida_se_rechaza() {
        let mut h = harness();
        for bad in [
            RunKey::new("", "e", "r").task("t"),
            RunKey::new("fw", "../e", "r").task("t"),
            RunKey::new("fw", "e", "..").task("t"),
            RunKey::new("fw", "e", "r").task(""),
        ] {
            let err = h.manager.update(StatusUpdate::new(bad, TaskState::Running)).unwrap_err();
            assert!(matches!(err, StatusUpdateError::Malformed { .. }), "{err}");
        }
        assert_eq!(h.store.append_count(), 0);
    }

    #[test]
    fn recupera_streams_y_reintenta_en_el_proximo_tick() {
        let store = InMemoryCheckpointStore::new();
        let running = update(TaskState::Running);
        let finished = update(TaskState::Finished);
        let other_task = run().task("task-2");
        let done = StatusUpdate::new(other_task.clone(), TaskState::Finished);
        {
            let mut h = harness_with(store.clone());
            h.manager.update(running.clone()).unwrap();
            h.manager.update(finished.clone()).unwrap();
            h.manager.update(done.clone()).unwrap();
            h.manager.acknowledgement(ack(&done)).unwrap();
        }

        let mut h = harness_with(store);
        let report = h.manager.recover().unwrap();
        assert_eq!(report.runs, 1);
        assert_eq!(report.streams, 2);
        assert_eq!(report.in_flight, 1);
        assert!(report.failed.is_empty());

        // nada se envía durante la recuperación
        assert!(h.transport.sent().is_empty());

        let stream = h.manager.stream(&task()).unwrap();
        assert_eq!(stream.in_flight().map(|u| u.uuid), Some(running.uuid));
        assert_eq!(stream.pending().count(), 1);
        assert_eq!(
            h.manager.stream(&other_task).unwrap().phase(),
            StreamPhase::Terminated
        );

        // el primer tick reenvía, con el último estado conocido
        assert_eq!(h.manager.retry_due(), 1);
        let sent = h.transport.take();
        assert_eq!(sent[0].uuid, running.uuid);
        assert_eq!(sent[0].latest_state, Some(TaskState::Finished));

        // después de recuperar, los duplicados se siguen detectando
        assert_eq!(
            h.manager.update(done).unwrap(),
            UpdateOutcome::DroppedDuplicate
        );
    }

    #[test]
    fn recuperar_dos_veces_da_lo_mismo() {
        let store = InMemoryCheckpointStore::new();
        {
            let mut h = harness_with(store.clone());
            let a = update(TaskState::Running);
            let b = update(TaskState::Finished);
            h.manager.update(a.clone()).unwrap();
            h.manager.update(b.clone()).unwrap();
            h.manager.acknowledgement(ack(&a)).unwrap();
            h.manager.acknowledgement(ack(&b)).unwrap();
            // post-ack: generación nueva
            h.manager.update(update(TaskState::Killed)).unwrap();
        }

        let records = store.records(&run());
        let first = replay_run(&run(), records.clone()).unwrap();
        let second = replay_run(&run(), records).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[&task()].generation(), 1);

        let mut h1 = harness_with(store.clone());
        let mut h2 = harness_with(store);
        h1.manager.recover().unwrap();
        h2.manager.recover().unwrap();
        assert_eq!(h1.manager.snapshot(), h2.manager.snapshot());
        assert_eq!(h1.manager.stream(&task()), h2.manager.stream(&task()));
    }

    #[test]
    fn log_corrupto_falla_solo_ese_run() {
        let store = InMemoryCheckpointStore::new();
        let healthy = RunKey::new("fw-1", "exec-1", "run-2");
        let healthy_update = StatusUpdate::new(healthy.task("t"), TaskState::Running);
        {
            let mut h = harness_with(store.clone());
            h.manager.update(update(TaskState::Running)).unwrap();
            h.manager.update(healthy_update.clone()).unwrap();
        }
        store.append_raw(&run(), b"{\"type\":\"ACK\"");

        let mut h = harness_with(store);
        let report = h.manager.recover().unwrap();
        assert_eq!(report.runs, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, run());

        assert!(h.manager.stream(&task()).is_none());
        assert!(h.manager.stream(&healthy_update.task).is_some());

        let err = h.manager.update(update(TaskState::Finished)).unwrap_err();
        assert!(matches!(err, StatusUpdateError::RunFailed { .. }), "{err}");
    }

    #[test]
    fn ack_que_no_coincide_en_el_log_es_corrupcion() {
        let u = update(TaskState::Running);
        let records = vec![
            CheckpointRecord::Update { update: u },
            CheckpointRecord::Ack {
                task_id: "task-1".into(),
                uuid: Uuid::new_v4(),
            },
        ];
        match replay_run(&run(), records) {
            Err(CheckpointError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("se esperaba corrupción, vino {other:?}"),
        }
    }

    #[test]
    fn recuperar_despues_de_empezar_es_error() {
        let mut h = harness();
        h.manager.update(update(TaskState::Running)).unwrap();
        assert!(matches!(
            h.manager.recover(),
            Err(StatusUpdateError::RecoveryAfterStart)
        ));
    }

    #[test]
    fn desmontar_el_run_cancela_timers_y_descarta_lo_que_llega() {
        let mut h = harness();
        let running = update(TaskState::Running);
        h.manager.update(running.clone()).unwrap();
        h.transport.take();

        assert_eq!(h.manager.cleanup_run(&run()).unwrap(), 1);
        assert!(h.manager.stream(&task()).is_none());
        assert!(h.manager.retry().is_empty());
        assert_eq!(h.store.torn_down(), vec![run()]);

        h.clock.advance(INTERVAL);
        assert_eq!(h.manager.retry_due(), 0);
        assert_eq!(
            h.manager.update(update(TaskState::Killed)).unwrap(),
            UpdateOutcome::DroppedTerminated
        );
        assert_eq!(
            h.manager.acknowledgement(ack(&running)).unwrap(),
            AckOutcome::IgnoredNoStream
        );
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn streams_de_distintas_tareas_son_independientes() {
        let mut h = harness();
        let a = update(TaskState::Running);
        let b = StatusUpdate::new(run().task("task-2"), TaskState::Running);
        assert_eq!(h.manager.update(a.clone()).unwrap(), UpdateOutcome::AcceptedAndSent);
        assert_eq!(h.manager.update(b.clone()).unwrap(), UpdateOutcome::AcceptedAndSent);

        h.manager.acknowledgement(ack(&b)).unwrap();
        h.clock.advance(INTERVAL);
        h.manager.retry_due();

        // solo a sigue sin ACK
        let sent = h.transport.sent();
        assert_eq!(uuids(&sent), vec![a.uuid, b.uuid, a.uuid]);
        assert_eq!(h.manager.snapshot().len(), 2);
    }

    #[test]
    fn teardown_sobrevive_al_reinicio() {
        let store = InMemoryCheckpointStore::new();
        let running = update(TaskState::Running);
        {
            let mut h = harness_with(store.clone());
            h.manager.update(running.clone()).unwrap();
            h.manager.cleanup_run(&run()).unwrap();
        }

        let mut h = harness_with(store.clone());
        let report = h.manager.recover().unwrap();
        assert_eq!(report.runs, 0);
        assert_eq!(report.torn_down, 1);
        assert_eq!(report.streams, 0);
        assert!(h.manager.stream(&task()).is_none());

        // nada que reintentar del run desmontado
        assert_eq!(h.manager.retry_due(), 0);
        h.clock.advance(INTERVAL * 10);
        assert_eq!(h.manager.retry_due(), 0);

        let before = store.append_count();
        for state in [TaskState::Running, TaskState::Killed] {
            assert_eq!(
                h.manager.update(update(state)).unwrap(),
                UpdateOutcome::DroppedTerminated
            );
        }
        // tampoco abre streams en otras tareas del run
        let other = StatusUpdate::new(run().task("task-2"), TaskState::Running);
        assert_eq!(
            h.manager.update(other).unwrap(),
            UpdateOutcome::DroppedTerminated
        );
        assert_eq!(store.append_count(), before);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.manager.stats().dropped_terminated, 3);
    }

    #[test]
    fn teardown_que_no_se_puede_marcar_falla_el_run() {
        let mut h = harness();
        h.manager.update(update(TaskState::Running)).unwrap();

        h.store.set_fail_appends(true);
        let err = h.manager.cleanup_run(&run()).unwrap_err();
        assert!(matches!(err, StatusUpdateError::Checkpoint { .. }), "{err}");
        assert!(h.store.torn_down().is_empty());

        // sin marca durable no hay reintentos ni operaciones sobre el run
        assert!(h.manager.retry().is_empty());
        h.store.set_fail_appends(false);
        let err = h.manager.update(update(TaskState::Killed)).unwrap_err();
        assert!(matches!(err, StatusUpdateError::RunFailed { .. }), "{err}");
    }

    #[test]
    fn teardown_con_identidad_invalida_se_rechaza() {
        let mut h = harness();
        let err = h
            .manager
            .cleanup_run(&RunKey::new("fw", "..", "run"))
            .unwrap_err();
        assert!(matches!(err, StatusUpdateError::Malformed { .. }), "{err}");
        assert!(h.store.torn_down().is_empty());
    }

    fn fs_manager(dir: &TempDir, transport: &RecordingTransport) -> StatusUpdateManager {
        StatusUpdateManager::new(
            FsCheckpointStore::new(dir.path()).unwrap(),
            Arc::new(transport.clone()),
            Arc::new(ManualClock::new()),
            RetryPolicy::fixed(INTERVAL),
        )
    }

    #[test]
    fn recupera_desde_disco_con_otra_instancia() {
        let dir = TempDir::new().unwrap();
        let running = update(TaskState::Running);
        let finished = update(TaskState::Finished);
        let gone = RunKey::new("fw-1", "exec-2", "run-7");
        let gone_update = StatusUpdate::new(gone.task("t"), TaskState::Running);
        let other_run = RunKey::new("fw-2", "exec-1", "run-1");
        let other_update = StatusUpdate::new(other_run.task("t"), TaskState::Staging);
        {
            let transport = RecordingTransport::new();
            let mut m = fs_manager(&dir, &transport);
            m.update(running.clone()).unwrap();
            m.update(finished.clone()).unwrap();
            m.acknowledgement(ack(&running)).unwrap();
            m.update(other_update.clone()).unwrap();
            m.update(gone_update.clone()).unwrap();
            m.cleanup_run(&gone).unwrap();
        }

        let transport = RecordingTransport::new();
        let mut m = fs_manager(&dir, &transport);
        let report = m.recover().unwrap();
        assert_eq!(report.runs, 2);
        assert_eq!(report.streams, 2);
        assert_eq!(report.in_flight, 2);
        assert_eq!(report.torn_down, 1);
        assert!(report.failed.is_empty());

        let stream = m.stream(&task()).unwrap();
        assert_eq!(stream.in_flight().map(|u| u.uuid), Some(finished.uuid));
        assert_eq!(stream.pending().count(), 0);
        assert!(m.stream(&other_update.task).is_some());
        assert!(m.stream(&gone_update.task).is_none());

        // los dos en vuelo se reenvían en el primer tick, en orden de identidad
        assert_eq!(m.retry_due(), 2);
        assert_eq!(
            uuids(&transport.take()),
            vec![finished.uuid, other_update.uuid]
        );

        // el ACK del running ya estaba en el log
        assert_eq!(
            m.update(running).unwrap(),
            UpdateOutcome::DroppedDuplicate
        );
        assert_eq!(
            m.update(StatusUpdate::new(gone.task("t"), TaskState::Killed)).unwrap(),
            UpdateOutcome::DroppedTerminated
        );
    }
}
