// agent/src/stream.rs
//
// Estado en memoria del pipeline de una tarea. No hace I/O: el manager
// decide cuándo persistir y cuándo enviar, el stream solo aplica las reglas
// de transición.

use std::collections::{HashSet, VecDeque};

use common::{StatusUpdate, StreamPhase, StreamSummary, TaskIdentity, TaskState};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    /// El uuid ya pasó por este stream (o por una generación anterior).
    Duplicate,
    Terminated,
}

/// Efecto de aplicar un ACK esperado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledged {
    pub acknowledged: StatusUpdate,
    /// Siguiente update promovido a en vuelo, listo para enviar.
    pub next: Option<StatusUpdate>,
    pub terminated: bool,
    /// Updates que quedaron en cola detrás de un terminal ya confirmado.
    pub dropped: Vec<StatusUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdateStream {
    task: TaskIdentity,
    generation: u32,
    pending: VecDeque<StatusUpdate>,
    in_flight: Option<StatusUpdate>,
    terminated: bool,
    received: HashSet<Uuid>,
    acknowledged: HashSet<Uuid>,
    latest_state: Option<TaskState>,
}

impl StatusUpdateStream {
    pub fn new(task: TaskIdentity) -> Self {
        Self {
            task,
            generation: 0,
            pending: VecDeque::new(),
            in_flight: None,
            terminated: false,
            received: HashSet::new(),
            acknowledged: HashSet::new(),
            latest_state: None,
        }
    }

    /// Generación nueva para la misma tarea. Hereda los uuids vistos para
    /// que un duplicado siga siendo duplicado después de terminar.
    pub fn successor(&self) -> Self {
        Self {
            generation: self.generation + 1,
            received: self.received.clone(),
            ..Self::new(self.task.clone())
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn in_flight(&self) -> Option<&StatusUpdate> {
        self.in_flight.as_ref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &StatusUpdate> {
        self.pending.iter()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn phase(&self) -> StreamPhase {
        if self.terminated {
            StreamPhase::Terminated
        } else if self.in_flight.is_some() || !self.pending.is_empty() {
            StreamPhase::Active
        } else {
            StreamPhase::Empty
        }
    }

    pub fn admit(&self, update: &StatusUpdate) -> Admission {
        if self.received.contains(&update.uuid) {
            Admission::Duplicate
        } else if self.terminated {
            Admission::Terminated
        } else {
            Admission::Fresh
        }
    }

    /// Encola un update ya admitido (y ya persistido). Si no había nada en
    /// vuelo, la cabeza de la cola pasa a en vuelo y se devuelve lista para
    /// enviar.
    pub fn push(&mut self, update: StatusUpdate) -> Option<StatusUpdate> {
        debug_assert!(!self.terminated, "push sobre stream terminado");

        self.received.insert(update.uuid);
        self.latest_state = Some(update.state);
        self.pending.push_back(update);

        if self.in_flight.is_none() {
            self.in_flight = self.pending.pop_front();
            self.outgoing()
        } else {
            None
        }
    }

    /// Solo se espera ACK para el update en vuelo.
    pub fn expects(&self, uuid: Uuid) -> bool {
        !self.terminated && self.in_flight.as_ref().is_some_and(|u| u.uuid == uuid)
    }

    /// Aplica un ACK. Devuelve None (sin tocar nada) si no corresponde al
    /// update en vuelo.
    pub fn acknowledge(&mut self, uuid: Uuid) -> Option<Acknowledged> {
        if !self.expects(uuid) {
            return None;
        }
        let acknowledged = self.in_flight.take()?;
        self.acknowledged.insert(uuid);

        if acknowledged.is_terminal() {
            self.terminated = true;
            let dropped = self.pending.drain(..).collect();
            return Some(Acknowledged {
                acknowledged,
                next: None,
                terminated: true,
                dropped,
            });
        }

        self.in_flight = self.pending.pop_front();
        Some(Acknowledged {
            acknowledged,
            next: self.outgoing(),
            terminated: false,
            dropped: Vec::new(),
        })
    }

    /// Copia del update en vuelo con el último estado conocido adjunto. El
    /// uuid nunca cambia entre reintentos.
    pub fn outgoing(&self) -> Option<StatusUpdate> {
        self.in_flight.as_ref().map(|u| StatusUpdate {
            latest_state: self.latest_state,
            ..u.clone()
        })
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            task: self.task.clone(),
            phase: self.phase(),
            generation: self.generation,
            in_flight: self.in_flight.as_ref().map(|u| u.uuid),
            in_flight_state: self.in_flight.as_ref().map(|u| u.state),
            pending: self.pending.len(),
            latest_state: self.latest_state,
            acknowledged: self.acknowledged.len(),
        }
    }
}
