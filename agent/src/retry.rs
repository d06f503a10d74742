// agent/src/retry.rs
//
// Timers de reintento por stream. El scheduler no dispara nada por su
// cuenta: el loop del manager le pregunta qué venció en cada tick, con el
// reloj que se le haya inyectado.

use std::collections::HashMap;
use std::time::Duration;

use common::{RunKey, TaskIdentity};
use tokio::time::Instant;

/// Intervalo mínimo antes de reenviar un update sin ACK.
pub const STATUS_UPDATE_RETRY_INTERVAL_MIN: Duration = Duration::from_secs(10);
/// Tope del backoff exponencial.
pub const STATUS_UPDATE_RETRY_INTERVAL_MAX: Duration = Duration::from_secs(10 * 60);

/// Fuente de tiempo compartida por el manager y sus timers.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reloj de tokio: respeta `tokio::time::pause()` / `advance()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Sin backoff: siempre `interval`.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval)
    }

    fn grow(&self, interval: Duration) -> Duration {
        interval.saturating_mul(2).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            STATUS_UPDATE_RETRY_INTERVAL_MIN,
            STATUS_UPDATE_RETRY_INTERVAL_MAX,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetryTimer {
    deadline: Instant,
    /// Intervalo a usar después del próximo disparo.
    next_interval: Duration,
}

pub struct RetryScheduler {
    policy: RetryPolicy,
    timers: HashMap<TaskIdentity, RetryTimer>,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            timers: HashMap::new(),
        }
    }

    /// Envío nuevo (o ACK aceptado que promovió otro update): vuelve al
    /// intervalo mínimo.
    pub fn arm(&mut self, task: &TaskIdentity, now: Instant) {
        self.timers.insert(
            task.clone(),
            RetryTimer {
                deadline: now + self.policy.min,
                next_interval: self.policy.grow(self.policy.min),
            },
        );
    }

    /// Vence en el próximo tick. Se usa al recuperar: los updates en vuelo
    /// no se reenvían en forma sincrónica.
    pub fn arm_now(&mut self, task: &TaskIdentity, now: Instant) {
        self.timers.insert(
            task.clone(),
            RetryTimer {
                deadline: now,
                next_interval: self.policy.min,
            },
        );
    }

    /// Después de un reintento: el próximo espera el doble (hasta `max`).
    pub fn backoff(&mut self, task: &TaskIdentity, now: Instant) {
        if let Some(timer) = self.timers.get_mut(task) {
            timer.deadline = now + timer.next_interval;
            timer.next_interval = self.policy.grow(timer.next_interval);
        }
    }

    pub fn cancel(&mut self, task: &TaskIdentity) {
        self.timers.remove(task);
    }

    pub fn cancel_run(&mut self, run: &RunKey) {
        self.timers.retain(|task, _| task.run() != *run);
    }

    pub fn deadline(&self, task: &TaskIdentity) -> Option<Instant> {
        self.timers.get(task).map(|t| t.deadline)
    }

    /// Tareas con timer vencido, ordenadas por vencimiento (y por identidad
    /// a igual vencimiento, para que el orden sea determinista).
    pub fn due(&self, now: Instant) -> Vec<TaskIdentity> {
        let mut due: Vec<(Instant, &TaskIdentity)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(task, t)| (t.deadline, task))
            .collect();
        due.sort();
        due.into_iter().map(|(_, task)| task.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
pub use manual::ManualClock;
