use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{TaskIdentity, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamPhase {
    Empty,
    Active,
    Terminated,
}

/// Vista de un stream del agente (solo lectura, para inspección).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub task: TaskIdentity,
    pub phase: StreamPhase,
    pub generation: u32,
    pub in_flight: Option<Uuid>,
    pub in_flight_state: Option<TaskState>,
    pub pending: usize,
    pub latest_state: Option<TaskState>,
    pub acknowledged: usize,
}

/// Lo que el scheduler sabe de una tarea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerTaskView {
    pub task: TaskIdentity,
    pub last_state: TaskState,
    pub latest_state: Option<TaskState>,
    pub updates_received: u64,
    pub duplicates: u64,
    pub last_update_uuid: Uuid,
}
