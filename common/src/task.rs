use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type FrameworkId = String;
pub type ExecutorId = String;
pub type RunId = String;
pub type TaskId = String;

/// Identifica una ejecución (run) de un executor. Cada run tiene su propio
/// log de checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub run_id: RunId,
}

impl RunKey {
    pub fn new(
        framework_id: impl Into<FrameworkId>,
        executor_id: impl Into<ExecutorId>,
        run_id: impl Into<RunId>,
    ) -> Self {
        Self {
            framework_id: framework_id.into(),
            executor_id: executor_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Identidad de una tarea dentro de este run.
    pub fn task(&self, task_id: impl Into<TaskId>) -> TaskIdentity {
        TaskIdentity {
            framework_id: self.framework_id.clone(),
            executor_id: self.executor_id.clone(),
            run_id: self.run_id.clone(),
            task_id: task_id.into(),
        }
    }

    pub fn components(&self) -> [&str; 3] {
        [
            self.framework_id.as_str(),
            self.executor_id.as_str(),
            self.run_id.as_str(),
        ]
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.framework_id, self.executor_id, self.run_id)
    }
}

/// Clave estable de la vida de una tarea: (framework, executor, run, task).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub run_id: RunId,
    pub task_id: TaskId,
}

impl TaskIdentity {
    pub fn run(&self) -> RunKey {
        RunKey {
            framework_id: self.framework_id.clone(),
            executor_id: self.executor_id.clone(),
            run_id: self.run_id.clone(),
        }
    }

    /// Componentes en orden: framework, executor, run, task.
    pub fn components(&self) -> [&str; 4] {
        [
            self.framework_id.as_str(),
            self.executor_id.as_str(),
            self.run_id.as_str(),
            self.task_id.as_str(),
        ]
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.framework_id, self.executor_id, self.run_id, self.task_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

impl TaskState {
    /// Estados desde los que no hay más transiciones legítimas.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Staging => "STAGING",
            TaskState::Starting => "STARTING",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::Killed => "KILLED",
            TaskState::Lost => "LOST",
            TaskState::Error => "ERROR",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // acepta "running", "RUNNING" y "TASK_RUNNING"
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("TASK_").unwrap_or(&upper);
        match name {
            "STAGING" => Ok(TaskState::Staging),
            "STARTING" => Ok(TaskState::Starting),
            "RUNNING" => Ok(TaskState::Running),
            "FINISHED" => Ok(TaskState::Finished),
            "FAILED" => Ok(TaskState::Failed),
            "KILLED" => Ok(TaskState::Killed),
            "LOST" => Ok(TaskState::Lost),
            "ERROR" => Ok(TaskState::Error),
            other => Err(anyhow!("estado de tarea desconocido: {other}")),
        }
    }
}

/// Una transición de estado de una tarea. Inmutable una vez creada: el
/// `uuid` es la única identidad usada para deduplicar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub uuid: Uuid,
    pub task: TaskIdentity,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,

    /// Último estado conocido de la tarea al momento del envío. Puede
    /// diferir de `state` cuando se reintenta un update viejo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_state: Option<TaskState>,

    /// Nota libre del executor (no participa en la deduplicación).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusUpdate {
    /// Crea un update nuevo con uuid aleatorio.
    pub fn new(task: TaskIdentity, state: TaskState) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            task,
            state,
            timestamp: Utc::now(),
            latest_state: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
