use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{StatusUpdate, TaskIdentity};

/// Agente -> scheduler. El `update` viaja con `latest_state` ya calculado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateMessage {
    pub update: StatusUpdate,
    /// Endpoint del agente al que el scheduler debe mandar el ACK.
    pub agent_url: String,
}

/// Scheduler -> agente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateAcknowledgementMessage {
    pub uuid: Uuid,
    pub task: TaskIdentity,
}

/// Confirmación de que un update concreto llegó al scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub uuid: Uuid,
    pub task: TaskIdentity,
}

impl From<StatusUpdateAcknowledgementMessage> for Acknowledgement {
    fn from(msg: StatusUpdateAcknowledgementMessage) -> Self {
        Self {
            uuid: msg.uuid,
            task: msg.task,
        }
    }
}

/// Resultado de entregar un update al manager. Ninguno es un error:
/// duplicados y llegadas tardías son parte del régimen normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateOutcome {
    AcceptedAndSent,
    AcceptedAndQueued,
    DroppedDuplicate,
    DroppedTerminated,
}

impl UpdateOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            UpdateOutcome::AcceptedAndSent | UpdateOutcome::AcceptedAndQueued
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckOutcome {
    Applied,
    IgnoredUnexpected,
    IgnoredNoStream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownResponse {
    /// Cantidad de streams descartados para el run.
    pub streams_removed: usize,
}
