// scheduler/src/state.rs

use common::{SchedulerTaskView, StatusUpdate, TaskIdentity};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<Mutex<HashMap<TaskIdentity, TaskRecord>>>,
    // cliente compartido para mandar los ACKs a los agentes
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            http,
        }
    }

    /// Registra un update recibido. Devuelve true si el uuid ya se había
    /// visto para esa tarea (reintento del agente).
    pub fn record(&self, update: &StatusUpdate) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let rec = tasks
            .entry(update.task.clone())
            .or_insert_with(|| TaskRecord::new(update));
        rec.observe(update)
    }

    pub fn views(&self) -> Vec<SchedulerTaskView> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut views: Vec<SchedulerTaskView> = tasks
            .iter()
            .map(|(task, rec)| rec.view(task))
            .collect();
        views.sort_by(|a, b| a.task.cmp(&b.task));
        views
    }
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub last_update: StatusUpdate,
    pub seen: HashSet<Uuid>,
    pub updates_received: u64,
    pub duplicates: u64,
}

impl TaskRecord {
    fn new(first: &StatusUpdate) -> Self {
        Self {
            last_update: first.clone(),
            seen: HashSet::new(),
            updates_received: 0,
            duplicates: 0,
        }
    }

    fn observe(&mut self, update: &StatusUpdate) -> bool {
        self.updates_received += 1;
        let duplicate = !self.seen.insert(update.uuid);
        if duplicate {
            self.duplicates += 1;
        }
        // un reintento puede traer un latest_state más nuevo
        self.last_update = update.clone();
        duplicate
    }

    fn view(&self, task: &TaskIdentity) -> SchedulerTaskView {
        SchedulerTaskView {
            task: task.clone(),
            last_state: self.last_update.state,
            latest_state: self.last_update.latest_state,
            updates_received: self.updates_received,
            duplicates: self.duplicates,
            last_update_uuid: self.last_update.uuid,
        }
    }
}
