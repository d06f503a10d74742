// agent/src/checkpoint.rs
//
// Log append-only por run: cada update y cada ACK que el manager aplica
// queda escrito (y sincronizado a disco) en el orden en que se aplicó.
// Nunca se reescribe ni se compacta desde acá.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use common::{RunKey, StatusUpdate, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CHECKPOINT_FILE: &str = "status_updates.jsonl";
/// Marca de teardown externo: un run con esta marca no se recupera.
pub const TORN_DOWN_FILE: &str = "TORN_DOWN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointRecord {
    Update { update: StatusUpdate },
    /// Un log contiene todas las tareas del run, por eso el ACK lleva task_id.
    Ack { task_id: TaskId, uuid: Uuid },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("error de I/O en {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no se pudo codificar el registro: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("log {log} corrupto en la línea {line}: {reason}")]
    Corrupt {
        log: String,
        line: usize,
        reason: String,
    },

    #[error("log {log} truncado: la última línea está incompleta")]
    Truncated { log: String },

    #[error("patrón de búsqueda de runs inválido: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("append rechazado por el almacenamiento: {0}")]
    Rejected(String),
}

fn io_err(path: &Path, source: io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Almacenamiento durable de los streams. No sabe nada del protocolo.
pub trait CheckpointStore: Send {
    /// Agrega un registro al log del run. Cuando devuelve Ok el registro es
    /// durable.
    fn append(&mut self, run: &RunKey, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    /// Lee el log completo desde el principio, en orden de escritura.
    fn replay(&self, run: &RunKey) -> Result<Vec<CheckpointRecord>, CheckpointError>;

    /// Runs con log en el almacenamiento, ordenados.
    fn runs(&self) -> Result<Vec<RunKey>, CheckpointError>;

    /// Teardown externo: suelta el handle de escritura y deja una marca
    /// durable. El log queda en disco.
    fn tear_down(&mut self, run: &RunKey) -> Result<(), CheckpointError>;

    fn is_torn_down(&self, run: &RunKey) -> Result<bool, CheckpointError>;
}

/// Decodifica un log JSONL completo. No intenta reparar nada.
pub fn decode_log(log: &str, contents: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
    if contents.is_empty() {
        return Ok(Vec::new());
    }
    if !contents.ends_with('\n') {
        return Err(CheckpointError::Truncated {
            log: log.to_string(),
        });
    }

    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let record: CheckpointRecord =
            serde_json::from_str(line).map_err(|e| CheckpointError::Corrupt {
                log: log.to_string(),
                line: idx + 1,
                reason: e.to_string(),
            })?;
        records.push(record);
    }
    Ok(records)
}

fn encode_record(record: &CheckpointRecord) -> Result<Vec<u8>, CheckpointError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Checkpoint en disco:
/// `<work_dir>/meta/frameworks/<fw>/executors/<ex>/runs/<run>/status_updates.jsonl`
pub struct FsCheckpointStore {
    root: PathBuf,
    handles: HashMap<RunKey, File>,
}

impl FsCheckpointStore {
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = work_dir.into().join("meta");
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self {
            root,
            handles: HashMap::new(),
        })
    }

    pub fn run_dir(&self, run: &RunKey) -> PathBuf {
        self.root
            .join("frameworks")
            .join(&run.framework_id)
            .join("executors")
            .join(&run.executor_id)
            .join("runs")
            .join(&run.run_id)
    }

    pub fn log_path(&self, run: &RunKey) -> PathBuf {
        self.run_dir(run).join(CHECKPOINT_FILE)
    }

    pub fn marker_path(&self, run: &RunKey) -> PathBuf {
        self.run_dir(run).join(TORN_DOWN_FILE)
    }

    /// Cierra el handle cacheado; el próximo append lo vuelve a abrir.
    pub fn release(&mut self, run: &RunKey) {
        self.handles.remove(run);
    }

    /// Reconstruye el RunKey a partir de la ruta de un log encontrado por glob.
    fn run_from_path(&self, path: &Path) -> Option<RunKey> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;

        match parts.as_slice() {
            ["frameworks", fw, "executors", ex, "runs", run, file] if *file == CHECKPOINT_FILE => {
                Some(RunKey::new(*fw, *ex, *run))
            }
            _ => None,
        }
    }
}

fn open_log(path: &Path) -> Result<File, CheckpointError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))
}

impl CheckpointStore for FsCheckpointStore {
    fn append(&mut self, run: &RunKey, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let line = encode_record(record)?;
        let path = self.log_path(run);

        let file = match self.handles.entry(run.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                debug!("abriendo log de checkpoint {}", path.display());
                e.insert(open_log(&path)?)
            }
        };

        let written = file.write_all(&line).and_then(|_| file.sync_data());
        if let Err(e) = written {
            // el handle puede haber quedado en mal estado, lo descartamos
            self.handles.remove(run);
            return Err(io_err(&path, e));
        }
        Ok(())
    }

    fn replay(&self, run: &RunKey) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let path = self.log_path(run);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&path, e)),
        };
        decode_log(&path.display().to_string(), &contents)
    }

    fn runs(&self) -> Result<Vec<RunKey>, CheckpointError> {
        let pattern = format!(
            "{}/frameworks/*/executors/*/runs/*/{}",
            glob::Pattern::escape(&self.root.to_string_lossy()),
            CHECKPOINT_FILE
        );

        let mut runs = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| {
                let path = e.path().to_path_buf();
                io_err(&path, io::Error::from(e))
            })?;
            match self.run_from_path(&path) {
                Some(run) => runs.push(run),
                None => debug!("ignorando ruta inesperada {}", path.display()),
            }
        }
        runs.sort();
        Ok(runs)
    }

    fn tear_down(&mut self, run: &RunKey) -> Result<(), CheckpointError> {
        self.release(run);

        let dir = self.run_dir(run);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let marker = self.marker_path(run);
        let file = File::create(&marker).map_err(|e| io_err(&marker, e))?;
        file.sync_all().map_err(|e| io_err(&marker, e))?;
        // la entrada nueva en el directorio también tiene que ser durable
        File::open(&dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| io_err(&dir, e))?;
        debug!("run {} marcado como desmontado", run);
        Ok(())
    }

    fn is_torn_down(&self, run: &RunKey) -> Result<bool, CheckpointError> {
        let marker = self.marker_path(run);
        marker.try_exists().map_err(|e| io_err(&marker, e))
    }
}

#[cfg(test)]
pub use memory::InMemoryCheckpointStore;
