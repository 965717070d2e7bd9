use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::storage::{ListableStorage, StorageClient};
use crate::error::StorageError;

/// Number of calls the simulated storage received, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub disconnect: usize,
    pub upload: usize,
    pub find: usize,
    pub size: usize,
    pub modified_at: usize,
    pub delete: usize,
}

#[derive(Debug, Clone)]
struct SimulatedFile {
    modified_at: DateTime<Utc>,
    size: u64,
}

#[derive(Default)]
struct Faults {
    connect: bool,
    disconnect: bool,
    upload: bool,
    find: bool,
    delete: HashSet<String>,
}

struct SimulatedState {
    listable: bool,
    files: BTreeMap<String, SimulatedFile>,
    faults: Faults,
    calls: CallCounts,
    upload_time: Option<DateTime<Utc>>,
}

type SharedState = Arc<Mutex<SimulatedState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, SimulatedState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory storage target.
///
/// Every client created from the same controller sees the same files, so a
/// test can seed remote files, hand clients to the orchestrator and inspect
/// the result afterwards.
pub struct SimulatedStorage {
    state: SharedState,
    connected: bool,
}

/// Test handle for seeding files, injecting faults and reading call counts.
#[derive(Clone)]
pub struct SimulatedController {
    state: SharedState,
}

impl SimulatedStorage {
    /// A listable target.
    pub fn new() -> (Self, SimulatedController) {
        Self::with_listing(true)
    }

    /// A target without the listing capability, like a mail drop.
    pub fn unlisted() -> (Self, SimulatedController) {
        Self::with_listing(false)
    }

    fn with_listing(listable: bool) -> (Self, SimulatedController) {
        let state = Arc::new(Mutex::new(SimulatedState {
            listable,
            files: BTreeMap::new(),
            faults: Faults::default(),
            calls: CallCounts::default(),
            upload_time: None,
        }));
        (
            Self {
                state: state.clone(),
                connected: false,
            },
            SimulatedController { state },
        )
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.connected {
            Ok(())
        } else {
            Err(StorageError::NotConnected)
        }
    }
}

impl SimulatedController {
    /// A new client sharing this controller's state.
    pub fn client(&self) -> Box<dyn StorageClient> {
        Box::new(SimulatedStorage {
            state: self.state.clone(),
            connected: false,
        })
    }

    pub fn insert(&self, id: &str, modified_at: DateTime<Utc>, size: u64) {
        lock(&self.state)
            .files
            .insert(id.to_string(), SimulatedFile { modified_at, size });
    }

    /// Stored ids in name order.
    pub fn file_ids(&self) -> Vec<String> {
        lock(&self.state).files.keys().cloned().collect()
    }

    pub fn calls(&self) -> CallCounts {
        lock(&self.state).calls
    }

    /// Modification time given to uploaded files instead of the current time.
    pub fn set_upload_time(&self, at: DateTime<Utc>) {
        lock(&self.state).upload_time = Some(at);
    }

    pub fn fail_connect(&self, fail: bool) {
        lock(&self.state).faults.connect = fail;
    }

    pub fn fail_disconnect(&self, fail: bool) {
        lock(&self.state).faults.disconnect = fail;
    }

    pub fn fail_upload(&self, fail: bool) {
        lock(&self.state).faults.upload = fail;
    }

    pub fn fail_find(&self, fail: bool) {
        lock(&self.state).faults.find = fail;
    }

    pub fn fail_delete(&self, id: &str) {
        lock(&self.state).faults.delete.insert(id.to_string());
    }
}

#[async_trait]
impl StorageClient for SimulatedStorage {
    fn describe(&self) -> String {
        "simulated storage".to_string()
    }

    async fn connect(&mut self) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        state.calls.connect += 1;
        if state.faults.connect {
            return Err(StorageError::Other("simulated connection refused".into()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        state.calls.disconnect += 1;
        self.connected = false;
        if state.faults.disconnect {
            return Err(StorageError::Other("simulated disconnect failure".into()));
        }
        Ok(())
    }

    async fn upload(&mut self, path: &Path) -> Result<(), StorageError> {
        lock(&self.state).calls.upload += 1;
        self.ensure_connected()?;

        let size = tokio::fs::metadata(path).await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::NotFound(path.display().to_string()))?;

        let mut state = lock(&self.state);
        if state.faults.upload {
            return Err(StorageError::Other("simulated upload failure".into()));
        }
        let modified_at = state.upload_time.unwrap_or_else(Utc::now);
        state.files.insert(name, SimulatedFile { modified_at, size });
        Ok(())
    }

    fn as_listable(&mut self) -> Option<&mut dyn ListableStorage> {
        if lock(&self.state).listable {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl ListableStorage for SimulatedStorage {
    async fn find(&mut self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_connected()?;
        let mut state = lock(&self.state);
        state.calls.find += 1;
        if state.faults.find {
            return Err(StorageError::Other("simulated listing failure".into()));
        }
        Ok(state
            .files
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn size(&mut self, id: &str) -> Result<u64, StorageError> {
        let mut state = lock(&self.state);
        state.calls.size += 1;
        state
            .files
            .get(id)
            .map(|f| f.size)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn modified_at(&mut self, id: &str) -> Result<DateTime<Utc>, StorageError> {
        let mut state = lock(&self.state);
        state.calls.modified_at += 1;
        state
            .files
            .get(id)
            .map(|f| f.modified_at)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn delete(&mut self, id: &str) -> Result<(), StorageError> {
        self.ensure_connected()?;
        let mut state = lock(&self.state);
        state.calls.delete += 1;
        if state.faults.delete.contains(id) {
            return Err(StorageError::Other(format!("simulated: cannot delete {id}")));
        }
        state
            .files
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}
