//! In-memory storage API for orchestrator and reconciler tests.

use super::{MigrationState, MigrationStatus, StorageApi};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StartedMigration {
    pub task_id: String,
    pub dataset: String,
    pub snapshot: String,
    pub remote_host: String,
    pub remote_dataset: String,
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub snapshots: BTreeMap<String, Vec<String>>,
    pub holds: BTreeMap<(String, String), Vec<String>>,
    /// Scripted poll results per task id; the last entry repeats. Tasks
    /// without a script complete immediately.
    pub poll_scripts: BTreeMap<String, VecDeque<MigrationStatus>>,
    pub started: Vec<StartedMigration>,
    pub destroyed: Vec<(String, String)>,
    pub placed: Vec<(String, String, String)>,
    pub released: Vec<(String, String, String)>,
    pub fail_list_snapshots: BTreeSet<String>,
    pub fail_start_migration: bool,
    next_task: u32,
}

#[derive(Debug, Default)]
pub(crate) struct MockApi {
    pub state: Mutex<MockState>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshots(self, dataset: &str, names: &[&str]) -> Self {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .insert(dataset.to_string(), names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn add_hold(&self, dataset: &str, snapshot: &str, tag: &str) {
        self.state
            .lock()
            .unwrap()
            .holds
            .entry((dataset.to_string(), snapshot.to_string()))
            .or_default()
            .push(tag.to_string());
    }

    pub fn script_poll(&self, task_id: &str, statuses: Vec<MigrationStatus>) {
        self.state
            .lock()
            .unwrap()
            .poll_scripts
            .insert(task_id.to_string(), statuses.into());
    }
}

#[async_trait]
impl StorageApi for MockApi {
    async fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .entry(dataset.to_string())
            .or_default()
            .push(name.to_string());
        Ok(())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_list_snapshots.contains(dataset) {
            return Err(BackupError::Api(format!("{dataset}: connection refused")));
        }
        Ok(state.snapshots.get(dataset).cloned().unwrap_or_default())
    }

    async fn destroy_snapshot(&self, dataset: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(names) = state.snapshots.get_mut(dataset) {
            names.retain(|n| n != snapshot);
        }
        state
            .holds
            .remove(&(dataset.to_string(), snapshot.to_string()));
        state
            .destroyed
            .push((dataset.to_string(), snapshot.to_string()));
        Ok(())
    }

    async fn list_holds(&self, dataset: &str, snapshot: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .holds
            .get(&(dataset.to_string(), snapshot.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn place_hold(&self, dataset: &str, snapshot: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .holds
            .entry((dataset.to_string(), snapshot.to_string()))
            .or_default()
            .push(tag.to_string());
        state
            .placed
            .push((dataset.to_string(), snapshot.to_string(), tag.to_string()));
        Ok(())
    }

    async fn release_hold(&self, dataset: &str, snapshot: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(tags) = state
            .holds
            .get_mut(&(dataset.to_string(), snapshot.to_string()))
        {
            tags.retain(|t| t != tag);
        }
        state
            .released
            .push((dataset.to_string(), snapshot.to_string(), tag.to_string()));
        Ok(())
    }

    async fn start_migration(
        &self,
        dataset: &str,
        snapshot: &str,
        remote_host: &str,
        remote_dataset: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start_migration {
            return Err(BackupError::Api("migration_create: service busy".to_string()));
        }
        state.next_task += 1;
        let task_id = format!("task-{}", state.next_task);
        state.started.push(StartedMigration {
            task_id: task_id.clone(),
            dataset: dataset.to_string(),
            snapshot: snapshot.to_string(),
            remote_host: remote_host.to_string(),
            remote_dataset: remote_dataset.to_string(),
        });
        Ok(task_id)
    }

    async fn poll_migration(&self, task_id: &str) -> Result<MigrationStatus> {
        let mut state = self.state.lock().unwrap();
        match state.poll_scripts.get_mut(task_id) {
            Some(script) if script.len() > 1 => Ok(script.pop_front().unwrap()),
            Some(script) => Ok(script
                .front()
                .cloned()
                .unwrap_or(MigrationStatus {
                    status: MigrationState::Completed,
                    error: None,
                })),
            None => Ok(MigrationStatus {
                status: MigrationState::Completed,
                error: None,
            }),
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}
