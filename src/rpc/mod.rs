//! Storage API abstraction.
//!
//! Every low-level storage operation (snapshot create/list/destroy, hold
//! place/list/release, asynchronous replication jobs) goes through the
//! [`StorageApi`] trait. Production uses the JSON-RPC client in
//! [`client`]; tests substitute an in-memory implementation.

pub mod client;
#[cfg(test)]
pub(crate) mod mock;

pub use client::RpcClient;

use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// Lifecycle state of a replication job as reported by the storage API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Completed | MigrationState::Failed)
    }
}

/// Poll result for a replication job.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationStatus {
    pub status: MigrationState,
    #[serde(default)]
    pub error: Option<String>,
}

/// Capabilities the scheduling core requires from the storage service.
#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()>;

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>>;

    async fn destroy_snapshot(&self, dataset: &str, snapshot: &str) -> Result<()>;

    async fn list_holds(&self, dataset: &str, snapshot: &str) -> Result<Vec<String>>;

    async fn place_hold(&self, dataset: &str, snapshot: &str, tag: &str) -> Result<()>;

    async fn release_hold(&self, dataset: &str, snapshot: &str, tag: &str) -> Result<()>;

    /// Start an asynchronous replication of `dataset@snapshot` to
    /// `remote_host:remote_dataset`. Returns the job id to poll.
    async fn start_migration(
        &self,
        dataset: &str,
        snapshot: &str,
        remote_host: &str,
        remote_dataset: &str,
    ) -> Result<String>;

    async fn poll_migration(&self, task_id: &str) -> Result<MigrationStatus>;

    /// Cheap reachability probe, used at startup and never retried
    /// internally.
    async fn health_check(&self) -> bool;
}
