//! Sync orchestration for (dataset, destination) pairs.
//!
//! Per pair the lifecycle is Idle -> Checking -> Syncing -> Idle; a failed
//! replication logs, counts, and returns to Idle to be retried at the next
//! due window. An entry in the in-flight table means Syncing: the table is
//! written by the tick that starts a job and by the job's poller when it
//! finishes, and is the only state shared between them. Everything else is
//! re-derived from holds, so a restart loses nothing but the polling of
//! jobs that keep running remotely.

use crate::config::DestinationConfig;
use crate::holds::{hold_tag, survey_holds, HoldTracker};
use crate::rpc::{MigrationState, StorageApi};
use crate::snapshots::SnapshotSurvey;
use crate::utils::errors::{BackupError, Result};
use chrono::NaiveDateTime;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identity of one replication relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub dataset: String,
    pub host: String,
}

#[derive(Debug, Clone)]
struct InFlightSync {
    task_id: String,
    snapshot: String,
    remote_dataset: String,
}

pub struct SyncOrchestrator {
    api: Arc<dyn StorageApi>,
    in_flight: Arc<DashMap<SyncKey, InFlightSync>>,
    failures: Arc<AtomicU64>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(api: Arc<dyn StorageApi>, poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            api,
            in_flight: Arc::new(DashMap::new()),
            failures: Arc::new(AtomicU64::new(0)),
            poll_interval,
            cancel,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_syncing(&self, dataset: &str, host: &str) -> bool {
        self.in_flight.contains_key(&SyncKey {
            dataset: dataset.to_string(),
            host: host.to_string(),
        })
    }

    /// Total replication failures since startup.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Due-check one destination and start a replication job when the sync
    /// interval has elapsed since the last hold-recorded sync. A pair with
    /// a tracked in-flight job is left alone; other pairs are unaffected.
    /// The caller has already checked the remote-sync window.
    pub async fn check_destination(
        &self,
        dataset: &str,
        dest: &DestinationConfig,
        survey: &SnapshotSurvey,
        tracker: &HoldTracker,
        sync_interval: chrono::Duration,
        now: NaiveDateTime,
    ) -> Result<()> {
        let key = SyncKey {
            dataset: dataset.to_string(),
            host: dest.remote_host.clone(),
        };
        if self.in_flight.contains_key(&key) {
            debug!(dataset = %dataset, host = %key.host, "Sync already in flight, skipping");
            return Ok(());
        }

        let due = match tracker.latest_sync(&key.host) {
            None => true,
            Some(hold) => now.signed_duration_since(hold.timestamp) >= sync_interval,
        };
        if !due {
            return Ok(());
        }

        let Some((_, snapshot)) = survey.latest() else {
            warn!(dataset = %dataset, host = %key.host, "Sync due but no backup snapshot exists yet");
            return Ok(());
        };

        let remote_dataset = dest.target_dataset(dataset).to_string();
        let task_id = self
            .api
            .start_migration(dataset, snapshot, &key.host, &remote_dataset)
            .await
            .map_err(|e| BackupError::Replication {
                host: key.host.clone(),
                detail: e.to_string(),
            })?;
        info!(
            dataset = %dataset,
            host = %key.host,
            snapshot = %snapshot,
            task_id = %task_id,
            "Started remote sync"
        );

        let job = InFlightSync {
            task_id,
            snapshot: snapshot.to_string(),
            remote_dataset,
        };
        self.in_flight.insert(key.clone(), job.clone());
        self.spawn_poller(key, job);
        Ok(())
    }

    fn spawn_poller(&self, key: SyncKey, job: InFlightSync) {
        let api = self.api.clone();
        let in_flight = self.in_flight.clone();
        let failures = self.failures.clone();
        let poll_interval = self.poll_interval;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            poll_to_completion(api, &key, &job, poll_interval, cancel, &failures).await;
            // Removed only after the hold is in place, so a tick that runs
            // between job completion and hold placement still sees the pair
            // as Syncing.
            in_flight.remove(&key);
        });
    }
}

/// Poll one replication job until it reaches a terminal state, then record
/// the outcome. Shutdown stops polling and leaves the job running remotely;
/// holds reconcile it on next startup.
async fn poll_to_completion(
    api: Arc<dyn StorageApi>,
    key: &SyncKey,
    job: &InFlightSync,
    poll_interval: Duration,
    cancel: CancellationToken,
    failures: &AtomicU64,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(
                    dataset = %key.dataset,
                    host = %key.host,
                    task_id = %job.task_id,
                    "Shutdown: leaving replication job to the storage service"
                );
                return;
            }
            _ = interval.tick() => {}
        }

        let status = match api.poll_migration(&job.task_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(task_id = %job.task_id, error = %e, "Migration poll failed, will retry");
                continue;
            }
        };

        match status.status {
            MigrationState::Pending | MigrationState::Running => continue,
            MigrationState::Completed => {
                finalize_success(api.as_ref(), key, job).await;
                return;
            }
            MigrationState::Failed => {
                failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    dataset = %key.dataset,
                    host = %key.host,
                    snapshot = %job.snapshot,
                    detail = %status.error.as_deref().unwrap_or("no detail"),
                    "Remote sync failed"
                );
                return;
            }
        }
    }
}

/// Record a successful sync: place the hold that is the durable evidence of
/// it, then release every older hold for the destination so earlier
/// snapshots become prunable again.
async fn finalize_success(api: &dyn StorageApi, key: &SyncKey, job: &InFlightSync) {
    let tag = hold_tag(&key.host, chrono::Local::now().naive_local());
    if let Err(e) = api.place_hold(&key.dataset, &job.snapshot, &tag).await {
        // Without the hold the next due cycle re-syncs; noisy but safe.
        warn!(
            dataset = %key.dataset,
            host = %key.host,
            snapshot = %job.snapshot,
            error = %e,
            "Sync completed but placing hold failed"
        );
        return;
    }

    match api.list_snapshots(&key.dataset).await {
        Ok(names) => {
            let tracker = survey_holds(api, &key.dataset, &names).await;
            for stale in tracker.stale_holds(&key.host) {
                if let Err(e) = api
                    .release_hold(&key.dataset, &stale.snapshot, &stale.tag)
                    .await
                {
                    warn!(
                        dataset = %key.dataset,
                        snapshot = %stale.snapshot,
                        tag = %stale.tag,
                        error = %e,
                        "Failed to release stale hold"
                    );
                }
            }
        }
        Err(e) => {
            warn!(dataset = %key.dataset, error = %e, "Could not list snapshots for hold cleanup");
        }
    }

    info!(
        dataset = %key.dataset,
        host = %key.host,
        snapshot = %job.snapshot,
        remote_dataset = %job.remote_dataset,
        "Remote sync successful"
    );
}
