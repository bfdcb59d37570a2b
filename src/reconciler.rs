//! The reconciliation loop.
//!
//! One pass per tick: re-read configuration when the reload interval has
//! elapsed, then per dataset create a due snapshot, release stale sync
//! holds, prune past-retention snapshots, and due-check every enabled
//! destination. Datasets are processed sequentially; the storage API is
//! the bottleneck, not this loop. A failure in one dataset never aborts
//! the others.

use crate::api::HealthState;
use crate::config::{Config, DatasetConfig, DatasetMode};
use crate::holds::survey_holds;
use crate::retention::snapshots_to_prune;
use crate::rpc::StorageApi;
use crate::schedule::due_granularities;
use crate::snapshots::{parse_snapshot_name, snapshot_name, SnapshotSurvey};
use crate::sync::SyncOrchestrator;
use crate::utils::errors::Result;
use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Reconciler {
    api: Arc<dyn StorageApi>,
    config: Config,
    config_path: PathBuf,
    orchestrator: SyncOrchestrator,
    health: Arc<HealthState>,
    last_reload: Instant,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn StorageApi>,
        config: Config,
        config_path: PathBuf,
        orchestrator: SyncOrchestrator,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            api,
            config,
            config_path,
            orchestrator,
            health,
            last_reload: Instant::now(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            tick_interval = self.config.server.tick_interval,
            datasets = self.config.datasets.len(),
            "Reconciliation loop started"
        );
        loop {
            let now_utc = chrono::Utc::now().naive_utc();
            let now_local = chrono::Local::now().naive_local();
            self.tick(now_utc, now_local).await;

            let sleep = Duration::from_secs(self.config.server.tick_interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconciliation loop stopped");
                    return;
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// One reconciliation pass. `now_utc` names snapshots; `now_local`
    /// drives schedule windows and sync intervals.
    pub async fn tick(&mut self, now_utc: NaiveDateTime, now_local: NaiveDateTime) {
        self.maybe_reload_config();

        // The tick works against an immutable snapshot of the dataset list;
        // a reload only takes effect on the next tick.
        let datasets = self.config.datasets.clone();
        let mut api_ok = true;
        for ds in datasets.iter().filter(|d| d.enabled) {
            if let Err(e) = self.process_dataset(ds, now_utc, now_local).await {
                if e.is_transient() {
                    api_ok = false;
                }
                error!(dataset = %ds.dataset, error = %e, "Dataset processing failed");
            }
        }

        if api_ok {
            self.health.record_success();
        } else {
            self.health.record_failure();
        }
    }

    fn maybe_reload_config(&mut self) {
        let reload_after = Duration::from_secs(self.config.server.config_reload_interval);
        if self.last_reload.elapsed() < reload_after {
            return;
        }
        self.last_reload = Instant::now();
        self.reload_config();
    }

    fn reload_config(&mut self) {
        match Config::from_file(&self.config_path) {
            Ok(new) => {
                if new.datasets.len() != self.config.datasets.len() {
                    info!(
                        datasets = new.datasets.len(),
                        "Configuration reloaded with changed dataset list"
                    );
                }
                self.config = new;
            }
            Err(e) => {
                warn!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Config reload failed, keeping previous configuration"
                );
            }
        }
    }

    async fn process_dataset(
        &self,
        ds: &DatasetConfig,
        now_utc: NaiveDateTime,
        now_local: NaiveDateTime,
    ) -> Result<()> {
        let mut names = self.api.list_snapshots(&ds.dataset).await?;
        let mut survey = SnapshotSurvey::from_names(&names);

        // Snapshot creation first: a snapshot created here is visible to
        // retention ordering and sync selection below.
        if ds.mode == DatasetMode::Active && self.config.schedule.window.is_active(now_local) {
            let due = due_granularities(
                now_utc,
                &survey,
                &self.config.retention,
                chrono::Duration::seconds(self.config.server.backup_interval as i64),
                self.config.schedule.independent_granularities,
            );
            for granularity in due {
                let name = snapshot_name(granularity, now_utc);
                self.api.create_snapshot(&ds.dataset, &name).await?;
                info!(dataset = %ds.dataset, granularity = %granularity, snapshot = %name,
                    "Created snapshot");
                if let Some((g, ts)) = parse_snapshot_name(&name) {
                    survey.record(g, ts, name.clone());
                }
                names.push(name);
            }
        }

        // Keep only the newest sync hold per destination host so older
        // snapshots become prunable again.
        let tracker = survey_holds(self.api.as_ref(), &ds.dataset, &names).await;
        for host in tracker.hosts() {
            for stale in tracker.stale_holds(host) {
                match self
                    .api
                    .release_hold(&ds.dataset, &stale.snapshot, &stale.tag)
                    .await
                {
                    Ok(()) => {
                        debug!(dataset = %ds.dataset, tag = %stale.tag, "Released stale hold")
                    }
                    Err(e) => {
                        warn!(dataset = %ds.dataset, tag = %stale.tag, error = %e,
                            "Failed to release stale hold")
                    }
                }
            }
        }

        // Retention pruning; held snapshots are deferred, not destroyed.
        let held = tracker.retained_snapshots();
        for snapshot in snapshots_to_prune(&survey, &self.config.retention, &held) {
            match self.api.destroy_snapshot(&ds.dataset, &snapshot).await {
                Ok(()) => info!(dataset = %ds.dataset, snapshot = %snapshot, "Pruned snapshot"),
                Err(e) => warn!(dataset = %ds.dataset, snapshot = %snapshot, error = %e,
                    "Failed to prune snapshot"),
            }
        }

        // Sync orchestration last, per enabled destination.
        if ds.mode == DatasetMode::Active
            && self.config.remote_sync.enabled
            && self.config.remote_sync.window.is_active(now_local)
        {
            for dest in ds.enabled_destinations() {
                let interval =
                    chrono::Duration::seconds(self.config.sync_interval_for(dest) as i64);
                if let Err(e) = self
                    .orchestrator
                    .check_destination(&ds.dataset, dest, &survey, &tracker, interval, now_local)
                    .await
                {
                    error!(dataset = %ds.dataset, host = %dest.remote_host, error = %e,
                        "Failed to start remote sync");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DestinationConfig, RemoteSyncConfig};
    use crate::holds::hold_tag;
    use crate::rpc::mock::MockApi;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn noon() -> (NaiveDateTime, NaiveDateTime) {
        // Wednesday, inside the default all-ones windows.
        let now = chrono::NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        (now, now)
    }

    fn dataset(path: &str, destinations: Vec<DestinationConfig>) -> DatasetConfig {
        DatasetConfig {
            dataset: path.to_string(),
            enabled: true,
            mode: DatasetMode::Active,
            destinations,
        }
    }

    fn destination(host: &str) -> DestinationConfig {
        DestinationConfig {
            remote_host: host.to_string(),
            remote_dataset: None,
            enabled: true,
            sync_interval: None,
        }
    }

    fn reconciler(api: Arc<MockApi>, config: Config) -> (Reconciler, Arc<HealthState>) {
        let health = Arc::new(HealthState::new(3));
        let orchestrator = SyncOrchestrator::new(
            api.clone(),
            Duration::from_millis(5),
            CancellationToken::new(),
        );
        let reconciler = Reconciler::new(
            api,
            config,
            PathBuf::from("/nonexistent/autobackup.toml"),
            orchestrator,
            health.clone(),
        );
        (reconciler, health)
    }

    #[tokio::test]
    async fn test_empty_dataset_gets_first_snapshot() {
        let api = Arc::new(MockApi::new().with_snapshots("tank/data", &[]));
        let config = Config {
            datasets: vec![dataset("tank/data", vec![])],
            ..Default::default()
        };
        let (mut reconciler, _) = reconciler(api.clone(), config);

        let (now_utc, now_local) = noon();
        reconciler.tick(now_utc, now_local).await;

        let state = api.state.lock().unwrap();
        assert_eq!(
            state.snapshots["tank/data"],
            vec!["frequent_backup_2025-01-15-12-00"]
        );
        assert!(state.destroyed.is_empty());
    }

    #[tokio::test]
    async fn test_created_snapshot_is_never_pruned_same_tick() {
        // Seven dailies at the keep limit plus coarser history; the day has
        // rolled over, so a new daily is created and only the oldest daily
        // may be destroyed.
        let mut names = vec![
            "yearly_backup_2025-01-01-00-00".to_string(),
            "monthly_backup_2025-01-01-00-05".to_string(),
            "weekly_backup_2025-01-13-00-05".to_string(),
        ];
        names.extend((8..=14).map(|d| format!("daily_backup_2025-01-{d:02}-00-00")));
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let api = Arc::new(MockApi::new().with_snapshots("tank/data", &refs));
        let config = Config {
            datasets: vec![dataset("tank/data", vec![])],
            ..Default::default()
        };
        let (mut reconciler, _) = reconciler(api.clone(), config);

        let (now_utc, now_local) = noon();
        reconciler.tick(now_utc, now_local).await;

        let state = api.state.lock().unwrap();
        let created = "daily_backup_2025-01-15-12-00";
        assert!(state.snapshots["tank/data"].iter().any(|n| n == created));
        // Eight dailies now exist; only the oldest one is pruned.
        assert_eq!(state.destroyed.len(), 1);
        assert_eq!(state.destroyed[0].1, "daily_backup_2025-01-08-00-00");
    }

    #[tokio::test]
    async fn test_window_inactive_still_prunes() {
        let names: Vec<String> = (5..=14)
            .map(|d| format!("daily_backup_2025-01-{d:02}-00-00"))
            .collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let api = Arc::new(MockApi::new().with_snapshots("tank/data", &refs));
        let mut config = Config {
            datasets: vec![dataset("tank/data", vec![])],
            ..Default::default()
        };
        config.schedule.window.days = "0000000".to_string();
        let (mut reconciler, _) = reconciler(api.clone(), config);

        let (now_utc, now_local) = noon();
        reconciler.tick(now_utc, now_local).await;

        let state = api.state.lock().unwrap();
        // Nothing created outside the window...
        assert_eq!(state.snapshots["tank/data"].len(), 7);
        // ...but the three oldest dailies are gone.
        assert_eq!(state.destroyed.len(), 3);
        assert_eq!(state.destroyed[0].1, "daily_backup_2025-01-05-00-00");
    }

    #[tokio::test]
    async fn test_passive_dataset_prunes_but_never_creates_or_syncs() {
        let names: Vec<String> = (5..=14)
            .map(|d| format!("daily_backup_2025-01-{d:02}-00-00"))
            .collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let api = Arc::new(MockApi::new().with_snapshots("tank/archive", &refs));
        let mut ds = dataset("tank/archive", vec![destination("backupsrv")]);
        ds.mode = DatasetMode::Passive;
        let config = Config {
            remote_sync: RemoteSyncConfig {
                enabled: true,
                ..Default::default()
            },
            datasets: vec![ds],
            ..Default::default()
        };
        let (mut reconciler, _) = reconciler(api.clone(), config);

        let (now_utc, now_local) = noon();
        reconciler.tick(now_utc, now_local).await;

        let state = api.state.lock().unwrap();
        assert_eq!(state.snapshots["tank/archive"].len(), 7);
        assert_eq!(state.destroyed.len(), 3);
        assert!(state.started.is_empty());
    }

    #[tokio::test]
    async fn test_stale_holds_released_on_tick() {
        let api = Arc::new(MockApi::new().with_snapshots(
            "tank/data",
            &["daily_backup_2025-01-14-00-00", "daily_backup_2025-01-15-00-00"],
        ));
        let (now_utc, now_local) = noon();
        let old = hold_tag("backupsrv", now_local - chrono::Duration::days(2));
        let new = hold_tag("backupsrv", now_local - chrono::Duration::days(1));
        api.add_hold("tank/data", "daily_backup_2025-01-14-00-00", &old);
        api.add_hold("tank/data", "daily_backup_2025-01-15-00-00", &new);

        let config = Config {
            datasets: vec![dataset("tank/data", vec![])],
            ..Default::default()
        };
        let (mut reconciler, _) = reconciler(api.clone(), config);
        reconciler.tick(now_utc, now_local).await;

        let state = api.state.lock().unwrap();
        assert_eq!(state.released.len(), 1);
        assert_eq!(state.released[0].2, old);
    }

    #[tokio::test]
    async fn test_dataset_failure_does_not_abort_others() {
        let api = Arc::new(
            MockApi::new()
                .with_snapshots("tank/broken", &[])
                .with_snapshots("tank/ok", &[]),
        );
        api.state
            .lock()
            .unwrap()
            .fail_list_snapshots
            .insert("tank/broken".to_string());

        let config = Config {
            datasets: vec![dataset("tank/broken", vec![]), dataset("tank/ok", vec![])],
            ..Default::default()
        };
        let (mut reconciler, health) = reconciler(api.clone(), config);

        let (now_utc, now_local) = noon();
        reconciler.tick(now_utc, now_local).await;

        // The healthy dataset still got its snapshot.
        let state = api.state.lock().unwrap();
        assert_eq!(state.snapshots["tank/ok"].len(), 1);
        drop(state);
        // And the failure was recorded for the health surface.
        assert_eq!(health.consecutive_failures(), 1);
        assert!(health.is_healthy());
    }

    #[tokio::test]
    async fn test_sync_started_for_never_synced_destination() {
        let api = Arc::new(
            MockApi::new().with_snapshots("tank/data", &["daily_backup_2025-01-15-00-00"]),
        );
        let config = Config {
            remote_sync: RemoteSyncConfig {
                enabled: true,
                ..Default::default()
            },
            datasets: vec![dataset("tank/data", vec![destination("backupsrv")])],
            ..Default::default()
        };
        let (mut reconciler, _) = reconciler(api.clone(), config);

        let (now_utc, now_local) = noon();
        reconciler.tick(now_utc, now_local).await;

        let state = api.state.lock().unwrap();
        assert_eq!(state.started.len(), 1);
        assert_eq!(state.started[0].remote_host, "backupsrv");
    }

    #[tokio::test]
    async fn test_invalid_config_reload_keeps_previous() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[[datasets]]\ndataset = \"tank/data\"").unwrap();
        file.flush().unwrap();

        let api = Arc::new(MockApi::new().with_snapshots("tank/data", &[]));
        let config = Config::from_file(file.path()).unwrap();
        let health = Arc::new(HealthState::new(3));
        let orchestrator = SyncOrchestrator::new(
            api.clone(),
            Duration::from_millis(5),
            CancellationToken::new(),
        );
        let mut reconciler = Reconciler::new(
            api,
            config,
            file.path().to_path_buf(),
            orchestrator,
            health,
        );

        // Valid rewrite swaps the dataset list wholesale.
        std::fs::write(
            file.path(),
            "[[datasets]]\ndataset = \"tank/data\"\n[[datasets]]\ndataset = \"tank/more\"\n",
        )
        .unwrap();
        reconciler.reload_config();
        assert_eq!(reconciler.config.datasets.len(), 2);

        // Garbage leaves the last-known-good list in force.
        std::fs::write(file.path(), "this is not toml [").unwrap();
        reconciler.reload_config();
        assert_eq!(reconciler.config.datasets.len(), 2);
        assert_eq!(reconciler.config.datasets[1].dataset, "tank/more");
    }
}
