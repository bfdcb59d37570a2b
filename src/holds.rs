//! Sync-hold grammar and per-destination hold tracking.
//!
//! A hold tagged `sync_<YYYY-MM-DD-HH-MM-SS>_<hostname>` records that the
//! snapshot it sits on was replicated to that host at that (local) time.
//! The newest hold per host is the last successful sync; everything older
//! is stale and only blocks retention. Hold tags from other tools are
//! ignored for sync tracking but still protect their snapshot from pruning.

use crate::rpc::StorageApi;
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Timestamp format embedded in hold tags (local time, second precision).
pub const HOLD_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Minute-precision variant written by earlier deployments; accepted on
/// parse, never produced.
const HOLD_TIME_FORMAT_SHORT: &str = "%Y-%m-%d-%H-%M";

const SYNC_PREFIX: &str = "sync_";

/// One parsed sync hold: which snapshot it protects, the raw tag, and the
/// destination/time it encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHold {
    pub snapshot: String,
    pub tag: String,
    pub host: String,
    pub timestamp: NaiveDateTime,
}

/// Build the hold tag for a sync to `host` completed at `now` (local time).
pub fn hold_tag(host: &str, now: NaiveDateTime) -> String {
    format!("sync_{}_{}", now.format(HOLD_TIME_FORMAT), host)
}

/// Parse a sync hold tag into (timestamp, host). Returns `None` when the tag
/// does not follow the sync grammar.
pub fn parse_hold_tag(tag: &str) -> Option<(NaiveDateTime, String)> {
    let mut parts = tag.splitn(3, '_');
    if parts.next()? != "sync" {
        return None;
    }
    let timestr = parts.next()?;
    let host = parts.next()?;
    if host.is_empty() {
        return None;
    }
    let timestamp = NaiveDateTime::parse_from_str(timestr, HOLD_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(timestr, HOLD_TIME_FORMAT_SHORT))
        .ok()?;
    Some((timestamp, host.to_string()))
}

/// Holds of one dataset, indexed by destination host. Rebuilt from the
/// storage API every time it is needed; never cached across ticks.
#[derive(Debug, Default)]
pub struct HoldTracker {
    by_host: HashMap<String, Vec<SyncHold>>,
    foreign_held: HashSet<String>,
}

impl HoldTracker {
    /// Build a tracker from a `snapshot -> hold tags` listing. Malformed
    /// sync tags are skipped with a warning; non-sync tags only mark their
    /// snapshot as held.
    pub fn from_listing(listing: &HashMap<String, Vec<String>>) -> Self {
        let mut tracker = Self::default();
        for (snapshot, tags) in listing {
            for tag in tags {
                match parse_hold_tag(tag) {
                    Some((timestamp, host)) => {
                        tracker.by_host.entry(host.clone()).or_default().push(SyncHold {
                            snapshot: snapshot.clone(),
                            tag: tag.clone(),
                            host,
                            timestamp,
                        });
                    }
                    None if tag.starts_with(SYNC_PREFIX) => {
                        warn!(snapshot = %snapshot, tag = %tag, "Skipping malformed sync hold");
                    }
                    None => {
                        tracker.foreign_held.insert(snapshot.clone());
                    }
                }
            }
        }
        // Order by embedded timestamp; the API does not guarantee listing
        // order. Ties break on snapshot name for determinism.
        for holds in tracker.by_host.values_mut() {
            holds.sort_by(|a, b| (a.timestamp, &a.snapshot).cmp(&(b.timestamp, &b.snapshot)));
        }
        tracker
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.by_host.keys().map(String::as_str)
    }

    /// Most recent successful sync to `host`, by embedded timestamp.
    pub fn latest_sync(&self, host: &str) -> Option<&SyncHold> {
        self.by_host.get(host).and_then(|holds| holds.last())
    }

    /// Everything but the most recent hold for `host`: released so older
    /// snapshots become eligible for retention cleanup.
    pub fn stale_holds(&self, host: &str) -> &[SyncHold] {
        match self.by_host.get(host) {
            Some(holds) if holds.len() > 1 => &holds[..holds.len() - 1],
            _ => &[],
        }
    }

    /// Snapshots that must survive pruning: the newest sync hold per host
    /// plus anything held by a foreign tag. Stale sync holds are not
    /// counted; they are released before retention runs.
    pub fn retained_snapshots(&self) -> HashSet<String> {
        let mut retained = self.foreign_held.clone();
        for holds in self.by_host.values() {
            if let Some(hold) = holds.last() {
                retained.insert(hold.snapshot.clone());
            }
        }
        retained
    }
}

/// Collect hold tags for every snapshot of a dataset. A listing failure on
/// one snapshot skips that snapshot; it never fails the dataset.
pub async fn survey_holds(api: &dyn StorageApi, dataset: &str, snapshots: &[String]) -> HoldTracker {
    let mut listing = HashMap::new();
    for snapshot in snapshots {
        match api.list_holds(dataset, snapshot).await {
            Ok(tags) if !tags.is_empty() => {
                listing.insert(snapshot.clone(), tags);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(dataset = %dataset, snapshot = %snapshot, error = %e,
                    "Failed to list holds, skipping snapshot");
            }
        }
    }
    HoldTracker::from_listing(&listing)
}
