//! Retention policy and pruning planner.
//!
//! Decides which backup snapshots to destroy once a granularity group grows
//! past its keep-count. Held snapshots are never pruned; the hold must be
//! released first, and until then the next-oldest unheld snapshot is pruned
//! in its place.

use crate::snapshots::{Granularity, SnapshotSurvey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Keep-counts per granularity. Global across all datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_frequent")]
    pub frequent: usize,
    #[serde(default = "default_hourly")]
    pub hourly: usize,
    #[serde(default = "default_daily")]
    pub daily: usize,
    #[serde(default = "default_weekly")]
    pub weekly: usize,
    #[serde(default = "default_monthly")]
    pub monthly: usize,
    #[serde(default = "default_yearly")]
    pub yearly: usize,
}

fn default_frequent() -> usize {
    4
}

fn default_hourly() -> usize {
    12
}

fn default_daily() -> usize {
    7
}

fn default_weekly() -> usize {
    4
}

fn default_monthly() -> usize {
    6
}

fn default_yearly() -> usize {
    3
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            frequent: default_frequent(),
            hourly: default_hourly(),
            daily: default_daily(),
            weekly: default_weekly(),
            monthly: default_monthly(),
            yearly: default_yearly(),
        }
    }
}

impl RetentionPolicy {
    pub fn keep_for(&self, granularity: Granularity) -> usize {
        match granularity {
            Granularity::Frequent => self.frequent,
            Granularity::Hourly => self.hourly,
            Granularity::Daily => self.daily,
            Granularity::Weekly => self.weekly,
            Granularity::Monthly => self.monthly,
            Granularity::Yearly => self.yearly,
        }
    }
}

/// Select snapshots to destroy: per granularity group, the oldest
/// `len - keep` unheld snapshots. A keep-count of 0 prunes the whole group;
/// such snapshots are no longer created, so any found are leftovers from an
/// earlier policy.
pub fn snapshots_to_prune(
    survey: &SnapshotSurvey,
    policy: &RetentionPolicy,
    held: &HashSet<String>,
) -> Vec<String> {
    let mut prune = Vec::new();
    for granularity in Granularity::COARSEST_FIRST {
        let group = survey.group(granularity);
        let keep = policy.keep_for(granularity);
        if group.len() <= keep {
            continue;
        }
        let mut excess = group.len() - keep;
        for (_, name) in group {
            if excess == 0 {
                break;
            }
            if held.contains(name) {
                continue;
            }
            prune.push(name.clone());
            excess -= 1;
        }
    }
    prune
}
