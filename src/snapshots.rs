//! Snapshot name grammar and the per-dataset snapshot survey.
//!
//! A backup snapshot is named `<granularity>_backup_<YYYY-MM-DD-HH-MM>` with
//! the timestamp in UTC. The name is the durable record: granularity and
//! creation time are recovered from it alone, so the survey can be rebuilt
//! from a bare `snapshot_list` call after any restart.

use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Timestamp format embedded in snapshot names (UTC, minute precision).
pub const SNAPSHOT_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M";

const BACKUP_MARKER: &str = "backup";

/// Snapshot cadence class, ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Frequent,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Granularity {
    /// All granularities, coarsest first. Due evaluation walks this order so
    /// a yearly snapshot satisfies every finer cadence for the same instant.
    pub const COARSEST_FIRST: [Granularity; 6] = [
        Granularity::Yearly,
        Granularity::Monthly,
        Granularity::Weekly,
        Granularity::Daily,
        Granularity::Hourly,
        Granularity::Frequent,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Granularity::Frequent => "frequent",
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
            Granularity::Yearly => "yearly",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "frequent" => Some(Granularity::Frequent),
            "hourly" => Some(Granularity::Hourly),
            "daily" => Some(Granularity::Daily),
            "weekly" => Some(Granularity::Weekly),
            "monthly" => Some(Granularity::Monthly),
            "yearly" => Some(Granularity::Yearly),
            _ => None,
        }
    }

    /// A coarser (or equal) granularity counts as an occurrence of a finer
    /// one when deriving "last snapshot of granularity G".
    pub fn subsumes(&self, other: Granularity) -> bool {
        *self >= other
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Build a snapshot name for `granularity` at `now` (UTC).
pub fn snapshot_name(granularity: Granularity, now: NaiveDateTime) -> String {
    format!(
        "{}_{}_{}",
        granularity.tag(),
        BACKUP_MARKER,
        now.format(SNAPSHOT_TIME_FORMAT)
    )
}

/// Parse a snapshot name back into its granularity and embedded timestamp.
/// Returns `None` for snapshots that are not ours (manual snapshots, other
/// tools' naming schemes).
pub fn parse_snapshot_name(name: &str) -> Option<(Granularity, NaiveDateTime)> {
    let mut parts = name.splitn(3, '_');
    let granularity = Granularity::from_tag(parts.next()?)?;
    if parts.next()? != BACKUP_MARKER {
        return None;
    }
    let timestamp = NaiveDateTime::parse_from_str(parts.next()?, SNAPSHOT_TIME_FORMAT).ok()?;
    Some((granularity, timestamp))
}

/// All backup snapshots of one dataset, grouped by granularity and sorted by
/// embedded timestamp. Rebuilt from the storage API listing every tick.
#[derive(Debug, Default)]
pub struct SnapshotSurvey {
    by_granularity: HashMap<Granularity, Vec<(NaiveDateTime, String)>>,
}

impl SnapshotSurvey {
    /// Build a survey from a raw snapshot listing. Names that do not follow
    /// the backup grammar are ignored.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut survey = Self::default();
        for name in names {
            let name = name.as_ref();
            if let Some((granularity, timestamp)) = parse_snapshot_name(name) {
                survey.record(granularity, timestamp, name.to_string());
            }
        }
        survey
    }

    /// Add one snapshot, keeping the group ordered. Used for snapshots
    /// created mid-tick so retention and sync selection see them without a
    /// second listing.
    pub fn record(&mut self, granularity: Granularity, timestamp: NaiveDateTime, name: String) {
        let group = self.by_granularity.entry(granularity).or_default();
        group.push((timestamp, name));
        group.sort();
    }

    pub fn is_empty(&self) -> bool {
        self.by_granularity.values().all(|g| g.is_empty())
    }

    /// Snapshots of one granularity, oldest first.
    pub fn group(&self, granularity: Granularity) -> &[(NaiveDateTime, String)] {
        self.by_granularity
            .get(&granularity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Timestamp of the most recent snapshot tagged with `granularity` or
    /// any coarser one. For `Frequent` this is the most recent backup
    /// snapshot of any kind.
    pub fn last_subsuming(&self, granularity: Granularity) -> Option<NaiveDateTime> {
        self.by_granularity
            .iter()
            .filter(|(g, _)| g.subsumes(granularity))
            .filter_map(|(_, group)| group.last())
            .map(|(ts, _)| *ts)
            .max()
    }

    /// The most recent backup snapshot overall, by embedded timestamp. This
    /// is the one offered for replication.
    pub fn latest(&self) -> Option<(&NaiveDateTime, &str)> {
        self.by_granularity
            .values()
            .filter_map(|group| group.last())
            .max_by_key(|(ts, _)| *ts)
            .map(|(ts, name)| (ts, name.as_str()))
    }
}
