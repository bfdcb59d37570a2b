//! Clock and schedule evaluation.
//!
//! Pure functions: given the current time, the day/hour bitmask window and
//! the snapshot survey, decide which granularities are due. The caller owns
//! the clock; nothing here reads it.
//!
//! Due checks for `hourly` and coarser compare calendar fields, not elapsed
//! time: a new yearly snapshot is due when the year rolls over, however long
//! ago the last one was taken. Only `frequent` is interval-based.

use crate::retention::RetentionPolicy;
use crate::snapshots::{Granularity, SnapshotSurvey};
use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Day-of-week and hour-of-day bitmasks. `days` is 7 characters, Monday
/// first; `hours` is 24 characters, midnight first. A `1` marks the window
/// as active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default = "default_days")]
    pub days: String,
    #[serde(default = "default_hours")]
    pub hours: String,
}

fn default_days() -> String {
    "1111111".to_string()
}

fn default_hours() -> String {
    "111111111111111111111111".to_string()
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            days: default_days(),
            hours: default_hours(),
        }
    }
}

impl Schedule {
    pub fn validate(&self) -> Result<(), String> {
        if self.days.len() != 7 || !self.days.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(format!(
                "schedule days must be 7 characters of 0/1, got {:?}",
                self.days
            ));
        }
        if self.hours.len() != 24 || !self.hours.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(format!(
                "schedule hours must be 24 characters of 0/1, got {:?}",
                self.hours
            ));
        }
        Ok(())
    }

    /// Whether the window is active at `now`. Outside the window nothing is
    /// due regardless of elapsed time.
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        let day = now.weekday().num_days_from_monday() as usize;
        let hour = now.hour() as usize;
        self.days.as_bytes().get(day) == Some(&b'1')
            && self.hours.as_bytes().get(hour) == Some(&b'1')
    }
}

/// Calendar-field comparison for one granularity. Fields are composite
/// (year+month, full date, date+hour) so a disabled coarser granularity
/// cannot mask a rollover.
fn calendar_due(
    granularity: Granularity,
    now: NaiveDateTime,
    last: NaiveDateTime,
    backup_interval: Duration,
) -> bool {
    match granularity {
        Granularity::Yearly => now.year() != last.year(),
        Granularity::Monthly => (now.year(), now.month()) != (last.year(), last.month()),
        Granularity::Weekly => now.iso_week() != last.iso_week(),
        Granularity::Daily => now.date() != last.date(),
        Granularity::Hourly => now.date() != last.date() || now.hour() != last.hour(),
        Granularity::Frequent => now.signed_duration_since(last) >= backup_interval,
    }
}

/// Which granularities should get a snapshot at `now`.
///
/// Granularities with a zero keep-count are never created. With
/// `independent` false (default), evaluation walks coarsest to finest and
/// stops at the first due granularity: at midnight on Jan 1 only a `yearly`
/// snapshot is created even though every finer cadence rolled over too.
/// With `independent` true each granularity is judged against its own
/// subsumption-derived last timestamp and several may be returned.
///
/// The first snapshot of an empty dataset gets the finest enabled
/// granularity.
pub fn due_granularities(
    now: NaiveDateTime,
    survey: &SnapshotSurvey,
    policy: &RetentionPolicy,
    backup_interval: Duration,
    independent: bool,
) -> Vec<Granularity> {
    if survey.is_empty() {
        return Granularity::COARSEST_FIRST
            .into_iter()
            .rev()
            .find(|g| policy.keep_for(*g) > 0)
            .into_iter()
            .collect();
    }

    let mut due = Vec::new();
    for granularity in Granularity::COARSEST_FIRST {
        if policy.keep_for(granularity) == 0 {
            continue;
        }
        let is_due = match survey.last_subsuming(granularity) {
            None => true,
            Some(last) => calendar_due(granularity, now, last, backup_interval),
        };
        if is_due {
            due.push(granularity);
            if !independent {
                break;
            }
        }
    }
    due
}
