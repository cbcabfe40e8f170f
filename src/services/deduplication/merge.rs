//! Merge policy for near-duplicate events.

use crate::models::{EventCandidate, StoredEvent};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// How a candidate relates to a stored event filed under a similar title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeResolution {
    /// The two events happen at different times.
    UnmergableDate,
    /// The two events happen at different places.
    UnmergableLocation,
    /// Same event; the candidate is fresher and replaces the stored fields.
    SupersedeExisting,
    /// Same event; the stored one is at least as fresh.
    DiscardCandidate,
}

impl MergeResolution {
    /// Returns true for the two outcomes that end neighbor resolution.
    #[must_use]
    pub const fn is_decisive(self) -> bool {
        matches!(self, Self::SupersedeExisting | Self::DiscardCandidate)
    }

    /// Returns the resolution as a log/metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnmergableDate => "unmergable_date",
            Self::UnmergableLocation => "unmergable_location",
            Self::SupersedeExisting => "supersede_existing",
            Self::DiscardCandidate => "discard_candidate",
        }
    }
}

/// Compares a candidate against a stored event.
///
/// Checks run in order: date, then location, then receipt time. Ties on
/// receipt time keep the stored event.
#[must_use]
pub fn resolve(candidate: &EventCandidate, existing: &StoredEvent) -> MergeResolution {
    if !dates_compatible(candidate.date_time, existing.date_time) {
        return MergeResolution::UnmergableDate;
    }
    if !locations_compatible(&candidate.location, &existing.location) {
        return MergeResolution::UnmergableLocation;
    }
    if candidate.source_received_at <= existing.source_received_at {
        MergeResolution::DiscardCandidate
    } else {
        MergeResolution::SupersedeExisting
    }
}

/// Start times are compatible if equal, or if one is all-day and both fall
/// on the same UTC day.
#[must_use]
pub fn dates_compatible(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a == b || ((is_all_day(a) || is_all_day(b)) && same_calendar_day(a, b))
}

/// Midnight UTC marks an all-day event.
#[must_use]
pub fn is_all_day(at: DateTime<Utc>) -> bool {
    at.hour() == 0 && at.minute() == 0
}

/// Both instants fall on the same UTC day.
#[must_use]
pub fn same_calendar_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    let day = |at: DateTime<Utc>| at.timestamp_millis().div_euclid(MILLIS_PER_DAY);
    day(a) == day(b)
}

/// Locations are compatible if either is unknown or one contains the other,
/// ignoring case.
#[must_use]
pub fn locations_compatible(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    a == "unknown" || b == "unknown" || a.contains(&b) || b.contains(&a)
}
