use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use time::OffsetDateTime;

use crate::dedup::DedupHash;
use crate::id::Ulid;

/// Disposition of a review queue entry.
///
/// `Pending` is the only live state; the other three are terminal and
/// never transition back.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Merged,
}

impl ReviewStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Unknown review status: {value}"))]
pub struct ReviewStatusParseError {
    pub value: String,
}

impl FromStr for ReviewStatus {
    type Err = ReviewStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Pending, Self::Approved, Self::Rejected, Self::Merged]
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ReviewStatusParseError {
                value: s.to_owned(),
            })
    }
}

/// A submission parked for human disposition.
///
/// Keyed by `(source_id, source_external_id)` when the submission
/// carried a source block, by `dedup_hash` otherwise; at most one
/// `pending` entry exists per key. References its event by id and
/// ULID without owning it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueEntry {
    pub id: i64,
    pub event_id: i64,
    pub event_ulid: Ulid,
    pub status: ReviewStatus,
    /// Opaque serialized warning list; see [`crate::warning`].
    pub warnings: Vec<u8>,
    pub dedup_hash: Option<DedupHash>,
    pub source_id: Option<i64>,
    pub source_external_id: Option<String>,
    /// End time of the submitted event, used by the rejection replay
    /// rule: once the event is past, resubmissions are allowed again.
    #[serde(with = "time::serde::rfc3339::option")]
    pub event_end_time: Option<OffsetDateTime>,
    pub reviewed_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reviewed_at: Option<OffsetDateTime>,
    pub rejection_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ReviewQueueEntry {
    /// Whether the reviewed event had ended by `now`.
    ///
    /// No recorded end time counts as "not past": rejection replay
    /// stays blocked rather than guessing.
    pub fn event_is_past(&self, now: OffsetDateTime) -> bool {
        self.event_end_time.is_some_and(|end| end < now)
    }
}
