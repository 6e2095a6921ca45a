use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use time::OffsetDateTime;

use crate::dedup::DedupHash;
use crate::id::Ulid;

/// Where an event sits in its publication lifecycle.
///
/// `Deleted` is terminal; the only transition out of it is an admin
/// resurrection which is handled outside this crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    Published,
    PendingReview,
    Postponed,
    Rescheduled,
    SoldOut,
    Cancelled,
    Completed,
    Deleted,
}

impl LifecycleState {
    pub const ALL: [Self; 9] = [
        Self::Draft,
        Self::Published,
        Self::PendingReview,
        Self::Postponed,
        Self::Rescheduled,
        Self::SoldOut,
        Self::Cancelled,
        Self::Completed,
        Self::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::PendingReview => "pending_review",
            Self::Postponed => "postponed",
            Self::Rescheduled => "rescheduled",
            Self::SoldOut => "sold_out",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Unknown lifecycle state: {value}"))]
pub struct LifecycleStateParseError {
    pub value: String,
}

impl FromStr for LifecycleState {
    type Err = LifecycleStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| LifecycleStateParseError {
                value: s.to_owned(),
            })
    }
}

/// Broad subject classification used for filtering.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDomain {
    Arts,
    Music,
    Culture,
    Sports,
    Community,
    Education,
    #[default]
    General,
}

impl EventDomain {
    pub const ALL: [Self; 7] = [
        Self::Arts,
        Self::Music,
        Self::Culture,
        Self::Sports,
        Self::Community,
        Self::Education,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arts => "arts",
            Self::Music => "music",
            Self::Culture => "culture",
            Self::Sports => "sports",
            Self::Community => "community",
            Self::Education => "education",
            Self::General => "general",
        }
    }
}

impl fmt::Display for EventDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Unknown event domain: {value}"))]
pub struct EventDomainParseError {
    pub value: String,
}

impl FromStr for EventDomain {
    type Err = EventDomainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|domain| domain.as_str() == s)
            .ok_or_else(|| EventDomainParseError {
                value: s.to_owned(),
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub url: String,
    pub status: String,
}

/// A single dated occurrence of an event. Owned 1:N by [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: i64,
    pub event_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub timezone: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub door_time: Option<OffsetDateTime>,
    pub venue_id: Option<i64>,
    pub virtual_url: String,
}

/// An aggregated event record.
///
/// String fields use `""` as the empty state; `Option` is reserved
/// for references and genuinely absent scalars. `merged_into_id` is
/// set iff the event was soft-deleted as a duplicate of another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub ulid: Ulid,
    pub name: String,
    pub description: String,
    pub license: License,
    pub dedup_hash: DedupHash,
    pub lifecycle_state: LifecycleState,
    pub event_domain: EventDomain,
    pub organizer_id: Option<i64>,
    pub primary_venue_id: Option<i64>,
    pub virtual_url: String,
    pub image_url: String,
    pub public_url: String,
    pub confidence: Option<f64>,
    pub quality_score: Option<u8>,
    pub keywords: Vec<String>,
    pub federation_uri: Option<String>,
    pub occurrences: Vec<Occurrence>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    pub merged_into_id: Option<i64>,
}

impl Event {
    pub fn is_deleted(&self) -> bool {
        self.lifecycle_state == LifecycleState::Deleted
    }

    /// End time of the last occurrence, if any occurrence has one.
    pub fn latest_end_time(&self) -> Option<OffsetDateTime> {
        self.occurrences.iter().filter_map(|o| o.end_time).max()
    }
}
