use core::fmt;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use time::OffsetDateTime;

/// How much a source's field values are believed over others', 1..=10.
///
/// Overwrites during merge require strictly greater trust; ties keep
/// the incumbent so repeated ingestion at equal trust is a no-op.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustLevel(u8);

impl TrustLevel {
    pub const MIN: Self = Self(1);
    pub const MAX: Self = Self(10);

    /// Clamps into the valid range.
    pub fn clamped(level: u8) -> Self {
        Self(level.clamp(Self::MIN.0, Self::MAX.0))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for TrustLevel {
    fn default() -> Self {
        Self::MIN
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Trust level out of range 1..=10: {value}"))]
pub struct TrustLevelError {
    pub value: u8,
}

impl TryFrom<u8> for TrustLevel {
    type Error = TrustLevelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value < Self::MIN.0 || Self::MAX.0 < value {
            return Err(TrustLevelError { value });
        }
        Ok(Self(value))
    }
}

/// An upstream submitter: a scraper, partner feed, or submission API
/// client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub trust_level: TrustLevel,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Join row between an [`crate::event::Event`] and a [`Source`],
/// carrying the source's own id for the event and the raw payload it
/// submitted. Ids only on both sides; the join row is the edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub event_id: i64,
    pub source_id: i64,
    pub external_id: String,
    pub raw_payload: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
