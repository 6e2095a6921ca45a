use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::id::Ulid;

/// Base URI this deployment publishes events under.
pub const FEDERATION_BASE_URL: &str = "https://togather.foundation";

/// Deletion reason recorded when an event is removed as a duplicate
/// of another. Free-text reasons are used for plain admin deletes.
pub const REASON_DUPLICATE_MERGED: &str = "duplicate_merged";

/// Federation-visible URI of an event.
pub fn event_uri(ulid: Ulid) -> String {
    format!("{FEDERATION_BASE_URL}/events/{ulid}")
}

/// A soft-deleted event's federation marker. One per deleted event;
/// on merge the duplicate's tombstone names the primary in
/// `superseded_by`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub event_id: i64,
    pub event_uri: String,
    #[serde(with = "time::serde::rfc3339")]
    pub deleted_at: OffsetDateTime,
    pub reason: String,
    pub superseded_by: Option<String>,
    /// JSON-LD bytes served to federation subscribers.
    pub payload: Vec<u8>,
}

/// The JSON-LD wire shape. Key order is not significant; consumers
/// key off `@id` and the `sel:` markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TombstonePayload {
    #[serde(rename = "@context")]
    pub context: serde_json::Value,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub object_type: String,
    pub name: String,
    #[serde(rename = "eventStatus")]
    pub event_status: String,
    #[serde(rename = "sel:tombstone")]
    pub tombstone: bool,
    #[serde(rename = "sel:deletedAt")]
    pub deleted_at: String,
    #[serde(rename = "sel:deletionReason")]
    pub deletion_reason: String,
    #[serde(rename = "sel:supersededBy", skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub superseded_by: Option<String>,
}

impl TombstonePayload {
    pub fn new(
        ulid: Ulid,
        name: &str,
        reason: &str,
        deleted_at: OffsetDateTime,
        superseded_by: Option<String>,
    ) -> Self {
        Self {
            context: serde_json::json!([
                "https://schema.org",
                { "sel": format!("{FEDERATION_BASE_URL}/ns#") }
            ]),
            id: event_uri(ulid),
            object_type: "Event".to_owned(),
            name: name.to_owned(),
            event_status: "https://schema.org/EventCancelled".to_owned(),
            tombstone: true,
            deleted_at: deleted_at
                .format(&Rfc3339)
                .expect("UTC timestamps always format"),
            deletion_reason: reason.to_owned(),
            superseded_by,
        }
    }

    /// UTF-8 JSON bytes as stored and served.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Payload always serializes")
    }
}
