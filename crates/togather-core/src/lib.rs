pub mod dedup;
pub mod event;
pub mod filter;
pub mod id;
pub mod idempotency;
pub mod place;
pub mod review;
pub mod source;
pub mod tombstone;
pub mod warning;

pub use dedup::{DedupCandidate, DedupHash, venue_key};
pub use event::{Event, EventDomain, License, LifecycleState, Occurrence};
pub use filter::{EventFilters, FilterError, Pagination, RawEventQuery};
pub use id::{Ulid, UlidGenerator};
pub use idempotency::IdempotencyKey;
pub use place::{CanonicalKey, Organization, Place};
pub use review::{ReviewQueueEntry, ReviewStatus};
pub use source::{EventSource, Source, TrustLevel};
pub use tombstone::{Tombstone, TombstonePayload, event_uri};
pub use warning::{QualityWarning, WarningCode};
