//! Persistence contract consumed by the ingest and admin services.
//!
//! The storage layer provides the implementation; this crate only
//! defines the surface: one [`Repository`] trait for reads and
//! writes, a [`RepositoryTx`] extension for caller-driven commit and
//! rollback, the parameter structs, and the sentinel errors. The
//! [`mem`] module carries a complete in-memory implementation used by
//! tests and local development.

pub mod mem;

use async_trait::async_trait;
use snafu::Snafu;
use time::OffsetDateTime;
use togather_core::dedup::DedupHash;
use togather_core::event::{Event, EventDomain, License, LifecycleState, Occurrence};
use togather_core::filter::{EventFilters, Pagination};
use togather_core::id::Ulid;
use togather_core::idempotency::IdempotencyKey;
use togather_core::place::{CanonicalKey, Organization, Place};
use togather_core::review::{ReviewQueueEntry, ReviewStatus};
use togather_core::source::{Source, TrustLevel};
use togather_core::tombstone::Tombstone;
use togather_util_error::BoxedError;

#[derive(Debug, Snafu)]
pub enum RepoError {
    #[snafu(display("Record not found"))]
    NotFound,
    #[snafu(display("Unique constraint conflict: {constraint}"))]
    Conflict { constraint: &'static str },
    #[snafu(display("Transaction already committed or rolled back"))]
    TxClosed,
    #[snafu(display("Storage error: {source}"))]
    Storage { source: BoxedError },
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;

/// Insert parameters for an event row.
#[derive(Debug, Clone)]
pub struct NewEvent {
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
}

#[derive(Debug, Clone)]
pub struct NewOccurrence {
    pub event_id: i64,
    pub start_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
    pub timezone: String,
    pub door_time: Option<OffsetDateTime>,
    pub venue_id: Option<i64>,
    pub virtual_url: String,
}

#[derive(Debug, Clone)]
pub struct NewEventSource {
    pub event_id: i64,
    pub source_id: i64,
    pub external_id: String,
    pub raw_payload: Vec<u8>,
}

/// Lookup-or-insert key for a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLookup {
    pub name: String,
    pub url: String,
}

/// Update set for an event. `Some` means "write this value"; `None`
/// leaves the column untouched. Description and the URL fields
/// distinguish absent (`None`), cleared (`Some("")`), and set this
/// way without sentinel strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub public_url: Option<String>,
    pub virtual_url: Option<String>,
    pub lifecycle_state: Option<LifecycleState>,
    pub event_domain: Option<EventDomain>,
    pub keywords: Option<Vec<String>>,
    pub confidence: Option<f64>,
    pub quality_score: Option<u8>,
    pub organizer_id: Option<i64>,
    pub primary_venue_id: Option<i64>,
}

impl EventChanges {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Proposed place row; the returned row's ULID differs from
/// `ulid` when an existing row matched the canonical key.
#[derive(Debug, Clone)]
pub struct UpsertPlace {
    pub ulid: Ulid,
    pub name: String,
    pub locality: String,
    pub region: String,
    pub country: String,
}

#[derive(Debug, Clone)]
pub struct UpsertOrganization {
    pub ulid: Ulid,
    pub name: String,
    pub locality: String,
    pub region: String,
    pub country: String,
}

/// A fuzzy match candidate returned by the similarity queries,
/// ranked by descending score in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarCandidate {
    pub id: i64,
    pub ulid: Ulid,
    pub name: String,
    pub score: f64,
}

/// An existing event at the same venue and date window whose name is
/// similar to the incoming one.
#[derive(Debug, Clone, PartialEq)]
pub struct NearDuplicate {
    pub event_id: i64,
    pub ulid: Ulid,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct NewReviewEntry {
    pub event_id: i64,
    pub event_ulid: Ulid,
    pub warnings: Vec<u8>,
    pub dedup_hash: Option<DedupHash>,
    pub source_id: Option<i64>,
    pub source_external_id: Option<String>,
    pub event_end_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewTombstone {
    pub event_id: i64,
    pub event_uri: String,
    pub deleted_at: OffsetDateTime,
    pub reason: String,
    pub superseded_by: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewIdempotencyKey {
    pub key: String,
    pub request_hash: String,
}

/// The persistence surface.
///
/// All suspension points of the core are calls into this trait.
/// Cancellation is dropping the returned future; implementations must
/// not leave partial state behind a dropped call (single statements
/// are atomic, multi-statement work goes through [`Repository::begin_tx`]).
#[async_trait]
pub trait Repository: Send + Sync {
    // ── events ──────────────────────────────────────────────────────

    /// Filtered listing ordered by ULID, with a cursor for the next
    /// page when more rows matched than the limit.
    async fn list_events(
        &self,
        filters: &EventFilters,
        page: &Pagination,
    ) -> RepoResult<(Vec<Event>, Option<Ulid>)>;

    async fn get_event_by_ulid(&self, ulid: Ulid) -> RepoResult<Event>;

    /// Inserts an event. Surfaces [`RepoError::Conflict`] when a
    /// live event with the same dedup hash already exists (unique
    /// index); callers retry the read path on that.
    async fn create_event(&self, event: NewEvent) -> RepoResult<Event>;

    async fn create_occurrence(&self, occurrence: NewOccurrence) -> RepoResult<Occurrence>;

    async fn create_event_source(&self, source: NewEventSource) -> RepoResult<()>;

    async fn find_by_source_external_id(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> RepoResult<Option<Event>>;

    /// Reviewed, live event with this dedup hash, if any. Deleted
    /// and `pending_review` rows do not match: a queued submission is
    /// reconciled through its review entry, not the hash index.
    async fn find_by_dedup_hash(&self, dedup_hash: &DedupHash) -> RepoResult<Option<Event>>;

    async fn update_event(&self, event_id: i64, changes: &EventChanges) -> RepoResult<Event>;

    /// Sets lifecycle `deleted` and `deleted_at`; the row stays.
    async fn soft_delete_event(&self, event_id: i64, deleted_at: OffsetDateTime)
    -> RepoResult<()>;

    /// Marks `duplicate_id` merged into `primary_id`: soft-deletes
    /// the duplicate and records `merged_into_id`.
    async fn merge_events(&self, duplicate_id: i64, primary_id: i64) -> RepoResult<()>;

    // ── sources ─────────────────────────────────────────────────────

    async fn get_or_create_source(&self, lookup: &SourceLookup) -> RepoResult<Source>;

    /// Max trust over the event's sources; minimum trust when the
    /// event has no source rows.
    async fn get_source_trust_level(&self, event_id: i64) -> RepoResult<TrustLevel>;

    async fn get_source_trust_level_by_source_id(&self, source_id: i64)
    -> RepoResult<TrustLevel>;

    // ── idempotency ─────────────────────────────────────────────────

    async fn get_idempotency_key(&self, key: &str) -> RepoResult<Option<IdempotencyKey>>;

    /// Surfaces [`RepoError::Conflict`] when the key already exists.
    async fn insert_idempotency_key(&self, key: NewIdempotencyKey) -> RepoResult<()>;

    async fn update_idempotency_key_event(
        &self,
        key: &str,
        event_id: i64,
        event_ulid: Ulid,
    ) -> RepoResult<()>;

    // ── places & organizations ──────────────────────────────────────

    /// Returns the row for the canonical key and whether it was
    /// created by this call.
    async fn upsert_place(&self, upsert: UpsertPlace) -> RepoResult<(Place, bool)>;

    async fn upsert_organization(
        &self,
        upsert: UpsertOrganization,
    ) -> RepoResult<(Organization, bool)>;

    /// Candidates with similarity ≥ `min_score` against the given
    /// canonical key, best first. How similarity is computed is the
    /// implementation's business (the SQL layer uses trigram
    /// matching); only the `0.0..=1.0` contract is promised.
    async fn find_similar_places(
        &self,
        key: &CanonicalKey,
        min_score: f64,
    ) -> RepoResult<Vec<SimilarCandidate>>;

    async fn find_similar_organizations(
        &self,
        key: &CanonicalKey,
        min_score: f64,
    ) -> RepoResult<Vec<SimilarCandidate>>;

    /// Folds `duplicate_id` into `primary_id` and retargets all
    /// references.
    async fn merge_places(&self, primary_id: i64, duplicate_id: i64) -> RepoResult<()>;

    async fn merge_organizations(&self, primary_id: i64, duplicate_id: i64) -> RepoResult<()>;

    // ── near duplicates ─────────────────────────────────────────────

    async fn find_near_duplicates(
        &self,
        name: &str,
        venue_id: i64,
        start_time: OffsetDateTime,
        min_score: f64,
    ) -> RepoResult<Vec<NearDuplicate>>;

    /// Whether the pair was marked not-a-duplicate by a reviewer.
    async fn is_not_duplicate(&self, a: Ulid, b: Ulid) -> RepoResult<bool>;

    // ── tombstones ──────────────────────────────────────────────────

    async fn create_tombstone(&self, tombstone: NewTombstone) -> RepoResult<()>;

    async fn get_tombstone_by_event_id(&self, event_id: i64) -> RepoResult<Option<Tombstone>>;

    async fn get_tombstone_by_event_ulid(&self, ulid: Ulid) -> RepoResult<Option<Tombstone>>;

    // ── review queue ────────────────────────────────────────────────

    /// Newest entry for the source key, a pending one first if both
    /// a pending and terminal entries exist.
    async fn find_review_by_source(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> RepoResult<Option<ReviewQueueEntry>>;

    /// Newest entry for the dedup hash, a pending one first.
    async fn find_review_by_dedup(
        &self,
        dedup_hash: &DedupHash,
    ) -> RepoResult<Option<ReviewQueueEntry>>;

    /// Surfaces [`RepoError::Conflict`] when a pending entry already
    /// exists for the same key (at most one pending per key).
    async fn create_review(&self, entry: NewReviewEntry) -> RepoResult<ReviewQueueEntry>;

    /// Replaces a pending entry's warnings and bumps `updated_at`.
    async fn update_review_warnings(
        &self,
        review_id: i64,
        warnings: Vec<u8>,
        event_end_time: Option<OffsetDateTime>,
    ) -> RepoResult<()>;

    async fn get_review(&self, review_id: i64) -> RepoResult<ReviewQueueEntry>;

    async fn list_reviews(&self, status: Option<ReviewStatus>)
    -> RepoResult<Vec<ReviewQueueEntry>>;

    /// Pending → approved. [`RepoError::Conflict`] on a terminal
    /// entry: terminal statuses never transition.
    async fn approve_review(&self, review_id: i64, reviewed_by: &str) -> RepoResult<()>;

    /// Pending → rejected, recording the reason. The entry's event
    /// is soft-deleted as part of the rejection so its dedup hash
    /// stops matching future submissions; those route through the
    /// rejection-replay rule instead.
    async fn reject_review(
        &self,
        review_id: i64,
        reviewed_by: &str,
        reason: &str,
    ) -> RepoResult<()>;

    /// Pending → merged.
    async fn mark_review_merged(&self, review_id: i64, reviewed_by: &str) -> RepoResult<()>;

    /// Drops pending entries whose event ended before `older_than`.
    /// Returns how many were removed.
    async fn cleanup_expired_reviews(&self, older_than: OffsetDateTime) -> RepoResult<u64>;

    // ── transactions ────────────────────────────────────────────────

    /// Opens a transaction-scoped repository. Every statement of a
    /// multi-statement operation must go through the returned handle,
    /// and exactly one of [`RepositoryTx::commit`] or
    /// [`RepositoryTx::rollback`] must be called; dropping the handle
    /// rolls back.
    async fn begin_tx(&self) -> RepoResult<Box<dyn RepositoryTx>>;
}

/// A transaction-scoped [`Repository`].
///
/// The handle and the repository that produced it share an interface
/// but refer to disjoint storage handles; methods on a handle that
/// was committed or rolled back fail with [`RepoError::TxClosed`].
#[async_trait]
pub trait RepositoryTx: Repository {
    async fn commit(self: Box<Self>) -> RepoResult<()>;

    async fn rollback(self: Box<Self>) -> RepoResult<()>;
}
