//! In-memory [`Repository`] implementation.
//!
//! Backs the integration tests and local development; the production
//! store is SQL and lives elsewhere. Semantics worth trusting in
//! tests: unique-index conflicts surface as [`RepoError::Conflict`],
//! and transactions work on a copy of the state that only replaces
//! the shared state on commit, so rollback and mid-transaction
//! failures leave nothing behind.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use togather_core::dedup::DedupHash;
use togather_core::event::{Event, LifecycleState, Occurrence};
use togather_core::filter::{EventFilters, Pagination};
use togather_core::id::Ulid;
use togather_core::idempotency::IdempotencyKey;
use togather_core::place::{CanonicalKey, Organization, Place};
use togather_core::review::{ReviewQueueEntry, ReviewStatus};
use togather_core::source::{EventSource, Source, TrustLevel};
use togather_core::tombstone::Tombstone;
use tracing::debug;

use crate::{
    EventChanges, NewEvent, NewEventSource, NewIdempotencyKey, NewOccurrence, NewReviewEntry,
    NewTombstone, NearDuplicate, RepoError, RepoResult, Repository, RepositoryTx,
    SimilarCandidate, SourceLookup, UpsertOrganization, UpsertPlace,
};

const LOG_TARGET: &str = "togather::repo::mem";

/// Occurrences this far from the probe start time still count as
/// "same date window" for near-duplicate scanning.
const NEAR_DUPLICATE_WINDOW: Duration = Duration::hours(24);

#[derive(Debug, Clone, Default)]
struct State {
    next_id: i64,
    events: BTreeMap<i64, Event>,
    event_sources: Vec<EventSource>,
    sources: BTreeMap<i64, Source>,
    places: BTreeMap<i64, Place>,
    organizations: BTreeMap<i64, Organization>,
    reviews: BTreeMap<i64, ReviewQueueEntry>,
    tombstones: Vec<Tombstone>,
    idempotency_keys: BTreeMap<String, IdempotencyKey>,
    not_duplicate_pairs: HashSet<(Ulid, Ulid)>,
}

impl State {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn event_by_ulid(&self, ulid: Ulid) -> Option<&Event> {
        self.events.values().find(|event| event.ulid == ulid)
    }

    fn list_events(
        &self,
        filters: &EventFilters,
        page: &Pagination,
    ) -> RepoResult<(Vec<Event>, Option<Ulid>)> {
        // A filter on an unknown ULID matches nothing rather than
        // erroring: the id may have been merged away.
        let venue_filter_id = match filters.venue_id {
            None => None,
            Some(ulid) => match self.places.values().find(|place| place.ulid == ulid) {
                Some(place) => Some(place.id),
                None => return Ok((vec![], None)),
            },
        };
        let organizer_filter_id = match filters.organizer_id {
            None => None,
            Some(ulid) => match self.organizations.values().find(|org| org.ulid == ulid) {
                Some(org) => Some(org.id),
                None => return Ok((vec![], None)),
            },
        };

        let mut matching: Vec<&Event> = self
            .events
            .values()
            .filter(|event| self.event_matches(event, filters, venue_filter_id, organizer_filter_id))
            .collect();
        matching.sort_by_key(|event| event.ulid);

        let mut events = Vec::new();
        let mut iter = matching
            .into_iter()
            .skip_while(|event| page.after.is_some_and(|after| event.ulid <= after));
        for event in iter.by_ref() {
            if page.limit as usize <= events.len() {
                let last_ulid = events.last().map(|last: &Event| last.ulid);
                return Ok((events, last_ulid));
            }
            events.push(event.clone());
        }
        Ok((events, None))
    }

    fn event_matches(
        &self,
        event: &Event,
        filters: &EventFilters,
        venue_filter_id: Option<i64>,
        organizer_filter_id: Option<i64>,
    ) -> bool {
        match filters.state {
            Some(state) => {
                if event.lifecycle_state != state {
                    return false;
                }
            }
            // Deleted rows are invisible unless explicitly requested.
            None => {
                if event.is_deleted() {
                    return false;
                }
            }
        }
        if let Some(domain) = filters.domain {
            if event.event_domain != domain {
                return false;
            }
        }
        if let Some(venue_id) = venue_filter_id {
            let at_venue = event.primary_venue_id == Some(venue_id)
                || event.occurrences.iter().any(|o| o.venue_id == Some(venue_id));
            if !at_venue {
                return false;
            }
        }
        if let Some(organizer_id) = organizer_filter_id {
            if event.organizer_id != Some(organizer_id) {
                return false;
            }
        }
        if let Some(start) = filters.start_date {
            if !event.occurrences.iter().any(|o| start <= o.start_time.date()) {
                return false;
            }
        }
        if let Some(end) = filters.end_date {
            if !event.occurrences.iter().any(|o| o.start_time.date() <= end) {
                return false;
            }
        }
        if let Some(city) = &filters.city {
            if !self.event_locality_matches(event, city, |place| &place.locality) {
                return false;
            }
        }
        if let Some(region) = &filters.region {
            if !self.event_locality_matches(event, region, |place| &place.region) {
                return false;
            }
        }
        if let Some(q) = &filters.q {
            let needle = q.to_lowercase();
            if !event.name.to_lowercase().contains(&needle)
                && !event.description.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if !filters.keywords.is_empty() {
            let event_keywords: HashSet<String> =
                event.keywords.iter().map(|k| k.to_lowercase()).collect();
            if !filters
                .keywords
                .iter()
                .any(|k| event_keywords.contains(&k.to_lowercase()))
            {
                return false;
            }
        }
        true
    }

    fn event_locality_matches(
        &self,
        event: &Event,
        wanted: &str,
        field: impl Fn(&Place) -> &str,
    ) -> bool {
        event
            .primary_venue_id
            .and_then(|id| self.places.get(&id))
            .is_some_and(|place| field(place).eq_ignore_ascii_case(wanted))
    }

    fn create_event(&mut self, new: NewEvent) -> RepoResult<Event> {
        let hash_taken = self
            .events
            .values()
            .any(|event| !event.is_deleted() && event.dedup_hash == new.dedup_hash);
        if hash_taken {
            return Err(RepoError::Conflict {
                constraint: "events_dedup_hash",
            });
        }

        let now = OffsetDateTime::now_utc();
        let event = Event {
            id: self.alloc_id(),
            ulid: new.ulid,
            name: new.name,
            description: new.description,
            license: new.license,
            dedup_hash: new.dedup_hash,
            lifecycle_state: new.lifecycle_state,
            event_domain: new.event_domain,
            organizer_id: new.organizer_id,
            primary_venue_id: new.primary_venue_id,
            virtual_url: new.virtual_url,
            image_url: new.image_url,
            public_url: new.public_url,
            confidence: new.confidence,
            quality_score: new.quality_score,
            keywords: new.keywords,
            federation_uri: new.federation_uri,
            occurrences: vec![],
            created_at: now,
            updated_at: now,
            deleted_at: None,
            merged_into_id: None,
        };
        self.events.insert(event.id, event.clone());
        Ok(event)
    }

    fn create_occurrence(&mut self, new: NewOccurrence) -> RepoResult<Occurrence> {
        let id = self.alloc_id();
        let event = self.events.get_mut(&new.event_id).ok_or(RepoError::NotFound)?;
        let occurrence = Occurrence {
            id,
            event_id: new.event_id,
            start_time: new.start_time,
            end_time: new.end_time,
            timezone: new.timezone,
            door_time: new.door_time,
            venue_id: new.venue_id,
            virtual_url: new.virtual_url,
        };
        event.occurrences.push(occurrence.clone());
        Ok(occurrence)
    }

    fn create_event_source(&mut self, new: NewEventSource) -> RepoResult<()> {
        if !self.events.contains_key(&new.event_id) {
            return Err(RepoError::NotFound);
        }
        self.event_sources.push(EventSource {
            event_id: new.event_id,
            source_id: new.source_id,
            external_id: new.external_id,
            raw_payload: new.raw_payload,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    fn update_event(&mut self, event_id: i64, changes: &EventChanges) -> RepoResult<Event> {
        let event = self.events.get_mut(&event_id).ok_or(RepoError::NotFound)?;
        if let Some(name) = &changes.name {
            event.name = name.clone();
        }
        if let Some(description) = &changes.description {
            event.description = description.clone();
        }
        if let Some(image_url) = &changes.image_url {
            event.image_url = image_url.clone();
        }
        if let Some(public_url) = &changes.public_url {
            event.public_url = public_url.clone();
        }
        if let Some(virtual_url) = &changes.virtual_url {
            event.virtual_url = virtual_url.clone();
        }
        if let Some(lifecycle_state) = changes.lifecycle_state {
            event.lifecycle_state = lifecycle_state;
        }
        if let Some(event_domain) = changes.event_domain {
            event.event_domain = event_domain;
        }
        if let Some(keywords) = &changes.keywords {
            event.keywords = keywords.clone();
        }
        if let Some(confidence) = changes.confidence {
            event.confidence = Some(confidence);
        }
        if let Some(quality_score) = changes.quality_score {
            event.quality_score = Some(quality_score);
        }
        if let Some(organizer_id) = changes.organizer_id {
            event.organizer_id = Some(organizer_id);
        }
        if let Some(primary_venue_id) = changes.primary_venue_id {
            event.primary_venue_id = Some(primary_venue_id);
        }
        event.updated_at = OffsetDateTime::now_utc();
        Ok(event.clone())
    }

    fn soft_delete_event(&mut self, event_id: i64, deleted_at: OffsetDateTime) -> RepoResult<()> {
        let event = self.events.get_mut(&event_id).ok_or(RepoError::NotFound)?;
        event.lifecycle_state = LifecycleState::Deleted;
        event.deleted_at = Some(deleted_at);
        event.updated_at = deleted_at;
        Ok(())
    }

    fn merge_events(&mut self, duplicate_id: i64, primary_id: i64) -> RepoResult<()> {
        if !self.events.contains_key(&primary_id) {
            return Err(RepoError::NotFound);
        }
        let now = OffsetDateTime::now_utc();
        let duplicate = self.events.get_mut(&duplicate_id).ok_or(RepoError::NotFound)?;
        duplicate.merged_into_id = Some(primary_id);
        duplicate.lifecycle_state = LifecycleState::Deleted;
        duplicate.deleted_at = Some(now);
        duplicate.updated_at = now;
        Ok(())
    }

    fn get_or_create_source(&mut self, lookup: &SourceLookup) -> RepoResult<Source> {
        if let Some(source) = self
            .sources
            .values()
            .find(|source| source.name == lookup.name && source.url == lookup.url)
        {
            return Ok(source.clone());
        }
        let source = Source {
            id: self.alloc_id(),
            name: lookup.name.clone(),
            url: lookup.url.clone(),
            trust_level: TrustLevel::default(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.sources.insert(source.id, source.clone());
        Ok(source)
    }

    fn get_source_trust_level(&self, event_id: i64) -> TrustLevel {
        self.event_sources
            .iter()
            .filter(|edge| edge.event_id == event_id)
            .filter_map(|edge| self.sources.get(&edge.source_id))
            .map(|source| source.trust_level)
            .max()
            .unwrap_or(TrustLevel::MIN)
    }

    fn upsert_place(&mut self, upsert: UpsertPlace) -> RepoResult<(Place, bool)> {
        let key = CanonicalKey::new(&upsert.name, &upsert.locality, &upsert.region, &upsert.country);
        if let Some(existing) = self
            .places
            .values()
            .find(|place| place.canonical_key() == key)
        {
            return Ok((existing.clone(), false));
        }
        let now = OffsetDateTime::now_utc();
        let place = Place {
            id: self.alloc_id(),
            ulid: upsert.ulid,
            name: upsert.name,
            locality: upsert.locality,
            region: upsert.region,
            country: upsert.country,
            created_at: now,
            updated_at: now,
        };
        self.places.insert(place.id, place.clone());
        Ok((place, true))
    }

    fn upsert_organization(
        &mut self,
        upsert: UpsertOrganization,
    ) -> RepoResult<(Organization, bool)> {
        let key = CanonicalKey::new(&upsert.name, &upsert.locality, &upsert.region, &upsert.country);
        if let Some(existing) = self
            .organizations
            .values()
            .find(|org| org.canonical_key() == key)
        {
            return Ok((existing.clone(), false));
        }
        let now = OffsetDateTime::now_utc();
        let org = Organization {
            id: self.alloc_id(),
            ulid: upsert.ulid,
            name: upsert.name,
            locality: upsert.locality,
            region: upsert.region,
            country: upsert.country,
            created_at: now,
            updated_at: now,
        };
        self.organizations.insert(org.id, org.clone());
        Ok((org, true))
    }

    fn find_similar<'s>(
        key: &CanonicalKey,
        rows: impl Iterator<Item = (&'s CanonicalKey, i64, Ulid, &'s str)>,
        min_score: f64,
    ) -> Vec<SimilarCandidate> {
        let probe = format!("{} {}", key.name, key.locality);
        let mut candidates: Vec<SimilarCandidate> = rows
            .filter(|(row_key, ..)| *row_key != key)
            .filter_map(|(row_key, id, ulid, name)| {
                let score =
                    trigram_similarity(&probe, &format!("{} {}", row_key.name, row_key.locality));
                (min_score <= score).then(|| SimilarCandidate {
                    id,
                    ulid,
                    name: name.to_owned(),
                    score,
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates
    }

    fn merge_places(&mut self, primary_id: i64, duplicate_id: i64) -> RepoResult<()> {
        if !self.places.contains_key(&primary_id) {
            return Err(RepoError::NotFound);
        }
        self.places.remove(&duplicate_id).ok_or(RepoError::NotFound)?;
        for event in self.events.values_mut() {
            if event.primary_venue_id == Some(duplicate_id) {
                event.primary_venue_id = Some(primary_id);
            }
            for occurrence in &mut event.occurrences {
                if occurrence.venue_id == Some(duplicate_id) {
                    occurrence.venue_id = Some(primary_id);
                }
            }
        }
        Ok(())
    }

    fn merge_organizations(&mut self, primary_id: i64, duplicate_id: i64) -> RepoResult<()> {
        if !self.organizations.contains_key(&primary_id) {
            return Err(RepoError::NotFound);
        }
        self.organizations
            .remove(&duplicate_id)
            .ok_or(RepoError::NotFound)?;
        for event in self.events.values_mut() {
            if event.organizer_id == Some(duplicate_id) {
                event.organizer_id = Some(primary_id);
            }
        }
        Ok(())
    }

    fn find_near_duplicates(
        &self,
        name: &str,
        venue_id: i64,
        start_time: OffsetDateTime,
        min_score: f64,
    ) -> Vec<NearDuplicate> {
        let mut candidates: Vec<NearDuplicate> = self
            .events
            .values()
            .filter(|event| !event.is_deleted())
            .filter(|event| {
                event.primary_venue_id == Some(venue_id)
                    || event.occurrences.iter().any(|o| o.venue_id == Some(venue_id))
            })
            .filter(|event| {
                event.occurrences.iter().any(|o| {
                    let gap = if start_time < o.start_time {
                        o.start_time - start_time
                    } else {
                        start_time - o.start_time
                    };
                    gap <= NEAR_DUPLICATE_WINDOW
                })
            })
            .filter_map(|event| {
                let score = trigram_similarity(name, &event.name);
                (min_score <= score).then(|| NearDuplicate {
                    event_id: event.id,
                    ulid: event.ulid,
                    name: event.name.clone(),
                    score,
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates
    }

    fn create_tombstone(&mut self, new: NewTombstone) -> RepoResult<()> {
        if self
            .tombstones
            .iter()
            .any(|tombstone| tombstone.event_id == new.event_id)
        {
            return Err(RepoError::Conflict {
                constraint: "tombstones_event_id",
            });
        }
        self.tombstones.push(Tombstone {
            event_id: new.event_id,
            event_uri: new.event_uri,
            deleted_at: new.deleted_at,
            reason: new.reason,
            superseded_by: new.superseded_by,
            payload: new.payload,
        });
        Ok(())
    }

    fn find_review(
        &self,
        matches: impl Fn(&ReviewQueueEntry) -> bool,
    ) -> Option<ReviewQueueEntry> {
        let mut entries: Vec<&ReviewQueueEntry> =
            self.reviews.values().filter(|entry| matches(entry)).collect();
        // A pending entry wins; otherwise the newest disposition.
        entries.sort_by_key(|entry| (entry.status == ReviewStatus::Pending, entry.id));
        entries.last().map(|entry| (*entry).clone())
    }

    fn create_review(&mut self, new: NewReviewEntry) -> RepoResult<ReviewQueueEntry> {
        let pending_taken = self.reviews.values().any(|entry| {
            if entry.status != ReviewStatus::Pending {
                return false;
            }
            let same_source = entry.source_id.is_some()
                && entry.source_id == new.source_id
                && entry.source_external_id == new.source_external_id;
            let same_hash = entry.dedup_hash.is_some() && entry.dedup_hash == new.dedup_hash;
            same_source || same_hash
        });
        if pending_taken {
            return Err(RepoError::Conflict {
                constraint: "reviews_one_pending_per_key",
            });
        }

        let now = OffsetDateTime::now_utc();
        let entry = ReviewQueueEntry {
            id: self.alloc_id(),
            event_id: new.event_id,
            event_ulid: new.event_ulid,
            status: ReviewStatus::Pending,
            warnings: new.warnings,
            dedup_hash: new.dedup_hash,
            source_id: new.source_id,
            source_external_id: new.source_external_id,
            event_end_time: new.event_end_time,
            reviewed_by: None,
            reviewed_at: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.reviews.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn update_review_warnings(
        &mut self,
        review_id: i64,
        warnings: Vec<u8>,
        event_end_time: Option<OffsetDateTime>,
    ) -> RepoResult<()> {
        let entry = self.reviews.get_mut(&review_id).ok_or(RepoError::NotFound)?;
        if entry.status.is_terminal() {
            return Err(RepoError::Conflict {
                constraint: "reviews_terminal_status",
            });
        }
        entry.warnings = warnings;
        if event_end_time.is_some() {
            entry.event_end_time = event_end_time;
        }
        entry.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    fn transition_review(
        &mut self,
        review_id: i64,
        status: ReviewStatus,
        reviewed_by: &str,
        reason: Option<&str>,
    ) -> RepoResult<()> {
        let entry = self.reviews.get_mut(&review_id).ok_or(RepoError::NotFound)?;
        if entry.status.is_terminal() {
            return Err(RepoError::Conflict {
                constraint: "reviews_terminal_status",
            });
        }
        let now = OffsetDateTime::now_utc();
        entry.status = status;
        entry.reviewed_by = Some(reviewed_by.to_owned());
        entry.reviewed_at = Some(now);
        entry.rejection_reason = reason.map(str::to_owned);
        entry.updated_at = now;

        // Rejection frees the dedup hash: the rejected event leaves
        // the live set so resubmissions hit the replay rule, not the
        // hash short-circuit.
        if status == ReviewStatus::Rejected {
            let event_id = entry.event_id;
            if let Some(event) = self.events.get_mut(&event_id) {
                if !event.is_deleted() {
                    event.lifecycle_state = LifecycleState::Deleted;
                    event.deleted_at = Some(now);
                    event.updated_at = now;
                }
            }
        }
        Ok(())
    }

    fn cleanup_expired_reviews(&mut self, older_than: OffsetDateTime) -> u64 {
        let expired: Vec<i64> = self
            .reviews
            .values()
            .filter(|entry| entry.status == ReviewStatus::Pending)
            .filter(|entry| entry.event_end_time.is_some_and(|end| end < older_than))
            .map(|entry| entry.id)
            .collect();
        for id in &expired {
            self.reviews.remove(id);
        }
        expired.len() as u64
    }
}

/// Word-wise trigram similarity in `0.0..=1.0`, the shape of what the
/// SQL layer gets from its trigram index.
fn trigram_similarity(a: &str, b: &str) -> f64 {
    let a = trigrams(a);
    let b = trigrams(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn trigrams(s: &str) -> BTreeSet<String> {
    let normalized: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let mut grams = BTreeSet::new();
    for word in normalized.split_whitespace() {
        let padded: Vec<char> = format!("  {word} ").chars().collect();
        for window in padded.windows(3) {
            grams.insert(window.iter().collect());
        }
    }
    grams
}

fn pair_key(a: Ulid, b: Ulid) -> (Ulid, Ulid) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Shared-state handle. Each call locks, applies, and releases: the
/// single-statement autocommit mode of the contract.
#[derive(Clone)]
pub struct MemRepository {
    state: Arc<Mutex<State>>,
}

impl Default for MemRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRepository {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    async fn with<R>(&self, f: impl FnOnce(&mut State) -> RepoResult<R> + Send) -> RepoResult<R> {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Registers a source with an explicit trust level. Sources are
    /// otherwise created at minimum trust by `get_or_create_source`.
    pub async fn add_source(&self, name: &str, url: &str, trust_level: TrustLevel) -> Source {
        let mut state = self.state.lock().await;
        let source = state
            .get_or_create_source(&SourceLookup {
                name: name.to_owned(),
                url: url.to_owned(),
            })
            .expect("get_or_create_source is infallible in memory");
        let source = state.sources.get_mut(&source.id).expect("Just created");
        source.trust_level = trust_level;
        source.clone()
    }

    /// Records a reviewer's "these are different events" verdict.
    pub async fn mark_not_duplicate(&self, a: Ulid, b: Ulid) {
        let mut state = self.state.lock().await;
        state.not_duplicate_pairs.insert(pair_key(a, b));
    }

    /// Raw row access for test assertions.
    pub async fn event_by_id(&self, event_id: i64) -> Option<Event> {
        let state = self.state.lock().await;
        state.events.get(&event_id).cloned()
    }
}

/// Transaction handle: works on a deep copy, swaps it in on commit.
pub struct MemTx {
    shared: Arc<Mutex<State>>,
    working: Mutex<Option<State>>,
}

impl MemTx {
    async fn with<R>(&self, f: impl FnOnce(&mut State) -> RepoResult<R> + Send) -> RepoResult<R> {
        let mut working = self.working.lock().await;
        let state = working.as_mut().ok_or(RepoError::TxClosed)?;
        f(state)
    }
}

macro_rules! impl_mem_repository {
    ($ty:ty, $($begin_tx:tt)*) => {
        #[async_trait]
        impl Repository for $ty {
            async fn list_events(
                &self,
                filters: &EventFilters,
                page: &Pagination,
            ) -> RepoResult<(Vec<Event>, Option<Ulid>)> {
                self.with(|state| state.list_events(filters, page)).await
            }

            async fn get_event_by_ulid(&self, ulid: Ulid) -> RepoResult<Event> {
                self.with(|state| state.event_by_ulid(ulid).cloned().ok_or(RepoError::NotFound))
                    .await
            }

            async fn create_event(&self, event: NewEvent) -> RepoResult<Event> {
                self.with(|state| state.create_event(event)).await
            }

            async fn create_occurrence(&self, occurrence: NewOccurrence) -> RepoResult<Occurrence> {
                self.with(|state| state.create_occurrence(occurrence)).await
            }

            async fn create_event_source(&self, source: NewEventSource) -> RepoResult<()> {
                self.with(|state| state.create_event_source(source)).await
            }

            async fn find_by_source_external_id(
                &self,
                source_id: i64,
                external_id: &str,
            ) -> RepoResult<Option<Event>> {
                self.with(|state| {
                    Ok(state
                        .event_sources
                        .iter()
                        .find(|edge| {
                            edge.source_id == source_id && edge.external_id == external_id
                        })
                        .and_then(|edge| state.events.get(&edge.event_id))
                        .filter(|event| !event.is_deleted())
                        .cloned())
                })
                .await
            }

            async fn find_by_dedup_hash(
                &self,
                dedup_hash: &DedupHash,
            ) -> RepoResult<Option<Event>> {
                self.with(|state| {
                    Ok(state
                        .events
                        .values()
                        .find(|event| {
                            !event.is_deleted()
                                && event.lifecycle_state != LifecycleState::PendingReview
                                && event.dedup_hash == *dedup_hash
                        })
                        .cloned())
                })
                .await
            }

            async fn update_event(
                &self,
                event_id: i64,
                changes: &EventChanges,
            ) -> RepoResult<Event> {
                self.with(|state| state.update_event(event_id, changes)).await
            }

            async fn soft_delete_event(
                &self,
                event_id: i64,
                deleted_at: OffsetDateTime,
            ) -> RepoResult<()> {
                self.with(|state| state.soft_delete_event(event_id, deleted_at)).await
            }

            async fn merge_events(&self, duplicate_id: i64, primary_id: i64) -> RepoResult<()> {
                self.with(|state| state.merge_events(duplicate_id, primary_id)).await
            }

            async fn get_or_create_source(&self, lookup: &SourceLookup) -> RepoResult<Source> {
                self.with(|state| state.get_or_create_source(lookup)).await
            }

            async fn get_source_trust_level(&self, event_id: i64) -> RepoResult<TrustLevel> {
                self.with(|state| Ok(state.get_source_trust_level(event_id))).await
            }

            async fn get_source_trust_level_by_source_id(
                &self,
                source_id: i64,
            ) -> RepoResult<TrustLevel> {
                self.with(|state| {
                    state
                        .sources
                        .get(&source_id)
                        .map(|source| source.trust_level)
                        .ok_or(RepoError::NotFound)
                })
                .await
            }

            async fn get_idempotency_key(&self, key: &str) -> RepoResult<Option<IdempotencyKey>> {
                self.with(|state| Ok(state.idempotency_keys.get(key).cloned())).await
            }

            async fn insert_idempotency_key(&self, key: NewIdempotencyKey) -> RepoResult<()> {
                self.with(|state| {
                    if state.idempotency_keys.contains_key(&key.key) {
                        return Err(RepoError::Conflict {
                            constraint: "idempotency_keys_key",
                        });
                    }
                    state.idempotency_keys.insert(
                        key.key.clone(),
                        IdempotencyKey {
                            key: key.key,
                            request_hash: key.request_hash,
                            event_id: None,
                            event_ulid: None,
                            created_at: OffsetDateTime::now_utc(),
                        },
                    );
                    Ok(())
                })
                .await
            }

            async fn update_idempotency_key_event(
                &self,
                key: &str,
                event_id: i64,
                event_ulid: Ulid,
            ) -> RepoResult<()> {
                self.with(|state| {
                    let record =
                        state.idempotency_keys.get_mut(key).ok_or(RepoError::NotFound)?;
                    record.event_id = Some(event_id);
                    record.event_ulid = Some(event_ulid);
                    Ok(())
                })
                .await
            }

            async fn upsert_place(&self, upsert: UpsertPlace) -> RepoResult<(Place, bool)> {
                self.with(|state| state.upsert_place(upsert)).await
            }

            async fn upsert_organization(
                &self,
                upsert: UpsertOrganization,
            ) -> RepoResult<(Organization, bool)> {
                self.with(|state| state.upsert_organization(upsert)).await
            }

            async fn find_similar_places(
                &self,
                key: &CanonicalKey,
                min_score: f64,
            ) -> RepoResult<Vec<SimilarCandidate>> {
                self.with(|state| {
                    let keys: Vec<(CanonicalKey, i64, Ulid, String)> = state
                        .places
                        .values()
                        .map(|p| (p.canonical_key(), p.id, p.ulid, p.name.clone()))
                        .collect();
                    Ok(State::find_similar(
                        key,
                        keys.iter().map(|(k, id, ulid, name)| (k, *id, *ulid, name.as_str())),
                        min_score,
                    ))
                })
                .await
            }

            async fn find_similar_organizations(
                &self,
                key: &CanonicalKey,
                min_score: f64,
            ) -> RepoResult<Vec<SimilarCandidate>> {
                self.with(|state| {
                    let keys: Vec<(CanonicalKey, i64, Ulid, String)> = state
                        .organizations
                        .values()
                        .map(|o| (o.canonical_key(), o.id, o.ulid, o.name.clone()))
                        .collect();
                    Ok(State::find_similar(
                        key,
                        keys.iter().map(|(k, id, ulid, name)| (k, *id, *ulid, name.as_str())),
                        min_score,
                    ))
                })
                .await
            }

            async fn merge_places(&self, primary_id: i64, duplicate_id: i64) -> RepoResult<()> {
                debug!(target: LOG_TARGET, primary_id, duplicate_id, "Merging places");
                self.with(|state| state.merge_places(primary_id, duplicate_id)).await
            }

            async fn merge_organizations(
                &self,
                primary_id: i64,
                duplicate_id: i64,
            ) -> RepoResult<()> {
                debug!(target: LOG_TARGET, primary_id, duplicate_id, "Merging organizations");
                self.with(|state| state.merge_organizations(primary_id, duplicate_id)).await
            }

            async fn find_near_duplicates(
                &self,
                name: &str,
                venue_id: i64,
                start_time: OffsetDateTime,
                min_score: f64,
            ) -> RepoResult<Vec<NearDuplicate>> {
                self.with(|state| {
                    Ok(state.find_near_duplicates(name, venue_id, start_time, min_score))
                })
                .await
            }

            async fn is_not_duplicate(&self, a: Ulid, b: Ulid) -> RepoResult<bool> {
                self.with(|state| Ok(state.not_duplicate_pairs.contains(&pair_key(a, b)))).await
            }

            async fn create_tombstone(&self, tombstone: NewTombstone) -> RepoResult<()> {
                self.with(|state| state.create_tombstone(tombstone)).await
            }

            async fn get_tombstone_by_event_id(
                &self,
                event_id: i64,
            ) -> RepoResult<Option<Tombstone>> {
                self.with(|state| {
                    Ok(state
                        .tombstones
                        .iter()
                        .find(|tombstone| tombstone.event_id == event_id)
                        .cloned())
                })
                .await
            }

            async fn get_tombstone_by_event_ulid(
                &self,
                ulid: Ulid,
            ) -> RepoResult<Option<Tombstone>> {
                self.with(|state| {
                    let Some(event) = state.event_by_ulid(ulid) else {
                        return Ok(None);
                    };
                    let event_id = event.id;
                    Ok(state
                        .tombstones
                        .iter()
                        .find(|tombstone| tombstone.event_id == event_id)
                        .cloned())
                })
                .await
            }

            async fn find_review_by_source(
                &self,
                source_id: i64,
                external_id: &str,
            ) -> RepoResult<Option<ReviewQueueEntry>> {
                self.with(|state| {
                    Ok(state.find_review(|entry| {
                        entry.source_id == Some(source_id)
                            && entry.source_external_id.as_deref() == Some(external_id)
                    }))
                })
                .await
            }

            async fn find_review_by_dedup(
                &self,
                dedup_hash: &DedupHash,
            ) -> RepoResult<Option<ReviewQueueEntry>> {
                self.with(|state| {
                    Ok(state.find_review(|entry| entry.dedup_hash == Some(*dedup_hash)))
                })
                .await
            }

            async fn create_review(&self, entry: NewReviewEntry) -> RepoResult<ReviewQueueEntry> {
                self.with(|state| state.create_review(entry)).await
            }

            async fn update_review_warnings(
                &self,
                review_id: i64,
                warnings: Vec<u8>,
                event_end_time: Option<OffsetDateTime>,
            ) -> RepoResult<()> {
                self.with(|state| state.update_review_warnings(review_id, warnings, event_end_time))
                    .await
            }

            async fn get_review(&self, review_id: i64) -> RepoResult<ReviewQueueEntry> {
                self.with(|state| {
                    state.reviews.get(&review_id).cloned().ok_or(RepoError::NotFound)
                })
                .await
            }

            async fn list_reviews(
                &self,
                status: Option<ReviewStatus>,
            ) -> RepoResult<Vec<ReviewQueueEntry>> {
                self.with(|state| {
                    Ok(state
                        .reviews
                        .values()
                        .filter(|entry| status.is_none_or(|status| entry.status == status))
                        .cloned()
                        .collect())
                })
                .await
            }

            async fn approve_review(&self, review_id: i64, reviewed_by: &str) -> RepoResult<()> {
                self.with(|state| {
                    state.transition_review(review_id, ReviewStatus::Approved, reviewed_by, None)
                })
                .await
            }

            async fn reject_review(
                &self,
                review_id: i64,
                reviewed_by: &str,
                reason: &str,
            ) -> RepoResult<()> {
                self.with(|state| {
                    state.transition_review(
                        review_id,
                        ReviewStatus::Rejected,
                        reviewed_by,
                        Some(reason),
                    )
                })
                .await
            }

            async fn mark_review_merged(
                &self,
                review_id: i64,
                reviewed_by: &str,
            ) -> RepoResult<()> {
                self.with(|state| {
                    state.transition_review(review_id, ReviewStatus::Merged, reviewed_by, None)
                })
                .await
            }

            async fn cleanup_expired_reviews(
                &self,
                older_than: OffsetDateTime,
            ) -> RepoResult<u64> {
                self.with(|state| Ok(state.cleanup_expired_reviews(older_than))).await
            }

            $($begin_tx)*
        }
    };
}

impl_mem_repository!(
    MemRepository,
    async fn begin_tx(&self) -> RepoResult<Box<dyn RepositoryTx>> {
        let snapshot = self.state.lock().await.clone();
        Ok(Box::new(MemTx {
            shared: Arc::clone(&self.state),
            working: Mutex::new(Some(snapshot)),
        }))
    }
);

impl_mem_repository!(
    MemTx,
    async fn begin_tx(&self) -> RepoResult<Box<dyn RepositoryTx>> {
        Err(RepoError::Storage {
            source: "nested transactions are not supported".into(),
        })
    }
);

#[async_trait]
impl RepositoryTx for MemTx {
    async fn commit(self: Box<Self>) -> RepoResult<()> {
        let working = self.working.lock().await.take().ok_or(RepoError::TxClosed)?;
        *self.shared.lock().await = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        self.working.lock().await.take().ok_or(RepoError::TxClosed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use togather_core::event::{EventDomain, License, LifecycleState};
    use togather_core::id::UlidGenerator;

    use super::*;

    fn new_event(ulid: Ulid, name: &str, hash: DedupHash) -> NewEvent {
        NewEvent {
            ulid,
            name: name.to_owned(),
            description: String::new(),
            license: License::default(),
            dedup_hash: hash,
            lifecycle_state: LifecycleState::Published,
            event_domain: EventDomain::General,
            organizer_id: None,
            primary_venue_id: None,
            virtual_url: String::new(),
            image_url: String::new(),
            public_url: String::new(),
            confidence: None,
            quality_score: None,
            keywords: vec![],
            federation_uri: None,
        }
    }

    fn hash(seed: &str) -> DedupHash {
        togather_core::dedup::DedupCandidate::new(seed, "", "").hash()
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn dedup_hash_unique_index() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        repo.create_event(new_event(ulids.generate(), "A", hash("a")))
            .await
            .expect("First insert");
        let err = repo
            .create_event(new_event(ulids.generate(), "A again", hash("a")))
            .await
            .expect_err("Duplicate hash");
        assert!(matches!(err, RepoError::Conflict { .. }));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn deleted_events_free_their_dedup_hash() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        let event = repo
            .create_event(new_event(ulids.generate(), "A", hash("a")))
            .await
            .expect("Insert");
        repo.soft_delete_event(event.id, OffsetDateTime::now_utc())
            .await
            .expect("Delete");

        assert_eq!(repo.find_by_dedup_hash(&hash("a")).await.expect("Query"), None);
        repo.create_event(new_event(ulids.generate(), "A", hash("a")))
            .await
            .expect("Hash is free again");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn upsert_place_returns_existing_row() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        let (first, created) = repo
            .upsert_place(UpsertPlace {
                ulid: ulids.generate(),
                name: "The Fox Theater".into(),
                locality: "Oakland".into(),
                region: "CA".into(),
                country: "US".into(),
            })
            .await
            .expect("Upsert");
        assert!(created);

        let proposed = ulids.generate();
        let (second, created) = repo
            .upsert_place(UpsertPlace {
                ulid: proposed,
                name: "  the fox theater ".into(),
                locality: "OAKLAND".into(),
                region: "ca".into(),
                country: "us".into(),
            })
            .await
            .expect("Upsert");
        assert!(!created);
        assert_eq!(second.ulid, first.ulid);
        assert_ne!(second.ulid, proposed);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn tx_rollback_leaves_shared_state_untouched() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        let tx = repo.begin_tx().await.expect("Begin");
        tx.create_event(new_event(ulids.generate(), "A", hash("a")))
            .await
            .expect("Insert inside tx");
        tx.rollback().await.expect("Rollback");

        assert_eq!(repo.find_by_dedup_hash(&hash("a")).await.expect("Query"), None);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn tx_commit_publishes_and_closes_handle() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        let tx = repo.begin_tx().await.expect("Begin");
        tx.create_event(new_event(ulids.generate(), "A", hash("a")))
            .await
            .expect("Insert inside tx");

        // Not visible before commit.
        assert_eq!(repo.find_by_dedup_hash(&hash("a")).await.expect("Query"), None);

        tx.commit().await.expect("Commit");
        assert!(repo.find_by_dedup_hash(&hash("a")).await.expect("Query").is_some());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn closed_tx_fails_loudly() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        let tx = repo.begin_tx().await.expect("Begin");
        let probe = new_event(ulids.generate(), "A", hash("a"));

        // Keep a second handle around after commit via Box::leak-free
        // route: commit consumes the box, so re-begin and roll back
        // to exercise the closed path on a fresh handle.
        tx.rollback().await.expect("Rollback");

        let tx = repo.begin_tx().await.expect("Begin");
        tx.create_event(probe).await.expect("Open tx works");
        let res = Box::new(MemTx {
            shared: Arc::new(Mutex::new(State::default())),
            working: Mutex::new(None),
        })
        .commit()
        .await;
        assert!(matches!(res, Err(RepoError::TxClosed)));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn one_pending_review_per_dedup_key() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        let event = repo
            .create_event(new_event(ulids.generate(), "A", hash("a")))
            .await
            .expect("Insert");

        let entry = NewReviewEntry {
            event_id: event.id,
            event_ulid: event.ulid,
            warnings: vec![],
            dedup_hash: Some(hash("a")),
            source_id: None,
            source_external_id: None,
            event_end_time: None,
        };
        repo.create_review(entry.clone()).await.expect("First entry");
        let err = repo.create_review(entry).await.expect_err("Second pending");
        assert!(matches!(err, RepoError::Conflict { .. }));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn terminal_review_never_transitions() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        let event = repo
            .create_event(new_event(ulids.generate(), "A", hash("a")))
            .await
            .expect("Insert");
        let entry = repo
            .create_review(NewReviewEntry {
                event_id: event.id,
                event_ulid: event.ulid,
                warnings: vec![],
                dedup_hash: Some(hash("a")),
                source_id: None,
                source_external_id: None,
                event_end_time: None,
            })
            .await
            .expect("Create");

        repo.approve_review(entry.id, "mod").await.expect("Approve");
        let err = repo
            .reject_review(entry.id, "mod", "nope")
            .await
            .expect_err("Terminal");
        assert!(matches!(err, RepoError::Conflict { .. }));
        assert_eq!(
            repo.get_review(entry.id).await.expect("Get").status,
            ReviewStatus::Approved
        );
    }

    #[test]
    fn trigram_similarity_behaves() {
        assert!((trigram_similarity("jazz night", "jazz night") - 1.0).abs() < f64::EPSILON);
        assert!(trigram_similarity("jazz night", "pottery class") < 0.2);

        let close = trigram_similarity("The Fox Theater Oakland", "Fox Theater Oakland");
        assert!(0.5 < close, "expected similar, got {close}");
        assert!(close < 1.0, "expected not identical, got {close}");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn near_duplicates_respect_window_and_venue() {
        let repo = MemRepository::new();
        let ulids = UlidGenerator::new();

        let (venue, _) = repo
            .upsert_place(UpsertPlace {
                ulid: ulids.generate(),
                name: "The Fox".into(),
                locality: "Oakland".into(),
                region: "CA".into(),
                country: "US".into(),
            })
            .await
            .expect("Upsert");

        let start = OffsetDateTime::now_utc() + Duration::days(7);
        let mut event = new_event(ulids.generate(), "Jazz Night at the Fox", hash("a"));
        event.primary_venue_id = Some(venue.id);
        let event = repo.create_event(event).await.expect("Insert");
        repo.create_occurrence(NewOccurrence {
            event_id: event.id,
            start_time: start,
            end_time: None,
            timezone: "UTC".into(),
            door_time: None,
            venue_id: Some(venue.id),
            virtual_url: String::new(),
        })
        .await
        .expect("Occurrence");

        let hits = repo
            .find_near_duplicates("Jazz Night at the Fox!", venue.id, start, 0.3)
            .await
            .expect("Query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].event_id, event.id);

        // Outside the window: no hit.
        let hits = repo
            .find_near_duplicates(
                "Jazz Night at the Fox!",
                venue.id,
                start + Duration::days(3),
                0.3,
            )
            .await
            .expect("Query");
        assert!(hits.is_empty());

        // Different venue: no hit.
        let hits = repo
            .find_near_duplicates("Jazz Night at the Fox!", venue.id + 1, start, 0.3)
            .await
            .expect("Query");
        assert!(hits.is_empty());
    }
}
