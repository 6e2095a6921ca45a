//! End-to-end ingestion of event submissions.
//!
//! One call to [`IngestService::ingest`] takes a submission through
//! validation, dedup (exact source id, then dedup hash, then fuzzy
//! neighbors), place/organization resolution, quality scoring, and
//! review-queue reconciliation, and persists whatever survives. The
//! ordering is deliberate: the exact source match short-circuits
//! before any fuzzy work so scraper re-runs stay cheap and
//! idempotent, and the dedup-hash match short-circuits before the
//! near-duplicate scan.

pub mod config;
pub mod merge;
pub mod quality;
mod resolve;
mod review;
pub mod submission;

use std::sync::Arc;

use snafu::Snafu;
use time::OffsetDateTime;
use togather_core::dedup::{DedupCandidate, DedupHash, venue_key};
use togather_core::event::{Event, LifecycleState};
use togather_core::id::UlidGenerator;
use togather_core::idempotency;
use togather_core::review::ReviewQueueEntry;
use togather_core::source::{Source, TrustLevel};
use togather_core::tombstone::event_uri;
use togather_core::warning::{QualityWarning, WarningCode, encode_warnings};
use togather_repo::{
    NewEvent, NewEventSource, NewIdempotencyKey, NewOccurrence, NewReviewEntry, RepoError,
    Repository, RepositoryTx, SourceLookup,
};
use togather_util_error::FmtCompact as _;
use tracing::{debug, info, warn};

pub use crate::config::{ConfigError, FuzzyThresholds, IngestConfig};
use crate::merge::auto_merge_fields;
use crate::quality::QualityReport;
use crate::review::Reconciliation;
pub use crate::submission::{
    EventSubmission, OrganizationInput, PlaceInput, SourceBlock, SubmissionError,
};
use crate::submission::ValidSubmission;

const LOG_TARGET: &str = "togather::ingest";

/// Reviewer name recorded when a clean resubmission auto-approves a
/// pending entry.
const AUTO_REVIEWER: &str = "system:auto-approve";

#[derive(Debug, Snafu)]
pub enum IngestError {
    #[snafu(transparent)]
    Validation { source: SubmissionError },
    #[snafu(display("Submission was previously rejected: {reason}"))]
    PreviouslyRejected {
        reason: String,
        reviewed_at: Option<OffsetDateTime>,
        reviewed_by: Option<String>,
    },
    #[snafu(display("Idempotency key {key} was already used for a different request"))]
    IdempotencyKeyReused { key: String },
    #[snafu(transparent)]
    Repo { source: RepoError },
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// The business outcome of one ingest. Warnings and `needs_review`
/// are results, not errors: a warned ingest still succeeded.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub event: Event,
    /// The submission resolved to an already-known event.
    pub is_duplicate: bool,
    /// The trust merge changed at least one field.
    pub is_merged: bool,
    /// The submission sits in the review queue.
    pub needs_review: bool,
    pub warnings: Vec<QualityWarning>,
}

/// Which lookup identified an existing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    SourceExternalId,
    DedupHash,
}

pub struct IngestService {
    repo: Arc<dyn Repository>,
    config: IngestConfig,
    ulids: UlidGenerator,
}

impl IngestService {
    pub fn new(repo: Arc<dyn Repository>, config: IngestConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            repo,
            config,
            ulids: UlidGenerator::new(),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Processes one submission end to end.
    pub async fn ingest(&self, submission: &EventSubmission) -> IngestResult<IngestOutcome> {
        let now = OffsetDateTime::now_utc();
        let valid = submission.validate(&self.config, now)?;
        let payload = submission.canonical_bytes();

        // A replayed idempotency key returns the original result
        // without touching anything. The stored request hash guards
        // against the key being recycled for a different payload:
        // that gets an error, never another request's event.
        if let Some(key) = submission.idempotency_key.as_deref() {
            if let Some(record) = self.repo.get_idempotency_key(key).await? {
                if record.request_hash != idempotency::request_hash(&payload) {
                    warn!(
                        target: LOG_TARGET,
                        key,
                        "Idempotency key reused with a different payload"
                    );
                    return Err(IngestError::IdempotencyKeyReused {
                        key: key.to_owned(),
                    });
                }
                if let Some(ulid) = record.event_ulid {
                    let event = self.repo.get_event_by_ulid(ulid).await?;
                    debug!(target: LOG_TARGET, key, ulid = %ulid, "Idempotency key replay");
                    return Ok(IngestOutcome {
                        event,
                        is_duplicate: true,
                        is_merged: false,
                        needs_review: false,
                        warnings: vec![],
                    });
                }
            }
        }

        let venue = valid
            .location
            .as_ref()
            .map(|l| venue_key(&l.name, &l.locality))
            .unwrap_or_default();
        let dedup_hash =
            DedupCandidate::new(valid.name.clone(), venue, valid.start_date_string()).hash();

        let source = match &valid.source {
            Some(block) => Some(
                self.repo
                    .get_or_create_source(&SourceLookup {
                        name: block.name.clone(),
                        url: block.url.clone(),
                    })
                    .await?,
            ),
            None => None,
        };
        let incoming_trust = match &source {
            Some(source) => {
                self.repo
                    .get_source_trust_level_by_source_id(source.id)
                    .await?
            }
            None => self.config.default_trust,
        };

        // Layer 1: exact (source, external id) match.
        if let (Some(source), Some(block)) = (&source, &valid.source) {
            let external_id = block.external_id.trim();
            if !external_id.is_empty() {
                if let Some(existing) = self
                    .repo
                    .find_by_source_external_id(source.id, external_id)
                    .await?
                {
                    return self
                        .merge_into_existing(
                            existing,
                            &valid,
                            incoming_trust,
                            MatchKind::SourceExternalId,
                        )
                        .await;
                }
            }
        }

        // Layer 2: dedup-hash match.
        if let Some(existing) = self.repo.find_by_dedup_hash(&dedup_hash).await? {
            return self
                .merge_into_existing(existing, &valid, incoming_trust, MatchKind::DedupHash)
                .await;
        }

        // Layer 3: fuzzy place/organization resolution, then the
        // near-duplicate scan over events at the resolved venue.
        let mut warnings = Vec::new();

        let mut venue_id = None;
        if let Some(location) = &valid.location {
            let (id, warning) = resolve::resolve_place(
                self.repo.as_ref(),
                location,
                self.ulids.generate(),
                self.config.place_thresholds,
            )
            .await?;
            venue_id = Some(id);
            warnings.extend(warning);
        }

        let mut organizer_id = None;
        if let Some(organizer) = &valid.organizer {
            let (id, warning) = resolve::resolve_organization(
                self.repo.as_ref(),
                organizer,
                self.ulids.generate(),
                self.config.org_thresholds,
            )
            .await?;
            organizer_id = Some(id);
            warnings.extend(warning);
        }

        let prior_review = self.find_prior_review(&source, &valid, &dedup_hash).await?;

        warnings.extend(
            self.near_duplicate_warning(&valid, venue_id, prior_review.as_ref())
                .await?,
        );

        let report = quality::evaluate(&valid, &self.config);
        warnings.extend(report.warnings.clone());

        match review::reconcile(prior_review.as_ref(), &warnings, now) {
            Reconciliation::RefusePreviouslyRejected(entry) => {
                info!(
                    target: LOG_TARGET,
                    review_id = entry.id,
                    event = %entry.event_ulid,
                    "Refusing resubmission of a rejected event"
                );
                Err(IngestError::PreviouslyRejected {
                    reason: entry.rejection_reason.unwrap_or_default(),
                    reviewed_at: entry.reviewed_at,
                    reviewed_by: entry.reviewed_by,
                })
            }
            Reconciliation::ApproveExisting(entry) => {
                self.approve_existing(entry, &valid, incoming_trust, warnings)
                    .await
            }
            Reconciliation::RefreshPending(entry) => {
                self.repo
                    .update_review_warnings(entry.id, encode_warnings(&warnings), valid.end)
                    .await?;
                let event = self.repo.get_event_by_ulid(entry.event_ulid).await?;
                debug!(
                    target: LOG_TARGET,
                    review_id = entry.id,
                    event = %event.ulid,
                    "Refreshed pending review warnings"
                );
                Ok(IngestOutcome {
                    event,
                    is_duplicate: true,
                    is_merged: false,
                    needs_review: true,
                    warnings,
                })
            }
            Reconciliation::CreatePublished => {
                self.create_new_event(
                    &valid,
                    &payload,
                    dedup_hash,
                    source.as_ref(),
                    incoming_trust,
                    venue_id,
                    organizer_id,
                    &report,
                    warnings,
                    false,
                    submission.idempotency_key.as_deref(),
                )
                .await
            }
            Reconciliation::CreatePending => {
                self.create_new_event(
                    &valid,
                    &payload,
                    dedup_hash,
                    source.as_ref(),
                    incoming_trust,
                    venue_id,
                    organizer_id,
                    &report,
                    warnings,
                    true,
                    submission.idempotency_key.as_deref(),
                )
                .await
            }
        }
    }

    /// Trust-merges the submission into an event found by an exact
    /// lookup. No review entry is created: the exact match is
    /// authoritative.
    async fn merge_into_existing(
        &self,
        existing: Event,
        valid: &ValidSubmission,
        incoming_trust: TrustLevel,
        kind: MatchKind,
    ) -> IngestResult<IngestOutcome> {
        let existing_trust = self.repo.get_source_trust_level(existing.id).await?;
        let (changes, changed) =
            auto_merge_fields(&existing, valid, existing_trust, incoming_trust);

        let event = if changed {
            self.repo.update_event(existing.id, &changes).await?
        } else {
            existing
        };
        info!(
            target: LOG_TARGET,
            event = %event.ulid,
            ?kind,
            merged = changed,
            existing_trust = %existing_trust,
            incoming_trust = %incoming_trust,
            "Duplicate submission resolved to existing event"
        );

        // Quality findings are still reported for a hash match, but
        // they never queue the event for review.
        let warnings = match kind {
            MatchKind::DedupHash => quality::evaluate(valid, &self.config).warnings,
            MatchKind::SourceExternalId => vec![],
        };
        Ok(IngestOutcome {
            event,
            is_duplicate: true,
            is_merged: changed,
            needs_review: false,
            warnings,
        })
    }

    async fn find_prior_review(
        &self,
        source: &Option<Source>,
        valid: &ValidSubmission,
        dedup_hash: &DedupHash,
    ) -> IngestResult<Option<ReviewQueueEntry>> {
        if let (Some(source), Some(block)) = (source, &valid.source) {
            let external_id = block.external_id.trim();
            if !external_id.is_empty() {
                if let Some(entry) = self
                    .repo
                    .find_review_by_source(source.id, external_id)
                    .await?
                {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(self.repo.find_review_by_dedup(dedup_hash).await?)
    }

    /// Scans for similar events at the same venue and start window.
    /// Skipped without a venue; degraded to "no warning" on lookup
    /// failure; pairs a reviewer already cleared are ignored.
    async fn near_duplicate_warning(
        &self,
        valid: &ValidSubmission,
        venue_id: Option<i64>,
        prior_review: Option<&ReviewQueueEntry>,
    ) -> IngestResult<Option<QualityWarning>> {
        let Some(venue_id) = venue_id else {
            return Ok(None);
        };
        if self.config.near_duplicate_threshold <= 0.0 {
            return Ok(None);
        }

        let candidates = match self
            .repo
            .find_near_duplicates(
                &valid.name,
                venue_id,
                valid.start,
                self.config.near_duplicate_threshold,
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Near-duplicate lookup failed, continuing without it"
                );
                return Ok(None);
            }
        };

        for candidate in candidates {
            if let Some(prior) = prior_review {
                if candidate.ulid == prior.event_ulid {
                    // The submission's own under-review event.
                    continue;
                }
                if self
                    .repo
                    .is_not_duplicate(prior.event_ulid, candidate.ulid)
                    .await?
                {
                    debug!(
                        target: LOG_TARGET,
                        candidate = %candidate.ulid,
                        "Skipping candidate a reviewer marked not-duplicate"
                    );
                    continue;
                }
            }
            return Ok(Some(QualityWarning::with_candidate(
                WarningCode::PotentialDuplicate,
                format!(
                    "similar event \"{}\" at the same venue and date",
                    candidate.name
                ),
                candidate.ulid,
                candidate.score,
            )));
        }
        Ok(None)
    }

    /// Clean resubmission of a pending entry: approve the entry,
    /// gap-fill the event, publish it. One transaction.
    async fn approve_existing(
        &self,
        entry: ReviewQueueEntry,
        valid: &ValidSubmission,
        incoming_trust: TrustLevel,
        warnings: Vec<QualityWarning>,
    ) -> IngestResult<IngestOutcome> {
        let tx = self.repo.begin_tx().await?;
        let result = self
            .approve_existing_tx(&*tx, &entry, valid, incoming_trust)
            .await;
        match result {
            Ok(event) => {
                tx.commit().await?;
                info!(
                    target: LOG_TARGET,
                    review_id = entry.id,
                    event = %event.ulid,
                    "Approved pending review on clean resubmission"
                );
                Ok(IngestOutcome {
                    event,
                    is_duplicate: true,
                    is_merged: false,
                    needs_review: false,
                    warnings,
                })
            }
            Err(err) => {
                rollback_logged(tx).await;
                Err(err)
            }
        }
    }

    async fn approve_existing_tx(
        &self,
        tx: &dyn RepositoryTx,
        entry: &ReviewQueueEntry,
        valid: &ValidSubmission,
        incoming_trust: TrustLevel,
    ) -> IngestResult<Event> {
        let event = tx.get_event_by_ulid(entry.event_ulid).await?;
        let existing_trust = tx.get_source_trust_level(event.id).await?;
        let (mut changes, _) = auto_merge_fields(&event, valid, existing_trust, incoming_trust);
        changes.lifecycle_state = Some(LifecycleState::Published);

        tx.approve_review(entry.id, AUTO_REVIEWER).await?;
        Ok(tx.update_event(event.id, &changes).await?)
    }

    /// Creates the event, its occurrence, the source edge, the review
    /// entry when queued, and the idempotency record. One
    /// transaction; a dedup-hash race falls back to the read path.
    #[allow(clippy::too_many_arguments)]
    async fn create_new_event(
        &self,
        valid: &ValidSubmission,
        payload: &[u8],
        dedup_hash: DedupHash,
        source: Option<&Source>,
        incoming_trust: TrustLevel,
        venue_id: Option<i64>,
        organizer_id: Option<i64>,
        report: &QualityReport,
        warnings: Vec<QualityWarning>,
        pending: bool,
        idempotency_key: Option<&str>,
    ) -> IngestResult<IngestOutcome> {
        let tx = self.repo.begin_tx().await?;
        let result = self
            .create_new_event_tx(
                &*tx,
                valid,
                payload,
                dedup_hash,
                source,
                venue_id,
                organizer_id,
                report,
                &warnings,
                pending,
                idempotency_key,
            )
            .await;

        let err = match result {
            Ok(event) => {
                tx.commit().await?;
                info!(
                    target: LOG_TARGET,
                    event = %event.ulid,
                    lifecycle = %event.lifecycle_state,
                    needs_review = pending,
                    "Ingested new event"
                );
                return Ok(IngestOutcome {
                    event,
                    is_duplicate: false,
                    is_merged: false,
                    needs_review: pending,
                    warnings,
                });
            }
            Err(err) => err,
        };
        rollback_logged(tx).await;

        if matches!(
            err,
            IngestError::Repo {
                source: RepoError::Conflict { .. }
            }
        ) {
            // Lost a dedup-hash race to a concurrent writer: the row
            // now exists, so take the read path against it.
            if let Some(existing) = self.repo.find_by_dedup_hash(&dedup_hash).await? {
                debug!(
                    target: LOG_TARGET,
                    event = %existing.ulid,
                    "Dedup-hash insert race lost, merging into winner"
                );
                return self
                    .merge_into_existing(existing, valid, incoming_trust, MatchKind::DedupHash)
                    .await;
            }
        }
        Err(err)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_new_event_tx(
        &self,
        tx: &dyn RepositoryTx,
        valid: &ValidSubmission,
        payload: &[u8],
        dedup_hash: DedupHash,
        source: Option<&Source>,
        venue_id: Option<i64>,
        organizer_id: Option<i64>,
        report: &QualityReport,
        warnings: &[QualityWarning],
        pending: bool,
        idempotency_key: Option<&str>,
    ) -> IngestResult<Event> {
        let ulid = self.ulids.generate();
        let event = tx
            .create_event(NewEvent {
                ulid,
                name: valid.name.clone(),
                description: valid.description.clone(),
                license: valid.license.clone(),
                dedup_hash,
                lifecycle_state: if pending {
                    LifecycleState::PendingReview
                } else {
                    LifecycleState::Published
                },
                event_domain: valid.event_domain.unwrap_or_default(),
                organizer_id,
                primary_venue_id: venue_id,
                virtual_url: valid.virtual_url.clone(),
                image_url: valid.image_url.clone(),
                public_url: valid.public_url.clone(),
                confidence: Some(report.confidence),
                quality_score: Some(report.quality_score),
                keywords: valid.keywords.clone(),
                federation_uri: Some(event_uri(ulid)),
            })
            .await?;

        tx.create_occurrence(NewOccurrence {
            event_id: event.id,
            start_time: valid.start,
            end_time: valid.end,
            timezone: valid.timezone.clone(),
            door_time: valid.door_time,
            venue_id,
            virtual_url: valid.virtual_url.clone(),
        })
        .await?;

        if let (Some(source), Some(block)) = (source, &valid.source) {
            tx.create_event_source(NewEventSource {
                event_id: event.id,
                source_id: source.id,
                external_id: block.external_id.trim().to_owned(),
                raw_payload: payload.to_vec(),
            })
            .await?;
        }

        if pending {
            tx.create_review(NewReviewEntry {
                event_id: event.id,
                event_ulid: event.ulid,
                warnings: encode_warnings(warnings),
                dedup_hash: Some(dedup_hash),
                source_id: source.map(|s| s.id),
                source_external_id: valid
                    .source
                    .as_ref()
                    .map(|block| block.external_id.trim().to_owned())
                    .filter(|id| !id.is_empty()),
                event_end_time: valid.end,
            })
            .await?;
        }

        if let Some(key) = idempotency_key {
            tx.insert_idempotency_key(NewIdempotencyKey {
                key: key.to_owned(),
                request_hash: idempotency::request_hash(payload),
            })
            .await?;
            tx.update_idempotency_key_event(key, event.id, event.ulid)
                .await?;
        }

        // Re-read so the returned event carries its occurrence.
        Ok(tx.get_event_by_ulid(event.ulid).await?)
    }
}

/// Rolls a transaction back, logging rather than masking the
/// original error when rollback itself fails.
async fn rollback_logged(tx: Box<dyn RepositoryTx>) {
    if let Err(err) = tx.rollback().await {
        warn!(
            target: LOG_TARGET,
            err = %err.fmt_compact(),
            "Transaction rollback failed"
        );
    }
}
