//! Admin-mediated event operations: updates, publish state, soft
//! deletes, and the duplicate merge that emits a federation-visible
//! tombstone.
//!
//! Every multi-statement operation runs inside one repository
//! transaction; on any error the transaction is rolled back before
//! the error surfaces, so a failed merge leaves the duplicate
//! untouched and tombstone-free.

use std::str::FromStr as _;
use std::sync::Arc;

use snafu::Snafu;
use time::OffsetDateTime;
use togather_core::event::{Event, EventDomain, LifecycleState};
use togather_core::filter::{FilterError, RawEventQuery};
use togather_core::id::Ulid;
use togather_core::tombstone::{REASON_DUPLICATE_MERGED, Tombstone, TombstonePayload, event_uri};
use togather_repo::{EventChanges, NewTombstone, RepoError, Repository, RepositoryTx};
use togather_util_error::FmtCompact as _;
use tracing::{info, warn};
use url::Url;

const LOG_TARGET: &str = "togather::admin";

pub const NAME_MAX_LEN: usize = 500;

#[derive(Debug, Snafu)]
pub enum AdminError {
    #[snafu(display("Event not found: {ulid}"))]
    NotFound { ulid: Ulid },
    #[snafu(display("Cannot merge an event into itself"))]
    CannotMergeSameEvent,
    #[snafu(display("Event is deleted: {ulid}"))]
    EventDeleted { ulid: Ulid },
    #[snafu(display("Invalid update params: {message}"))]
    InvalidUpdateParams { message: String },
    #[snafu(transparent)]
    Filter { source: FilterError },
    #[snafu(transparent)]
    Repo { source: RepoError },
}

pub type AdminResult<T> = std::result::Result<T, AdminError>;

/// Admin update surface. `None` leaves a field untouched; a present
/// value is validated and written, `Some("")` clears a clearable
/// field. Lifecycle and domain arrive as strings and must parse into
/// the allowed sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateEventParams {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub public_url: Option<String>,
    pub lifecycle_state: Option<String>,
    pub event_domain: Option<String>,
    pub keywords: Option<Vec<String>>,
}

pub struct AdminService {
    repo: Arc<dyn Repository>,
    require_https: bool,
}

impl AdminService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            require_https: true,
        }
    }

    /// Accept plain-http URLs in update params (mirrors the ingest
    /// configuration knob).
    pub fn allow_http_urls(mut self) -> Self {
        self.require_https = false;
        self
    }

    /// Listing with the public filter surface.
    pub async fn list_events(
        &self,
        query: &RawEventQuery,
    ) -> AdminResult<(Vec<Event>, Option<Ulid>)> {
        let (filters, page) = togather_core::filter::EventFilters::parse(query)?;
        Ok(self.repo.list_events(&filters, &page).await?)
    }

    pub async fn get_event(&self, ulid: Ulid) -> AdminResult<Event> {
        self.get_required(ulid).await
    }

    /// Validates, diffs, and persists admin edits. A no-op diff
    /// returns the stored event unchanged without writing. Read and
    /// write share one transaction so the diff cannot go stale.
    pub async fn update_event(&self, ulid: Ulid, params: &UpdateEventParams) -> AdminResult<Event> {
        let changes = self.validate_update(params)?;

        let tx = self.repo.begin_tx().await?;
        let result = update_event_tx(&*tx, ulid, changes).await;
        match result {
            Ok((event, changed)) => {
                tx.commit().await?;
                if changed {
                    info!(target: LOG_TARGET, event = %ulid, "Updated event");
                }
                Ok(event)
            }
            Err(err) => {
                rollback_logged(tx).await;
                Err(err)
            }
        }
    }

    /// Idempotent shorthand for setting lifecycle `published`.
    pub async fn publish_event(&self, ulid: Ulid) -> AdminResult<Event> {
        self.set_lifecycle(ulid, LifecycleState::Published).await
    }

    /// Idempotent shorthand for setting lifecycle `draft`.
    pub async fn unpublish_event(&self, ulid: Ulid) -> AdminResult<Event> {
        self.set_lifecycle(ulid, LifecycleState::Draft).await
    }

    async fn set_lifecycle(&self, ulid: Ulid, state: LifecycleState) -> AdminResult<Event> {
        let changes = EventChanges {
            lifecycle_state: Some(state),
            ..Default::default()
        };

        let tx = self.repo.begin_tx().await?;
        let result = update_event_tx(&*tx, ulid, changes).await;
        match result {
            Ok((event, changed)) => {
                tx.commit().await?;
                if changed {
                    info!(target: LOG_TARGET, event = %ulid, lifecycle = %state, "Changed lifecycle");
                }
                Ok(event)
            }
            Err(err) => {
                rollback_logged(tx).await;
                Err(err)
            }
        }
    }

    /// Soft-deletes the event and emits its tombstone, atomically.
    pub async fn delete_event(&self, ulid: Ulid, reason: &str) -> AdminResult<()> {
        let tx = self.repo.begin_tx().await?;
        let result = delete_event_tx(&*tx, ulid, reason).await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                info!(target: LOG_TARGET, event = %ulid, reason, "Deleted event");
                Ok(())
            }
            Err(err) => {
                rollback_logged(tx).await;
                Err(err)
            }
        }
    }

    /// Folds `duplicate` into `primary`: the duplicate is
    /// soft-deleted with `merged_into_id` set and gets a tombstone
    /// naming the primary as `supersededBy`. All or nothing.
    pub async fn merge_events(&self, primary: Ulid, duplicate: Ulid) -> AdminResult<Event> {
        self.merge_events_inner(primary, duplicate, None).await
    }

    /// [`Self::merge_events`] plus review bookkeeping: the primary is
    /// enriched from the duplicate's fields (gap-fill only, a merge
    /// decision is not a trust statement) and the review entry is
    /// marked `merged`.
    pub async fn merge_events_with_review(
        &self,
        primary: Ulid,
        duplicate: Ulid,
        review_id: i64,
        actor: &str,
    ) -> AdminResult<Event> {
        self.merge_events_inner(primary, duplicate, Some((review_id, actor)))
            .await
    }

    async fn merge_events_inner(
        &self,
        primary: Ulid,
        duplicate: Ulid,
        review: Option<(i64, &str)>,
    ) -> AdminResult<Event> {
        if primary == duplicate {
            return Err(AdminError::CannotMergeSameEvent);
        }

        let tx = self.repo.begin_tx().await?;
        let result = merge_events_tx(&*tx, primary, duplicate, review).await;
        match result {
            Ok(event) => {
                tx.commit().await?;
                info!(
                    target: LOG_TARGET,
                    primary = %primary,
                    duplicate = %duplicate,
                    with_review = review.is_some(),
                    "Merged duplicate event"
                );
                Ok(event)
            }
            Err(err) => {
                rollback_logged(tx).await;
                Err(err)
            }
        }
    }

    pub async fn get_tombstone(&self, ulid: Ulid) -> AdminResult<Option<Tombstone>> {
        Ok(self.repo.get_tombstone_by_event_ulid(ulid).await?)
    }

    /// Drops pending review entries whose event ended before
    /// `older_than`. Invoked periodically from outside the core.
    pub async fn cleanup_expired_reviews(&self, older_than: OffsetDateTime) -> AdminResult<u64> {
        let removed = self.repo.cleanup_expired_reviews(older_than).await?;
        if 0 < removed {
            info!(target: LOG_TARGET, removed, "Cleaned up expired reviews");
        }
        Ok(removed)
    }

    async fn get_required(&self, ulid: Ulid) -> AdminResult<Event> {
        get_required_on(self.repo.as_ref(), ulid).await
    }

    fn validate_update(&self, params: &UpdateEventParams) -> AdminResult<EventChanges> {
        let mut changes = EventChanges::default();

        if let Some(name) = &params.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(AdminError::InvalidUpdateParams {
                    message: "name must not be empty".into(),
                });
            }
            if NAME_MAX_LEN < name.chars().count() {
                return Err(AdminError::InvalidUpdateParams {
                    message: format!("name exceeds {NAME_MAX_LEN} chars"),
                });
            }
            changes.name = Some(name.to_owned());
        }

        if let Some(description) = &params.description {
            changes.description = Some(description.trim().to_owned());
        }
        if let Some(image_url) = &params.image_url {
            changes.image_url = Some(self.validate_url("image_url", image_url)?);
        }
        if let Some(public_url) = &params.public_url {
            changes.public_url = Some(self.validate_url("public_url", public_url)?);
        }

        if let Some(state) = &params.lifecycle_state {
            let state = LifecycleState::from_str(state.trim()).map_err(|err| {
                AdminError::InvalidUpdateParams {
                    message: err.to_string(),
                }
            })?;
            // Deletion goes through `delete_event`, which also emits
            // the tombstone.
            if state == LifecycleState::Deleted {
                return Err(AdminError::InvalidUpdateParams {
                    message: "lifecycle_state deleted is set by delete, not update".into(),
                });
            }
            changes.lifecycle_state = Some(state);
        }

        if let Some(domain) = &params.event_domain {
            let domain = EventDomain::from_str(domain.trim()).map_err(|err| {
                AdminError::InvalidUpdateParams {
                    message: err.to_string(),
                }
            })?;
            changes.event_domain = Some(domain);
        }

        if let Some(keywords) = &params.keywords {
            changes.keywords = Some(
                keywords
                    .iter()
                    .map(|k| k.trim())
                    .filter(|k| !k.is_empty())
                    .map(str::to_owned)
                    .collect(),
            );
        }

        Ok(changes)
    }

    fn validate_url(&self, field: &'static str, value: &str) -> AdminResult<String> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(String::new());
        }
        let parsed = Url::parse(value).map_err(|_| AdminError::InvalidUpdateParams {
            message: format!("invalid {field}: {value}"),
        })?;
        match parsed.scheme() {
            "https" => {}
            "http" if !self.require_https => {}
            _ => {
                return Err(AdminError::InvalidUpdateParams {
                    message: format!("{field} must use https: {value}"),
                });
            }
        }
        Ok(value.to_owned())
    }
}

async fn get_required_on<R: Repository + ?Sized>(repo: &R, ulid: Ulid) -> AdminResult<Event> {
    match repo.get_event_by_ulid(ulid).await {
        Ok(event) => Ok(event),
        Err(RepoError::NotFound) => Err(AdminError::NotFound { ulid }),
        Err(err) => Err(err.into()),
    }
}

/// Fetch, diff, and write inside the caller's transaction. Returns
/// the event and whether anything was written.
async fn update_event_tx(
    tx: &dyn RepositoryTx,
    ulid: Ulid,
    changes: EventChanges,
) -> AdminResult<(Event, bool)> {
    let existing = get_required_on(tx, ulid).await?;
    if existing.is_deleted() {
        return Err(AdminError::EventDeleted { ulid });
    }

    let changes = diff_changes(&existing, changes);
    if changes.is_empty() {
        return Ok((existing, false));
    }
    let updated = tx.update_event(existing.id, &changes).await?;
    Ok((updated, true))
}

async fn delete_event_tx(tx: &dyn RepositoryTx, ulid: Ulid, reason: &str) -> AdminResult<()> {
    let event = get_required_on(tx, ulid).await?;
    if event.is_deleted() {
        return Err(AdminError::EventDeleted { ulid });
    }

    let now = OffsetDateTime::now_utc();
    tx.soft_delete_event(event.id, now).await?;

    let payload = TombstonePayload::new(event.ulid, &event.name, reason, now, None);
    tx.create_tombstone(NewTombstone {
        event_id: event.id,
        event_uri: event_uri(event.ulid),
        deleted_at: now,
        reason: reason.to_owned(),
        superseded_by: None,
        payload: payload.to_bytes(),
    })
    .await?;
    Ok(())
}

async fn merge_events_tx(
    tx: &dyn RepositoryTx,
    primary: Ulid,
    duplicate: Ulid,
    review: Option<(i64, &str)>,
) -> AdminResult<Event> {
    let primary_event = match tx.get_event_by_ulid(primary).await {
        Ok(event) => event,
        Err(RepoError::NotFound) => return Err(AdminError::NotFound { ulid: primary }),
        Err(err) => return Err(err.into()),
    };
    let duplicate_event = match tx.get_event_by_ulid(duplicate).await {
        Ok(event) => event,
        Err(RepoError::NotFound) => return Err(AdminError::NotFound { ulid: duplicate }),
        Err(err) => return Err(err.into()),
    };
    if primary_event.is_deleted() {
        return Err(AdminError::EventDeleted { ulid: primary });
    }
    if duplicate_event.is_deleted() {
        return Err(AdminError::EventDeleted { ulid: duplicate });
    }

    tx.merge_events(duplicate_event.id, primary_event.id).await?;

    let now = OffsetDateTime::now_utc();
    let primary_uri = event_uri(primary_event.ulid);
    let payload = TombstonePayload::new(
        duplicate_event.ulid,
        &duplicate_event.name,
        REASON_DUPLICATE_MERGED,
        now,
        Some(primary_uri.clone()),
    );
    tx.create_tombstone(NewTombstone {
        event_id: duplicate_event.id,
        event_uri: event_uri(duplicate_event.ulid),
        deleted_at: now,
        reason: REASON_DUPLICATE_MERGED.to_owned(),
        superseded_by: Some(primary_uri),
        payload: payload.to_bytes(),
    })
    .await?;

    let mut primary_event = primary_event;
    if let Some((review_id, actor)) = review {
        let changes = gap_fill_changes(&primary_event, &duplicate_event);
        if !changes.is_empty() {
            primary_event = tx.update_event(primary_event.id, &changes).await?;
        }
        tx.mark_review_merged(review_id, actor).await?;
    }
    Ok(primary_event)
}

/// Enrichment of a merge primary from its duplicate: empty fields
/// fill from the duplicate, populated fields never change. A human
/// picked the primary; that choice outranks source trust.
fn gap_fill_changes(primary: &Event, duplicate: &Event) -> EventChanges {
    let mut changes = EventChanges::default();
    if primary.description.is_empty() && !duplicate.description.is_empty() {
        changes.description = Some(duplicate.description.clone());
    }
    if primary.image_url.is_empty() && !duplicate.image_url.is_empty() {
        changes.image_url = Some(duplicate.image_url.clone());
    }
    if primary.public_url.is_empty() && !duplicate.public_url.is_empty() {
        changes.public_url = Some(duplicate.public_url.clone());
    }
    if primary.virtual_url.is_empty() && !duplicate.virtual_url.is_empty() {
        changes.virtual_url = Some(duplicate.virtual_url.clone());
    }
    if primary.event_domain == EventDomain::General
        && duplicate.event_domain != EventDomain::General
    {
        changes.event_domain = Some(duplicate.event_domain);
    }
    if primary.keywords.is_empty() && !duplicate.keywords.is_empty() {
        changes.keywords = Some(duplicate.keywords.clone());
    }
    changes
}

/// Strips changes that match the stored values so a no-op update is
/// detected before any write happens.
fn diff_changes(existing: &Event, mut changes: EventChanges) -> EventChanges {
    if changes.name.as_deref() == Some(existing.name.as_str()) {
        changes.name = None;
    }
    if changes.description.as_deref() == Some(existing.description.as_str()) {
        changes.description = None;
    }
    if changes.image_url.as_deref() == Some(existing.image_url.as_str()) {
        changes.image_url = None;
    }
    if changes.public_url.as_deref() == Some(existing.public_url.as_str()) {
        changes.public_url = None;
    }
    if changes.lifecycle_state == Some(existing.lifecycle_state) {
        changes.lifecycle_state = None;
    }
    if changes.event_domain == Some(existing.event_domain) {
        changes.event_domain = None;
    }
    if changes.keywords.as_deref() == Some(existing.keywords.as_slice()) {
        changes.keywords = None;
    }
    changes
}

async fn rollback_logged(tx: Box<dyn RepositoryTx>) {
    if let Err(err) = tx.rollback().await {
        warn!(
            target: LOG_TARGET,
            err = %err.fmt_compact(),
            "Transaction rollback failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use togather_core::dedup::DedupCandidate;
    use togather_core::event::License;

    use super::*;

    fn event(description: &str, domain: EventDomain) -> Event {
        Event {
            id: 1,
            ulid: Ulid::ZERO,
            name: "Jazz Night".into(),
            description: description.into(),
            license: License::default(),
            dedup_hash: DedupCandidate::new("jazz night", "", "2026-09-01").hash(),
            lifecycle_state: LifecycleState::Published,
            event_domain: domain,
            organizer_id: None,
            primary_venue_id: None,
            virtual_url: String::new(),
            image_url: String::new(),
            public_url: String::new(),
            confidence: None,
            quality_score: None,
            keywords: vec![],
            federation_uri: None,
            occurrences: vec![],
            created_at: datetime!(2026-08-01 00:00 UTC),
            updated_at: datetime!(2026-08-01 00:00 UTC),
            deleted_at: None,
            merged_into_id: None,
        }
    }

    #[test]
    fn gap_fill_never_overwrites() {
        let mut primary = event("Primary description", EventDomain::Music);
        primary.keywords = vec!["jazz".into()];
        let mut duplicate = event("Duplicate description", EventDomain::Arts);
        duplicate.image_url = "https://example.com/dup.jpg".into();
        duplicate.keywords = vec!["other".into()];

        let changes = gap_fill_changes(&primary, &duplicate);
        assert_eq!(changes.description, None);
        assert_eq!(changes.event_domain, None);
        assert_eq!(changes.keywords, None);
        assert_eq!(
            changes.image_url.as_deref(),
            Some("https://example.com/dup.jpg")
        );
    }

    #[test]
    fn diff_drops_identical_values() {
        let existing = event("Same", EventDomain::Music);
        let changes = EventChanges {
            description: Some("Same".into()),
            event_domain: Some(EventDomain::Music),
            name: Some("New Name".into()),
            ..Default::default()
        };
        let diffed = diff_changes(&existing, changes);
        assert_eq!(diffed.description, None);
        assert_eq!(diffed.event_domain, None);
        assert_eq!(diffed.name.as_deref(), Some("New Name"));
    }
}
