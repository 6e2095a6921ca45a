use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use togather_admin::{AdminError, AdminService, UpdateEventParams};
use togather_core::event::{Event, LifecycleState};
use togather_core::review::ReviewStatus;
use togather_core::tombstone::event_uri;
use togather_ingest::{EventSubmission, IngestConfig, IngestService, PlaceInput};
use togather_repo::Repository as _;
use togather_repo::mem::MemRepository;
use togather_repo::{NewTombstone, RepoError};

struct TestHarness {
    repo: MemRepository,
    ingest: IngestService,
    admin: AdminService,
}

impl TestHarness {
    fn new() -> Self {
        let repo = MemRepository::new();
        let ingest = IngestService::new(Arc::new(repo.clone()), IngestConfig::default())
            .expect("Config is valid");
        let admin = AdminService::new(Arc::new(repo.clone()));
        Self {
            repo,
            ingest,
            admin,
        }
    }

    /// Ingests a clean submission and returns the stored event.
    async fn seed_event(&self, name: &str) -> Event {
        let submission = EventSubmission {
            name: name.to_owned(),
            description: "An evening of live music.".into(),
            image_url: "https://example.com/poster.jpg".into(),
            start_date: future(30),
            end_date: Some(future(31)),
            location: Some(PlaceInput {
                name: "The Fox Theater".into(),
                locality: "Oakland".into(),
                region: "CA".into(),
                country: "US".into(),
            }),
            ..Default::default()
        };
        let outcome = self.ingest.ingest(&submission).await.expect("Seeded");
        assert!(!outcome.needs_review, "seed events must be clean");
        outcome.event
    }
}

fn future(days: i64) -> String {
    (OffsetDateTime::now_utc() + Duration::days(days))
        .format(&Rfc3339)
        .expect("Timestamps format")
}

// ── Updates ──────────────────────────────────────────────────────────

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn update_applies_diff_and_noop_returns_unchanged() {
    let h = TestHarness::new();
    let event = h.seed_event("Jazz Night").await;

    let params = UpdateEventParams {
        description: Some("A late-night jam session.".into()),
        event_domain: Some("music".into()),
        ..Default::default()
    };
    let updated = h
        .admin
        .update_event(event.ulid, &params)
        .await
        .expect("Updated");
    assert_eq!(updated.description, "A late-night jam session.");
    assert_eq!(updated.event_domain.as_str(), "music");

    // Re-applying the identical params writes nothing.
    let repeat = h
        .admin
        .update_event(event.ulid, &params)
        .await
        .expect("No-op");
    assert_eq!(repeat.updated_at, updated.updated_at);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn update_rejects_invalid_params() {
    let h = TestHarness::new();
    let event = h.seed_event("Jazz Night").await;

    for params in [
        UpdateEventParams {
            name: Some("  ".into()),
            ..Default::default()
        },
        UpdateEventParams {
            name: Some("x".repeat(501)),
            ..Default::default()
        },
        UpdateEventParams {
            lifecycle_state: Some("live".into()),
            ..Default::default()
        },
        UpdateEventParams {
            lifecycle_state: Some("deleted".into()),
            ..Default::default()
        },
        UpdateEventParams {
            event_domain: Some("gaming".into()),
            ..Default::default()
        },
        UpdateEventParams {
            image_url: Some("http://example.com/x.jpg".into()),
            ..Default::default()
        },
    ] {
        let err = h
            .admin
            .update_event(event.ulid, &params)
            .await
            .expect_err("Rejected");
        assert!(
            matches!(err, AdminError::InvalidUpdateParams { .. }),
            "params {params:?} gave {err:?}"
        );
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn publish_and_unpublish_are_idempotent() {
    let h = TestHarness::new();
    let event = h.seed_event("Jazz Night").await;

    let drafted = h.admin.unpublish_event(event.ulid).await.expect("Drafted");
    assert_eq!(drafted.lifecycle_state, LifecycleState::Draft);
    let again = h.admin.unpublish_event(event.ulid).await.expect("No-op");
    assert_eq!(again.updated_at, drafted.updated_at);

    let published = h.admin.publish_event(event.ulid).await.expect("Published");
    assert_eq!(published.lifecycle_state, LifecycleState::Published);
}

// ── Delete + tombstone ───────────────────────────────────────────────

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delete_soft_deletes_and_emits_tombstone() {
    let h = TestHarness::new();
    let event = h.seed_event("Jazz Night").await;

    h.admin
        .delete_event(event.ulid, "spam")
        .await
        .expect("Deleted");

    let stored = h
        .repo
        .get_event_by_ulid(event.ulid)
        .await
        .expect("Still readable");
    assert_eq!(stored.lifecycle_state, LifecycleState::Deleted);
    assert!(stored.deleted_at.is_some());
    assert_eq!(stored.merged_into_id, None);

    let tombstone = h
        .admin
        .get_tombstone(event.ulid)
        .await
        .expect("Query")
        .expect("Exists");
    assert_eq!(tombstone.reason, "spam");
    assert_eq!(tombstone.superseded_by, None);

    let payload: serde_json::Value =
        serde_json::from_slice(&tombstone.payload).expect("Valid JSON-LD");
    assert_eq!(payload["@id"], event_uri(event.ulid).as_str());
    assert_eq!(payload["sel:tombstone"], true);
    assert_eq!(payload["sel:deletionReason"], "spam");

    // Deleting a deleted event is refused.
    let err = h
        .admin
        .delete_event(event.ulid, "again")
        .await
        .expect_err("Refused");
    assert!(matches!(err, AdminError::EventDeleted { .. }));
}

// ── Merge ────────────────────────────────────────────────────────────

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn merge_soft_deletes_duplicate_with_superseding_tombstone() {
    let h = TestHarness::new();
    let primary = h.seed_event("Jazz Night").await;
    let duplicate = h.seed_event("Jazz Nite").await;

    h.admin
        .merge_events(primary.ulid, duplicate.ulid)
        .await
        .expect("Merged");

    let merged = h
        .repo
        .get_event_by_ulid(duplicate.ulid)
        .await
        .expect("Readable");
    assert_eq!(merged.lifecycle_state, LifecycleState::Deleted);
    assert_eq!(merged.merged_into_id, Some(primary.id));

    let tombstone = h
        .admin
        .get_tombstone(duplicate.ulid)
        .await
        .expect("Query")
        .expect("Exists");
    assert_eq!(tombstone.reason, "duplicate_merged");
    assert_eq!(tombstone.superseded_by.as_deref(), Some(event_uri(primary.ulid).as_str()));

    let payload: serde_json::Value =
        serde_json::from_slice(&tombstone.payload).expect("Valid JSON-LD");
    assert_eq!(payload["sel:supersededBy"], event_uri(primary.ulid).as_str());

    // The primary is untouched.
    let primary_now = h
        .repo
        .get_event_by_ulid(primary.ulid)
        .await
        .expect("Readable");
    assert_eq!(primary_now.lifecycle_state, LifecycleState::Published);
    assert_eq!(primary_now.merged_into_id, None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn merge_same_event_fails_fast() {
    let h = TestHarness::new();
    let event = h.seed_event("Jazz Night").await;

    let err = h
        .admin
        .merge_events(event.ulid, event.ulid)
        .await
        .expect_err("Refused");
    assert!(matches!(err, AdminError::CannotMergeSameEvent));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn merge_into_deleted_primary_is_refused() {
    let h = TestHarness::new();
    let primary = h.seed_event("Jazz Night").await;
    let duplicate = h.seed_event("Jazz Nite").await;

    h.admin
        .delete_event(primary.ulid, "spam")
        .await
        .expect("Deleted");

    let err = h
        .admin
        .merge_events(primary.ulid, duplicate.ulid)
        .await
        .expect_err("Refused");
    assert!(matches!(err, AdminError::EventDeleted { .. }));

    // No state change on the duplicate, no tombstone for it.
    let unchanged = h
        .repo
        .get_event_by_ulid(duplicate.ulid)
        .await
        .expect("Readable");
    assert_eq!(unchanged.lifecycle_state, LifecycleState::Published);
    assert_eq!(unchanged.merged_into_id, None);
    assert!(
        h.admin
            .get_tombstone(duplicate.ulid)
            .await
            .expect("Query")
            .is_none()
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn merge_rolls_back_when_tombstone_insert_fails() {
    let h = TestHarness::new();
    let primary = h.seed_event("Jazz Night").await;
    let duplicate = h.seed_event("Jazz Nite").await;

    // Occupy the duplicate's tombstone slot so the insert inside the
    // merge transaction hits the unique index.
    let duplicate_row = h
        .repo
        .get_event_by_ulid(duplicate.ulid)
        .await
        .expect("Readable");
    h.repo
        .create_tombstone(NewTombstone {
            event_id: duplicate_row.id,
            event_uri: event_uri(duplicate.ulid),
            deleted_at: OffsetDateTime::now_utc(),
            reason: "seeded".into(),
            superseded_by: None,
            payload: b"{}".to_vec(),
        })
        .await
        .expect("Seeded");

    let err = h
        .admin
        .merge_events(primary.ulid, duplicate.ulid)
        .await
        .expect_err("Merge fails");
    assert!(matches!(
        err,
        AdminError::Repo {
            source: RepoError::Conflict { .. }
        }
    ));

    // Rollback: the duplicate kept its lifecycle and merge marker.
    let unchanged = h
        .repo
        .get_event_by_ulid(duplicate.ulid)
        .await
        .expect("Readable");
    assert_eq!(unchanged.lifecycle_state, LifecycleState::Published);
    assert_eq!(unchanged.merged_into_id, None);

    // Only the pre-seeded tombstone exists.
    let tombstone = h
        .admin
        .get_tombstone(duplicate.ulid)
        .await
        .expect("Query")
        .expect("Exists");
    assert_eq!(tombstone.reason, "seeded");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn merge_with_review_gap_fills_and_closes_entry() {
    let h = TestHarness::new();

    // Primary lacks an image; otherwise clean.
    let primary_submission = EventSubmission {
        name: "Jazz Night".into(),
        description: "An evening of live music.".into(),
        start_date: future(30),
        ..Default::default()
    };
    let primary = h
        .ingest
        .ingest(&primary_submission)
        .await
        .expect("Seeded")
        .event;

    // Duplicate has the image but no description: queued for review.
    let duplicate_submission = EventSubmission {
        name: "Jazz Nite".into(),
        image_url: "https://example.com/poster.jpg".into(),
        start_date: future(30),
        ..Default::default()
    };
    let duplicate_outcome = h
        .ingest
        .ingest(&duplicate_submission)
        .await
        .expect("Seeded");
    assert!(duplicate_outcome.needs_review);

    let pending = h
        .repo
        .list_reviews(Some(ReviewStatus::Pending))
        .await
        .expect("List");
    assert_eq!(pending.len(), 1);

    let enriched = h
        .admin
        .merge_events_with_review(
            primary.ulid,
            duplicate_outcome.event.ulid,
            pending[0].id,
            "moderator",
        )
        .await
        .expect("Merged");

    // Gap fill only: the image came over, the description stayed.
    assert_eq!(enriched.image_url, "https://example.com/poster.jpg");
    assert_eq!(enriched.description, "An evening of live music.");

    let entry = h.repo.get_review(pending[0].id).await.expect("Readable");
    assert_eq!(entry.status, ReviewStatus::Merged);
    assert_eq!(entry.reviewed_by.as_deref(), Some("moderator"));
}

// ── Listing + review cleanup ─────────────────────────────────────────

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn list_filters_by_state_and_hides_deleted() {
    let h = TestHarness::new();
    let keep = h.seed_event("Jazz Night").await;
    let remove = h.seed_event("Blues Revue").await;
    h.admin
        .delete_event(remove.ulid, "spam")
        .await
        .expect("Deleted");

    let (events, next) = h
        .admin
        .list_events(&Default::default())
        .await
        .expect("List");
    assert_eq!(next, None);
    assert_eq!(
        events.iter().map(|e| e.ulid).collect::<Vec<_>>(),
        vec![keep.ulid]
    );

    let (deleted, _) = h
        .admin
        .list_events(&togather_core::filter::RawEventQuery {
            state: Some("deleted".into()),
            ..Default::default()
        })
        .await
        .expect("List");
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].ulid, remove.ulid);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cleanup_drops_pending_reviews_for_past_events() {
    let h = TestHarness::new();

    let submission = EventSubmission {
        name: "Jazz Night".into(),
        start_date: future(30),
        end_date: Some(future(31)),
        ..Default::default()
    };
    let outcome = h.ingest.ingest(&submission).await.expect("Seeded");
    assert!(outcome.needs_review);

    // Not expired yet.
    let removed = h
        .admin
        .cleanup_expired_reviews(OffsetDateTime::now_utc())
        .await
        .expect("Cleanup");
    assert_eq!(removed, 0);

    // Well past the event's end.
    let removed = h
        .admin
        .cleanup_expired_reviews(OffsetDateTime::now_utc() + Duration::days(40))
        .await
        .expect("Cleanup");
    assert_eq!(removed, 1);
    assert!(
        h.repo
            .list_reviews(Some(ReviewStatus::Pending))
            .await
            .expect("List")
            .is_empty()
    );
}
