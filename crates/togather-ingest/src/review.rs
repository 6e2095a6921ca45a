//! Resubmission reconciliation against the review queue.
//!
//! Runs on every ingest that reaches the create path, whether or not
//! the new submission needs review. The prior entry for the
//! submission's key decides what happens:
//!
//! | prior      | new outcome  | action                                 |
//! |------------|--------------|----------------------------------------|
//! | none       | needs review | new pending entry, event pending       |
//! | none       | clean        | new event, published                   |
//! | pending    | clean        | approve entry, publish existing event  |
//! | pending    | needs review | refresh entry warnings                 |
//! | rejected   | not past     | clean or same codes: refuse; else new  |
//! | rejected   | past         | new event                              |
//! | approved   | any          | plain create path                      |
//! | merged     | any          | plain create path                      |

use time::OffsetDateTime;
use togather_core::review::{ReviewQueueEntry, ReviewStatus};
use togather_core::warning::{QualityWarning, same_warning_codes};

/// What the reconciliation decided; the orchestrator executes it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reconciliation {
    /// Create the event `published`, no review entry.
    CreatePublished,
    /// Create the event `pending_review` plus a pending entry.
    CreatePending,
    /// Clean resubmission of a pending entry: approve it and publish
    /// its existing event.
    ApproveExisting(ReviewQueueEntry),
    /// Still-warned resubmission of a pending entry: refresh the
    /// entry's warnings and return its existing event.
    RefreshPending(ReviewQueueEntry),
    /// A reviewer already said no and the event has not passed.
    RefusePreviouslyRejected(ReviewQueueEntry),
}

pub(crate) fn reconcile(
    prior: Option<&ReviewQueueEntry>,
    warnings: &[QualityWarning],
    now: OffsetDateTime,
) -> Reconciliation {
    let needs_review = !warnings.is_empty();

    let Some(prior) = prior else {
        return if needs_review {
            Reconciliation::CreatePending
        } else {
            Reconciliation::CreatePublished
        };
    };

    match prior.status {
        ReviewStatus::Pending => {
            if needs_review {
                // Same or different warning codes: either way the
                // entry's warnings become the latest set.
                Reconciliation::RefreshPending(prior.clone())
            } else {
                Reconciliation::ApproveExisting(prior.clone())
            }
        }
        ReviewStatus::Rejected => {
            if prior.event_is_past(now) {
                // The rejected event is over; whatever is being
                // submitted now is effectively a new event.
                return if needs_review {
                    Reconciliation::CreatePending
                } else {
                    Reconciliation::CreatePublished
                };
            }
            // A clean resubmission or one with the same gaps is the
            // same submission the reviewer already refused. Only a
            // different warning set earns another look.
            if !needs_review || same_warning_codes(Some(&prior.warnings), warnings) {
                Reconciliation::RefusePreviouslyRejected(prior.clone())
            } else {
                Reconciliation::CreatePending
            }
        }
        // The entry's event already exists (approved) or was folded
        // into a primary (merged); the dedup-hash short-circuit
        // handles those earlier, so reaching here means a genuinely
        // new event for this key.
        ReviewStatus::Approved | ReviewStatus::Merged => {
            if needs_review {
                Reconciliation::CreatePending
            } else {
                Reconciliation::CreatePublished
            }
        }
    }
}
