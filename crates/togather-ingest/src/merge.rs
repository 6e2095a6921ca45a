//! Trust-weighted field merge between an existing event and an
//! incoming submission.
//!
//! The policy per mutable field (description, image URL, public URL,
//! domain, keywords):
//!
//! 1. Empty incoming value: leave the field alone.
//! 2. Empty existing value: gap-fill from the incoming value, trust
//!    notwithstanding.
//! 3. Both set: overwrite only on strictly greater incoming trust.
//!
//! Name and lifecycle are never merged; a name change would
//! invalidate the dedup hash, lifecycle belongs to the review state
//! machine. Ties keep the incumbent, which makes re-ingestion at
//! equal trust a no-op.

use togather_core::event::{Event, EventDomain};
use togather_core::source::TrustLevel;
use togather_repo::EventChanges;

use crate::submission::ValidSubmission;

pub fn auto_merge_fields(
    existing: &Event,
    incoming: &ValidSubmission,
    existing_trust: TrustLevel,
    new_trust: TrustLevel,
) -> (EventChanges, bool) {
    let overwrites = existing_trust < new_trust;
    let mut changes = EventChanges::default();

    changes.description = merge_text(&existing.description, &incoming.description, overwrites);
    changes.image_url = merge_text(&existing.image_url, &incoming.image_url, overwrites);
    changes.public_url = merge_text(&existing.public_url, &incoming.public_url, overwrites);

    if let Some(incoming_domain) = incoming.event_domain {
        // `General` is the unclassified state and plays the "empty"
        // role for gap-fill.
        let existing_empty = existing.event_domain == EventDomain::General;
        if incoming_domain != existing.event_domain && (existing_empty || overwrites) {
            changes.event_domain = Some(incoming_domain);
        }
    }

    // Keywords merge atomically: the incoming list replaces the
    // existing one or does not touch it at all.
    if !incoming.keywords.is_empty()
        && incoming.keywords != existing.keywords
        && (existing.keywords.is_empty() || overwrites)
    {
        changes.keywords = Some(incoming.keywords.clone());
    }

    let changed = !changes.is_empty();
    (changes, changed)
}

fn merge_text(existing: &str, incoming: &str, overwrites: bool) -> Option<String> {
    let incoming = incoming.trim();
    if incoming.is_empty() || incoming == existing {
        return None;
    }
    if existing.is_empty() || overwrites {
        return Some(incoming.to_owned());
    }
    None
}
