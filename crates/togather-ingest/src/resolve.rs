//! Place and organization resolution: canonical-key upsert, then a
//! fuzzy pass over similar rows when the upsert created something
//! new.
//!
//! The fuzzy pass only ever looks at the top candidate. At or above
//! the auto-merge threshold the fresh row is folded into the
//! candidate and the event points at the survivor; in the review
//! band both rows stay and the submission gets flagged. Lookup
//! failures degrade to "no match" so ingest never fails on the
//! similarity index.

use togather_core::id::Ulid;
use togather_core::place::CanonicalKey;
use togather_core::warning::{QualityWarning, WarningCode};
use togather_repo::{Repository, SimilarCandidate, UpsertOrganization, UpsertPlace};
use togather_util_error::FmtCompact as _;
use tracing::{debug, info, warn};

use crate::IngestResult;
use crate::config::FuzzyThresholds;
use crate::submission::{OrganizationInput, PlaceInput};

const LOG_TARGET: &str = "togather::ingest::resolve";

/// What the fuzzy pass decided about a freshly created row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FuzzyDecision {
    /// Fold the fresh row into this candidate.
    AutoMerge(SimilarCandidate),
    /// Keep both rows, flag the submission.
    Flag(SimilarCandidate),
    /// Nothing similar enough.
    Keep,
}

/// Pure threshold policy over the ranked candidates. The auto-merge
/// comparison is inclusive: a candidate exactly at the threshold
/// merges.
pub(crate) fn fuzzy_decision(
    candidates: &[SimilarCandidate],
    thresholds: FuzzyThresholds,
) -> FuzzyDecision {
    let Some(top) = candidates.first() else {
        return FuzzyDecision::Keep;
    };
    if thresholds.auto_merge <= top.score {
        FuzzyDecision::AutoMerge(top.clone())
    } else if thresholds.review <= top.score {
        FuzzyDecision::Flag(top.clone())
    } else {
        FuzzyDecision::Keep
    }
}

/// Upserts the submitted place and resolves fuzzy duplicates.
/// Returns the id the event should reference and, possibly, a
/// `place_possible_duplicate` warning.
pub(crate) async fn resolve_place(
    repo: &dyn Repository,
    input: &PlaceInput,
    proposed_ulid: Ulid,
    thresholds: FuzzyThresholds,
) -> IngestResult<(i64, Option<QualityWarning>)> {
    let (place, created) = repo
        .upsert_place(UpsertPlace {
            ulid: proposed_ulid,
            name: input.name.clone(),
            locality: input.locality.clone(),
            region: input.region.clone(),
            country: input.country.clone(),
        })
        .await?;

    if !created || thresholds.is_disabled() {
        return Ok((place.id, None));
    }

    let key = CanonicalKey::new(&input.name, &input.locality, &input.region, &input.country);
    let candidates = match repo.find_similar_places(&key, thresholds.review).await {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                err = %err.fmt_compact(),
                place = %place.ulid,
                "Similar-place lookup failed, continuing without fuzzy match"
            );
            return Ok((place.id, None));
        }
    };

    match fuzzy_decision(&candidates, thresholds) {
        FuzzyDecision::AutoMerge(candidate) => {
            repo.merge_places(candidate.id, place.id).await?;
            info!(
                target: LOG_TARGET,
                merged = %place.ulid,
                into = %candidate.ulid,
                score = candidate.score,
                "Auto-merged near-identical place"
            );
            Ok((candidate.id, None))
        }
        FuzzyDecision::Flag(candidate) => {
            debug!(
                target: LOG_TARGET,
                place = %place.ulid,
                candidate = %candidate.ulid,
                score = candidate.score,
                "Place flagged as possible duplicate"
            );
            let warning = QualityWarning::with_candidate(
                WarningCode::PlacePossibleDuplicate,
                format!("place resembles existing \"{}\"", candidate.name),
                candidate.ulid,
                candidate.score,
            );
            Ok((place.id, Some(warning)))
        }
        FuzzyDecision::Keep => Ok((place.id, None)),
    }
}

/// Organization counterpart of [`resolve_place`].
pub(crate) async fn resolve_organization(
    repo: &dyn Repository,
    input: &OrganizationInput,
    proposed_ulid: Ulid,
    thresholds: FuzzyThresholds,
) -> IngestResult<(i64, Option<QualityWarning>)> {
    let (org, created) = repo
        .upsert_organization(UpsertOrganization {
            ulid: proposed_ulid,
            name: input.name.clone(),
            locality: input.locality.clone(),
            region: input.region.clone(),
            country: input.country.clone(),
        })
        .await?;

    if !created || thresholds.is_disabled() {
        return Ok((org.id, None));
    }

    let key = CanonicalKey::new(&input.name, &input.locality, &input.region, &input.country);
    let candidates = match repo.find_similar_organizations(&key, thresholds.review).await {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(
                target: LOG_TARGET,
                err = %err.fmt_compact(),
                organization = %org.ulid,
                "Similar-organization lookup failed, continuing without fuzzy match"
            );
            return Ok((org.id, None));
        }
    };

    match fuzzy_decision(&candidates, thresholds) {
        FuzzyDecision::AutoMerge(candidate) => {
            repo.merge_organizations(candidate.id, org.id).await?;
            info!(
                target: LOG_TARGET,
                merged = %org.ulid,
                into = %candidate.ulid,
                score = candidate.score,
                "Auto-merged near-identical organization"
            );
            Ok((candidate.id, None))
        }
        FuzzyDecision::Flag(candidate) => {
            let warning = QualityWarning::with_candidate(
                WarningCode::OrgPossibleDuplicate,
                format!("organization resembles existing \"{}\"", candidate.name),
                candidate.ulid,
                candidate.score,
            );
            Ok((org.id, Some(warning)))
        }
        FuzzyDecision::Keep => Ok((org.id, None)),
    }
}
