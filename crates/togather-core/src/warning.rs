use core::fmt;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::id::Ulid;

/// Machine-readable code of a quality warning.
///
/// Only the code participates in equality between warning sets; the
/// other fields are informational and may grow without affecting
/// review reconciliation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    MissingDescription,
    MissingImage,
    LowConfidence,
    PotentialDuplicate,
    PlacePossibleDuplicate,
    OrgPossibleDuplicate,
}

impl WarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingDescription => "missing_description",
            Self::MissingImage => "missing_image",
            Self::LowConfidence => "low_confidence",
            Self::PotentialDuplicate => "potential_duplicate",
            Self::PlacePossibleDuplicate => "place_possible_duplicate",
            Self::OrgPossibleDuplicate => "org_possible_duplicate",
        }
    }
}

impl fmt::Display for WarningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal quality finding attached to an ingest result and, when
/// the submission is queued, to its review entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityWarning {
    pub code: WarningCode,
    pub message: String,
    /// ULID of the suspected duplicate for the `*_duplicate` codes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_ulid: Option<Ulid>,
    /// Similarity score that triggered a `*_duplicate` code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

impl QualityWarning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            related_ulid: None,
            similarity: None,
        }
    }

    pub fn with_candidate(
        code: WarningCode,
        message: impl Into<String>,
        related_ulid: Ulid,
        similarity: f64,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            related_ulid: Some(related_ulid),
            similarity: Some(similarity),
        }
    }
}

/// Serializes a warning list to the opaque byte form stored in review
/// entries.
pub fn encode_warnings(warnings: &[QualityWarning]) -> Vec<u8> {
    serde_json::to_vec(warnings).expect("Warnings always serialize")
}

/// Parses stored warning bytes back into a list.
///
/// Stored warnings are re-parsed on every comparison rather than
/// compared as bytes, so older entries stay comparable when the
/// warning shape grows fields.
pub fn decode_warnings(bytes: &[u8]) -> Result<Vec<QualityWarning>, serde_json::Error> {
    if bytes.is_empty() {
        return Ok(vec![]);
    }
    serde_json::from_slice(bytes)
}

pub fn warning_codes(warnings: &[QualityWarning]) -> BTreeSet<WarningCode> {
    warnings.iter().map(|w| w.code).collect()
}

/// Set equality over warning codes only. A missing stored list equals
/// the empty set.
pub fn same_warning_codes(stored: Option<&[u8]>, current: &[QualityWarning]) -> bool {
    let stored_codes = match stored {
        Some(bytes) => match decode_warnings(bytes) {
            Ok(warnings) => warning_codes(&warnings),
            // Unparseable old warnings never equal anything current;
            // reconciliation then treats the codes as changed.
            Err(_) => return false,
        },
        None => BTreeSet::new(),
    };
    stored_codes == warning_codes(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&WarningCode::MissingDescription).expect("Serializes"),
            "\"missing_description\""
        );
        assert_eq!(
            serde_json::to_string(&WarningCode::OrgPossibleDuplicate).expect("Serializes"),
            "\"org_possible_duplicate\""
        );
    }

    #[test]
    fn encode_decode_roundtrip() {
        let warnings = vec![
            QualityWarning::new(WarningCode::MissingDescription, "description is empty"),
            QualityWarning::with_candidate(
                WarningCode::PotentialDuplicate,
                "similar event at same venue",
                crate::id::UlidGenerator::new().generate(),
                0.87,
            ),
        ];
        let bytes = encode_warnings(&warnings);
        let decoded = decode_warnings(&bytes).expect("Decodes");
        assert_eq!(warnings, decoded);
    }

    #[test]
    fn decode_empty_bytes_is_empty_list() {
        assert_eq!(decode_warnings(b"").expect("Decodes"), vec![]);
    }

    #[test]
    fn same_codes_ignores_messages_and_order() {
        let stored = encode_warnings(&[
            QualityWarning::new(WarningCode::MissingImage, "image missing"),
            QualityWarning::new(WarningCode::MissingDescription, "old message"),
        ]);
        let current = vec![
            QualityWarning::new(WarningCode::MissingDescription, "new message"),
            QualityWarning::new(WarningCode::MissingImage, "no image supplied"),
        ];
        assert!(same_warning_codes(Some(&stored), &current));
    }

    #[test]
    fn same_codes_detects_difference() {
        let stored = encode_warnings(&[QualityWarning::new(
            WarningCode::MissingDescription,
            "description is empty",
        )]);
        let current = vec![QualityWarning::new(WarningCode::MissingImage, "no image")];
        assert!(!same_warning_codes(Some(&stored), &current));
    }

    #[test]
    fn missing_stored_list_equals_empty() {
        assert!(same_warning_codes(None, &[]));
        assert!(!same_warning_codes(
            None,
            &[QualityWarning::new(WarningCode::LowConfidence, "0.5")]
        ));
    }

    #[test]
    fn duplicate_codes_collapse_in_comparison() {
        let stored = encode_warnings(&[
            QualityWarning::new(WarningCode::LowConfidence, "a"),
            QualityWarning::new(WarningCode::LowConfidence, "b"),
        ]);
        let current = vec![QualityWarning::new(WarningCode::LowConfidence, "c")];
        assert!(same_warning_codes(Some(&stored), &current));
    }
}
