use togather_core::warning::{QualityWarning, WarningCode};

use crate::config::IngestConfig;
use crate::submission::ValidSubmission;

/// Confidence starts here and loses [`CONFIDENCE_PENALTY`] per
/// missing field from {description, image}.
pub const CONFIDENCE_BASE: f64 = 0.9;
pub const CONFIDENCE_PENALTY: f64 = 0.2;

/// Below this the submission gets a `low_confidence` warning.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Quality verdict for one submission: the score pair stored on the
/// event plus the warnings that drive review routing.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub confidence: f64,
    pub quality_score: u8,
    pub warnings: Vec<QualityWarning>,
}

pub fn evaluate(submission: &ValidSubmission, config: &IngestConfig) -> QualityReport {
    let has_description = !submission.description.is_empty();
    let has_image = !submission.image_url.is_empty();

    let mut confidence = CONFIDENCE_BASE;
    if !has_description {
        confidence -= CONFIDENCE_PENALTY;
    }
    if !has_image {
        confidence -= CONFIDENCE_PENALTY;
    }

    let mut warnings = Vec::new();
    if !has_description {
        warnings.push(QualityWarning::new(
            WarningCode::MissingDescription,
            "submission has no description",
        ));
    }
    if !has_image && config.require_image {
        warnings.push(QualityWarning::new(
            WarningCode::MissingImage,
            "submission has no image",
        ));
    }
    if confidence < LOW_CONFIDENCE_THRESHOLD {
        warnings.push(QualityWarning::new(
            WarningCode::LowConfidence,
            format!("confidence {confidence:.1} below {LOW_CONFIDENCE_THRESHOLD}"),
        ));
    }

    QualityReport {
        confidence,
        quality_score: (confidence * 100.0).round().clamp(0.0, 100.0) as u8,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use togather_core::warning::warning_codes;

    use super::*;
    use crate::submission::EventSubmission;

    fn validated(description: &str, image_url: &str) -> ValidSubmission {
        EventSubmission {
            name: "Jazz Night".into(),
            description: description.into(),
            image_url: image_url.into(),
            start_date: "2026-09-01T19:00:00Z".into(),
            ..Default::default()
        }
        .validate(&IngestConfig::default(), datetime!(2026-08-01 12:00 UTC))
        .expect("Valid")
    }

    #[test]
    fn complete_submission_is_clean() {
        let report = evaluate(
            &validated("An evening of jazz.", "https://example.com/poster.jpg"),
            &IngestConfig::default(),
        );
        assert!((report.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(report.quality_score, 90);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_description_costs_confidence() {
        let report = evaluate(
            &validated("", "https://example.com/poster.jpg"),
            &IngestConfig::default(),
        );
        assert!((report.confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(
            warning_codes(&report.warnings).into_iter().collect::<Vec<_>>(),
            vec![WarningCode::MissingDescription]
        );
    }

    #[test]
    fn both_missing_drops_below_low_confidence() {
        let report = evaluate(&validated("", ""), &IngestConfig::default());
        assert!((report.confidence - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.quality_score, 50);
        let codes = warning_codes(&report.warnings);
        assert!(codes.contains(&WarningCode::MissingDescription));
        assert!(codes.contains(&WarningCode::LowConfidence));
        // missing_image only fires when images are required.
        assert!(!codes.contains(&WarningCode::MissingImage));
    }

    #[test]
    fn missing_image_warns_when_required() {
        let mut config = IngestConfig::default();
        config.require_image = true;
        let report = evaluate(&validated("An evening of jazz.", ""), &config);
        assert!(warning_codes(&report.warnings).contains(&WarningCode::MissingImage));
    }
}
