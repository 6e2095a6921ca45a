use serde::{Deserialize, Serialize};
use snafu::Snafu;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use togather_core::event::{EventDomain, EventDomainParseError, License};
use url::Url;

use crate::config::IngestConfig;

pub const NAME_MAX_LEN: usize = 500;

/// A structured event description as posted by a scraper, partner
/// feed, or direct submitter. All temporal fields are RFC3339
/// strings; everything is validated before the pipeline runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSubmission {
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub public_url: String,
    pub start_date: String,
    pub end_date: Option<String>,
    pub door_time: Option<String>,
    pub timezone: String,
    pub license_url: String,
    pub location: Option<PlaceInput>,
    pub virtual_location: String,
    pub organizer: Option<OrganizationInput>,
    pub source: Option<SourceBlock>,
    pub keywords: Vec<String>,
    pub event_domain: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceInput {
    pub name: String,
    pub locality: String,
    pub region: String,
    pub country: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationInput {
    pub name: String,
    pub locality: String,
    pub region: String,
    pub country: String,
}

/// Identity of the upstream that produced a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceBlock {
    pub name: String,
    pub url: String,
    pub external_id: String,
}

#[derive(Debug, Snafu, Clone, PartialEq)]
pub enum SubmissionError {
    #[snafu(display("Event name is required"))]
    EmptyName,
    #[snafu(display("Event name exceeds {NAME_MAX_LEN} chars: {len}"))]
    NameTooLong { len: usize },
    #[snafu(display("Invalid RFC3339 {field}: {value}"))]
    InvalidTimestamp { field: &'static str, value: String },
    #[snafu(display("Start date {start} is too far in the past"))]
    StartDateInPast { start: String },
    #[snafu(display("End date precedes start date"))]
    EndBeforeStart,
    #[snafu(display("Invalid {field} URL: {value}"))]
    InvalidUrl { field: &'static str, value: String },
    #[snafu(display("{field} URL must use https: {value}"))]
    InsecureUrl { field: &'static str, value: String },
    #[snafu(transparent)]
    UnknownDomain { source: EventDomainParseError },
}

pub type SubmissionResult<T> = std::result::Result<T, SubmissionError>;

/// The submission after fatal validation: trimmed strings, parsed
/// timestamps, resolved enums. What the pipeline actually consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidSubmission {
    pub name: String,
    pub description: String,
    pub image_url: String,
    pub public_url: String,
    pub start: OffsetDateTime,
    pub end: Option<OffsetDateTime>,
    pub door_time: Option<OffsetDateTime>,
    pub timezone: String,
    pub license: License,
    pub location: Option<PlaceInput>,
    pub virtual_url: String,
    pub organizer: Option<OrganizationInput>,
    pub source: Option<SourceBlock>,
    pub keywords: Vec<String>,
    /// `None` when the submission did not classify itself; the merge
    /// policy then leaves the existing domain alone.
    pub event_domain: Option<EventDomain>,
}

impl ValidSubmission {
    /// The date string fed into the dedup hash: the UTC calendar date
    /// of the start time.
    pub fn start_date_string(&self) -> String {
        let format = time::macros::format_description!("[year]-[month]-[day]");
        self.start
            .date()
            .format(&format)
            .expect("Dates always format")
    }
}

impl EventSubmission {
    /// Runs every fatal check. Quality findings are not errors and
    /// are computed separately; a submission that passes here always
    /// proceeds to the pipeline.
    pub fn validate(
        &self,
        config: &IngestConfig,
        now: OffsetDateTime,
    ) -> SubmissionResult<ValidSubmission> {
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(SubmissionError::EmptyName);
        }
        if NAME_MAX_LEN < name.chars().count() {
            return Err(SubmissionError::NameTooLong {
                len: name.chars().count(),
            });
        }

        let start = parse_timestamp("start_date", &self.start_date)?;
        if start < now - config.past_grace {
            return Err(SubmissionError::StartDateInPast {
                start: self.start_date.trim().to_owned(),
            });
        }
        let end = self
            .end_date
            .as_deref()
            .map(|value| parse_timestamp("end_date", value))
            .transpose()?;
        if let Some(end) = end {
            if end < start {
                return Err(SubmissionError::EndBeforeStart);
            }
        }
        let door_time = self
            .door_time
            .as_deref()
            .map(|value| parse_timestamp("door_time", value))
            .transpose()?;

        let image_url = validate_url("image_url", &self.image_url, config)?;
        let public_url = validate_url("public_url", &self.public_url, config)?;
        let virtual_url = validate_url("virtual_location", &self.virtual_location, config)?;

        let event_domain = self
            .event_domain
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::parse::<EventDomain>)
            .transpose()?;

        let timezone = match self.timezone.trim() {
            "" => "UTC".to_owned(),
            tz => tz.to_owned(),
        };

        Ok(ValidSubmission {
            name,
            description: self.description.trim().to_owned(),
            image_url,
            public_url,
            start,
            end,
            door_time,
            timezone,
            license: License {
                url: self.license_url.trim().to_owned(),
                status: String::new(),
            },
            location: self.location.clone().filter(|l| !l.name.trim().is_empty()),
            virtual_url,
            organizer: self.organizer.clone().filter(|o| !o.name.trim().is_empty()),
            source: self
                .source
                .clone()
                .filter(|s| !s.external_id.trim().is_empty() || !s.url.trim().is_empty()),
            keywords: normalize_keywords(&self.keywords),
            event_domain,
        })
    }

    /// Canonical bytes for the raw payload blob and the idempotency
    /// request hash.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Submissions always serialize")
    }
}

fn parse_timestamp(field: &'static str, value: &str) -> SubmissionResult<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Rfc3339).map_err(|_| SubmissionError::InvalidTimestamp {
        field,
        value: value.trim().to_owned(),
    })
}

fn validate_url(
    field: &'static str,
    value: &str,
    config: &IngestConfig,
) -> SubmissionResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(String::new());
    }
    let parsed = Url::parse(value).map_err(|_| SubmissionError::InvalidUrl {
        field,
        value: value.to_owned(),
    })?;
    match parsed.scheme() {
        "https" => {}
        "http" if !config.require_https => {}
        _ => {
            return Err(SubmissionError::InsecureUrl {
                field,
                value: value.to_owned(),
            });
        }
    }
    Ok(value.to_owned())
}

/// Trims, drops blanks, dedups case-insensitively keeping the first
/// spelling.
fn normalize_keywords(keywords: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_lowercase()))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn config() -> IngestConfig {
        IngestConfig::default()
    }

    fn now() -> OffsetDateTime {
        datetime!(2026-08-01 12:00 UTC)
    }

    fn minimal() -> EventSubmission {
        EventSubmission {
            name: "Jazz Night".into(),
            start_date: "2026-09-01T19:00:00Z".into(),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_submission_validates() {
        let valid = minimal().validate(&config(), now()).expect("Valid");
        assert_eq!(valid.name, "Jazz Night");
        assert_eq!(valid.start, datetime!(2026-09-01 19:00 UTC));
        assert_eq!(valid.timezone, "UTC");
        assert_eq!(valid.event_domain, None);
    }

    #[test]
    fn rejects_empty_name() {
        let mut submission = minimal();
        submission.name = "   ".into();
        assert_eq!(
            submission.validate(&config(), now()),
            Err(SubmissionError::EmptyName)
        );
    }

    #[test]
    fn rejects_name_over_limit() {
        let mut submission = minimal();
        submission.name = "x".repeat(NAME_MAX_LEN + 1);
        assert!(matches!(
            submission.validate(&config(), now()),
            Err(SubmissionError::NameTooLong { len }) if len == NAME_MAX_LEN + 1
        ));
    }

    #[test]
    fn accepts_name_at_limit() {
        let mut submission = minimal();
        submission.name = "x".repeat(NAME_MAX_LEN);
        submission.validate(&config(), now()).expect("Valid");
    }

    #[test]
    fn rejects_bad_start_date() {
        let mut submission = minimal();
        submission.start_date = "next tuesday".into();
        assert!(matches!(
            submission.validate(&config(), now()),
            Err(SubmissionError::InvalidTimestamp { field: "start_date", .. })
        ));
    }

    #[test]
    fn past_start_respects_grace() {
        // 12h ago: inside the 24h default grace.
        let mut submission = minimal();
        submission.start_date = "2026-08-01T00:00:00Z".into();
        submission.validate(&config(), now()).expect("Valid");

        // 3 days ago: rejected.
        submission.start_date = "2026-07-29T00:00:00Z".into();
        assert!(matches!(
            submission.validate(&config(), now()),
            Err(SubmissionError::StartDateInPast { .. })
        ));
    }

    #[test]
    fn rejects_end_before_start() {
        let mut submission = minimal();
        submission.end_date = Some("2026-09-01T18:00:00Z".into());
        assert_eq!(
            submission.validate(&config(), now()),
            Err(SubmissionError::EndBeforeStart)
        );
    }

    #[test]
    fn url_validation() {
        let mut submission = minimal();
        submission.image_url = "not a url".into();
        assert!(matches!(
            submission.validate(&config(), now()),
            Err(SubmissionError::InvalidUrl { field: "image_url", .. })
        ));

        submission.image_url = "http://example.com/poster.jpg".into();
        assert!(matches!(
            submission.validate(&config(), now()),
            Err(SubmissionError::InsecureUrl { field: "image_url", .. })
        ));

        let mut lax = config();
        lax.require_https = false;
        submission.validate(&lax, now()).expect("Valid over http");

        submission.image_url = "https://example.com/poster.jpg".into();
        submission.validate(&config(), now()).expect("Valid");
    }

    #[test]
    fn rejects_unknown_domain() {
        let mut submission = minimal();
        submission.event_domain = Some("gaming".into());
        assert!(submission.validate(&config(), now()).is_err());

        submission.event_domain = Some("music".into());
        let valid = submission.validate(&config(), now()).expect("Valid");
        assert_eq!(valid.event_domain, Some(EventDomain::Music));
    }

    #[test]
    fn keywords_are_normalized() {
        let mut submission = minimal();
        submission.keywords = vec![
            " jazz ".into(),
            String::new(),
            "JAZZ".into(),
            "blues".into(),
        ];
        let valid = submission.validate(&config(), now()).expect("Valid");
        assert_eq!(valid.keywords, vec!["jazz".to_owned(), "blues".to_owned()]);
    }

    #[test]
    fn start_date_string_is_utc_date() {
        let valid = minimal().validate(&config(), now()).expect("Valid");
        assert_eq!(valid.start_date_string(), "2026-09-01");
    }

    #[test]
    fn blank_location_is_dropped() {
        let mut submission = minimal();
        submission.location = Some(PlaceInput::default());
        let valid = submission.validate(&config(), now()).expect("Valid");
        assert_eq!(valid.location, None);
    }
}
