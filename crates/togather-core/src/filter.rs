use snafu::Snafu;
use time::Date;
use time::format_description::well_known::Rfc3339;

use crate::event::{EventDomain, LifecycleState};
use crate::id::Ulid;

pub const LIMIT_DEFAULT: u32 = 50;
pub const LIMIT_MAX: u32 = 200;

/// A rejected query parameter, named so the API layer can map it onto
/// the offending field.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Invalid filter `{field}`: {message}"))]
pub struct FilterError {
    pub field: &'static str,
    pub message: String,
}

impl FilterError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Raw query parameters as the list API receives them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEventQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub venue_id: Option<String>,
    pub organizer_id: Option<String>,
    pub state: Option<String>,
    pub domain: Option<String>,
    pub q: Option<String>,
    pub keywords: Option<String>,
    pub limit: Option<String>,
    pub after: Option<String>,
}

/// Validated listing filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilters {
    pub start_date: Option<Date>,
    pub end_date: Option<Date>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub venue_id: Option<Ulid>,
    pub organizer_id: Option<Ulid>,
    pub state: Option<LifecycleState>,
    pub domain: Option<EventDomain>,
    pub q: Option<String>,
    pub keywords: Vec<String>,
}

/// Cursor pagination: `after` is the last ULID of the previous page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub after: Option<Ulid>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: LIMIT_DEFAULT,
            after: None,
        }
    }
}

impl EventFilters {
    /// Validates the raw query surface field by field. The first
    /// failing field wins; the API maps the error straight onto it.
    pub fn parse(raw: &RawEventQuery) -> Result<(Self, Pagination), FilterError> {
        let start_date = raw
            .start_date
            .as_deref()
            .map(|s| parse_date("startDate", s))
            .transpose()?;
        let end_date = raw
            .end_date
            .as_deref()
            .map(|s| parse_date("endDate", s))
            .transpose()?;
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if end < start {
                return Err(FilterError::new(
                    "endDate",
                    format!("must not be before startDate ({start} > {end})"),
                ));
            }
        }

        let venue_id = raw
            .venue_id
            .as_deref()
            .map(|s| parse_ulid("venueId", s))
            .transpose()?;
        let organizer_id = raw
            .organizer_id
            .as_deref()
            .map(|s| parse_ulid("organizerId", s))
            .transpose()?;

        let state = raw
            .state
            .as_deref()
            .map(|s| {
                s.parse::<LifecycleState>()
                    .map_err(|err| FilterError::new("state", err.to_string()))
            })
            .transpose()?;
        let domain = raw
            .domain
            .as_deref()
            .map(|s| {
                s.parse::<EventDomain>()
                    .map_err(|err| FilterError::new("domain", err.to_string()))
            })
            .transpose()?;

        let keywords = raw
            .keywords
            .as_deref()
            .map(split_keywords)
            .unwrap_or_default();

        let limit = match raw.limit.as_deref() {
            None => LIMIT_DEFAULT,
            Some(s) => {
                let limit: u32 = s
                    .parse()
                    .map_err(|_| FilterError::new("limit", format!("not a number: {s}")))?;
                if limit < 1 || LIMIT_MAX < limit {
                    return Err(FilterError::new(
                        "limit",
                        format!("must be within 1..={LIMIT_MAX}, got {limit}"),
                    ));
                }
                limit
            }
        };
        let after = raw
            .after
            .as_deref()
            .map(|s| parse_ulid("after", s))
            .transpose()?;

        let filters = Self {
            start_date,
            end_date,
            city: none_if_blank(raw.city.as_deref()),
            region: none_if_blank(raw.region.as_deref()),
            venue_id,
            organizer_id,
            state,
            domain,
            q: none_if_blank(raw.q.as_deref()),
            keywords,
        };
        Ok((filters, Pagination { limit, after }))
    }
}

fn parse_date(field: &'static str, s: &str) -> Result<Date, FilterError> {
    let format = time::macros::format_description!("[year]-[month]-[day]");
    Date::parse(s, &format)
        // Accept a full RFC3339 timestamp and keep its date.
        .or_else(|_| {
            time::OffsetDateTime::parse(s, &Rfc3339).map(|timestamp| timestamp.date())
        })
        .map_err(|_| FilterError::new(field, format!("not a date: {s}")))
}

fn parse_ulid(field: &'static str, s: &str) -> Result<Ulid, FilterError> {
    s.parse()
        .map_err(|err: crate::id::UlidParseError| FilterError::new(field, err.to_string()))
}

/// Comma-separated keywords: trimmed, blanks dropped, first
/// occurrence wins.
pub fn split_keywords(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_lowercase()))
        .map(str::to_owned)
        .collect()
}

fn none_if_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    #[test]
    fn empty_query_gets_defaults() {
        let (filters, page) = EventFilters::parse(&RawEventQuery::default()).expect("Valid");
        assert_eq!(filters, EventFilters::default());
        assert_eq!(page.limit, LIMIT_DEFAULT);
        assert_eq!(page.after, None);
    }

    #[test]
    fn parses_dates() {
        let raw = RawEventQuery {
            start_date: Some("2026-08-01".into()),
            end_date: Some("2026-08-31".into()),
            ..Default::default()
        };
        let (filters, _) = EventFilters::parse(&raw).expect("Valid");
        assert_eq!(filters.start_date, Some(date!(2026 - 08 - 01)));
        assert_eq!(filters.end_date, Some(date!(2026 - 08 - 31)));
    }

    #[test]
    fn rejects_end_before_start() {
        let raw = RawEventQuery {
            start_date: Some("2026-08-31".into()),
            end_date: Some("2026-08-01".into()),
            ..Default::default()
        };
        let err = EventFilters::parse(&raw).expect_err("Invalid");
        assert_eq!(err.field, "endDate");
    }

    #[test]
    fn rejects_bad_ulid() {
        let raw = RawEventQuery {
            venue_id: Some("not-a-ulid".into()),
            ..Default::default()
        };
        let err = EventFilters::parse(&raw).expect_err("Invalid");
        assert_eq!(err.field, "venueId");
    }

    #[test]
    fn rejects_unknown_state_and_domain() {
        let raw = RawEventQuery {
            state: Some("live".into()),
            ..Default::default()
        };
        assert_eq!(EventFilters::parse(&raw).expect_err("Invalid").field, "state");

        let raw = RawEventQuery {
            domain: Some("gaming".into()),
            ..Default::default()
        };
        assert_eq!(
            EventFilters::parse(&raw).expect_err("Invalid").field,
            "domain"
        );
    }

    #[test]
    fn limit_bounds() {
        for bad in ["0", "201", "banana"] {
            let raw = RawEventQuery {
                limit: Some(bad.into()),
                ..Default::default()
            };
            assert_eq!(
                EventFilters::parse(&raw).expect_err("Invalid").field,
                "limit",
                "limit={bad}"
            );
        }

        let raw = RawEventQuery {
            limit: Some("200".into()),
            ..Default::default()
        };
        let (_, page) = EventFilters::parse(&raw).expect("Valid");
        assert_eq!(page.limit, 200);
    }

    #[test]
    fn splits_keywords() {
        assert_eq!(
            split_keywords("jazz, live music , ,JAZZ,blues"),
            vec!["jazz".to_owned(), "live music".to_owned(), "blues".to_owned()]
        );
    }

    #[test]
    fn blank_text_fields_become_none() {
        let raw = RawEventQuery {
            city: Some("  ".into()),
            q: Some(" fox ".into()),
            ..Default::default()
        };
        let (filters, _) = EventFilters::parse(&raw).expect("Valid");
        assert_eq!(filters.city, None);
        assert_eq!(filters.q, Some("fox".into()));
    }
}
