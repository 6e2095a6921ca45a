use snafu::Snafu;
use time::Duration;
use togather_core::source::TrustLevel;

/// Default grace window for submissions whose start date is already
/// in the past: scrapers routinely pick up events mid-way through.
pub const PAST_GRACE_DEFAULT: Duration = Duration::hours(24);

/// Default minimum name similarity for the near-duplicate scan.
pub const NEAR_DUPLICATE_THRESHOLD_DEFAULT: f64 = 0.7;

/// Default fuzzy thresholds for place and organization resolution.
pub const FUZZY_REVIEW_THRESHOLD_DEFAULT: f64 = 0.6;
pub const FUZZY_AUTO_MERGE_THRESHOLD_DEFAULT: f64 = 0.95;

#[derive(Debug, Snafu, Clone, PartialEq)]
pub enum ConfigError {
    #[snafu(display("{name} threshold out of range 0..=1: {value}"))]
    ThresholdRange { name: &'static str, value: f64 },
    #[snafu(display(
        "{name} auto-merge threshold {auto_merge} below review threshold {review}"
    ))]
    ThresholdOrder {
        name: &'static str,
        review: f64,
        auto_merge: f64,
    },
}

/// Fuzzy resolution thresholds for one entity kind.
///
/// A `review` threshold of 0 disables the similarity query entirely.
/// Candidates scoring in `review..auto_merge` get flagged for human
/// review; `auto_merge` and above (inclusive) merge silently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzyThresholds {
    pub review: f64,
    pub auto_merge: f64,
}

impl Default for FuzzyThresholds {
    fn default() -> Self {
        Self {
            review: FUZZY_REVIEW_THRESHOLD_DEFAULT,
            auto_merge: FUZZY_AUTO_MERGE_THRESHOLD_DEFAULT,
        }
    }
}

impl FuzzyThresholds {
    pub fn disabled() -> Self {
        Self {
            review: 0.0,
            auto_merge: 0.0,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.review == 0.0
    }

    fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        for value in [self.review, self.auto_merge] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdRange { name, value });
            }
        }
        // An inverted pair can only be a typo for the opposite order,
        // so it is rejected rather than treated as "flag everything".
        if !self.is_disabled() && self.auto_merge < self.review {
            return Err(ConfigError::ThresholdOrder {
                name,
                review: self.review,
                auto_merge: self.auto_merge,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Emit `missing_image` when a submission has no image.
    pub require_image: bool,
    /// Reject non-HTTPS image/public/virtual URLs.
    pub require_https: bool,
    /// How far in the past a start date may lie before rejection.
    pub past_grace: Duration,
    pub place_thresholds: FuzzyThresholds,
    pub org_thresholds: FuzzyThresholds,
    /// Minimum name similarity for `potential_duplicate` warnings; 0
    /// disables the scan.
    pub near_duplicate_threshold: f64,
    /// Trust assigned to submissions without a source block.
    pub default_trust: TrustLevel,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            require_image: false,
            require_https: true,
            past_grace: PAST_GRACE_DEFAULT,
            place_thresholds: FuzzyThresholds::default(),
            org_thresholds: FuzzyThresholds::default(),
            near_duplicate_threshold: NEAR_DUPLICATE_THRESHOLD_DEFAULT,
            default_trust: TrustLevel::MIN,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.place_thresholds.validate("place")?;
        self.org_thresholds.validate("organization")?;
        if !(0.0..=1.0).contains(&self.near_duplicate_threshold) {
            return Err(ConfigError::ThresholdRange {
                name: "near_duplicate",
                value: self.near_duplicate_threshold,
            });
        }
        Ok(())
    }
}
