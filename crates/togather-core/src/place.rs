use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::id::Ulid;

/// Canonical identity of a place or organization: normalized name +
/// locality + region + country. Two rows with equal keys are the same
/// entity by definition; everything less exact goes through fuzzy
/// matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub name: String,
    pub locality: String,
    pub region: String,
    pub country: String,
}

impl CanonicalKey {
    pub fn new(name: &str, locality: &str, region: &str, country: &str) -> Self {
        Self {
            name: normalize(name),
            locality: normalize(locality),
            region: normalize(region),
            country: normalize(country),
        }
    }
}

fn normalize(field: &str) -> String {
    field.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: i64,
    pub ulid: Ulid,
    pub name: String,
    pub locality: String,
    pub region: String,
    pub country: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Place {
    pub fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey::new(&self.name, &self.locality, &self.region, &self.country)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub ulid: Ulid,
    pub name: String,
    pub locality: String,
    pub region: String,
    pub country: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Organization {
    pub fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey::new(&self.name, &self.locality, &self.region, &self.country)
    }
}
