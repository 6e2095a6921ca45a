use core::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};
use snafu::{ResultExt as _, Snafu};

/// Delimiter between the hashed fields.
///
/// The delimiter is part of the hashed domain and pipes inside the
/// inputs are not escaped, so `("a|b", "c")` and `("a", "b|c")`
/// collide. Harmless in practice: a hash hit only short-circuits into
/// the trust merge, which re-checks nothing destructive.
const FIELD_DELIMITER: u8 = b'|';

/// The three normalized inputs the dedup hash is computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupCandidate {
    pub name: String,
    pub venue_key: String,
    pub start_date: String,
}

impl DedupCandidate {
    pub fn new(
        name: impl Into<String>,
        venue_key: impl Into<String>,
        start_date: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            venue_key: venue_key.into(),
            start_date: start_date.into(),
        }
    }

    /// SHA-256 over `norm(name) | norm(venue_key) | norm(start_date)`
    /// where `norm` is trim + lowercase. Deterministic,
    /// case-insensitive, and whitespace-invariant in all three
    /// fields; empty fields are allowed and hash a stable string.
    pub fn hash(&self) -> DedupHash {
        let mut hasher = Sha256::new();
        hasher.update(normalize_field(&self.name).as_bytes());
        hasher.update([FIELD_DELIMITER]);
        hasher.update(normalize_field(&self.venue_key).as_bytes());
        hasher.update([FIELD_DELIMITER]);
        hasher.update(normalize_field(&self.start_date).as_bytes());
        DedupHash(hasher.finalize().into())
    }
}

fn normalize_field(field: &str) -> String {
    field.trim().to_lowercase()
}

/// Venue component of the dedup candidate:
/// `lower(trim(venue_name)) + lower(trim(locality))`.
///
/// Empty fields contribute an empty segment; a virtual event with no
/// venue gets the empty string.
pub fn venue_key(venue_name: &str, locality: &str) -> String {
    let mut key = normalize_field(venue_name);
    key.push_str(&normalize_field(locality));
    key
}

/// Hex form length of a [`DedupHash`].
pub const DEDUP_HASH_STR_LEN: usize = 64;

/// SHA-256 digest identifying an event by (name, venue, start date).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DedupHash([u8; 32]);

impl DedupHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Display for DedupHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(self.as_slice(), f)
    }
}

impl fmt::Debug for DedupHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DedupHash({self})")
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum DedupHashParseError {
    #[snafu(display("Invalid length: expected {DEDUP_HASH_STR_LEN} chars, got {len}"))]
    InvalidLength { len: usize },
    #[snafu(display("Invalid hex: {source}"))]
    Decoding { source: data_encoding::DecodeError },
}

impl FromStr for DedupHash {
    type Err = DedupHashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DEDUP_HASH_STR_LEN {
            return Err(InvalidLengthSnafu { len: s.len() }.build());
        }
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .context(DecodingSnafu)?;
        Ok(Self(bytes.try_into().expect("Length checked above")))
    }
}

impl ::serde::Serialize for DedupHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ::serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> ::serde::Deserialize<'de> for DedupHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: ::serde::Deserializer<'de>,
    {
        let s = <std::borrow::Cow<'_, str>>::deserialize(deserializer)?;
        Self::from_str(&s).map_err(::serde::de::Error::custom)
    }
}
