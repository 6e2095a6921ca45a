use core::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::Specification;
use rand::Rng as _;
use snafu::{ResultExt as _, Snafu};

/// Crockford base32, the alphabet ULIDs are written in.
///
/// Lowercase input is accepted and folded to uppercase; the encoded
/// form is always uppercase. Symbol order is ascending ASCII, so the
/// string ordering of two encoded ULIDs matches their byte ordering.
pub fn crockford_encoding() -> data_encoding::Encoding {
    let mut spec = Specification::new();
    spec.symbols.push_str("0123456789ABCDEFGHJKMNPQRSTVWXYZ");
    spec.translate
        .from
        .push_str("abcdefghjkmnpqrstvwxyz");
    spec.translate.to.push_str("ABCDEFGHJKMNPQRSTVWXYZ");
    spec.encoding().expect("Valid encoding spec")
}

/// Encoded length of a [`Ulid`]: 128 bits in base32.
pub const ULID_STR_LEN: usize = 26;

/// A 128-bit lexicographically sortable identifier.
///
/// The first 6 bytes are a big-endian millisecond timestamp, the
/// remaining 10 bytes are entropy. Byte order is creation order, and
/// the base32 form preserves it, so `ORDER BY ulid` is `ORDER BY
/// created_at` for free.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ulid([u8; 16]);

impl Ulid {
    pub const ZERO: Self = Self([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Millisecond timestamp embedded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..].copy_from_slice(&self.0[..6]);
        u64::from_be_bytes(buf)
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crockford_encoding().encode_write(self.as_slice(), f)
    }
}

impl fmt::Debug for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ulid({self})")
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum UlidParseError {
    #[snafu(display("Invalid length: expected {ULID_STR_LEN} chars, got {len}"))]
    InvalidLength { len: usize },
    #[snafu(display("Invalid base32: {source}"))]
    Decoding { source: data_encoding::DecodeError },
}

impl FromStr for Ulid {
    type Err = UlidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ULID_STR_LEN {
            return Err(InvalidLengthSnafu { len: s.len() }.build());
        }
        let bytes = crockford_encoding()
            .decode(s.as_bytes())
            .context(DecodingSnafu)?;
        Ok(Self(bytes.try_into().expect("Length checked above")))
    }
}

impl ::serde::Serialize for Ulid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ::serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> ::serde::Deserialize<'de> for Ulid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: ::serde::Deserializer<'de>,
    {
        let s = <std::borrow::Cow<'_, str>>::deserialize(deserializer)?;
        Self::from_str(&s).map_err(::serde::de::Error::custom)
    }
}

/// Monotonic ULID source.
///
/// Within a single millisecond the entropy is incremented instead of
/// re-rolled, so ids generated back-to-back stay strictly ordered.
#[derive(Debug)]
pub struct UlidGenerator {
    last: Mutex<(u64, [u8; 10])>,
}

impl Default for UlidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl UlidGenerator {
    pub fn new() -> Self {
        Self {
            last: Mutex::new((0, [0; 10])),
        }
    }

    pub fn generate(&self) -> Ulid {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System clock before unix epoch")
            .as_millis() as u64;

        let mut last = self.last.lock().expect("Locking failed");

        let (mut ms, mut entropy) = *last;
        if ms < now_ms {
            ms = now_ms;
            rand::rng().fill(&mut entropy);
        } else {
            // Same (or rewound) millisecond: bump the 80-bit entropy
            // as a big-endian counter. Overflow advances the
            // timestamp instead of wrapping back below older ids.
            if !increment_be(&mut entropy) {
                ms += 1;
                rand::rng().fill(&mut entropy);
            }
        }
        *last = (ms, entropy);

        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&ms.to_be_bytes()[2..]);
        bytes[6..].copy_from_slice(&entropy);
        Ulid(bytes)
    }
}

/// Increments a big-endian byte counter. Returns false on overflow.
fn increment_be(bytes: &mut [u8; 10]) -> bool {
    for b in bytes.iter_mut().rev() {
        let (next, overflow) = b.overflowing_add(1);
        *b = next;
        if !overflow {
            return true;
        }
    }
    false
}
