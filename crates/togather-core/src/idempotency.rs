use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use time::OffsetDateTime;

use crate::id::Ulid;

/// Client-supplied retry key. Stable across retries of the same
/// request; the event reference is filled in once the first attempt
/// commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    /// Hex SHA-256 of the canonical request body, to catch a key
    /// reused for a different request.
    pub request_hash: String,
    pub event_id: Option<i64>,
    pub event_ulid: Option<Ulid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Hex SHA-256 of a canonical request serialization.
pub fn request_hash(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    data_encoding::HEXLOWER.encode(&digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_hash_is_deterministic_hex() {
        let a = request_hash(b"{\"name\":\"Jazz Night\"}");
        let b = request_hash(b"{\"name\":\"Jazz Night\"}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, request_hash(b"{\"name\":\"Other\"}"));
    }
}
