//! Content-addressed payload store
//!
//! Payloads are keyed by the SHA-256 of their canonical JSON form. Storing the
//! same logical content twice is a successful no-op, which is what makes
//! re-running an ingestion safe. Families using
//! [`ConflictPolicy::UpsertByIdentifier`] additionally replace the row held for
//! an identifier when its content changes.

pub mod memory;
pub mod postgres;

pub use memory::MemoryContentStore;
pub use postgres::PgContentStore;

use crate::discovery::listing::as_identifier;
use crate::discovery::template::identifier_from_url;
use crate::error::{BronzeError, Result};
use crate::models::{ArchivedPayload, ConflictPolicy, ResourceFamily};
use async_trait::async_trait;
use sasp_common::checksum::content_hash;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// Payload keys that carry a record identifier, in lookup order
pub const PAYLOAD_ID_KEYS: [&str; 4] = ["match_number", "MatchNumber", "matchNumber", "id"];

/// Identifier to store next to a payload
///
/// Taken from the payload body when present, else from the trailing numeric
/// segment of the source URL.
pub fn identifier_hint(payload: &Value, source_url: &str) -> Option<i64> {
    PAYLOAD_ID_KEYS
        .iter()
        .find_map(|key| payload.get(*key).and_then(as_identifier))
        .or_else(|| identifier_from_url(source_url))
}

/// A payload ready to be written
#[derive(Debug, Clone)]
pub struct NewPayload {
    pub family: String,
    pub policy: ConflictPolicy,
    pub identifier: Option<i64>,
    pub source_url: String,
    pub payload: Value,
    pub content_hash: String,
}

impl NewPayload {
    pub fn new(
        family: &ResourceFamily,
        identifier: Option<i64>,
        source_url: impl Into<String>,
        payload: Value,
    ) -> Self {
        let content_hash = content_hash(&payload);
        Self {
            family: family.name().to_string(),
            policy: family.policy(),
            identifier,
            source_url: source_url.into(),
            payload,
            content_hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PutStatus {
    /// A new row was written
    Inserted,
    /// An existing row for the identifier now holds the new content
    Updated,
    /// Identical content was already archived
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutOutcome {
    pub status: PutStatus,
    pub row_id: i64,
    pub content_hash: String,
}

impl PutOutcome {
    /// Whether this call changed the store
    pub fn stored(&self) -> bool {
        self.status != PutStatus::Duplicate
    }
}

/// Durable archive of raw payloads
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Write one payload in its own transaction
    async fn put(&self, item: &NewPayload) -> Result<PutOutcome> {
        self.put_batch(std::slice::from_ref(item))
            .await?
            .pop()
            .ok_or_else(|| BronzeError::Persistence("empty batch result".to_string()))?
    }

    /// Write a batch in one transaction
    ///
    /// The outer error means nothing was committed; inner errors affect only
    /// their own item.
    async fn put_batch(&self, items: &[NewPayload]) -> Result<Vec<Result<PutOutcome>>>;

    /// Archived payloads of a family, oldest first
    async fn list_payloads(&self, family: &str, limit: Option<i64>) -> Result<Vec<ArchivedPayload>>;

    /// Identifiers already archived for a family
    async fn archived_identifiers(&self, family: &str) -> Result<BTreeSet<i64>>;

    async fn count(&self, family: &str) -> Result<i64>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identifier_hint_prefers_payload() {
        let payload = json!({"MatchNumber": "581", "id": 9});
        assert_eq!(identifier_hint(&payload, "https://example.com/api/x/600"), Some(581));
    }

    #[test]
    fn test_identifier_hint_falls_back_to_url() {
        let payload = json!({"name": "Eagles"});
        assert_eq!(identifier_hint(&payload, "https://example.com/api/teams/77"), Some(77));
        assert_eq!(identifier_hint(&payload, "https://example.com/api/teams?page=2"), None);
    }

    #[test]
    fn test_new_payload_hash_is_canonical() {
        let family = ResourceFamily::new("raw_teams").unwrap();
        let a = NewPayload::new(&family, Some(1), "u", json!({"id": 1, "name": "A"}));
        let b = NewPayload::new(&family, Some(1), "u", json!({"name": "A", "id": 1}));
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.policy, ConflictPolicy::AppendOnly);
    }
}
