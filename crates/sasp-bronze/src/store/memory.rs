//! In-process content store for dry runs and tests

use super::{ContentStore, NewPayload, PutOutcome, PutStatus};
use crate::error::Result;
use crate::models::{ArchivedPayload, ConflictPolicy};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use tokio::sync::Mutex;

/// Same dedup and upsert rules as the Postgres store, held in a `Vec`
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    rows: Mutex<Vec<ArchivedPayload>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row in insertion order
    pub async fn rows(&self) -> Vec<ArchivedPayload> {
        self.rows.lock().await.clone()
    }

    fn put_locked(rows: &mut Vec<ArchivedPayload>, item: &NewPayload) -> PutOutcome {
        let outcome = |status, row_id| PutOutcome {
            status,
            row_id,
            content_hash: item.content_hash.clone(),
        };

        if let Some(row) = rows
            .iter()
            .find(|r| r.family == item.family && r.content_hash == item.content_hash)
        {
            return outcome(PutStatus::Duplicate, row.id);
        }

        if let (ConflictPolicy::UpsertByIdentifier, Some(identifier)) = (item.policy, item.identifier) {
            if let Some(row) = rows
                .iter_mut()
                .rev()
                .find(|r| r.family == item.family && r.identifier == Some(identifier))
            {
                row.payload = item.payload.clone();
                row.source_url = item.source_url.clone();
                row.content_hash = item.content_hash.clone();
                row.ingested_at = Utc::now();
                return outcome(PutStatus::Updated, row.id);
            }
        }

        let id = rows.len() as i64 + 1;
        rows.push(ArchivedPayload {
            id,
            family: item.family.clone(),
            identifier: item.identifier,
            payload: item.payload.clone(),
            source_url: item.source_url.clone(),
            content_hash: item.content_hash.clone(),
            ingested_at: Utc::now(),
        });
        outcome(PutStatus::Inserted, id)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put_batch(&self, items: &[NewPayload]) -> Result<Vec<Result<PutOutcome>>> {
        let mut rows = self.rows.lock().await;
        Ok(items
            .iter()
            .map(|item| Ok(Self::put_locked(&mut rows, item)))
            .collect())
    }

    async fn list_payloads(&self, family: &str, limit: Option<i64>) -> Result<Vec<ArchivedPayload>> {
        let rows = self.rows.lock().await;
        let limit = limit.map_or(usize::MAX, |l| l.max(0) as usize);
        // rows are appended, so Vec order is ingestion order
        Ok(rows
            .iter()
            .filter(|r| r.family == family)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn archived_identifiers(&self, family: &str) -> Result<BTreeSet<i64>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|r| r.family == family)
            .filter_map(|r| r.identifier)
            .collect())
    }

    async fn count(&self, family: &str) -> Result<i64> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().filter(|r| r.family == family).count() as i64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::ResourceFamily;
    use serde_json::json;

    fn scoreboard() -> ResourceFamily {
        ResourceFamily::new("raw_scoreboard").unwrap()
    }

    #[tokio::test]
    async fn test_same_content_stored_once() {
        let store = MemoryContentStore::new();
        let family = scoreboard();

        let first = store
            .put(&NewPayload::new(&family, Some(1), "https://x/1", json!({"id": 1, "score": [3, 2]})))
            .await
            .unwrap();
        let second = store
            .put(&NewPayload::new(&family, Some(1), "https://x/1", json!({"score": [3, 2], "id": 1})))
            .await
            .unwrap();

        assert!(first.stored());
        assert!(!second.stored());
        assert_eq!(first.row_id, second.row_id);
        assert_eq!(store.count("raw_scoreboard").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_content_in_two_families_is_stored_twice() {
        let store = MemoryContentStore::new();
        let scoreboard = scoreboard();
        let schedule = ResourceFamily::new("raw_schedule").unwrap();
        let body = json!({"data": [], "message": "no matches"});

        let first = store
            .put(&NewPayload::new(&scoreboard, None, "https://x/a", body.clone()))
            .await
            .unwrap();
        let second = store
            .put(&NewPayload::new(&schedule, None, "https://x/b", body))
            .await
            .unwrap();

        assert_eq!(first.status, PutStatus::Inserted);
        assert_eq!(second.status, PutStatus::Inserted);
        assert_ne!(first.row_id, second.row_id);
        assert_eq!(store.count("raw_schedule").await.unwrap(), 1);
        assert_eq!(store.list_payloads("raw_schedule", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_only_keeps_snapshots() {
        let store = MemoryContentStore::new();
        let family = scoreboard();

        store
            .put(&NewPayload::new(&family, Some(5), "https://x/5", json!({"id": 5, "score": 1})))
            .await
            .unwrap();
        let changed = store
            .put(&NewPayload::new(&family, Some(5), "https://x/5", json!({"id": 5, "score": 2})))
            .await
            .unwrap();

        assert_eq!(changed.status, PutStatus::Inserted);
        assert_eq!(store.count("raw_scoreboard").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_family_replaces_changed_content() {
        let store = MemoryContentStore::new();
        let teams = ResourceFamily::new("raw_teams")
            .unwrap()
            .with_policy(ConflictPolicy::UpsertByIdentifier);

        let first = store
            .put(&NewPayload::new(&teams, Some(12), "https://x/12", json!({"id": 12, "name": "Old"})))
            .await
            .unwrap();
        let second = store
            .put(&NewPayload::new(&teams, Some(12), "https://x/12", json!({"id": 12, "name": "New"})))
            .await
            .unwrap();

        assert_eq!(second.status, PutStatus::Updated);
        assert_eq!(second.row_id, first.row_id);
        let rows = store.list_payloads("raw_teams", None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload["name"], "New");
    }

    #[tokio::test]
    async fn test_list_and_identifiers_are_per_family() {
        let store = MemoryContentStore::new();
        let scoreboard = scoreboard();
        let schedule = ResourceFamily::new("raw_schedule").unwrap();

        for id in [3, 1, 2] {
            store
                .put(&NewPayload::new(&scoreboard, Some(id), "u", json!({"id": id})))
                .await
                .unwrap();
        }
        store
            .put(&NewPayload::new(&schedule, Some(9), "u", json!({"id": 9, "kind": "schedule"})))
            .await
            .unwrap();

        let ids = store.archived_identifiers("raw_scoreboard").await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let listed = store.list_payloads("raw_scoreboard", Some(2)).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].identifier, Some(3));
    }
}
