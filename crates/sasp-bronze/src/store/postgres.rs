//! PostgreSQL content store backed by the `bronze_payloads` table

use super::{ContentStore, NewPayload, PutOutcome, PutStatus};
use crate::error::{BronzeError, Result};
use crate::models::{ArchivedPayload, ConflictPolicy};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn put_tx(&self, tx: &mut Transaction<'_, Postgres>, item: &NewPayload) -> Result<PutOutcome> {
        match (item.policy, item.identifier) {
            (ConflictPolicy::UpsertByIdentifier, Some(identifier)) => {
                self.upsert_by_identifier_tx(tx, item, identifier).await
            },
            _ => self.insert_tx(tx, item).await,
        }
    }

    async fn insert_tx(&self, tx: &mut Transaction<'_, Postgres>, item: &NewPayload) -> Result<PutOutcome> {
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO bronze_payloads (family, identifier, payload, source_url, content_hash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (family, content_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&item.family)
        .bind(item.identifier)
        .bind(&item.payload)
        .bind(&item.source_url)
        .bind(&item.content_hash)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row_id) = inserted {
            return Ok(self.outcome(PutStatus::Inserted, row_id, item));
        }

        let row_id = self.id_by_hash_tx(tx, item).await?.ok_or_else(|| {
            BronzeError::Persistence(format!(
                "content hash {} conflicted but no row was found",
                item.content_hash
            ))
        })?;
        Ok(self.outcome(PutStatus::Duplicate, row_id, item))
    }

    async fn upsert_by_identifier_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        item: &NewPayload,
        identifier: i64,
    ) -> Result<PutOutcome> {
        // Serializes writers of the same (family, identifier) until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), ($2 % 2147483647)::int4)")
            .bind(&item.family)
            .bind(identifier)
            .execute(&mut **tx)
            .await?;

        if let Some(row_id) = self.id_by_hash_tx(tx, item).await? {
            return Ok(self.outcome(PutStatus::Duplicate, row_id, item));
        }

        let existing = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM bronze_payloads
            WHERE family = $1 AND identifier = $2
            ORDER BY ingested_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(&item.family)
        .bind(identifier)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row_id) = existing else {
            return self.insert_tx(tx, item).await;
        };

        sqlx::query(
            r#"
            UPDATE bronze_payloads
            SET payload = $1, source_url = $2, content_hash = $3, ingested_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(&item.payload)
        .bind(&item.source_url)
        .bind(&item.content_hash)
        .bind(row_id)
        .execute(&mut **tx)
        .await?;

        debug!(family = %item.family, identifier, row_id, "Replaced payload for identifier");
        Ok(self.outcome(PutStatus::Updated, row_id, item))
    }

    async fn id_by_hash_tx(&self, tx: &mut Transaction<'_, Postgres>, item: &NewPayload) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT id FROM bronze_payloads WHERE content_hash = $1 AND family = $2",
        )
        .bind(&item.content_hash)
        .bind(&item.family)
        .fetch_optional(&mut **tx)
        .await?)
    }

    fn outcome(&self, status: PutStatus, row_id: i64, item: &NewPayload) -> PutOutcome {
        PutOutcome {
            status,
            row_id,
            content_hash: item.content_hash.clone(),
        }
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn put_batch(&self, items: &[NewPayload]) -> Result<Vec<Result<PutOutcome>>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(items.len());

        for item in items {
            // Isolate each item so one failure does not abort the batch
            sqlx::query("SAVEPOINT payload_item").execute(&mut *tx).await?;

            match self.put_tx(&mut tx, item).await {
                Ok(outcome) => {
                    sqlx::query("RELEASE SAVEPOINT payload_item")
                        .execute(&mut *tx)
                        .await?;
                    outcomes.push(Ok(outcome));
                },
                Err(e) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT payload_item")
                        .execute(&mut *tx)
                        .await?;
                    warn!(
                        family = %item.family,
                        url = %item.source_url,
                        error = %e,
                        "Failed to store payload (isolated with savepoint)"
                    );
                    outcomes.push(Err(e));
                },
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn list_payloads(&self, family: &str, limit: Option<i64>) -> Result<Vec<ArchivedPayload>> {
        let rows = sqlx::query_as::<_, ArchivedPayload>(
            r#"
            SELECT id, family, identifier, payload, source_url, content_hash, ingested_at
            FROM bronze_payloads
            WHERE family = $1
            ORDER BY ingested_at, id
            LIMIT $2
            "#,
        )
        .bind(family)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn archived_identifiers(&self, family: &str) -> Result<BTreeSet<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT identifier FROM bronze_payloads WHERE family = $1 AND identifier IS NOT NULL",
        )
        .bind(family)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn count(&self, family: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM bronze_payloads WHERE family = $1")
                .bind(family)
                .fetch_one(&self.pool)
                .await?,
        )
    }
}
