//! PostgreSQL health tracker backed by the `resource_health` table

use super::{HealthFilter, HealthPolicy, HealthTracker, ResourceHealth};
use crate::error::Result;
use crate::models::FetchTarget;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info};

const HEALTH_COLUMNS: &str = "family, identifier, url, last_checked, last_status, \
    consecutive_failures, first_failure_at, last_success_at, permanent_unavailable, note";

pub struct PgHealthTracker {
    pool: PgPool,
    policy: HealthPolicy,
}

impl PgHealthTracker {
    pub fn new(pool: PgPool, policy: HealthPolicy) -> Self {
        Self { pool, policy }
    }
}

#[async_trait]
impl HealthTracker for PgHealthTracker {
    async fn is_permanently_unavailable(&self, family: &str, url: &str) -> Result<bool> {
        let flag = sqlx::query_scalar::<_, bool>(
            "SELECT permanent_unavailable FROM resource_health WHERE family = $1 AND url = $2",
        )
        .bind(family)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn record_outcome(
        &self,
        target: &FetchTarget,
        status: Option<u16>,
        success: bool,
    ) -> Result<ResourceHealth> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO resource_health (family, identifier, url, last_checked)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (family, url) DO NOTHING
            "#,
        )
        .bind(&target.family)
        .bind(target.identifier)
        .bind(&target.url)
        .execute(&mut *tx)
        .await?;

        // Row lock held until commit: concurrent updates of one URL queue here
        let mut record = sqlx::query_as::<_, ResourceHealth>(&format!(
            "SELECT {} FROM resource_health WHERE family = $1 AND url = $2 FOR UPDATE",
            HEALTH_COLUMNS
        ))
        .bind(&target.family)
        .bind(&target.url)
        .fetch_one(&mut *tx)
        .await?;

        let max_seen = if !success && status == Some(404) {
            sqlx::query_scalar::<_, Option<i64>>(
                r#"
                SELECT MAX(identifier) FROM resource_health
                WHERE family = $1 AND last_success_at IS NOT NULL
                "#,
            )
            .bind(&target.family)
            .fetch_one(&mut *tx)
            .await?
        } else {
            None
        };

        let was_permanent = record.permanent_unavailable;
        record.apply(status, success, &self.policy, max_seen, Utc::now());

        sqlx::query(
            r#"
            UPDATE resource_health
            SET identifier = COALESCE($3, identifier),
                last_checked = $4,
                last_status = $5,
                consecutive_failures = $6,
                first_failure_at = $7,
                last_success_at = $8,
                permanent_unavailable = $9,
                note = $10
            WHERE family = $1 AND url = $2
            "#,
        )
        .bind(&record.family)
        .bind(&record.url)
        .bind(target.identifier)
        .bind(record.last_checked)
        .bind(record.last_status)
        .bind(record.consecutive_failures)
        .bind(record.first_failure_at)
        .bind(record.last_success_at)
        .bind(record.permanent_unavailable)
        .bind(&record.note)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if record.permanent_unavailable && !was_permanent {
            info!(
                family = %record.family,
                url = %record.url,
                failures = record.consecutive_failures,
                "Marked permanently unavailable"
            );
        } else if was_permanent && !record.permanent_unavailable {
            info!(family = %record.family, url = %record.url, "Resource is available again");
        } else {
            debug!(url = %record.url, status = ?status, success, "Recorded outcome");
        }

        Ok(record)
    }

    async fn get(&self, family: &str, url: &str) -> Result<Option<ResourceHealth>> {
        Ok(sqlx::query_as::<_, ResourceHealth>(&format!(
            "SELECT {} FROM resource_health WHERE family = $1 AND url = $2",
            HEALTH_COLUMNS
        ))
        .bind(family)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list(&self, filter: &HealthFilter) -> Result<Vec<ResourceHealth>> {
        let limit = (filter.limit > 0).then_some(filter.limit);
        Ok(sqlx::query_as::<_, ResourceHealth>(&format!(
            r#"
            SELECT {} FROM resource_health
            WHERE ($1::text IS NULL OR family = $1)
              AND (NOT $2 OR permanent_unavailable)
            ORDER BY last_checked DESC, url
            LIMIT $3
            "#,
            HEALTH_COLUMNS
        ))
        .bind(filter.family.as_deref())
        .bind(filter.permanent_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}
