//! Ledger of ingestion runs

use crate::error::Result;
use crate::models::IngestStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Terminal status for a run that returned stats
    pub fn from_stats(stats: &IngestStats) -> Self {
        if stats.cancelled {
            Self::Cancelled
        } else {
            Self::Completed
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IngestionRun {
    pub id: Uuid,
    pub family: String,
    pub mode: String,
    pub status: String,
    pub attempted: i64,
    pub stored: i64,
    pub duplicate: i64,
    pub not_found: i64,
    pub error: i64,
    pub skipped: i64,
    pub elapsed_secs: Option<f64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Records run start and outcome in `ingestion_runs`
#[derive(Clone)]
pub struct PgRunLedger {
    pool: PgPool,
}

impl PgRunLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn start(&self, family: &str, mode: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ingestion_runs (id, family, mode, status)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(family)
        .bind(mode)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        tracing::debug!(run_id = %id, family, mode, "Run started");
        Ok(id)
    }

    /// Close a run; `stats` is `None` when the run aborted before producing any
    pub async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        stats: Option<&IngestStats>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let counter = |f: fn(&IngestStats) -> u64| stats.map_or(0, |s| f(s) as i64);

        sqlx::query(
            r#"
            UPDATE ingestion_runs
            SET status = $2,
                attempted = $3,
                stored = $4,
                duplicate = $5,
                not_found = $6,
                error = $7,
                skipped = $8,
                elapsed_secs = $9,
                error_message = $10,
                finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(counter(|s| s.attempted))
        .bind(counter(|s| s.stored))
        .bind(counter(|s| s.duplicate))
        .bind(counter(|s| s.not_found))
        .bind(counter(|s| s.error))
        .bind(counter(|s| s.skipped))
        .bind(stats.map(|s| s.elapsed.as_secs_f64()))
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        tracing::debug!(run_id = %id, status = %status, "Run finished");
        Ok(())
    }

    pub async fn recent(&self, family: Option<&str>, limit: i64) -> Result<Vec<IngestionRun>> {
        let runs = sqlx::query_as::<_, IngestionRun>(
            r#"
            SELECT id, family, mode, status, attempted, stored, duplicate, not_found,
                   error, skipped, elapsed_secs, error_message, started_at, finished_at
            FROM ingestion_runs
            WHERE ($1::text IS NULL OR family = $1)
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(family)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }
}
