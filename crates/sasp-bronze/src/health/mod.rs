//! Per-URL resource health tracking
//!
//! Each URL moves through `Unknown -> Healthy <-> Failing -> PermanentlyUnavailable`.
//! Only 404 responses count toward permanence, and a target is only declared
//! permanently unavailable when it keeps failing while sitting well below the
//! highest identifier known to be good. Identifiers near the frontier may
//! simply not be published yet.

pub mod memory;
pub mod postgres;

pub use memory::MemoryHealthTracker;
pub use postgres::PgHealthTracker;

use crate::error::Result;
use crate::models::FetchTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Unknown,
    Healthy,
    Failing,
    PermanentlyUnavailable,
}

/// Thresholds for declaring a target permanently unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive 404s required
    pub failure_threshold: u32,
    /// How far below the highest good identifier the target must sit
    pub identifier_margin: i64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            identifier_margin: 10,
        }
    }
}

impl HealthPolicy {
    /// Whether `identifier` is far enough behind `max_seen` to be judged
    pub fn is_far_behind(&self, identifier: Option<i64>, max_seen: Option<i64>) -> bool {
        match (identifier, max_seen) {
            (Some(id), Some(max)) => id <= max.saturating_sub(self.identifier_margin),
            _ => false,
        }
    }
}

/// The health record of one URL
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ResourceHealth {
    pub family: String,
    pub identifier: Option<i64>,
    pub url: String,
    pub last_checked: DateTime<Utc>,
    pub last_status: Option<i32>,
    pub consecutive_failures: i32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub permanent_unavailable: bool,
    pub note: Option<String>,
}

impl ResourceHealth {
    /// A fresh record for a URL seen for the first time
    pub fn new(target: &FetchTarget, now: DateTime<Utc>) -> Self {
        Self {
            family: target.family.clone(),
            identifier: target.identifier,
            url: target.url.clone(),
            last_checked: now,
            last_status: None,
            consecutive_failures: 0,
            first_failure_at: None,
            last_success_at: None,
            permanent_unavailable: false,
            note: None,
        }
    }

    pub fn state(&self) -> HealthState {
        if self.permanent_unavailable {
            HealthState::PermanentlyUnavailable
        } else if self.last_success_at == Some(self.last_checked) {
            HealthState::Healthy
        } else {
            HealthState::Failing
        }
    }

    /// Fold one attempt outcome into the record
    ///
    /// `max_seen` is the highest identifier with a recorded success in this
    /// family; it only matters for 404s.
    pub fn apply(
        &mut self,
        status: Option<u16>,
        success: bool,
        policy: &HealthPolicy,
        max_seen: Option<i64>,
        now: DateTime<Utc>,
    ) {
        self.last_checked = now;
        self.last_status = status.map(i32::from);

        if success {
            self.consecutive_failures = 0;
            self.first_failure_at = None;
            self.permanent_unavailable = false;
            self.last_success_at = Some(now);
            self.note = None;
            return;
        }

        if status != Some(404) {
            self.note = Some(match status {
                Some(code) => format!("last attempt failed with status {}", code),
                None => "last attempt failed without a response".to_string(),
            });
            return;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.first_failure_at.get_or_insert(now);

        if !self.permanent_unavailable
            && self.consecutive_failures >= policy.failure_threshold as i32
            && policy.is_far_behind(self.identifier, max_seen)
        {
            self.permanent_unavailable = true;
            self.note = Some(format!(
                "{} consecutive 404s; identifier at least {} below highest good {}",
                self.consecutive_failures,
                policy.identifier_margin,
                max_seen.unwrap_or_default()
            ));
        } else if !self.permanent_unavailable {
            self.note = Some(format!("{} consecutive 404s", self.consecutive_failures));
        }
    }
}

/// State of a URL given its record, `Unknown` when none exists yet
pub fn state_of(record: Option<&ResourceHealth>) -> HealthState {
    record.map_or(HealthState::Unknown, ResourceHealth::state)
}

/// Filter for health listings
#[derive(Debug, Clone, Default)]
pub struct HealthFilter {
    pub family: Option<String>,
    pub permanent_only: bool,
    pub limit: i64,
}

/// Tracks success and failure history per URL
///
/// Implementations must serialize concurrent updates to the same URL.
#[async_trait]
pub trait HealthTracker: Send + Sync {
    async fn is_permanently_unavailable(&self, family: &str, url: &str) -> Result<bool>;

    /// Record one attempt outcome; `status` is `None` for transport failures
    async fn record_outcome(
        &self,
        target: &FetchTarget,
        status: Option<u16>,
        success: bool,
    ) -> Result<ResourceHealth>;

    async fn get(&self, family: &str, url: &str) -> Result<Option<ResourceHealth>>;

    /// Most recently checked records first
    async fn list(&self, filter: &HealthFilter) -> Result<Vec<ResourceHealth>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn target(identifier: i64) -> FetchTarget {
        FetchTarget {
            family: "raw_scoreboard".to_string(),
            identifier: Some(identifier),
            url: format!("https://example.com/api/shot/sasp-scoreboard/{}", identifier),
        }
    }

    fn fail_404(record: &mut ResourceHealth, times: usize, max_seen: Option<i64>) {
        let policy = HealthPolicy::default();
        for _ in 0..times {
            record.apply(Some(404), false, &policy, max_seen, Utc::now());
        }
    }

    #[test]
    fn test_far_behind_boundaries() {
        let policy = HealthPolicy::default();
        assert!(policy.is_far_behind(Some(50), Some(100)));
        assert!(policy.is_far_behind(Some(90), Some(100)));
        assert!(!policy.is_far_behind(Some(91), Some(100)));
        assert!(!policy.is_far_behind(Some(120), Some(100)));
        assert!(!policy.is_far_behind(None, Some(100)));
        assert!(!policy.is_far_behind(Some(1), None));
    }

    #[test]
    fn test_far_behind_identifier_marked_permanent_after_threshold() {
        let mut record = ResourceHealth::new(&target(50), Utc::now());

        fail_404(&mut record, 4, Some(100));
        assert!(!record.permanent_unavailable);
        assert_eq!(record.state(), HealthState::Failing);

        fail_404(&mut record, 1, Some(100));
        assert!(record.permanent_unavailable);
        assert_eq!(record.consecutive_failures, 5);
        assert_eq!(record.state(), HealthState::PermanentlyUnavailable);
    }

    #[test]
    fn test_identifier_near_frontier_never_permanent() {
        let mut record = ResourceHealth::new(&target(98), Utc::now());
        fail_404(&mut record, 5, Some(100));
        assert!(!record.permanent_unavailable);

        fail_404(&mut record, 20, Some(100));
        assert!(!record.permanent_unavailable);
        assert_eq!(record.consecutive_failures, 25);
    }

    #[test]
    fn test_server_errors_do_not_count() {
        let policy = HealthPolicy::default();
        let mut record = ResourceHealth::new(&target(10), Utc::now());

        for _ in 0..5 {
            record.apply(Some(500), false, &policy, Some(1000), Utc::now());
        }
        record.apply(None, false, &policy, Some(1000), Utc::now());

        assert!(!record.permanent_unavailable);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.first_failure_at, None);
        assert_eq!(record.last_status, None);
        assert_eq!(record.state(), HealthState::Failing);
    }

    #[test]
    fn test_success_resets_everything() {
        let policy = HealthPolicy::default();
        let mut record = ResourceHealth::new(&target(50), Utc::now());
        fail_404(&mut record, 6, Some(100));
        assert!(record.permanent_unavailable);
        assert!(record.first_failure_at.is_some());

        record.apply(Some(200), true, &policy, Some(100), Utc::now());
        assert!(!record.permanent_unavailable);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.first_failure_at, None);
        assert!(record.last_success_at.is_some());
        assert_eq!(record.state(), HealthState::Healthy);
    }

    #[test]
    fn test_permanent_flag_survives_further_failures() {
        let policy = HealthPolicy::default();
        let mut record = ResourceHealth::new(&target(50), Utc::now());
        fail_404(&mut record, 5, Some(100));
        assert!(record.permanent_unavailable);

        record.apply(Some(503), false, &policy, Some(100), Utc::now());
        fail_404(&mut record, 1, None);
        assert!(record.permanent_unavailable);
    }

    #[test]
    fn test_first_failure_time_kept_across_404s() {
        let mut record = ResourceHealth::new(&target(3), Utc::now());
        fail_404(&mut record, 1, None);
        let first = record.first_failure_at;
        fail_404(&mut record, 2, None);
        assert_eq!(record.first_failure_at, first);
    }

    #[test]
    fn test_missing_record_is_unknown() {
        assert_eq!(state_of(None), HealthState::Unknown);

        let policy = HealthPolicy::default();
        let mut record = ResourceHealth::new(&target(1), Utc::now());
        record.apply(Some(200), true, &policy, None, Utc::now());
        assert_eq!(state_of(Some(&record)), HealthState::Healthy);
    }
}
