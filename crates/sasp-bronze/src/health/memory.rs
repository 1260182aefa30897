//! In-process health tracker for dry runs and tests

use super::{HealthFilter, HealthPolicy, HealthTracker, ResourceHealth};
use crate::error::Result;
use crate::models::FetchTarget;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// One lock around the whole map serializes every update
#[derive(Debug, Default)]
pub struct MemoryHealthTracker {
    policy: HealthPolicy,
    records: Mutex<HashMap<(String, String), ResourceHealth>>,
}

impl MemoryHealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HealthTracker for MemoryHealthTracker {
    async fn is_permanently_unavailable(&self, family: &str, url: &str) -> Result<bool> {
        let records = self.records.lock().await;
        Ok(records
            .get(&(family.to_string(), url.to_string()))
            .is_some_and(|r| r.permanent_unavailable))
    }

    async fn record_outcome(
        &self,
        target: &FetchTarget,
        status: Option<u16>,
        success: bool,
    ) -> Result<ResourceHealth> {
        let mut records = self.records.lock().await;
        let now = Utc::now();

        let max_seen = records
            .values()
            .filter(|r| r.family == target.family && r.last_success_at.is_some())
            .filter_map(|r| r.identifier)
            .max();

        let record = records
            .entry((target.family.clone(), target.url.clone()))
            .or_insert_with(|| ResourceHealth::new(target, now));
        record.apply(status, success, &self.policy, max_seen, now);
        Ok(record.clone())
    }

    async fn get(&self, family: &str, url: &str) -> Result<Option<ResourceHealth>> {
        let records = self.records.lock().await;
        Ok(records.get(&(family.to_string(), url.to_string())).cloned())
    }

    async fn list(&self, filter: &HealthFilter) -> Result<Vec<ResourceHealth>> {
        let records = self.records.lock().await;
        let mut matching: Vec<ResourceHealth> = records
            .values()
            .filter(|r| filter.family.as_deref().map_or(true, |f| r.family == f))
            .filter(|r| !filter.permanent_only || r.permanent_unavailable)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.last_checked.cmp(&a.last_checked).then_with(|| a.url.cmp(&b.url)));
        if filter.limit > 0 {
            matching.truncate(filter.limit as usize);
        }
        Ok(matching)
    }
}
