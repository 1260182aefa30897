//! Shared helpers for bronze integration tests
//!
//! Builds fetchers with a generous request budget and millisecond backoff so
//! tests against a `wiremock` server run in real time without waiting on the
//! production limits.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use sasp_bronze::discovery::UrlTemplate;
use sasp_bronze::fetcher::{FetcherConfig, RateLimitedFetcher, RetryPolicy};
use sasp_bronze::health::{HealthPolicy, MemoryHealthTracker};
use sasp_bronze::orchestrator::{IngestOrchestrator, OrchestratorConfig};
use sasp_bronze::store::MemoryContentStore;
use sasp_bronze::ResourceFamily;
use std::sync::Arc;
use std::time::Duration;

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(50),
    }
}

pub fn fast_fetcher() -> RateLimitedFetcher {
    let config = FetcherConfig {
        timeout: Duration::from_secs(5),
        max_concurrent: 5,
        requests_per_minute: 10_000,
        retry: fast_retry(),
        ..FetcherConfig::default()
    };
    RateLimitedFetcher::new(&config).expect("fetcher")
}

pub fn scoreboard() -> ResourceFamily {
    ResourceFamily::new("raw_scoreboard").unwrap()
}

pub fn scoreboard_template(base: &str) -> UrlTemplate {
    UrlTemplate::parse(&format!("{}/api/shot/sasp-scoreboard/{{}}", base)).unwrap()
}

/// Orchestrator over in-memory stores; the stores are returned for inspection
pub struct Harness {
    pub orchestrator: IngestOrchestrator,
    pub store: Arc<MemoryContentStore>,
    pub health: Arc<MemoryHealthTracker>,
}

pub fn harness(config: OrchestratorConfig) -> Harness {
    let store = Arc::new(MemoryContentStore::new());
    let health = Arc::new(MemoryHealthTracker::new(HealthPolicy::default()));
    let orchestrator = IngestOrchestrator::new(
        Arc::new(fast_fetcher()),
        store.clone(),
        health.clone(),
        config,
    );
    Harness {
        orchestrator,
        store,
        health,
    }
}
