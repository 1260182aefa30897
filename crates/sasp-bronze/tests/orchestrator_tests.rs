//! End-to-end ingestion runs against a mock API and in-memory stores

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use common::{fast_fetcher, harness, scoreboard, scoreboard_template};
use sasp_bronze::discovery::{ExplicitDiscovery, PaginationDiscovery, RangeDiscovery};
use sasp_bronze::health::{HealthState, HealthTracker, MemoryHealthTracker};
use sasp_bronze::models::ArchivedPayload;
use sasp_bronze::orchestrator::{IngestOrchestrator, OrchestratorConfig};
use sasp_bronze::store::{ContentStore, MemoryContentStore, NewPayload, PutOutcome};
use sasp_bronze::{BronzeError, ResourceFamily, Result};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_scoreboard(server: &MockServer, id: i64, status: u16) {
    let response = if status == 200 {
        ResponseTemplate::new(200).set_body_json(json!({"match_number": id, "home": "A", "away": "B"}))
    } else {
        ResponseTemplate::new(status)
    };
    Mock::given(method("GET"))
        .and(path(format!("/api/shot/sasp-scoreboard/{}", id)))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_range_run_archives_and_tracks_health() {
    let server = MockServer::start().await;
    mount_scoreboard(&server, 1, 200).await;
    mount_scoreboard(&server, 2, 404).await;
    mount_scoreboard(&server, 3, 200).await;

    let h = harness(OrchestratorConfig::default());
    let template = scoreboard_template(&server.uri());
    let range = RangeDiscovery::new(scoreboard(), template.clone(), 1, 3).unwrap();

    let stats = h
        .orchestrator
        .run(&scoreboard(), range.targets(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.attempted, 3);
    assert_eq!(stats.stored, 2);
    assert_eq!(stats.not_found, 1);
    assert_eq!(stats.error, 0);
    assert!(!stats.cancelled);
    assert_eq!(h.store.count("raw_scoreboard").await.unwrap(), 2);

    let missing = h
        .health
        .get("raw_scoreboard", &template.render(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(missing.consecutive_failures, 1);
    assert!(!missing.permanent_unavailable);
    assert_eq!(missing.last_status, Some(404));

    let found = h.health.get("raw_scoreboard", &template.render(1)).await.unwrap().unwrap();
    assert_eq!(found.state(), HealthState::Healthy);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let server = MockServer::start().await;
    for id in 1..=4 {
        mount_scoreboard(&server, id, 200).await;
    }

    let h = harness(OrchestratorConfig::default());
    let range = RangeDiscovery::new(scoreboard(), scoreboard_template(&server.uri()), 1, 4).unwrap();

    let first = h
        .orchestrator
        .run(&scoreboard(), range.targets(), CancellationToken::new())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .run(&scoreboard(), range.targets(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.stored, 4);
    assert_eq!(second.stored, 0);
    assert_eq!(second.duplicate, 4);
    assert_eq!(second.success_rate(), 1.0);
    assert_eq!(h.store.count("raw_scoreboard").await.unwrap(), 4);
}

#[tokio::test]
async fn test_permanently_unavailable_targets_are_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/shot/sasp-scoreboard/50"))
        .respond_with(ResponseTemplate::new(404))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(OrchestratorConfig::default());
    let family = scoreboard();
    let template = scoreboard_template(&server.uri());

    // A good identifier far ahead, then five 404s for 50
    h.health
        .record_outcome(&family.target(Some(100), template.render(100)), Some(200), true)
        .await
        .unwrap();
    let gone = family.target(Some(50), template.render(50));
    for _ in 0..5 {
        h.health.record_outcome(&gone, Some(404), false).await.unwrap();
    }
    assert!(h.health.is_permanently_unavailable("raw_scoreboard", &gone.url).await.unwrap());

    let stats = h
        .orchestrator
        .run(&family, vec![gone], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.attempted, 0);
}

#[tokio::test]
async fn test_success_without_json_counts_as_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/shot/sasp-scoreboard/7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let h = harness(OrchestratorConfig::default());
    let template = scoreboard_template(&server.uri());
    let stats = h
        .orchestrator
        .run(
            &scoreboard(),
            vec![scoreboard().target(Some(7), template.render(7))],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.error, 1);
    assert_eq!(stats.stored, 0);
    assert!(!stats.is_acceptable(0.875));

    let record = h.health.get("raw_scoreboard", &template.render(7)).await.unwrap().unwrap();
    assert_eq!(record.state(), HealthState::Failing);
    assert_eq!(record.consecutive_failures, 0);
}

/// Store whose every commit fails
struct FailingStore;

#[async_trait]
impl ContentStore for FailingStore {
    async fn put_batch(&self, _items: &[NewPayload]) -> Result<Vec<Result<PutOutcome>>> {
        Err(BronzeError::Persistence("database unavailable".to_string()))
    }

    async fn list_payloads(&self, _family: &str, _limit: Option<i64>) -> Result<Vec<ArchivedPayload>> {
        Ok(Vec::new())
    }

    async fn archived_identifiers(&self, _family: &str) -> Result<BTreeSet<i64>> {
        Ok(BTreeSet::new())
    }

    async fn count(&self, _family: &str) -> Result<i64> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_persistence_failure_does_not_mark_success() {
    let server = MockServer::start().await;
    mount_scoreboard(&server, 1, 200).await;
    mount_scoreboard(&server, 2, 200).await;

    let health = Arc::new(MemoryHealthTracker::default());
    let orchestrator = IngestOrchestrator::new(
        Arc::new(fast_fetcher()),
        Arc::new(FailingStore),
        health.clone(),
        OrchestratorConfig::default(),
    );
    let template = scoreboard_template(&server.uri());
    let range = RangeDiscovery::new(scoreboard(), template.clone(), 1, 2).unwrap();

    let stats = orchestrator
        .run(&scoreboard(), range.targets(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.attempted, 2);
    assert_eq!(stats.error, 2);
    assert_eq!(stats.stored, 0);
    assert!(health.get("raw_scoreboard", &template.render(1)).await.unwrap().is_none());
}

async fn mount_slow_scoreboard(server: &MockServer, id: i64, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(format!("/api/shot/sasp-scoreboard/{}", id)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"match_number": id, "status": "final"}))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

async fn archived_hashes(store: &MemoryContentStore) -> BTreeSet<String> {
    store
        .list_payloads("raw_scoreboard", None)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.content_hash)
        .collect()
}

#[tokio::test]
async fn test_cancelled_run_resumes_to_same_archive() {
    let server = MockServer::start().await;
    for id in 1..=10 {
        mount_slow_scoreboard(&server, id, Duration::from_millis(200)).await;
    }
    let family = scoreboard();
    let range = RangeDiscovery::new(family.clone(), scoreboard_template(&server.uri()), 1, 10).unwrap();

    // Uninterrupted run on its own store
    let baseline = harness(OrchestratorConfig {
        workers: 5,
        ..OrchestratorConfig::default()
    });
    let full = baseline
        .orchestrator
        .run(&family, range.targets(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(full.stored, 10);

    let h = harness(OrchestratorConfig {
        workers: 1,
        batch_size: 50,
        progress_interval: 100,
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let first = h.orchestrator.run(&family, range.targets(), cancel).await.unwrap();
    assert!(first.cancelled);
    assert!(first.attempted >= 1 && first.attempted < 10);

    // In-flight fetches were committed before the run returned
    let archived = h.store.archived_identifiers("raw_scoreboard").await.unwrap();
    assert_eq!(archived.len() as u64, first.stored);
    assert_eq!(h.store.count("raw_scoreboard").await.unwrap() as u64, first.stored);

    let rest = ExplicitDiscovery::from(range.clone()).without(&archived);
    let second = h
        .orchestrator
        .run(&family, rest.targets(), CancellationToken::new())
        .await
        .unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.attempted as usize, 10 - archived.len());
    assert_eq!(second.duplicate, 0);

    assert_eq!(
        h.store.count("raw_scoreboard").await.unwrap(),
        baseline.store.count("raw_scoreboard").await.unwrap()
    );
    assert_eq!(
        h.store.archived_identifiers("raw_scoreboard").await.unwrap(),
        baseline.store.archived_identifiers("raw_scoreboard").await.unwrap()
    );
    assert_eq!(archived_hashes(&h.store).await, archived_hashes(&baseline.store).await);
}

#[tokio::test]
async fn test_pre_cancelled_run_does_nothing() {
    let h = harness(OrchestratorConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let range = RangeDiscovery::new(scoreboard(), scoreboard_template("http://127.0.0.1:1"), 1, 100).unwrap();
    let stats = h.orchestrator.run(&scoreboard(), range.targets(), cancel).await.unwrap();

    assert!(stats.cancelled);
    assert_eq!(stats.attempted, 0);
}

fn competitions() -> ResourceFamily {
    ResourceFamily::new("raw_competition").unwrap()
}

async fn mount_page(server: &MockServer, page: u32, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api/shot/SASP/competitions"))
        .and(query_param("page", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_pages_follow_last_page_metadata() {
    let server = MockServer::start().await;
    mount_page(&server, 1, json!({"data": [{"id": 600}], "meta": {"last_page": 3}})).await;
    mount_page(&server, 2, json!({"data": [{"id": 601}], "meta": {"last_page": 3}})).await;
    mount_page(&server, 3, json!({"data": [{"id": 602}], "meta": {"last_page": 3}, "links": {"next": null}})).await;

    let h = harness(OrchestratorConfig::default());
    let discovery = PaginationDiscovery::new(
        competitions(),
        format!("{}/api/shot/SASP/competitions?type=S&page=1", server.uri()),
    )
    .unwrap();

    let stats = h
        .orchestrator
        .run_pages(&discovery, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.attempted, 3);
    assert_eq!(stats.stored, 3);
    assert_eq!(h.store.archived_identifiers("raw_competition").await.unwrap().len(), 3);

    let listings = h.store.list_payloads("raw_competition", None).await.unwrap();
    let ids = ExplicitDiscovery::from_listings(scoreboard(), scoreboard_template("https://x"), &listings);
    assert_eq!(ids.ids(), &[600, 601, 602]);
}

#[tokio::test]
async fn test_pages_stop_after_three_empty_pages() {
    let server = MockServer::start().await;
    mount_page(&server, 1, json!({"data": [{"id": 1}]})).await;
    Mock::given(method("GET"))
        .and(path("/api/shot/SASP/competitions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let h = harness(OrchestratorConfig {
        workers: 1,
        ..OrchestratorConfig::default()
    });
    let discovery = PaginationDiscovery::new(
        competitions(),
        format!("{}/api/shot/SASP/competitions?type=S&page=1", server.uri()),
    )
    .unwrap()
    .with_max_pages(20);

    let stats = h
        .orchestrator
        .run_pages(&discovery, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.attempted, 4);
    assert!(!stats.cancelled);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_pages_capped_at_page_ceiling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/shot/SASP/competitions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": 1}], "meta": {"last_page": 2_000_000}})),
        )
        .mount(&server)
        .await;

    let h = harness(OrchestratorConfig::default());
    let discovery = PaginationDiscovery::new(
        competitions(),
        format!("{}/api/shot/SASP/competitions?type=S&page=1", server.uri()),
    )
    .unwrap()
    .with_max_pages(5);

    let stats = h
        .orchestrator
        .run_pages(&discovery, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.attempted, 5);
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}
