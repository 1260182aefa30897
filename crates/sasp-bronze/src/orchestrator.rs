//! Ingestion orchestrator
//!
//! Runs a pool of fetch workers over a discovery sequence for one resource
//! family. Workers skip targets the health tracker has given up on, fetch
//! through the shared rate limiter and hand results back to the run loop,
//! which stages payloads and commits them in batches. A success is only
//! recorded in the health tracker after its batch commits, so a payload that
//! failed to persist is retried by the next run.
//!
//! Cancelling the token stops dequeuing new targets. Fetches already in
//! flight complete and the staged batch is committed before returning.

use crate::discovery::listing::PageMeta;
use crate::discovery::{PageObservation, PageStopRule, PaginationDiscovery};
use crate::error::Result;
use crate::fetcher::{AttemptClass, FetchError, FetchResponse, RateLimitedFetcher};
use crate::health::HealthTracker;
use crate::models::{FailureKind, FetchTarget, IngestStats, ResourceFamily};
use crate::store::{identifier_hint, ContentStore, NewPayload};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent fetch workers
    pub workers: usize,
    /// Payloads per commit
    pub batch_size: usize,
    /// Log progress every N completed targets
    pub progress_interval: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            batch_size: 50,
            progress_interval: 100,
        }
    }
}

/// Result of one worker's handling of a target
#[derive(Debug)]
enum TargetOutcome {
    Skipped(FetchTarget),
    Fetched {
        target: FetchTarget,
        status: u16,
        payload: Value,
    },
    Failed {
        target: FetchTarget,
        kind: FailureKind,
    },
}

struct Staged {
    target: FetchTarget,
    status: u16,
    item: NewPayload,
}

#[derive(Clone)]
struct Worker {
    fetcher: Arc<RateLimitedFetcher>,
    health: Arc<dyn HealthTracker>,
}

impl Worker {
    async fn process(self, target: FetchTarget) -> TargetOutcome {
        match self
            .health
            .is_permanently_unavailable(&target.family, &target.url)
            .await
        {
            Ok(true) => return TargetOutcome::Skipped(target),
            Ok(false) => {},
            Err(e) => warn!(url = %target.url, error = %e, "Health lookup failed, fetching anyway"),
        }

        let result = self.fetcher.fetch(&target.url).await;
        let outcome = classify(target, result);
        self.record_failure(&outcome).await;
        outcome
    }

    async fn record_failure(&self, outcome: &TargetOutcome) {
        if let TargetOutcome::Failed { target, kind } = outcome {
            if let Err(e) = self.health.record_outcome(target, kind.status(), false).await {
                error!(url = %target.url, error = %e, "Failed to record failure");
            }
        }
    }
}

fn classify(target: FetchTarget, result: std::result::Result<FetchResponse, FetchError>) -> TargetOutcome {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %target.url, error = %e, "Fetch failed without a response");
            return TargetOutcome::Failed {
                target,
                kind: FailureKind::Transport,
            };
        },
    };

    if response.class() != AttemptClass::Success {
        let kind = FailureKind::from_status(response.status);
        if kind == FailureKind::NotFound {
            debug!(url = %target.url, "Not found");
        } else {
            warn!(url = %target.url, status = response.status, attempts = response.attempts, "Fetch failed");
        }
        return TargetOutcome::Failed { target, kind };
    }

    match response.json() {
        Ok(payload) => TargetOutcome::Fetched {
            target,
            status: response.status,
            payload,
        },
        Err(e) => {
            warn!(url = %target.url, status = response.status, error = %e, "Response body is not JSON");
            TargetOutcome::Failed {
                target,
                kind: FailureKind::Malformed(response.status),
            }
        },
    }
}

pub struct IngestOrchestrator {
    fetcher: Arc<RateLimitedFetcher>,
    store: Arc<dyn ContentStore>,
    health: Arc<dyn HealthTracker>,
    config: OrchestratorConfig,
}

impl IngestOrchestrator {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        store: Arc<dyn ContentStore>,
        health: Arc<dyn HealthTracker>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            health,
            config,
        }
    }

    /// Ingest every target of a range or explicit-set discovery
    pub async fn run<I>(&self, family: &ResourceFamily, targets: I, cancel: CancellationToken) -> Result<IngestStats>
    where
        I: IntoIterator<Item = FetchTarget>,
        I::IntoIter: Send + 'static,
    {
        info!(family = %family, workers = self.config.workers, "Starting ingestion run");
        self.drive(family, targets.into_iter(), cancel, None, None).await
    }

    /// Ingest a paginated listing: probe page 1, then scan the remaining pages
    pub async fn run_pages(&self, discovery: &PaginationDiscovery, cancel: CancellationToken) -> Result<IngestStats> {
        let family = discovery.family().clone();
        let first = discovery.page_target(1);
        info!(family = %family, url = %first.url, "Starting paginated ingestion run");

        let plan = if cancel.is_cancelled() {
            discovery.unprobed_plan()
        } else if self
            .health
            .is_permanently_unavailable(&first.family, &first.url)
            .await
            .unwrap_or(false)
        {
            warn!(url = %first.url, "First page is permanently unavailable, skipping probe");
            discovery.unprobed_plan()
        } else {
            discovery.probe(&self.fetcher).await
        };

        let stop_rule = plan.stop_rule();
        let remaining = plan.remaining_targets();
        let seed = plan
            .first_result
            .map(|result| classify(plan.first_page, result));
        if let Some(outcome) = &seed {
            self.worker().record_failure(outcome).await;
        }

        self.drive(&family, remaining, cancel, seed, Some(stop_rule)).await
    }

    fn worker(&self) -> Worker {
        Worker {
            fetcher: self.fetcher.clone(),
            health: self.health.clone(),
        }
    }

    async fn drive<T>(
        &self,
        family: &ResourceFamily,
        targets: T,
        cancel: CancellationToken,
        seed: Option<TargetOutcome>,
        mut stop_rule: Option<PageStopRule>,
    ) -> Result<IngestStats>
    where
        T: Iterator<Item = FetchTarget> + Send + 'static,
    {
        let started = Instant::now();
        let batch_size = self.config.batch_size.max(1);
        let mut stats = IngestStats::new(family.name());
        let mut staged: Vec<Staged> = Vec::with_capacity(batch_size);

        // Child token: an early pagination stop must not look like an operator cancel
        let stop = cancel.child_token();

        if let Some(outcome) = seed {
            let observation = self.absorb(family, outcome, &mut stats, &mut staged);
            if let (Some(rule), Some((Some(page), observation))) = (stop_rule.as_mut(), observation) {
                if rule.observe(page, observation) {
                    stop.cancel();
                }
            }
        }

        let stopped = {
            let stop = stop.clone();
            async move { stop.cancelled().await }
        };
        let worker = self.worker();
        let completions = stream::iter(targets)
            .take_until(stopped)
            .map(move |target| tokio::spawn(worker.clone().process(target)))
            .buffer_unordered(self.config.workers.max(1));
        futures::pin_mut!(completions);

        while let Some(joined) = completions.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Worker task failed");
                    stats.attempted += 1;
                    stats.error += 1;
                    continue;
                },
            };

            let observation = self.absorb(family, outcome, &mut stats, &mut staged);
            if let (Some(rule), Some((Some(page), observation))) = (stop_rule.as_mut(), observation) {
                if rule.observe(page, observation) && !stop.is_cancelled() {
                    info!(family = %family, "End of listing reached, no further pages");
                    stop.cancel();
                }
            }

            if staged.len() >= batch_size {
                self.commit(&mut staged, &mut stats).await;
            }

            let processed = stats.attempted + stats.skipped;
            if self.config.progress_interval > 0 && processed % self.config.progress_interval == 0 {
                stats.elapsed = started.elapsed();
                info!(
                    family = %family,
                    processed,
                    stored = stats.stored,
                    duplicate = stats.duplicate,
                    not_found = stats.not_found,
                    errors = stats.error,
                    rate_per_min = format!("{:.1}", stats.rate_per_minute()),
                    "Progress"
                );
            }
        }

        self.commit(&mut staged, &mut stats).await;

        stats.cancelled = cancel.is_cancelled();
        stats.elapsed = started.elapsed();

        info!(
            family = %family,
            attempted = stats.attempted,
            stored = stats.stored,
            duplicate = stats.duplicate,
            not_found = stats.not_found,
            errors = stats.error,
            skipped = stats.skipped,
            cancelled = stats.cancelled,
            elapsed_secs = stats.elapsed.as_secs_f64(),
            success_rate = format!("{:.1}%", stats.success_rate() * 100.0),
            "Ingestion run finished"
        );
        Ok(stats)
    }

    /// Fold a worker outcome into the counters
    ///
    /// Returns the target's identifier (the page number for listings) and what
    /// the response says about a listing page.
    fn absorb(
        &self,
        family: &ResourceFamily,
        outcome: TargetOutcome,
        stats: &mut IngestStats,
        staged: &mut Vec<Staged>,
    ) -> Option<(Option<i64>, PageObservation)> {
        match outcome {
            TargetOutcome::Skipped(target) => {
                debug!(url = %target.url, "Skipping permanently unavailable target");
                stats.skipped += 1;
                None
            },
            TargetOutcome::Fetched {
                target,
                status,
                payload,
            } => {
                stats.attempted += 1;
                let observation = (target.identifier, PageObservation::Listing(PageMeta::read(&payload)));
                let identifier = identifier_hint(&payload, &target.url).or(target.identifier);
                let item = NewPayload::new(family, identifier, target.url.clone(), payload);
                staged.push(Staged {
                    target,
                    status,
                    item,
                });
                Some(observation)
            },
            TargetOutcome::Failed { target, kind } => {
                stats.attempted += 1;
                if kind == FailureKind::NotFound {
                    stats.not_found += 1;
                } else {
                    stats.error += 1;
                }
                Some((target.identifier, PageObservation::Failed))
            },
        }
    }

    /// Persist staged payloads, then mark the persisted targets healthy
    async fn commit(&self, staged: &mut Vec<Staged>, stats: &mut IngestStats) {
        if staged.is_empty() {
            return;
        }

        let batch: Vec<Staged> = std::mem::take(staged);
        let items: Vec<NewPayload> = batch.iter().map(|s| s.item.clone()).collect();

        let results = match self.store.put_batch(&items).await {
            Ok(results) => results,
            Err(e) => {
                // Health is left untouched so the next run retries these targets
                error!(count = batch.len(), error = %e, "Batch commit failed");
                stats.error += batch.len() as u64;
                return;
            },
        };

        let mut persisted = Vec::with_capacity(batch.len());
        for (staged, result) in batch.iter().zip(results) {
            match result {
                Ok(outcome) if outcome.stored() => {
                    stats.stored += 1;
                    persisted.push(staged);
                },
                Ok(_) => {
                    stats.duplicate += 1;
                    persisted.push(staged);
                },
                Err(e) => {
                    error!(url = %staged.target.url, error = %e, "Failed to persist payload");
                    stats.error += 1;
                },
            }
        }

        debug!(batch = batch.len(), persisted = persisted.len(), "Committed batch");

        let updates = persisted
            .iter()
            .map(|s| self.health.record_outcome(&s.target, Some(s.status), true));
        for (staged, result) in persisted.iter().zip(futures::future::join_all(updates).await) {
            if let Err(e) = result {
                error!(url = %staged.target.url, error = %e, "Failed to record success");
            }
        }
    }
}
