//! CLI command implementations

use crate::cli::{Cli, Commands, FamilyArgs};
use crate::config::{BronzeConfig, EndpointsConfig};
use crate::discovery::template::identifier_from_url;
use crate::discovery::{ExplicitDiscovery, PaginationDiscovery, RangeDiscovery, UrlTemplate};
use crate::error::Result;
use crate::fetcher::RateLimitedFetcher;
use crate::health::{HealthFilter, HealthTracker, MemoryHealthTracker, PgHealthTracker};
use crate::models::{FetchTarget, IngestStats, ResourceFamily};
use crate::orchestrator::IngestOrchestrator;
use crate::runs::{PgRunLedger, RunStatus};
use crate::store::{ContentStore, MemoryContentStore, PgContentStore};
use crate::db;
use anyhow::Context;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Storage backends for one invocation
struct Backend {
    store: Arc<dyn ContentStore>,
    health: Arc<dyn HealthTracker>,
    ledger: Option<PgRunLedger>,
}

impl Backend {
    async fn open(config: &BronzeConfig, dry_run: bool) -> anyhow::Result<Self> {
        if dry_run {
            info!("Dry run: payloads and health records stay in memory");
            return Ok(Self {
                store: Arc::new(MemoryContentStore::new()),
                health: Arc::new(MemoryHealthTracker::new(config.health_policy())),
                ledger: None,
            });
        }

        let pool = db::connect(&config.database)
            .await
            .context("Failed to connect to database")?;
        db::migrate(&pool).await.context("Failed to run migrations")?;

        Ok(Self {
            store: Arc::new(PgContentStore::new(pool.clone())),
            health: Arc::new(PgHealthTracker::new(pool.clone(), config.health_policy())),
            ledger: Some(PgRunLedger::new(pool)),
        })
    }

    /// Run `ingest` between a ledger start and finish
    async fn ledgered<F>(&self, family: &str, mode: &str, ingest: F) -> anyhow::Result<IngestStats>
    where
        F: Future<Output = Result<IngestStats>>,
    {
        let run_id = match &self.ledger {
            Some(ledger) => Some(ledger.start(family, mode).await?),
            None => None,
        };

        let result = ingest.await;

        if let (Some(ledger), Some(run_id)) = (&self.ledger, run_id) {
            let finished = match &result {
                Ok(stats) => ledger.finish(run_id, RunStatus::from_stats(stats), Some(stats), None).await,
                Err(e) => {
                    ledger
                        .finish(run_id, RunStatus::Failed, None, Some(&e.to_string()))
                        .await
                },
            };
            if let Err(e) = finished {
                warn!(run_id = %run_id, error = %e, "Failed to close run record");
            }
        }

        Ok(result?)
    }
}

/// Fold CLI overrides into the environment configuration
fn apply_overrides(config: &mut BronzeConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(path) = &cli.endpoints {
        config.endpoints_file = path.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    if let Some(rate_limit) = cli.rate_limit {
        config.requests_per_minute = rate_limit;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()
}

fn resolve_template(endpoints: &EndpointsConfig, args: &FamilyArgs) -> anyhow::Result<UrlTemplate> {
    match &args.template {
        Some(template) => Ok(UrlTemplate::parse(template)?),
        None => Ok(endpoints
            .get(&args.family)?
            .template()
            .with_context(|| format!("No URL template for family '{}'; pass --template", args.family))?),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report(stats: &IngestStats, acceptance_ratio: f64) {
    if !stats.is_acceptable(acceptance_ratio) {
        warn!(
            family = %stats.family,
            success_rate = format!("{:.1}%", stats.success_rate() * 100.0),
            threshold = format!("{:.1}%", acceptance_ratio * 100.0),
            "Success rate below acceptance threshold"
        );
    }
}

/// Execute the parsed command
pub async fn execute(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut config = BronzeConfig::from_env()?;
    apply_overrides(&mut config, cli)?;

    match &cli.command {
        Commands::Migrate => {
            let pool = db::connect(&config.database).await?;
            db::migrate(&pool).await?;
            print_json(&serde_json::json!({ "status": "migrated" }))
        },

        Commands::Health {
            family,
            permanent_only,
            limit,
        } => {
            let backend = Backend::open(&config, cli.dry_run).await?;
            let filter = HealthFilter {
                family: family.clone(),
                permanent_only: *permanent_only,
                limit: *limit,
            };
            let records = backend.health.list(&filter).await?;
            print_json(&records)
        },

        command => {
            let endpoints = EndpointsConfig::load(&config.endpoints_file)?;
            let backend = Backend::open(&config, cli.dry_run).await?;
            let fetcher = Arc::new(RateLimitedFetcher::new(&config.fetcher_config())?);
            let orchestrator = IngestOrchestrator::new(
                fetcher,
                backend.store.clone(),
                backend.health.clone(),
                config.orchestrator_config(),
            );
            let ctx = RunContext {
                config: &config,
                endpoints: &endpoints,
                backend: &backend,
                orchestrator: &orchestrator,
                cancel,
            };
            ctx.ingest(command).await
        },
    }
}

struct RunContext<'a> {
    config: &'a BronzeConfig,
    endpoints: &'a EndpointsConfig,
    backend: &'a Backend,
    orchestrator: &'a IngestOrchestrator,
    cancel: CancellationToken,
}

impl RunContext<'_> {
    async fn ingest(&self, command: &Commands) -> anyhow::Result<()> {
        match command {
            Commands::Range {
                target,
                start,
                end,
                skip_archived,
            } => {
                let family = self.endpoints.family(&target.family)?;
                let template = resolve_template(self.endpoints, target)?;
                let range = RangeDiscovery::new(family.clone(), template, *start, *end)?;

                let stats = if *skip_archived {
                    let archived = self.backend.store.archived_identifiers(family.name()).await?;
                    let explicit = ExplicitDiscovery::from(range).without(&archived);
                    info!(family = %family, remaining = explicit.len(), "Skipping archived identifiers");
                    self.run_targets(&family, "range", explicit.targets()).await?
                } else {
                    info!(family = %family, start, end, count = range.len(), "Range discovery");
                    self.run_targets(&family, "range", range.targets()).await?
                };
                self.finish(&stats)
            },

            Commands::Ids {
                target,
                ids,
                from_family,
                skip_archived,
            } => {
                let family = self.endpoints.family(&target.family)?;
                let template = resolve_template(self.endpoints, target)?;

                let mut explicit = match from_family {
                    Some(source) => {
                        let listings = self.backend.store.list_payloads(source, None).await?;
                        info!(source = %source, listings = listings.len(), "Extracting identifiers from listings");
                        ExplicitDiscovery::from_listings(family.clone(), template, &listings)
                    },
                    None => ExplicitDiscovery::new(family.clone(), template, ids.clone()),
                };
                if *skip_archived {
                    let archived = self.backend.store.archived_identifiers(family.name()).await?;
                    explicit = explicit.without(&archived);
                }
                info!(family = %family, count = explicit.len(), "Explicit discovery");

                let stats = self.run_targets(&family, "ids", explicit.targets()).await?;
                self.finish(&stats)
            },

            Commands::Pages {
                family,
                url,
                max_pages,
                force_full_pages,
            } => {
                let family = self.endpoints.family(family)?;
                let base_url = match url {
                    Some(url) => url.clone(),
                    None => self
                        .endpoints
                        .get(family.name())?
                        .pages
                        .clone()
                        .with_context(|| format!("No listing URL for family '{}'; pass --url", family))?,
                };

                let discovery = PaginationDiscovery::new(family.clone(), base_url)?
                    .with_max_pages(max_pages.unwrap_or(self.config.max_pages))
                    .with_force_full_pages(*force_full_pages || self.config.force_full_pages);

                let stats = self
                    .backend
                    .ledgered(
                        family.name(),
                        "pages",
                        self.orchestrator.run_pages(&discovery, self.cancel.clone()),
                    )
                    .await?;
                self.finish(&stats)
            },

            Commands::Endpoints { family } => {
                let mut all_stats = Vec::new();
                for endpoint in self.endpoints.iter() {
                    if family.as_deref().is_some_and(|f| f != endpoint.family.name()) {
                        continue;
                    }
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    if endpoint.urls.is_empty() {
                        info!(family = %endpoint.family, "No example URLs configured, skipping");
                        continue;
                    }

                    let targets: Vec<FetchTarget> = endpoint
                        .urls
                        .iter()
                        .map(|url| endpoint.family.target(identifier_from_url(url), url.clone()))
                        .collect();
                    let stats = self.run_targets(&endpoint.family, "endpoints", targets).await?;
                    report(&stats, self.config.acceptance_ratio);
                    all_stats.push(stats);
                }
                print_json(&all_stats)
            },

            Commands::Health { .. } | Commands::Migrate => Ok(()),
        }
    }

    async fn run_targets<I>(&self, family: &ResourceFamily, mode: &str, targets: I) -> anyhow::Result<IngestStats>
    where
        I: IntoIterator<Item = FetchTarget>,
        I::IntoIter: Send + 'static,
    {
        self.backend
            .ledgered(
                family.name(),
                mode,
                self.orchestrator.run(family, targets, self.cancel.clone()),
            )
            .await
    }

    fn finish(&self, stats: &IngestStats) -> anyhow::Result<()> {
        report(stats, self.config.acceptance_ratio);
        print_json(stats)
    }
}
