//! SASP Bronze Ingestion Engine
//!
//! Archives raw JSON payloads from the SASP results API into Postgres before
//! any transformation happens.
//!
//! # Components
//!
//! - **Content Store** ([`store`]): content-addressed, idempotent payload archive
//! - **Resource Health** ([`health`]): per-URL failure history and permanent-unavailability verdicts
//! - **Fetcher** ([`fetcher`]): HTTP client behind a concurrency gate and a per-minute request budget
//! - **Discovery** ([`discovery`]): ranges, explicit id sets and paginated listings
//! - **Orchestrator** ([`orchestrator`]): worker pool tying the above together
//!
//! # Example
//!
//! ```no_run
//! use sasp_bronze::discovery::{RangeDiscovery, UrlTemplate};
//! use sasp_bronze::fetcher::{FetcherConfig, RateLimitedFetcher};
//! use sasp_bronze::health::MemoryHealthTracker;
//! use sasp_bronze::models::ResourceFamily;
//! use sasp_bronze::orchestrator::{IngestOrchestrator, OrchestratorConfig};
//! use sasp_bronze::store::MemoryContentStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let family = ResourceFamily::new("raw_scoreboard")?;
//!     let template = UrlTemplate::parse("https://virtual.sssfonline.com/api/shot/sasp-scoreboard/{}")?;
//!     let range = RangeDiscovery::new(family.clone(), template, 580, 600)?;
//!
//!     let orchestrator = IngestOrchestrator::new(
//!         Arc::new(RateLimitedFetcher::new(&FetcherConfig::default())?),
//!         Arc::new(MemoryContentStore::new()),
//!         Arc::new(MemoryHealthTracker::default()),
//!         OrchestratorConfig::default(),
//!     );
//!     let stats = orchestrator.run(&family, range.targets(), CancellationToken::new()).await?;
//!     println!("stored {} of {}", stats.stored, stats.attempted);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod runs;
pub mod store;

pub use cli::{Cli, Commands};
pub use error::{BronzeError, Result};
pub use models::{ConflictPolicy, FetchTarget, IngestStats, ResourceFamily};
