//! Configuration management
//!
//! Runtime settings come from the environment (a `.env` file is honored), and
//! the endpoint catalogue comes from a YAML file. CLI flags override both.

use crate::discovery::UrlTemplate;
use crate::fetcher::{FetcherConfig, RetryPolicy};
use crate::health::HealthPolicy;
use crate::models::{ConflictPolicy, ResourceFamily};
use crate::orchestrator::OrchestratorConfig;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_PG_HOST: &str = "localhost";
pub const DEFAULT_PG_PORT: u16 = 5432;
pub const DEFAULT_PG_DATABASE: &str = "sasp";
pub const DEFAULT_PG_USER: &str = "postgres";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

pub const DEFAULT_USER_AGENT: &str = crate::fetcher::DEFAULT_USER_AGENT;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_REQUESTS_PER_MINUTE: usize = 20;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 60;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_IDENTIFIER_MARGIN: i64 = 10;

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100;
pub const DEFAULT_MAX_PAGES: u32 = crate::discovery::pagination::DEFAULT_MAX_PAGES;

/// Minimum (stored + duplicate) / attempted before a run is reported as degraded
pub const DEFAULT_ACCEPTANCE_RATIO: f64 = 0.875;

pub const DEFAULT_ENDPOINTS_FILE: &str = "config/endpoints.yml";

const DEFAULT_API_BASE: &str = "https://virtual.sssfonline.com/api";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// Runtime configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// `DATABASE_URL` wins; otherwise the URL is assembled from the libpq variables
    fn from_env() -> Self {
        let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            let host = std::env::var("PGHOST").unwrap_or_else(|_| DEFAULT_PG_HOST.to_string());
            let port: u16 = env_or("PGPORT", DEFAULT_PG_PORT);
            let database = std::env::var("PGDATABASE").unwrap_or_else(|_| DEFAULT_PG_DATABASE.to_string());
            let user = std::env::var("PGUSER").unwrap_or_else(|_| DEFAULT_PG_USER.to_string());
            match std::env::var("PGPASSWORD") {
                Ok(password) if !password.is_empty() => {
                    format!("postgresql://{}:{}@{}:{}/{}", user, password, host, port, database)
                },
                _ => format!("postgresql://{}@{}:{}/{}", user, host, port, database),
            }
        });

        Self {
            url,
            max_connections: env_or("SASP_DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BronzeConfig {
    pub database: DatabaseConfig,

    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_concurrent: usize,
    pub requests_per_minute: usize,

    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_secs: u64,

    pub failure_threshold: u32,
    pub identifier_margin: i64,

    pub workers: usize,
    pub batch_size: usize,
    pub progress_interval: u64,
    pub max_pages: u32,
    pub force_full_pages: bool,
    pub acceptance_ratio: f64,

    pub endpoints_file: PathBuf,
}

impl BronzeConfig {
    /// Load from environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::read_env();
        config.validate()?;
        Ok(config)
    }

    fn read_env() -> Self {
        Self {
            database: DatabaseConfig::from_env(),
            user_agent: std::env::var("SASP_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_or("SASP_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            max_concurrent: env_or("SASP_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT),
            requests_per_minute: env_or("SASP_REQUESTS_PER_MINUTE", DEFAULT_REQUESTS_PER_MINUTE),
            max_attempts: env_or("SASP_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            backoff_initial_ms: env_or("SASP_BACKOFF_INITIAL_MS", DEFAULT_BACKOFF_INITIAL_MS),
            backoff_multiplier: env_or("SASP_BACKOFF_MULTIPLIER", DEFAULT_BACKOFF_MULTIPLIER),
            backoff_max_secs: env_or("SASP_BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX_SECS),
            failure_threshold: env_or("SASP_FAILURE_THRESHOLD", DEFAULT_FAILURE_THRESHOLD),
            identifier_margin: env_or("SASP_IDENTIFIER_MARGIN", DEFAULT_IDENTIFIER_MARGIN),
            workers: env_or("SASP_WORKERS", DEFAULT_WORKERS),
            batch_size: env_or("SASP_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            progress_interval: env_or("SASP_PROGRESS_INTERVAL", DEFAULT_PROGRESS_INTERVAL),
            max_pages: env_or("SASP_MAX_PAGES", DEFAULT_MAX_PAGES),
            force_full_pages: env_or("SASP_FORCE_FULL_PAGES", false),
            acceptance_ratio: env_or("SASP_ACCEPTANCE_RATIO", DEFAULT_ACCEPTANCE_RATIO),
            endpoints_file: std::env::var("SASP_ENDPOINTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_ENDPOINTS_FILE)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be greater than 0");
        }
        if self.requests_per_minute == 0 {
            anyhow::bail!("requests_per_minute must be greater than 0");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            anyhow::bail!("backoff_multiplier must be >= 1.0, got {}", self.backoff_multiplier);
        }
        if self.failure_threshold == 0 {
            anyhow::bail!("failure_threshold must be greater than 0");
        }
        if self.identifier_margin < 0 {
            anyhow::bail!("identifier_margin cannot be negative");
        }
        if self.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }
        if self.max_pages == 0 {
            anyhow::bail!("max_pages must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.acceptance_ratio) {
            anyhow::bail!("acceptance_ratio must be between 0 and 1, got {}", self.acceptance_ratio);
        }
        if self.workers > self.max_concurrent * 4 {
            tracing::warn!(
                workers = self.workers,
                max_concurrent = self.max_concurrent,
                "Workers far exceed concurrent request slots; most will wait on the limiter"
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_secs(self.backoff_max_secs),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            max_concurrent: self.max_concurrent,
            requests_per_minute: self.requests_per_minute,
            retry: self.retry_policy(),
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.failure_threshold,
            identifier_margin: self.identifier_margin,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            progress_interval: self.progress_interval,
        }
    }
}

impl Default for BronzeConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: format!(
                    "postgresql://{}@{}:{}/{}",
                    DEFAULT_PG_USER, DEFAULT_PG_HOST, DEFAULT_PG_PORT, DEFAULT_PG_DATABASE
                ),
                max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            },
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            identifier_margin: DEFAULT_IDENTIFIER_MARGIN,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            max_pages: DEFAULT_MAX_PAGES,
            force_full_pages: false,
            acceptance_ratio: DEFAULT_ACCEPTANCE_RATIO,
            endpoints_file: PathBuf::from(DEFAULT_ENDPOINTS_FILE),
        }
    }
}

// ============================================================================
// Endpoint catalogue
// ============================================================================

/// One family's entry in the endpoints file: a bare list of example URLs,
/// or a detailed mapping
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEndpoint {
    Urls(Vec<String>),
    Detailed(DetailedEndpoint),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetailedEndpoint {
    template: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
    pages: Option<String>,
    #[serde(default)]
    policy: ConflictPolicy,
}

/// Where a family's targets come from
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub family: ResourceFamily,
    pub template: Option<UrlTemplate>,
    /// Example URLs, fetched as-is by the `endpoints` command
    pub urls: Vec<String>,
    /// Any page of a paginated listing
    pub pages: Option<String>,
}

impl Endpoint {
    /// The configured template, or one derived from the first example URL
    pub fn template(&self) -> crate::error::Result<UrlTemplate> {
        if let Some(template) = &self.template {
            return Ok(template.clone());
        }
        let example = self.urls.first().ok_or_else(|| {
            crate::error::BronzeError::Config(format!(
                "Family '{}' has no URL template and no example URL",
                self.family
            ))
        })?;
        UrlTemplate::from_example(example)
    }
}

#[derive(Debug, Clone)]
pub struct EndpointsConfig {
    endpoints: BTreeMap<String, Endpoint>,
}

impl EndpointsConfig {
    /// Load the endpoints file, falling back to the built-in catalogue when absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Endpoints file not found, using built-in endpoints");
            return Ok(Self::defaults());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read endpoints file {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid endpoints file {}", path.display()))?;

        tracing::info!(path = %path.display(), families = config.endpoints.len(), "Loaded endpoints");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let raw: BTreeMap<String, RawEndpoint> = serde_yaml::from_str(content)?;

        let mut endpoints = BTreeMap::new();
        for (name, entry) in raw {
            let detailed = match entry {
                RawEndpoint::Urls(urls) => DetailedEndpoint {
                    urls,
                    ..DetailedEndpoint::default()
                },
                RawEndpoint::Detailed(detailed) => detailed,
            };

            let family = ResourceFamily::new(name.clone())?.with_policy(detailed.policy);
            let template = detailed
                .template
                .as_deref()
                .map(UrlTemplate::parse)
                .transpose()
                .with_context(|| format!("Family '{}'", name))?;

            endpoints.insert(
                name,
                Endpoint {
                    family,
                    template,
                    urls: detailed.urls,
                    pages: detailed.pages,
                },
            );
        }

        Ok(Self { endpoints })
    }

    /// The families this service ships with
    pub fn defaults() -> Self {
        let mut endpoints = BTreeMap::new();
        let mut add = |name: &str, policy: ConflictPolicy, template: Option<String>, pages: Option<String>| {
            if let Ok(family) = ResourceFamily::new(name) {
                endpoints.insert(
                    name.to_string(),
                    Endpoint {
                        family: family.with_policy(policy),
                        template: template.and_then(|t| UrlTemplate::parse(&t).ok()),
                        urls: Vec::new(),
                        pages,
                    },
                );
            }
        };

        add(
            "raw_teams",
            ConflictPolicy::UpsertByIdentifier,
            Some(format!("{}/teams/{{}}", DEFAULT_API_BASE)),
            None,
        );
        add(
            "raw_scoreboard",
            ConflictPolicy::AppendOnly,
            Some(format!("{}/shot/sasp-scoreboard/{{}}", DEFAULT_API_BASE)),
            None,
        );
        add(
            "raw_schedule",
            ConflictPolicy::AppendOnly,
            Some(format!("{}/shot/sasp-schedule/{{}}", DEFAULT_API_BASE)),
            None,
        );
        add(
            "raw_competition",
            ConflictPolicy::AppendOnly,
            None,
            Some(format!("{}/shot/SASP/competitions?type=S&page=1", DEFAULT_API_BASE)),
        );

        Self { endpoints }
    }

    pub fn get(&self, family: &str) -> anyhow::Result<&Endpoint> {
        self.endpoints.get(family).with_context(|| {
            format!(
                "Unknown family '{}'. Configured families: {}",
                family,
                self.endpoints.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    /// The family definition, or an append-only family when it is not configured
    pub fn family(&self, name: &str) -> crate::error::Result<ResourceFamily> {
        match self.endpoints.get(name) {
            Some(endpoint) => Ok(endpoint.family.clone()),
            None => ResourceFamily::new(name),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const SASP_VARS: [&str; 8] = [
        "DATABASE_URL",
        "PGHOST",
        "PGPASSWORD",
        "SASP_WORKERS",
        "SASP_REQUESTS_PER_MINUTE",
        "SASP_BACKOFF_MULTIPLIER",
        "SASP_ACCEPTANCE_RATIO",
        "SASP_FORCE_FULL_PAGES",
    ];

    fn clear_env() {
        for key in SASP_VARS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = BronzeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.requests_per_minute, 20);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.health_policy(), HealthPolicy::default());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgresql://localhost/test");
        std::env::set_var("SASP_WORKERS", "8");
        std::env::set_var("SASP_REQUESTS_PER_MINUTE", "30");
        std::env::set_var("SASP_FORCE_FULL_PAGES", "true");

        let config = BronzeConfig::read_env();
        assert_eq!(config.database.url, "postgresql://localhost/test");
        assert_eq!(config.workers, 8);
        assert_eq!(config.fetcher_config().requests_per_minute, 30);
        assert!(config.force_full_pages);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_database_url_from_libpq_vars() {
        clear_env();
        std::env::set_var("PGHOST", "db.internal");
        std::env::set_var("PGPASSWORD", "secret");

        let config = BronzeConfig::read_env();
        assert!(config.database.url.contains("db.internal"));
        assert!(config.database.url.contains(":secret@"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_values_fall_back_to_defaults() {
        clear_env();
        std::env::set_var("SASP_WORKERS", "many");

        let config = BronzeConfig::read_env();
        assert_eq!(config.workers, DEFAULT_WORKERS);

        clear_env();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BronzeConfig {
            acceptance_ratio: 1.5,
            ..BronzeConfig::default()
        };
        assert!(config.validate().is_err());

        config.acceptance_ratio = DEFAULT_ACCEPTANCE_RATIO;
        config.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        config.backoff_multiplier = 2.0;
        config.requests_per_minute = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoints_yaml_both_shapes() {
        let yaml = r#"
raw_scoreboard:
  - https://example.com/api/shot/sasp-scoreboard/640
raw_teams:
  template: https://example.com/api/teams/{id}
  policy: upsert_by_identifier
raw_competition:
  pages: https://example.com/api/shot/SASP/competitions?type=S&page=1
"#;
        let config = EndpointsConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.len(), 3);

        let scoreboard = config.get("raw_scoreboard").unwrap();
        assert_eq!(
            scoreboard.template().unwrap().render(641),
            "https://example.com/api/shot/sasp-scoreboard/641"
        );

        let teams = config.get("raw_teams").unwrap();
        assert_eq!(teams.family.policy(), ConflictPolicy::UpsertByIdentifier);
        assert_eq!(teams.template().unwrap().render(7), "https://example.com/api/teams/7");

        let competition = config.get("raw_competition").unwrap();
        assert!(competition.pages.is_some());
        assert!(competition.template().is_err());
    }

    #[test]
    fn test_endpoints_yaml_rejects_bad_family_name() {
        let yaml = "Raw-Teams:\n  - https://example.com/api/teams/1\n";
        assert!(EndpointsConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_endpoints_load_file_and_fallback() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "raw_schedule:\n  template: https://example.com/api/shot/sasp-schedule/{{}}").unwrap();

        let loaded = EndpointsConfig::load(file.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.get("raw_teams").is_err());

        let missing = EndpointsConfig::load(Path::new("/nonexistent/endpoints.yml")).unwrap();
        assert_eq!(missing.len(), 4);
        assert_eq!(
            missing.family("raw_teams").unwrap().policy(),
            ConflictPolicy::UpsertByIdentifier
        );
        assert_eq!(missing.family("raw_other").unwrap().policy(), ConflictPolicy::AppendOnly);
    }
}
