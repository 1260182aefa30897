//! Core data types shared by the bronze engine components

use crate::error::{BronzeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How a family reacts to new content for an identifier it already holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Every distinct content becomes a new snapshot row
    #[default]
    AppendOnly,
    /// Changed content replaces the row holding the same identifier
    UpsertByIdentifier,
}

impl FromStr for ConflictPolicy {
    type Err = BronzeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "append_only" | "append" => Ok(Self::AppendOnly),
            "upsert_by_identifier" | "upsert" => Ok(Self::UpsertByIdentifier),
            other => Err(BronzeError::Config(format!("Unknown conflict policy: {}", other))),
        }
    }
}

/// A logical category of fetch targets sharing a URL shape and storage destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFamily {
    name: String,
    policy: ConflictPolicy,
}

impl ResourceFamily {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(BronzeError::Config(format!(
                "Invalid resource family name '{}': use lowercase letters, digits and underscores",
                name
            )));
        }
        Ok(Self {
            name,
            policy: ConflictPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Build a target belonging to this family
    pub fn target(&self, identifier: Option<i64>, url: impl Into<String>) -> FetchTarget {
        FetchTarget {
            family: self.name.clone(),
            identifier,
            url: url.into(),
        }
    }
}

impl fmt::Display for ResourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One unit of work: a resolved URL plus the identifier or page number it came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FetchTarget {
    pub family: String,
    pub identifier: Option<i64>,
    pub url: String,
}

/// A payload as stored in the content store
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ArchivedPayload {
    pub id: i64,
    pub family: String,
    pub identifier: Option<i64>,
    pub payload: Value,
    pub source_url: String,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

/// Terminal classification of a target that did not end up archived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum FailureKind {
    /// Timeout or connection failure with no response
    Transport,
    RateLimited,
    Server(u16),
    NotFound,
    /// 4xx other than 404 and 429
    Client(u16),
    /// 2xx whose body is not JSON
    Malformed(u16),
}

impl FailureKind {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            429 => Self::RateLimited,
            500..=599 => Self::Server(status),
            other => Self::Client(other),
        }
    }

    /// HTTP status associated with this failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport => None,
            Self::RateLimited => Some(429),
            Self::NotFound => Some(404),
            Self::Server(s) | Self::Client(s) | Self::Malformed(s) => Some(*s),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport error"),
            Self::RateLimited => write!(f, "rate limited (429)"),
            Self::Server(s) => write!(f, "server error ({})", s),
            Self::NotFound => write!(f, "not found (404)"),
            Self::Client(s) => write!(f, "client error ({})", s),
            Self::Malformed(s) => write!(f, "malformed body on {}", s),
        }
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub family: String,
    /// Targets for which at least one request was issued
    pub attempted: u64,
    pub stored: u64,
    pub duplicate: u64,
    pub not_found: u64,
    pub error: u64,
    /// Targets skipped as permanently unavailable
    pub skipped: u64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl IngestStats {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            ..Self::default()
        }
    }

    /// Share of attempted targets that ended up archived (new or duplicate)
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 1.0;
        }
        (self.stored + self.duplicate) as f64 / self.attempted as f64
    }

    pub fn is_acceptable(&self, min_ratio: f64) -> bool {
        self.success_rate() >= min_ratio
    }

    /// Requests per minute over the run so far
    pub fn rate_per_minute(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.attempted as f64 * 60.0 / secs
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
