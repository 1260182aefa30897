//! Retry classification and backoff timing

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// What a single request attempt means for the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    Success,
    /// 429 and 5xx: worth another attempt
    Retryable,
    /// 404 and every other 4xx: final for this fetch
    Terminal,
}

pub fn classify_status(status: u16) -> AttemptClass {
    match status {
        200..=299 => AttemptClass::Success,
        429 | 500..=599 => AttemptClass::Retryable,
        _ => AttemptClass::Terminal,
    }
}

/// Exponential backoff with full jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep that follows failed attempt number `attempt` (1-based)
    pub fn backoff_cap(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
        } else {
            Duration::ZERO
        }
    }

    /// Uniform draw from `[0, backoff_cap(attempt)]`
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let cap = self.backoff_cap(attempt).as_secs_f64();
        if cap <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(rng.gen_range(0.0..=cap)).unwrap_or(self.max_delay)
    }

    /// Server-supplied Retry-After wins over computed backoff
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.jittered_delay(attempt, &mut rand::thread_rng()))
    }
}

/// Parse a Retry-After header: delta seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
