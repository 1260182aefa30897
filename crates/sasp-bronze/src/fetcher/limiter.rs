//! Request admission: a concurrency gate plus a sliding per-window rate bound

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Held for the lifetime of one in-flight request
#[derive(Debug)]
pub struct RequestPermit {
    _permit: OwnedSemaphorePermit,
}

/// Shared by every worker of a run
///
/// Callers wait (never fail) when either the concurrency gate or the rate
/// window is full.
#[derive(Debug)]
pub struct RateLimiter {
    gate: Arc<Semaphore>,
    starts: Mutex<VecDeque<Instant>>,
    max_per_window: usize,
    window: Duration,
}

impl RateLimiter {
    /// `max_concurrent` in-flight requests and `per_minute` request starts per rolling minute
    pub fn new(max_concurrent: usize, per_minute: usize) -> Self {
        Self::with_window(max_concurrent, per_minute, RATE_WINDOW)
    }

    pub fn with_window(max_concurrent: usize, max_per_window: usize, window: Duration) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
            starts: Mutex::new(VecDeque::with_capacity(max_per_window)),
            max_per_window: max_per_window.max(1),
            window,
        }
    }

    /// Wait for a concurrency permit, then for room in the rate window
    pub async fn acquire(&self) -> Result<RequestPermit, AcquireError> {
        let permit = self.gate.clone().acquire_owned().await?;
        self.reserve_start().await;
        Ok(RequestPermit { _permit: permit })
    }

    async fn reserve_start(&self) {
        loop {
            let ready_at = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();
                while starts
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    starts.pop_front();
                }

                if starts.len() < self.max_per_window {
                    starts.push_back(now);
                    return;
                }
                starts.front().map(|oldest| *oldest + self.window)
            };

            if let Some(at) = ready_at {
                tracing::debug!(
                    wait_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Rate window full, waiting"
                );
                tokio::time::sleep_until(at).await;
            }
        }
    }

    /// Concurrency permits currently free
    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }
}
