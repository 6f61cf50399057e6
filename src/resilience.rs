//! Resilience utilities: retry policy, stateful backoff, bulkheads.
//!
//! - [`RetryConfig`]: exponential backoff schedule for transient failures
//! - [`Backoff`]: the stateful policy object the change tracker consults
//!   between attempts; grows on each failure, snaps back on success
//! - [`Bulkhead`]: semaphore bounding concurrent requests to a remote
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), couchlite::resilience::BulkheadFull> {
//! use couchlite::resilience::{Backoff, Bulkhead, RetryConfig};
//!
//! let mut backoff = Backoff::new(RetryConfig::default());
//! let first = backoff.next_delay();
//! let second = backoff.next_delay();
//! assert!(second > first);
//! backoff.reset();
//!
//! // At most 5 requests in flight against the remote
//! let bulkhead = Bulkhead::new(5);
//! let _permit = bulkhead.acquire().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for retry behavior.
///
/// There is no attempt limit: the change tracker keeps retrying for as
/// long as its replication runs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// Stateful backoff
// =============================================================================

/// Exponential backoff with memory of consecutive failures.
///
/// Each call to [`next_delay`](Self::next_delay) records one more failure
/// and returns the wait before the next attempt. [`reset`](Self::reset)
/// after a success returns the schedule to its baseline.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, failures: 0 }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for_attempt(self.failures)
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> usize {
        self.failures
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits concurrent operations against a shared resource.
///
/// The replicator uses one per remote so that batch fan-out never opens
/// more than a handful of connections at once.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }
}
