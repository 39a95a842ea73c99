/*!
 * Utility functions and helpers for devgate.
 */
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "Operation timed out after {:?}",
            duration
        ))),
    }
}

/// Fixed-backoff retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub retries: usize,
    /// Pause between two attempts
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy with the given retry count and interval
    pub fn new(retries: usize, interval: Duration) -> Self {
        Self { retries, interval }
    }
}

/// Run a fallible operation, retrying with a fixed backoff
///
/// # Arguments
///
/// * `policy` - The retry count and the pause between attempts
/// * `future_factory` - A function that creates a new future for each attempt
///
/// # Returns
///
/// The result of the first successful attempt, or the last error
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, mut future_factory: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    let start = Instant::now();

    for i in 0..=policy.retries {
        if i > 0 {
            debug!("Retry {}/{} in {:?}", i, policy.retries, policy.interval);
            tokio::time::sleep(policy.interval).await;
        }

        match future_factory().await {
            Ok(result) => {
                if i > 0 {
                    debug!("Succeeded after {} retries", i);
                }
                return Ok(result);
            }
            Err(e) => {
                warn!("Attempt {} failed: {}", i + 1, e);
                last_error = Some(e);
            }
        }
    }

    warn!(
        "All {} attempts failed after {:?}",
        policy.retries + 1,
        start.elapsed()
    );

    Err(last_error.unwrap_or_else(|| Error::other("Unknown error in retry loop")))
}
