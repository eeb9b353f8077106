//! Retry loop shared by every protocol adapter.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use super::TransportError;

/// Attempt ceiling and fixed pause between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves like one.
    pub attempts: u32,
    /// Pause between consecutive attempts.
    pub sleep: Duration,
}

impl RetryPolicy {
    /// Creates a policy with `attempts` tries separated by `sleep`.
    #[must_use]
    pub const fn new(attempts: u32, sleep: Duration) -> Self {
        Self { attempts, sleep }
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// the attempt ceiling is reached.
///
/// Transient failures are logged at info level while attempts remain; the
/// final failure is logged at warn level before it is returned.
///
/// # Errors
///
/// Returns the last error produced by `operation`.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                info!(
                    attempt,
                    attempts,
                    error = %err,
                    "{label} failed, retrying in {:?}",
                    policy.sleep
                );
                sleep(policy.sleep).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(attempt, attempts, error = %err, "{label} failed, giving up");
                }
                return Err(err);
            }
        }
    }
}
