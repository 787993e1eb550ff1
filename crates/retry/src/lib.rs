//! Bounded retry policies for the reconciler's external calls.
//!
//! Every call the reconciler makes to the orchestrator API or the database
//! driver is bounded: nothing in this crate retries forever. The outer
//! Watching loop (owned by the reconciler itself) is the only unbounded
//! repetition in the system.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Exponential backoff: base 1s, factor 2, capped at `max_attempts`.
///
/// Used for orchestrator-API calls (listing tasks, nodes, services), which
/// fail in bursts during cluster churn and recover quickly once the API
/// server catches up.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    factor: u32,
    max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, factor: u32, max_attempts: u32) -> Self {
        Self {
            base,
            factor,
            max_attempts,
        }
    }

    /// The policy used for orchestrator-API calls: base 1s, factor 2, 10 attempts.
    pub fn orchestrator_api() -> Self {
        Self::new(Duration::from_secs(1), 2, 10)
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base * self.factor.saturating_pow(attempt)
    }
}

/// Fixed-delay bounded retry: a constant delay between a fixed number of attempts.
///
/// Used for database-driver calls, where the wait is dictated by the
/// database's own recovery time (stepdown, election) rather than by
/// backpressure on a remote API.
#[derive(Debug, Clone, Copy)]
pub struct FixedRetry {
    delay: Duration,
    max_attempts: u32,
}

impl FixedRetry {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self { delay, max_attempts }
    }

    /// Reconfigure retries: 3 attempts, 5s apart.
    pub fn reconfigure() -> Self {
        Self::new(Duration::from_secs(5), 3)
    }

    /// Primary-election wait: 6 attempts, 10s apart.
    pub fn primary_election() -> Self {
        Self::new(Duration::from_secs(10), 6)
    }

    /// Primary-election wait during fresh initiation: 8 attempts, 10s apart.
    pub fn initiation_primary_election() -> Self {
        Self::new(Duration::from_secs(10), 8)
    }

    /// Admin-user creation retries: 8 attempts, 10s apart.
    pub fn admin_user_creation() -> Self {
        Self::new(Duration::from_secs(10), 8)
    }

    /// "Never initialized" classification window: 3 attempts, 10s apart.
    pub fn classification() -> Self {
        Self::new(Duration::from_secs(10), 3)
    }

    /// Startup budget waiting for the database service to come fully up:
    /// 40 attempts, 10s apart.
    pub fn service_startup() -> Self {
        Self::new(Duration::from_secs(10), 40)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Run `op` under the exponential backoff policy, retrying on `Err`.
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn with_exponential_backoff<T, E, F, Fut>(
    policy: ExponentialBackoff,
    op_name: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(op = op_name, attempts = attempt, %err, "exhausted retry budget");
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(op = op_name, attempt, ?delay, %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run `op` under a fixed-delay policy, retrying on `Err`.
///
/// Unlike [`with_exponential_backoff`], every attempt after the first waits
/// the same fixed delay, matching the database's own recovery cadence
/// rather than backing off further on repeated failure.
pub async fn with_fixed_retry<T, E, F, Fut>(
    policy: FixedRetry,
    op_name: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(op = op_name, attempts = attempt, %err, "exhausted retry budget");
                    return Err(err);
                }
                debug!(op = op_name, attempt, delay = ?policy.delay, %err, "retrying");
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delay_doubles_each_attempt() {
        let policy = ExponentialBackoff::new(Duration::from_secs(1), 2, 10);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn with_fixed_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = FixedRetry::new(Duration::from_millis(1), 5);
        let result: Result<u32, &str> = with_fixed_retry(policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_fixed_retry_exhausts_budget() {
        let policy = FixedRetry::new(Duration::from_millis(1), 3);
        let result: Result<u32, &str> =
            with_fixed_retry(policy, "test", || async { Err("always fails") }).await;
        assert_eq!(result, Err("always fails"));
    }

    #[tokio::test]
    async fn with_exponential_backoff_succeeds_eventually() {
        let calls = AtomicU32::new(0);
        let policy = ExponentialBackoff::new(Duration::from_millis(1), 2, 10);
        let result: Result<u32, &str> = with_exponential_backoff(policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err("retry me")
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn named_policies_match_documented_budgets() {
        assert_eq!(FixedRetry::reconfigure().max_attempts(), 3);
        assert_eq!(FixedRetry::reconfigure().delay(), Duration::from_secs(5));
        assert_eq!(FixedRetry::primary_election().max_attempts(), 6);
        assert_eq!(FixedRetry::initiation_primary_election().max_attempts(), 8);
        assert_eq!(FixedRetry::admin_user_creation().max_attempts(), 8);
        assert_eq!(FixedRetry::classification().max_attempts(), 3);
        assert_eq!(FixedRetry::service_startup().max_attempts(), 40);
        assert_eq!(FixedRetry::service_startup().delay(), Duration::from_secs(10));
    }
}
