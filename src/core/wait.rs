use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A named asynchronous predicate checked repeatedly by
/// [`wait_for_condition`]. The name only exists to make log lines and
/// timeout errors identifiable.
pub struct Condition<F> {
    name: String,
    check: F,
}

impl<F, Fut> Condition<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Condition {
            name: name.into(),
            check,
        }
    }

    async fn check(&mut self) -> Result<bool> {
        (self.check)().await
    }
}

/// Poll a condition until it holds, the timeout elapses, or an error
/// propagates.
///
/// Cluster API errors from the check are swallowed (and logged) unless
/// `fail_on_api_error` is set; a resource being briefly unreadable mid
/// restart is routine while waiting. Every other error propagates
/// immediately. The poll yields for `interval` between checks and is
/// cancelled by dropping the future.
pub async fn wait_for_condition<F, Fut>(
    mut condition: Condition<F>,
    timeout: Duration,
    interval: Duration,
    fail_on_api_error: bool,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    debug!("waiting for condition '{}'", condition.name);
    let start = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            return Err(Error::Timeout {
                condition: condition.name.clone(),
                timeout,
            });
        }

        match condition.check().await {
            Ok(true) => {
                debug!(
                    "condition '{}' passed after {:?}",
                    condition.name,
                    start.elapsed()
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(err @ Error::KubeApi(_)) if !fail_on_api_error => {
                warn!("API error while waiting for '{}': {err}", condition.name);
            }
            Err(err) => return Err(err),
        }

        tokio::time::sleep(interval).await;
    }
}

/// Exponential delay for retry attempt `attempt` (0-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_once_the_condition_holds() {
        let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
        let checks = AtomicU32::new(0);
        let condition = Condition::new("three checks", || {
            let n = checks.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n >= 2) }
        });
        wait_for_condition(
            condition,
            Duration::from_secs(5),
            Duration::from_millis(5),
            true,
        )
        .await
        .unwrap();
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_the_condition_never_holds() {
        let condition = Condition::new("never", || async { Ok(false) });
        let err = wait_for_condition(
            condition,
            Duration::from_millis(30),
            Duration::from_millis(5),
            true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn api_errors_continue_the_poll_when_tolerated() {
        let checks = AtomicU32::new(0);
        let condition = Condition::new("flaky", || {
            let n = checks.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::KubeApi(kube::Error::Api(kube::core::ErrorResponse {
                        status: "Failure".into(),
                        message: "temporarily unavailable".into(),
                        reason: "ServiceUnavailable".into(),
                        code: 503,
                    })))
                } else {
                    Ok(true)
                }
            }
        });
        wait_for_condition(
            condition,
            Duration::from_secs(5),
            Duration::from_millis(5),
            false,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn api_errors_propagate_when_not_tolerated() {
        let condition = Condition::new("strict", || async {
            Err(Error::KubeApi(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "forbidden".into(),
                reason: "Forbidden".into(),
                code: 403,
            })))
        });
        let err = wait_for_condition(
            condition,
            Duration::from_secs(1),
            Duration::from_millis(5),
            true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::KubeApi(_)));
    }

    #[tokio::test]
    async fn non_api_errors_always_propagate() {
        let condition = Condition::new("rejected", || async {
            Err(Error::rejected(
                crate::errors::RejectionReason::SchedulingFailed,
                "0/4 nodes available",
            ))
        });
        let err = wait_for_condition(
            condition,
            Duration::from_secs(1),
            Duration::from_millis(5),
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::AdjustmentRejected { .. }));
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(Duration::from_millis(100), 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(Duration::from_millis(100), 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(Duration::from_millis(100), 2), Duration::from_millis(400));
    }
}
