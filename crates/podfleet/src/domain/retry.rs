//! Retrying API calls that fail transiently while provisioning.

use std::future::Future;
use std::time::Duration;

use error_stack::Report;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::domain::cluster_api::KubernetesError;
use crate::domain::cluster_spec::ProvisionTimeout;
use crate::domain::error::PermissionError;
use crate::domain::error::ProvisionError;

/// Exponential backoff bounded by the provisioning timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub timeout: ProvisionTimeout,
}

impl RetryPolicy {
    pub fn new(timeout: ProvisionTimeout) -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.6,
            max_delay: Duration::from_secs(5),
            timeout,
        }
    }

    pub fn deadline(&self, start: Instant) -> Option<Instant> {
        self.timeout.as_duration().map(|timeout| start + timeout)
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently or the timeout elapses.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::Permission`] on 401/403, never retried
    /// - [`ProvisionError::Timeout`] once transient failures outlast the timeout
    /// - [`ProvisionError::Api`] on any other failure
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, Report<ProvisionError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Report<KubernetesError>>>,
    {
        let deadline = self.deadline(Instant::now());
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let report = match op().await {
                Ok(value) => return Ok(value),
                Err(report) => report,
            };

            let context = report.current_context().clone();
            if context.is_forbidden() {
                return Err(report.change_context(ProvisionError::Permission(PermissionError {
                    operation: operation.to_string(),
                    message: context.to_string(),
                })));
            }
            if !context.is_transient() {
                return Err(report.change_context(ProvisionError::Api {
                    operation: operation.to_string(),
                }));
            }

            if let Some(deadline) = deadline {
                if Instant::now() + delay > deadline {
                    return Err(report
                        .change_context(ProvisionError::Timeout {
                            operation: operation.to_string(),
                            timeout: self.timeout.as_duration().unwrap_or_default(),
                        })
                        .attach_printable(format!("gave up after {attempt} attempts")));
                }
            }

            if attempt == 1 {
                debug!(%operation, error = %context, "transient failure, retrying");
            } else {
                warn!(%operation, attempt, error = %context, ?delay, "transient failure, retrying");
            }
            tokio::time::sleep(delay).await;
            delay = self.next_delay(delay);
        }
    }
}
