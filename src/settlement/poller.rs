//! Bounded settlement polling

use super::{Settlement, SettlementSource};
use crate::config::SettlementConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::task::OperationHandle;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polls a [`SettlementSource`] until an operation reaches a terminal status
pub struct SettlementPoller {
    source: Arc<dyn SettlementSource>,
    interval: Duration,
    max_consecutive_errors: u32,
}

impl SettlementPoller {
    pub fn new(source: Arc<dyn SettlementSource>, config: &SettlementConfig) -> Self {
        Self {
            source,
            interval: config.poll_interval(),
            max_consecutive_errors: config.max_consecutive_errors.max(1),
        }
    }

    /// Wait until `handle` settles.
    ///
    /// Returns as soon as a terminal status is observed. Fails with
    /// `SettlementTimeout` once `timeout` has elapsed, with
    /// `PollerUnavailable` after too many consecutive query failures, and
    /// with `Interrupted` when `cancel` fires. None of these failures say
    /// anything about the operation itself.
    pub async fn await_settlement(
        &self,
        handle: &OperationHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<Settlement> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut failures = 0u32;

        let timed_out = || CoordinatorError::SettlementTimeout {
            handle: handle.to_string(),
            waited_secs: timeout.as_secs(),
        };
        let interrupted = || CoordinatorError::Interrupted {
            handle: handle.to_string(),
        };

        loop {
            let query = timeout_at(deadline, self.source.query_status(handle));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(interrupted()),
                result = query => result,
            };

            match result {
                Err(_) => return Err(timed_out()),
                Ok(Ok(status)) => {
                    failures = 0;
                    if let Some(settlement) = Settlement::classify(&status) {
                        let elapsed = started.elapsed();
                        info!(
                            "Operation {} settled {} after {:.1}s",
                            handle,
                            settlement.as_str(),
                            elapsed.as_secs_f64()
                        );
                        crate::metrics::record_settlement(settlement.as_str(), elapsed.as_secs_f64());
                        return Ok(settlement);
                    }
                    debug!("Operation {} status {}", handle, status);
                }
                Ok(Err(e @ CoordinatorError::Validation(_))) => return Err(e),
                Ok(Err(e)) => {
                    failures += 1;
                    crate::metrics::record_poll_error();
                    warn!(
                        "Status query for {} failed ({}/{}): {}",
                        handle, failures, self.max_consecutive_errors, e
                    );
                    if failures >= self.max_consecutive_errors {
                        return Err(CoordinatorError::PollerUnavailable {
                            handle: handle.to_string(),
                            failures,
                        });
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(interrupted()),
                _ = sleep_until((now + self.interval).min(deadline)) => {}
            }
        }
    }
}
