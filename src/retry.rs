use crate::hypervisor::{CreateStatus, Hypervisor, MigrationParams};
use crate::{FerryError, Result, log_debug, log_info, log_warn};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Result of [`RetryPolicy::attempt_start`]: how many requests went out and
/// how the last one ended.
#[derive(Debug)]
pub struct StartOutcome {
    pub attempts: u32,
    pub result: Result<()>,
}

/// Asks the destination to accept the migration, waiting out the periods
/// where it is already busy with as many incoming guests as it allows.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry_interval: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub async fn attempt_start(
        &self,
        hypervisor: &dyn Hypervisor,
        params: &MigrationParams,
        downtime_limit: u64,
        cancel: &CancellationToken,
    ) -> StartOutcome {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            log_debug!(
                "Requesting migration of '{}' (attempt {})",
                params.vm_name,
                attempts
            );

            let error = match hypervisor.start_migration(params, downtime_limit).await {
                Ok(response) => match response.status {
                    CreateStatus::Success => {
                        log_info!(
                            "Destination accepted migration of '{}' after {} attempt(s)",
                            params.vm_name,
                            attempts
                        );
                        return StartOutcome {
                            attempts,
                            result: Ok(()),
                        };
                    }
                    CreateStatus::LimitExceeded => {
                        FerryError::MigrationLimitExceeded(response.message)
                    }
                    CreateStatus::Error(code) => FerryError::hypervisor(code, response.message),
                },
                Err(e) => e,
            };

            if !error.is_retryable() {
                log_warn!(
                    "Migration of '{}' rejected after {} attempt(s): {}",
                    params.vm_name,
                    attempts,
                    error
                );
                return StartOutcome {
                    attempts,
                    result: Err(error),
                };
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                log_warn!(
                    "Giving up on migration of '{}' after {} attempt(s): {}",
                    params.vm_name,
                    attempts,
                    error
                );
                return StartOutcome {
                    attempts,
                    result: Err(error),
                };
            }

            log_info!(
                "Destination busy, retrying migration of '{}' in {:?}",
                params.vm_name,
                self.retry_interval
            );

            if self.retry_interval.is_zero() {
                if cancel.is_cancelled() {
                    return StartOutcome {
                        attempts,
                        result: Err(FerryError::Cancelled),
                    };
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return StartOutcome { attempts, result: Err(FerryError::Cancelled) };
                    }
                    _ = sleep(self.retry_interval) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{CreateResponse, JobStats, MigrateOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct BusyDestination {
        busy_for: u32,
        failure: CreateResponse,
        attempts: AtomicU32,
    }

    impl BusyDestination {
        fn new(busy_for: u32, failure: CreateResponse) -> Self {
            Self {
                busy_for,
                failure,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Hypervisor for BusyDestination {
        async fn start_migration(&self, _: &MigrationParams, _: u64) -> Result<CreateResponse> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.busy_for {
                Ok(CreateResponse::success())
            } else {
                Ok(self.failure.clone())
            }
        }
        async fn set_max_downtime(&self, _: u64) -> Result<()> {
            Ok(())
        }
        async fn get_job_stats(&self) -> Result<JobStats> {
            Ok(JobStats::new())
        }
        async fn migrate_to_destination(&self, _: &str, _: &MigrateOptions) -> Result<()> {
            Ok(())
        }
        async fn is_persistent(&self) -> Result<bool> {
            Ok(true)
        }
        async fn abort_job(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retries_until_accepted() {
        for failures in [0, 1, 2, 10] {
            let dest = BusyDestination::new(failures, CreateResponse::limit_exceeded());
            let outcome = RetryPolicy::new(Duration::ZERO)
                .attempt_start(&dest, &MigrationParams::default(), 500, &CancellationToken::new())
                .await;
            assert!(outcome.result.is_ok());
            assert_eq!(outcome.attempts, failures + 1);
            assert_eq!(dest.attempts.load(Ordering::SeqCst), failures + 1);
        }
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let dest = BusyDestination::new(5, CreateResponse::error(12, "destination refused"));
        let outcome = RetryPolicy::new(Duration::ZERO)
            .attempt_start(&dest, &MigrationParams::default(), 500, &CancellationToken::new())
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.result,
            Err(FerryError::Hypervisor { code: 12, .. })
        ));
    }

    #[tokio::test]
    async fn test_max_attempts_cap() {
        let dest = BusyDestination::new(10, CreateResponse::limit_exceeded());
        let outcome = RetryPolicy::new(Duration::ZERO)
            .with_max_attempts(Some(3))
            .attempt_start(&dest, &MigrationParams::default(), 500, &CancellationToken::new())
            .await;
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(
            outcome.result,
            Err(FerryError::MigrationLimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let dest = BusyDestination::new(u32::MAX, CreateResponse::limit_exceeded());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = RetryPolicy::new(Duration::from_secs(3600))
            .attempt_start(&dest, &MigrationParams::default(), 500, &cancel)
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(FerryError::Cancelled)));
    }
}
