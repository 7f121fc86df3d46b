use crate::hypervisor::{Hypervisor, JobStats, JobType, stat};
use crate::{FerryError, Result, log_debug, log_info, log_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    PreCopy,
    PostCopy,
}

/// One decoded job stats sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub job_type: JobType,
    pub time_elapsed_ms: u64,
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
    pub mem_total: u64,
    pub mem_processed: u64,
    pub mem_remaining: u64,
    pub mem_bps: Option<u64>,
    pub mem_constant: Option<u64>,
    pub compression_bytes: Option<u64>,
    pub dirty_rate: Option<u64>,
    pub mem_iteration: Option<u64>,
    pub operation: Option<u64>,
    pub postcopy_requests: Option<u64>,
}

fn required(stats: &JobStats, key: &str) -> Result<u64> {
    stats
        .get(key)
        .copied()
        .ok_or_else(|| FerryError::MissingField(key.to_string()))
}

impl Progress {
    pub fn from_job_stats(stats: &JobStats) -> Result<Self> {
        let code = required(stats, stat::TYPE)?;
        let job_type = JobType::from_code(code)
            .ok_or_else(|| FerryError::InvalidArgument(format!("unknown job type {}", code)))?;

        Ok(Self {
            job_type,
            time_elapsed_ms: required(stats, stat::TIME_ELAPSED)?,
            data_total: required(stats, stat::DATA_TOTAL)?,
            data_processed: required(stats, stat::DATA_PROCESSED)?,
            data_remaining: required(stats, stat::DATA_REMAINING)?,
            mem_total: required(stats, stat::MEMORY_TOTAL)?,
            mem_processed: required(stats, stat::MEMORY_PROCESSED)?,
            mem_remaining: required(stats, stat::MEMORY_REMAINING)?,
            mem_bps: stats.get(stat::MEMORY_BPS).copied(),
            mem_constant: stats.get(stat::MEMORY_CONSTANT).copied(),
            compression_bytes: stats.get(stat::COMPRESSION_BYTES).copied(),
            dirty_rate: stats.get(stat::MEMORY_DIRTY_RATE).copied(),
            mem_iteration: stats.get(stat::MEMORY_ITERATION).copied(),
            operation: stats.get(stat::OPERATION).copied(),
            postcopy_requests: stats.get(stat::MEMORY_POSTCOPY_REQUESTS).copied(),
        })
    }

    /// Share of data already sent, rounded to the nearest whole percent.
    pub fn percentage(&self) -> u8 {
        if self.data_total == 0 {
            return 0;
        }
        let total = u128::from(self.data_total);
        let done = total.saturating_sub(u128::from(self.data_remaining));
        let pct = (done * 100 + total / 2) / total;
        pct.min(100) as u8
    }

    pub fn phase(&self) -> MigrationPhase {
        match self.postcopy_requests {
            Some(requests) if requests > 0 => MigrationPhase::PostCopy,
            _ => MigrationPhase::PreCopy,
        }
    }
}

fn optional(value: Option<u64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}% ({:?}) elapsed={}ms data: total={} processed={} remaining={} \
             mem: total={} processed={} remaining={} bps={} constant={} \
             compressed={} dirty_rate={} iteration={}",
            self.percentage(),
            self.phase(),
            self.time_elapsed_ms,
            self.data_total,
            self.data_processed,
            self.data_remaining,
            self.mem_total,
            self.mem_processed,
            self.mem_remaining,
            optional(self.mem_bps),
            optional(self.mem_constant),
            optional(self.compression_bytes),
            optional(self.dirty_rate),
            optional(self.mem_iteration),
        )
    }
}

/// True while the hypervisor still has a bounded or unbounded job running.
pub fn ongoing(stats: &JobStats) -> bool {
    stats
        .get(stat::TYPE)
        .and_then(|code| JobType::from_code(*code))
        .is_some_and(JobType::is_active)
}

/// Published by the monitor on every useful sample; replaced, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub percentage: u8,
    pub phase: MigrationPhase,
    pub raw_stats: JobStats,
    pub sampled_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn from_progress(progress: &Progress, raw_stats: JobStats) -> Self {
        Self {
            percentage: progress.percentage(),
            phase: progress.phase(),
            raw_stats,
            sampled_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The transfer is not converging; the coordinator should abort it.
    Stalled(String),
}

#[derive(Debug, Clone, Default)]
pub struct StallLimits {
    /// Longest stretch without `data_remaining` reaching a new low.
    pub progress_timeout: Option<Duration>,
    /// Overall budget for the whole transfer.
    pub max_time: Option<Duration>,
}

/// Floor on the sampling interval; every sample is a round trip to the hypervisor.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

pub struct ProgressMonitor {
    hypervisor: Arc<dyn Hypervisor>,
    interval: Duration,
    limits: StallLimits,
    sender: Option<watch::Sender<Option<ProgressSnapshot>>>,
    receiver: watch::Receiver<Option<ProgressSnapshot>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, interval: Duration, limits: StallLimits) -> Self {
        let (sender, receiver) = watch::channel(None);
        Self {
            hypervisor,
            interval: interval.max(MIN_SAMPLE_INTERVAL),
            limits,
            sender: Some(sender),
            receiver,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressSnapshot>> {
        self.receiver.clone()
    }

    pub fn latest(&self) -> Option<ProgressSnapshot> {
        self.receiver.borrow().clone()
    }

    pub fn start(&mut self, events: mpsc::UnboundedSender<MonitorEvent>) {
        let Some(sender) = self.sender.take() else {
            return;
        };

        let poller = Poller {
            hypervisor: Arc::clone(&self.hypervisor),
            interval: self.interval,
            limits: self.limits.clone(),
            cancel: self.cancel.clone(),
        };
        self.handle = Some(tokio::spawn(poller.run(sender, events)));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait up to `timeout` for the task; abandon it if it overruns.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(mut handle) = self.handle.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                log_warn!("Progress monitor did not stop within {:?}, aborting it", timeout);
                handle.abort();
                false
            }
        }
    }
}

struct Poller {
    hypervisor: Arc<dyn Hypervisor>,
    interval: Duration,
    limits: StallLimits,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(
        self,
        sender: watch::Sender<Option<ProgressSnapshot>>,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) {
        let started = Instant::now();
        let mut lowest_remaining: Option<u64> = None;
        let mut last_progress_at = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }

            let stats = match self.hypervisor.get_job_stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    log_warn!("Failed to read migration job stats: {}", e);
                    continue;
                }
            };
            // Before the transfer starts, and after it ends, there is nothing to report.
            if !ongoing(&stats) {
                continue;
            }
            let progress = match Progress::from_job_stats(&stats) {
                Ok(progress) => progress,
                Err(e) => {
                    log_warn!("Discarding malformed job stats: {}", e);
                    continue;
                }
            };

            log_info!("Migration progress: {}", progress);
            let phase = progress.phase();
            let remaining = progress.data_remaining;
            sender.send_replace(Some(ProgressSnapshot::from_progress(&progress, stats)));

            // A stalled post-copy cannot be aborted without losing the guest.
            if phase == MigrationPhase::PostCopy {
                continue;
            }

            if lowest_remaining.is_none_or(|low| remaining < low) {
                lowest_remaining = Some(remaining);
                last_progress_at = Instant::now();
            } else if let Some(timeout) = self.limits.progress_timeout {
                if last_progress_at.elapsed() > timeout {
                    let reason = format!(
                        "no progress for {}s, {} bytes remaining",
                        last_progress_at.elapsed().as_secs(),
                        remaining
                    );
                    let _ = events.send(MonitorEvent::Stalled(reason));
                    break;
                }
            }

            if let Some(max_time) = self.limits.max_time {
                if started.elapsed() > max_time {
                    let reason = format!("exceeded time budget of {}s", max_time.as_secs());
                    let _ = events.send(MonitorEvent::Stalled(reason));
                    break;
                }
            }
        }

        log_debug!("Progress monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_stats() -> JobStats {
        [
            (stat::TYPE, JobType::Unbounded.code()),
            (stat::TIME_ELAPSED, 42),
            (stat::DATA_TOTAL, 8192),
            (stat::DATA_PROCESSED, 0),
            (stat::DATA_REMAINING, 8192),
            (stat::MEMORY_TOTAL, 1024),
            (stat::MEMORY_PROCESSED, 512),
            (stat::MEMORY_REMAINING, 512),
            (stat::MEMORY_BPS, 128),
            (stat::MEMORY_CONSTANT, 0),
            (stat::COMPRESSION_BYTES, 0),
            (stat::MEMORY_DIRTY_RATE, 2),
            (stat::MEMORY_ITERATION, 0),
            (stat::OPERATION, 4),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_display() {
        let progress = Progress::from_job_stats(&job_stats()).unwrap();
        let line = progress.to_string();
        assert!(line.starts_with("0%"));
        assert!(line.contains("bps=128"));
    }

    #[test]
    fn test_required_fields() {
        for field in stat::REQUIRED {
            let mut stats = job_stats();
            stats.remove(field);
            match Progress::from_job_stats(&stats) {
                Err(FerryError::MissingField(name)) => assert_eq!(name, field),
                other => panic!("expected MissingField({}), got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_display_without_optional_fields() {
        for field in [
            stat::MEMORY_BPS,
            stat::MEMORY_CONSTANT,
            stat::COMPRESSION_BYTES,
            stat::MEMORY_DIRTY_RATE,
            stat::MEMORY_ITERATION,
            stat::OPERATION,
        ] {
            let mut stats = job_stats();
            stats.remove(field);
            let progress = Progress::from_job_stats(&stats).unwrap();
            assert!(!progress.to_string().is_empty());
        }
    }

    #[test]
    fn test_percentage() {
        let cases = [
            (0, 0, 0),
            (0, 100, 100),
            (100, 100, 0),
            (50, 100, 50),
            (33, 100, 67),
            (1, 100, 99),
            (99, 100, 1),
        ];
        for (remaining, total, expected) in cases {
            let mut stats = job_stats();
            stats.insert(stat::DATA_REMAINING.to_string(), remaining);
            stats.insert(stat::DATA_TOTAL.to_string(), total);
            let progress = Progress::from_job_stats(&stats).unwrap();
            assert_eq!(
                progress.percentage(),
                expected,
                "remaining={} total={}",
                remaining,
                total
            );
        }
    }

    #[test]
    fn test_remaining_above_total_is_zero() {
        let mut stats = job_stats();
        stats.insert(stat::DATA_REMAINING.to_string(), 200);
        stats.insert(stat::DATA_TOTAL.to_string(), 100);
        assert_eq!(Progress::from_job_stats(&stats).unwrap().percentage(), 0);
    }

    #[test]
    fn test_ongoing() {
        for (job_type, expected) in [
            (JobType::Bounded, true),
            (JobType::Unbounded, true),
            (JobType::None, false),
        ] {
            let mut stats = job_stats();
            stats.insert(stat::TYPE.to_string(), job_type.code());
            assert_eq!(ongoing(&stats), expected, "{:?}", job_type);
        }
        assert!(!ongoing(&JobStats::new()));
    }

    #[test]
    fn test_phase() {
        let mut stats = job_stats();
        assert_eq!(
            Progress::from_job_stats(&stats).unwrap().phase(),
            MigrationPhase::PreCopy
        );
        stats.insert(stat::MEMORY_POSTCOPY_REQUESTS.to_string(), 3);
        assert_eq!(
            Progress::from_job_stats(&stats).unwrap().phase(),
            MigrationPhase::PostCopy
        );
    }
}
