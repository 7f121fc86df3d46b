//! Stepwise raising of the permitted migration downtime.
//!
//! The guest is first allowed only a short pause. If memory copy does not
//! converge, the ceiling is raised on a fixed timer until it reaches the
//! configured target.

use crate::hypervisor::Hypervisor;
use crate::{Result, log_debug, log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Converged,
    Cancelled,
}

/// Downtime values for each of `steps` ticks, ending exactly at `downtime`.
///
/// The curve is geometric: it starts around `downtime / steps` and grows
/// slowly at first, never exceeding the linear ramp towards the same end
/// value. Every value is at least 1ms.
pub fn exponential_downtime(downtime: u64, steps: u32) -> Vec<u64> {
    let downtime = downtime.max(1);
    if steps <= 1 {
        return vec![downtime];
    }

    let n = u64::from(steps);
    let offset = downtime as f64 / n as f64;
    let base = (downtime as f64 - offset).powf(1.0 / (n - 1) as f64);

    (0..n)
        .map(|i| {
            if i == n - 1 {
                return downtime;
            }
            let geometric = (offset + base.powi(i as i32)) as u64;
            let linear = linear_downtime(downtime, steps, i as u32);
            geometric.min(linear).max(1)
        })
        .collect()
}

/// Value of the linear ramp at `step` (0-based), at least 1ms.
pub fn linear_downtime(downtime: u64, steps: u32, step: u32) -> u64 {
    let steps = u128::from(steps.max(1));
    let ramp = u128::from(downtime) * (u128::from(step) + 1) / steps;
    u64::try_from(ramp).unwrap_or(downtime).max(1)
}

#[derive(Debug)]
struct Shared {
    state: SchedulerState,
    applied: Vec<u64>,
}

pub struct DowntimeScheduler {
    hypervisor: Arc<dyn Hypervisor>,
    schedule: Vec<u64>,
    delay: Duration,
    next_step: usize,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DowntimeScheduler {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, downtime: u64, steps: u32, delay: Duration) -> Self {
        Self {
            hypervisor,
            schedule: exponential_downtime(downtime, steps),
            delay,
            next_step: 0,
            shared: Arc::new(Mutex::new(Shared {
                state: SchedulerState::Idle,
                applied: Vec::new(),
            })),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn schedule(&self) -> &[u64] {
        &self.schedule
    }

    pub fn state(&self) -> SchedulerState {
        lock(&self.shared).state
    }

    /// Values handed to the hypervisor so far, in order.
    pub fn applied(&self) -> Vec<u64> {
        lock(&self.shared).applied.clone()
    }

    /// Apply the lowest value before the transfer begins.
    pub async fn set_initial_downtime(&mut self) -> Result<()> {
        if self.next_step > 0 {
            return Ok(());
        }
        let initial = self.schedule[0];
        log_debug!("Setting initial migration downtime to {}ms", initial);
        self.hypervisor.set_max_downtime(initial).await?;
        lock(&self.shared).applied.push(initial);
        self.next_step = 1;
        Ok(())
    }

    /// Spawn the task applying the rest of the schedule.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let remaining = self.schedule[self.next_step..].to_vec();
        self.next_step = self.schedule.len();
        lock(&self.shared).state = SchedulerState::Running;

        let hypervisor = Arc::clone(&self.hypervisor);
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let delay = self.delay;

        self.handle = Some(tokio::spawn(async move {
            let outcome = apply_schedule(hypervisor, remaining, delay, &shared, cancel).await;
            lock(&shared).state = outcome;
        }));
    }

    /// Ask the task to stop before its next application.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait up to `timeout` for the task; abandon it if it overruns.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(mut handle) = self.handle.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                log_warn!("Downtime scheduler did not stop within {:?}, aborting it", timeout);
                handle.abort();
                lock(&self.shared).state = SchedulerState::Cancelled;
                false
            }
        }
    }
}

async fn apply_schedule(
    hypervisor: Arc<dyn Hypervisor>,
    values: Vec<u64>,
    delay: Duration,
    shared: &Mutex<Shared>,
    cancel: CancellationToken,
) -> SchedulerState {
    let total = values.len();
    for (step, value) in values.into_iter().enumerate() {
        if delay.is_zero() {
            if cancel.is_cancelled() {
                return SchedulerState::Cancelled;
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return SchedulerState::Cancelled,
                _ = sleep(delay) => {}
            }
        }

        log_debug!("Raising migration downtime to {}ms (step {}/{})", value, step + 1, total);
        // The guest may have finished migrating in the meantime.
        if let Err(e) = hypervisor.set_max_downtime(value).await {
            log_debug!("Ignoring failure to set downtime {}ms: {}", value, e);
        }
        lock(shared).applied.push(value);
    }

    log_info!("Migration downtime schedule completed");
    SchedulerState::Converged
}

fn lock(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: [(u64, u32); 9] = [
        (100, 2),
        (100, 10),
        (100, 1000),
        (500, 2),
        (500, 10),
        (500, 1000),
        (10000, 2),
        (10000, 10),
        (10000, 1000),
    ];

    fn delta(downtime: u64, steps: u32) -> f64 {
        f64::max(1.0, (downtime as f64 / steps as f64) / 10.0)
    }

    fn linear(downtime: u64, steps: u32) -> Vec<f64> {
        (0..steps)
            .map(|i| f64::max(1.0, downtime as f64 * (i + 1) as f64 / steps as f64))
            .collect()
    }

    #[test]
    fn test_schedule_length_and_end_value() {
        for steps in [1, 2, 10] {
            let schedule = exponential_downtime(1000, steps);
            assert_eq!(schedule.len(), steps as usize);
            assert_eq!(*schedule.last().unwrap(), 1000);
        }
    }

    #[test]
    fn test_single_step_is_target() {
        assert_eq!(exponential_downtime(750, 1), vec![750]);
    }

    #[test]
    fn test_schedule_never_zero_and_increasing() {
        for (downtime, steps) in PARAMS {
            let schedule = exponential_downtime(downtime, steps);
            assert!(schedule.iter().all(|&v| v > 0), "{:?}", (downtime, steps));
            assert!(
                schedule.windows(2).all(|w| w[0] <= w[1]),
                "not monotonic for {:?}",
                (downtime, steps)
            );
        }
    }

    #[test]
    fn test_schedule_stays_below_linear() {
        for (downtime, steps) in PARAMS {
            let exp = exponential_downtime(downtime, steps);
            let lin = linear(downtime, steps);

            assert!((exp[0] as f64 - lin[0]).abs() <= delta(downtime, steps));
            for (i, (a, b)) in exp.iter().zip(lin.iter()).enumerate().skip(1) {
                assert!(
                    *a as f64 <= *b,
                    "step={}/{} exp={} lin={}",
                    i,
                    steps,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_schedule_front_loads() {
        // with few steps, the geometric curve must sit strictly under linear somewhere
        let exp = exponential_downtime(10000, 10);
        let lin = linear(10000, 10);
        assert!(exp.iter().zip(lin.iter()).any(|(a, b)| (*a as f64) < *b));
    }

    #[test]
    fn test_huge_downtime_does_not_overflow() {
        let schedule = exponential_downtime(u64::MAX, 10);
        assert_eq!(schedule.len(), 10);
        assert_eq!(*schedule.last().unwrap(), u64::MAX);
        assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(linear_downtime(u64::MAX, 10, 9), u64::MAX);
        assert_eq!(linear_downtime(u64::MAX, 4, 1), u64::MAX / 2);
    }
}
