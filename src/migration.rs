//! Orchestration of one outgoing live migration.
//!
//! The coordinator owns the [`MigrationJob`] record. The downtime scheduler
//! and the progress monitor run as separate tasks that only ever hand values
//! back over channels; every write to the job happens here, under one lock.

use crate::address::{self, split_host_port, uri_host};
use crate::config::MigrationConfig;
use crate::downtime::DowntimeScheduler;
use crate::hypervisor::{DomainEvent, Hypervisor, MigrateOptions, MigrationParams};
use crate::progress::{MigrationPhase, MonitorEvent, ProgressMonitor, ProgressSnapshot, StallLimits};
use crate::retry::RetryPolicy;
use crate::vm::{PostCopyPhase, Vm, VmStatus};
use crate::{FerryError, Result, log_debug, log_error, log_info, log_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    Preparing,
    Migrating,
    PostCopy,
    Succeeded,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MigrationStatus::Succeeded | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            MigrationStatus::Preparing => 0,
            MigrationStatus::Migrating => 1,
            MigrationStatus::PostCopy => 2,
            MigrationStatus::Succeeded | MigrationStatus::Failed | MigrationStatus::Cancelled => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationJob {
    id: Uuid,
    vm: Arc<Vm>,
    destination: String,
    downtime_target: u64,
    downtime_steps: u32,
    status: MigrationStatus,
    progress: u8,
    post_copy: PostCopyPhase,
    retry_attempts: u32,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl MigrationJob {
    pub fn new(vm: Arc<Vm>, downtime_target: u64, downtime_steps: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            vm,
            destination: String::new(),
            downtime_target,
            downtime_steps,
            status: MigrationStatus::Preparing,
            progress: 0,
            post_copy: PostCopyPhase::None,
            retry_attempts: 0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn downtime_target(&self) -> u64 {
        self.downtime_target
    }

    pub fn downtime_steps(&self) -> u32 {
        self.downtime_steps
    }

    pub fn status(&self) -> MigrationStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn post_copy(&self) -> PostCopyPhase {
        self.post_copy
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Move forward to `to`. Going back, standing still, or leaving a
    /// terminal state is refused.
    pub fn transition(&mut self, to: MigrationStatus) -> Result<()> {
        if self.status.is_terminal() || to.rank() <= self.status.rank() {
            return Err(FerryError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", to),
            });
        }
        log_debug!("Migration {} {:?} -> {:?}", self.id, self.status, to);
        self.status = to;
        if to.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Fold a progress sample in; the visible figure never goes down.
    pub fn record_progress(&mut self, sample: u8) -> u8 {
        if !self.status.is_terminal() {
            self.progress = self.progress.max(sample.min(100));
        }
        self.progress
    }

    /// Returns true only the first time post-copy is entered.
    pub fn enter_post_copy(&mut self) -> bool {
        if self.post_copy == PostCopyPhase::Running || self.status.is_terminal() {
            return false;
        }
        self.post_copy = PostCopyPhase::Running;
        if let Err(e) = self.transition(MigrationStatus::PostCopy) {
            log_warn!("Post-copy signalled in unexpected state: {}", e);
        }
        true
    }

    fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    fn finish(&mut self, status: MigrationStatus, error: Option<String>) {
        if let Err(e) = self.transition(status) {
            log_warn!("Ignoring final status of migration {}: {}", self.id, e);
            return;
        }
        self.error = error;
    }
}

/// What the daemon's status API reports for a running migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStat {
    pub progress: u8,
    pub attempt_count: u32,
    pub destination: String,
    pub post_copy: PostCopyPhase,
    pub status: MigrationStatus,
}

pub struct MigrationCoordinator {
    vm: Arc<Vm>,
    hypervisor: Arc<dyn Hypervisor>,
    params: MigrationParams,
    config: MigrationConfig,
    job: Mutex<MigrationJob>,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<DomainEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DomainEvent>>>,
}

impl MigrationCoordinator {
    pub fn new(
        vm: Arc<Vm>,
        hypervisor: Arc<dyn Hypervisor>,
        params: MigrationParams,
        config: MigrationConfig,
    ) -> Self {
        let job = MigrationJob::new(
            Arc::clone(&vm),
            config.migration_downtime,
            config.migration_downtime_steps,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            vm,
            hypervisor,
            params,
            config,
            job: Mutex::new(job),
            cancel: CancellationToken::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Seed the visible progress, e.g. when re-attaching to a migration a
    /// previous daemon instance reported on.
    pub fn with_progress(self, progress: u8) -> Self {
        self.job().record_progress(progress);
        self
    }

    fn job(&self) -> MutexGuard<'_, MigrationJob> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn job_id(&self) -> Uuid {
        self.job().id()
    }

    /// Copy of the job record as it stands.
    pub fn snapshot(&self) -> MigrationJob {
        self.job().clone()
    }

    pub fn get_stat(&self) -> MigrationStat {
        let job = self.job();
        MigrationStat {
            progress: job.progress,
            attempt_count: job.retry_attempts,
            destination: job.destination.clone(),
            post_copy: job.post_copy,
            status: job.status,
        }
    }

    /// Where hypervisor lifecycle callbacks for this VM should be sent.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<DomainEvent> {
        self.events_tx.clone()
    }

    /// Ask for the migration to be aborted. The job only becomes `Cancelled`
    /// once the hypervisor confirms the transfer has stopped.
    ///
    /// Refused once post-copy has started: the guest's memory is then split
    /// between both hosts and the transfer has to run to completion.
    pub fn cancel(&self) -> Result<()> {
        {
            let job = self.job();
            if job.status.is_terminal() || job.post_copy == PostCopyPhase::Running {
                log_warn!(
                    "Refusing to cancel migration {} in status {:?}",
                    job.id,
                    job.status
                );
                return Err(FerryError::InvalidTransition {
                    from: format!("{:?}", job.status),
                    to: format!("{:?}", MigrationStatus::Cancelled),
                });
            }
            log_info!("Cancellation requested for migration {}", job.id);
        }
        self.cancel.cancel();
        Ok(())
    }

    /// Drive the migration to a terminal state. The returned error is the
    /// one that ended the job; the job record reflects it either way.
    pub async fn run(&self) -> Result<()> {
        let mut events = self
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| FerryError::InvalidArgument("migration already ran".to_string()))?;

        self.job().mark_started();

        let previous_status = self.vm.status();
        if !previous_status.is_migratable() {
            let error = FerryError::NoSuchVM(self.vm.name().to_string());
            log_error!("Refusing to migrate VM '{}' in status {:?}", self.vm.name(), previous_status);
            self.job().finish(MigrationStatus::Failed, Some(error.to_string()));
            return Err(error);
        }

        let destination = match self.resolve_destination() {
            Ok(destination) => destination,
            Err(e) => {
                log_error!("Invalid migration destination for VM '{}': {}", self.vm.name(), e);
                self.job().finish(MigrationStatus::Failed, Some(e.to_string()));
                return Err(e);
            }
        };
        self.job().destination = destination.clone();

        log_info!(
            "Starting migration {} of VM '{}' to {}",
            self.job_id(),
            self.vm.name(),
            destination
        );

        let params_scope = self.vm.migration_parameters(self.params.clone());
        self.vm.set_status(VmStatus::MigrationSource);

        let mut scheduler = DowntimeScheduler::new(
            Arc::clone(&self.hypervisor),
            self.config.migration_downtime,
            self.config.migration_downtime_steps,
            self.config.downtime_delay(),
        );
        let mut monitor = ProgressMonitor::new(
            Arc::clone(&self.hypervisor),
            self.config.monitor_interval(),
            StallLimits {
                progress_timeout: self.config.progress_timeout(),
                max_time: self.config.max_migration_time(self.vm.mem_size_mb()),
            },
        );

        let result = self
            .drive(&destination, &mut scheduler, &mut monitor, &mut events)
            .await;

        scheduler.stop();
        monitor.stop();
        let join_timeout = self.config.task_join_timeout();
        let (scheduler_stopped, monitor_stopped) =
            tokio::join!(scheduler.join(join_timeout), monitor.join(join_timeout));
        if !(scheduler_stopped && monitor_stopped) {
            log_warn!("Abandoned background tasks of migration {}", self.job_id());
        }

        self.finalize(&result, previous_status);

        if let Err(e) = params_scope.release() {
            log_error!("Failed to release migration parameters: {}", e);
        }

        result
    }

    fn resolve_destination(&self) -> Result<String> {
        let default_port = serde_json::Value::from(self.config.management_port);
        let port = match &self.params.dst_port {
            Some(port) if !port.is_null() => Some(port),
            // A host carrying its own port must pass through untouched.
            _ if has_embedded_port(self.params.dst.as_deref()) => None,
            _ => Some(&default_port),
        };
        address::canonicalize_value(self.params.dst.as_deref(), port)
    }

    async fn drive(
        &self,
        destination: &str,
        scheduler: &mut DowntimeScheduler,
        monitor: &mut ProgressMonitor,
        events: &mut mpsc::UnboundedReceiver<DomainEvent>,
    ) -> Result<()> {
        let outcome = RetryPolicy::new(self.config.retry_timeout())
            .with_max_attempts(self.config.max_start_attempts)
            .attempt_start(
                self.hypervisor.as_ref(),
                &self.params,
                self.config.migration_downtime,
                &self.cancel,
            )
            .await;
        self.job().retry_attempts = outcome.attempts;
        if let Err(e) = outcome.result {
            log_error!(
                "Failed to start migration of VM '{}' after {} attempt(s): {}",
                self.vm.name(),
                outcome.attempts,
                e
            );
            return Err(e);
        }

        if self.cancel.is_cancelled() {
            return Err(FerryError::Cancelled);
        }
        self.job().transition(MigrationStatus::Migrating)?;

        if let Err(e) = scheduler.set_initial_downtime().await {
            log_warn!("Failed to set initial downtime: {}", e);
        }
        scheduler.start();

        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let mut progress_rx = monitor.subscribe();
        monitor.start(monitor_tx);

        let uri = self.destination_uri(destination)?;
        let options = self.migrate_options(destination).await?;
        log_info!("Transferring VM '{}' to {}", self.vm.name(), uri);

        let transfer = self.hypervisor.migrate_to_destination(&uri, &options);
        tokio::pin!(transfer);

        let mut progress_open = true;
        let mut cancel_seen = false;
        // Why the transfer is being torn down, once the hypervisor accepted the abort.
        let mut aborting: Option<FerryError> = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    if self.abort_transfer("cancellation").await {
                        aborting = Some(FerryError::Cancelled);
                    }
                }
                result = &mut transfer => {
                    self.apply_latest(&progress_rx);
                    return match (result, aborting.take()) {
                        (Err(e), Some(reason)) => {
                            log_debug!("Transfer ended after abort: {}", e);
                            Err(reason)
                        }
                        (result, _) => result,
                    };
                }
                changed = progress_rx.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                    let snapshot = progress_rx.borrow_and_update().clone();
                    if let Some(snapshot) = snapshot {
                        self.apply_snapshot(&snapshot);
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
                Some(MonitorEvent::Stalled(reason)) = monitor_rx.recv(), if aborting.is_none() => {
                    log_warn!("Migration of VM '{}' stalled: {}", self.vm.name(), reason);
                    if self.abort_transfer("stall").await {
                        aborting = Some(FerryError::Stalled(reason));
                    }
                }
            }
        }
    }

    /// Ask the hypervisor to stop the transfer. On refusal the migration keeps
    /// going and its outcome is whatever the transfer returns.
    async fn abort_transfer(&self, cause: &str) -> bool {
        if self.job().post_copy == PostCopyPhase::Running {
            log_warn!(
                "Ignoring {} of VM '{}': post-copy already running",
                cause,
                self.vm.name()
            );
            return false;
        }

        log_info!("Aborting migration of VM '{}' on {}", self.vm.name(), cause);
        match self.hypervisor.abort_job().await {
            Ok(()) => true,
            Err(e) => {
                log_error!(
                    "Failed to abort migration of VM '{}', it continues: {}",
                    self.vm.name(),
                    e
                );
                false
            }
        }
    }

    fn destination_uri(&self, destination: &str) -> Result<String> {
        Ok(format!(
            "{}://{}/system",
            self.config.migration_uri_scheme,
            uri_host(destination)?
        ))
    }

    async fn migrate_options(&self, destination: &str) -> Result<MigrateOptions> {
        let persistent = self.hypervisor.is_persistent().await?;

        Ok(MigrateOptions {
            live: true,
            peer_to_peer: true,
            persist_dest: persistent,
            undefine_source: persistent,
            abort_on_error: true,
            post_copy: self.config.migration_allow_post_copy,
            bandwidth: (self.config.migration_max_bandwidth > 0)
                .then_some(self.config.migration_max_bandwidth),
            migrate_uri: Some(format!("tcp://{}", uri_host(destination)?)),
        })
    }

    fn apply_latest(&self, progress_rx: &watch::Receiver<Option<ProgressSnapshot>>) {
        let snapshot = progress_rx.borrow().clone();
        if let Some(snapshot) = snapshot {
            self.apply_snapshot(&snapshot);
        }
    }

    fn apply_snapshot(&self, snapshot: &ProgressSnapshot) {
        let entered_post_copy = {
            let mut job = self.job();
            job.record_progress(snapshot.percentage);
            snapshot.phase == MigrationPhase::PostCopy && job.enter_post_copy()
        };
        if entered_post_copy {
            self.on_post_copy();
        }
    }

    fn handle_event(&self, event: DomainEvent) {
        match event {
            DomainEvent::PostCopyStarted => {
                if self.job().enter_post_copy() {
                    self.on_post_copy();
                }
            }
            DomainEvent::PostCopyFailed => {
                log_error!(
                    "Post-copy migration of VM '{}' failed, guest left paused",
                    self.vm.name()
                );
            }
        }
    }

    fn on_post_copy(&self) {
        log_info!("Migration of VM '{}' switched to post-copy", self.vm.name());
        self.vm.set_post_copy(PostCopyPhase::Running);
    }

    fn finalize(&self, result: &Result<()>, previous_status: VmStatus) {
        let mut job = self.job();
        match result {
            Ok(()) => {
                job.record_progress(100);
                job.finish(MigrationStatus::Succeeded, None);
                log_info!(
                    "Migration {} of VM '{}' to {} succeeded after {} attempt(s)",
                    job.id,
                    self.vm.name(),
                    job.destination,
                    job.retry_attempts
                );
                self.vm.set_post_copy(PostCopyPhase::None);
                self.vm.set_down_status("Migration succeeded");
            }
            Err(e) => {
                let status = match e {
                    FerryError::Cancelled => MigrationStatus::Cancelled,
                    _ => MigrationStatus::Failed,
                };
                job.finish(status, Some(e.to_string()));
                log_error!(
                    "Migration {} of VM '{}' ended {:?} at {}% after {} attempt(s): {}",
                    job.id,
                    self.vm.name(),
                    status,
                    job.progress,
                    job.retry_attempts,
                    e
                );
                // Once post-copy ran, the guest's memory lives on both sides.
                if job.post_copy == PostCopyPhase::Running {
                    self.vm.set_status(VmStatus::Paused);
                } else {
                    self.vm.set_status(previous_status);
                }
            }
        }
    }
}

fn has_embedded_port(host: Option<&str>) -> bool {
    host.is_some_and(|host| matches!(split_host_port(host), Ok(Some(_))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> MigrationJob {
        MigrationJob::new(Vm::new("guest", 128, VmStatus::Up), 500, 10)
    }

    #[test]
    fn test_progress_starts_at_zero() {
        assert_eq!(job().progress(), 0);
    }

    #[test]
    fn test_progress_not_backwards() {
        let mut job = job();
        job.transition(MigrationStatus::Migrating).unwrap();

        let observed: Vec<u8> = [8, 15, 23, 85, 81]
            .into_iter()
            .map(|sample| job.record_progress(sample))
            .collect();
        assert_eq!(observed, vec![8, 15, 23, 85, 85]);
        assert_eq!(job.progress(), 85);
    }

    #[test]
    fn test_progress_frozen_when_terminal() {
        let mut job = job();
        job.record_progress(40);
        job.finish(MigrationStatus::Failed, Some("boom".to_string()));
        assert_eq!(job.record_progress(90), 40);
        assert_eq!(job.error(), Some("boom"));
        assert!(job.ended_at().is_some());
    }

    #[test]
    fn test_transitions_only_forward() {
        let mut job = job();
        job.transition(MigrationStatus::Migrating).unwrap();
        assert!(job.transition(MigrationStatus::Preparing).is_err());
        assert!(job.transition(MigrationStatus::Migrating).is_err());
        job.transition(MigrationStatus::PostCopy).unwrap();
        job.transition(MigrationStatus::Succeeded).unwrap();
        assert!(job.transition(MigrationStatus::Failed).is_err());
        assert_eq!(job.status(), MigrationStatus::Succeeded);
    }

    #[test]
    fn test_post_copy_set_once() {
        let mut job = job();
        job.transition(MigrationStatus::Migrating).unwrap();
        assert!(job.enter_post_copy());
        assert!(!job.enter_post_copy());
        assert_eq!(job.status(), MigrationStatus::PostCopy);
        assert_eq!(job.post_copy(), PostCopyPhase::Running);
    }

    #[test]
    fn test_embedded_port_detection() {
        assert!(has_embedded_port(Some("10.0.0.1:2222")));
        assert!(!has_embedded_port(Some("10.0.0.1")));
        assert!(!has_embedded_port(None));
    }
}
