use crate::hypervisor::MigrationParams;
use crate::{FerryError, Result, log_debug, log_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStatus {
    WaitForLaunch,
    PoweringUp,
    Up,
    Paused,
    MigrationSource,
    MigrationDestination,
    PoweringDown,
    Down,
}

impl VmStatus {
    pub fn is_migratable(self) -> bool {
        !matches!(self, VmStatus::WaitForLaunch | VmStatus::Down)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PostCopyPhase {
    #[default]
    None,
    Running,
}

/// What the daemon's query surface shows for a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStats {
    pub vm_id: Uuid,
    pub name: String,
    pub status: VmStatus,
    pub exit_reason: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug)]
struct VmState {
    status: VmStatus,
    post_copy: PostCopyPhase,
    migration_params: Option<MigrationParams>,
    exit_reason: Option<String>,
    last_updated: DateTime<Utc>,
}

/// The daemon's record of one guest. Shared between the VM's own lifecycle
/// owner and any migration in flight for it.
#[derive(Debug)]
pub struct Vm {
    id: Uuid,
    name: String,
    mem_size_mb: u64,
    state: Mutex<VmState>,
}

impl Vm {
    pub fn new(name: impl Into<String>, mem_size_mb: u64, status: VmStatus) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            mem_size_mb,
            state: Mutex::new(VmState {
                status,
                post_copy: PostCopyPhase::None,
                migration_params: None,
                exit_reason: None,
                last_updated: Utc::now(),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mem_size_mb(&self) -> u64 {
        self.mem_size_mb
    }

    // The record only holds plain values, so a poisoned lock is still usable.
    fn state(&self) -> MutexGuard<'_, VmState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> VmStatus {
        self.state().status
    }

    pub fn set_status(&self, status: VmStatus) {
        let mut state = self.state();
        log_debug!("VM '{}' status {:?} -> {:?}", self.name, state.status, status);
        state.status = status;
        state.last_updated = Utc::now();
    }

    pub fn set_down_status(&self, reason: impl Into<String>) {
        let mut state = self.state();
        state.status = VmStatus::Down;
        state.exit_reason = Some(reason.into());
        state.last_updated = Utc::now();
    }

    pub fn post_copy(&self) -> PostCopyPhase {
        self.state().post_copy
    }

    pub fn set_post_copy(&self, phase: PostCopyPhase) {
        let mut state = self.state();
        state.post_copy = phase;
        state.last_updated = Utc::now();
    }

    /// Externally reported stats. Once post-copy is running the source can
    /// no longer serve guest memory, so the guest is reported paused.
    pub fn get_stats(&self) -> VmStats {
        let state = self.state();
        let status = match (state.status, state.post_copy) {
            (VmStatus::MigrationSource, PostCopyPhase::Running) => VmStatus::Paused,
            (status, _) => status,
        };
        VmStats {
            vm_id: self.id,
            name: self.name.clone(),
            status,
            exit_reason: state.exit_reason.clone(),
            last_updated: state.last_updated,
        }
    }

    pub fn migration_params(&self) -> Option<MigrationParams> {
        self.state().migration_params.clone()
    }

    /// Stash `params` on the VM for as long as the returned guard lives.
    pub fn migration_parameters(self: &Arc<Self>, params: MigrationParams) -> MigrationParamsGuard {
        self.state().migration_params = Some(params);
        MigrationParamsGuard {
            vm: Arc::clone(self),
            released: false,
        }
    }
}

/// Scope of the migration parameters stored on a [`Vm`].
#[must_use = "dropping the guard immediately clears the migration parameters"]
pub struct MigrationParamsGuard {
    vm: Arc<Vm>,
    released: bool,
}

impl MigrationParamsGuard {
    /// Clear the parameters, reporting if someone else already did.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match self.vm.state().migration_params.take() {
            Some(_) => Ok(()),
            None => Err(FerryError::ConfigError(format!(
                "migration parameters of VM '{}' were already cleared",
                self.vm.name
            ))),
        }
    }
}

impl Drop for MigrationParamsGuard {
    fn drop(&mut self) {
        if !self.released && self.vm.state().migration_params.take().is_none() {
            log_warn!(
                "Migration parameters of VM '{}' were already cleared",
                self.vm.name
            );
        }
    }
}
