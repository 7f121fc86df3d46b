//! The seam between the migration core and whatever actually drives the
//! guest: libvirt, a remote daemon, or a test double.
//!
//! Job stats use libvirt's typed-parameter names so a driver can forward
//! what the hypervisor reports without renaming anything.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw counters as reported by the hypervisor for the current job.
pub type JobStats = HashMap<String, u64>;

pub mod stat {
    pub const TYPE: &str = "type";
    pub const TIME_ELAPSED: &str = "time_elapsed";
    pub const DATA_TOTAL: &str = "data_total";
    pub const DATA_PROCESSED: &str = "data_processed";
    pub const DATA_REMAINING: &str = "data_remaining";
    pub const MEMORY_TOTAL: &str = "memory_total";
    pub const MEMORY_PROCESSED: &str = "memory_processed";
    pub const MEMORY_REMAINING: &str = "memory_remaining";
    pub const MEMORY_BPS: &str = "memory_bps";
    pub const MEMORY_CONSTANT: &str = "memory_constant";
    pub const COMPRESSION_BYTES: &str = "compression_bytes";
    pub const MEMORY_DIRTY_RATE: &str = "memory_dirty_rate";
    pub const MEMORY_ITERATION: &str = "memory_iteration";
    pub const OPERATION: &str = "operation";
    pub const MEMORY_POSTCOPY_REQUESTS: &str = "memory_postcopy_requests";

    pub const REQUIRED: [&str; 8] = [
        TYPE,
        TIME_ELAPSED,
        DATA_TOTAL,
        DATA_PROCESSED,
        DATA_REMAINING,
        MEMORY_TOTAL,
        MEMORY_PROCESSED,
        MEMORY_REMAINING,
    ];
}

/// libvirt's `virDomainJobType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    None,
    Bounded,
    Unbounded,
    Completed,
    Failed,
    Cancelled,
}

impl JobType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(JobType::None),
            1 => Some(JobType::Bounded),
            2 => Some(JobType::Unbounded),
            3 => Some(JobType::Completed),
            4 => Some(JobType::Failed),
            5 => Some(JobType::Cancelled),
            _ => None,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            JobType::None => 0,
            JobType::Bounded => 1,
            JobType::Unbounded => 2,
            JobType::Completed => 3,
            JobType::Failed => 4,
            JobType::Cancelled => 5,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobType::Bounded | JobType::Unbounded)
    }
}

/// Outcome classes of the remote "create migration" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateStatus {
    Success,
    /// Destination is already running as many incoming migrations as it allows.
    LimitExceeded,
    Error(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResponse {
    pub status: CreateStatus,
    pub message: String,
}

impl CreateResponse {
    pub fn success() -> Self {
        Self {
            status: CreateStatus::Success,
            message: "Done".to_string(),
        }
    }

    pub fn limit_exceeded() -> Self {
        Self {
            status: CreateStatus::LimitExceeded,
            message: "Migration limit exceeded".to_string(),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            status: CreateStatus::Error(code),
            message: message.into(),
        }
    }
}

/// What the destination needs to know to prepare for the incoming guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationParams {
    pub vm_id: String,
    pub vm_name: String,
    /// Destination as supplied by the caller, possibly without a port.
    pub dst: Option<String>,
    /// Kept loosely typed: it arrives from the JSON API unvalidated.
    #[serde(default)]
    pub dst_port: Option<serde_json::Value>,
    #[serde(default)]
    pub mem_size_mb: u64,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Flags and tunables for the hypervisor-side transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrateOptions {
    pub live: bool,
    pub peer_to_peer: bool,
    pub persist_dest: bool,
    pub undefine_source: bool,
    pub abort_on_error: bool,
    pub post_copy: bool,
    /// MiB/s, `None` leaves the hypervisor default.
    pub bandwidth: Option<u64>,
    /// Data channel URI, when it differs from the control connection.
    pub migrate_uri: Option<String>,
}

/// Lifecycle notifications the hypervisor pushes while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    PostCopyStarted,
    PostCopyFailed,
}

/// Every call must be safe to issue concurrently from several tasks.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Ask the destination to prepare for an incoming migration.
    async fn start_migration(
        &self,
        params: &MigrationParams,
        downtime_limit: u64,
    ) -> Result<CreateResponse>;

    async fn set_max_downtime(&self, downtime_ms: u64) -> Result<()>;

    async fn get_job_stats(&self) -> Result<JobStats>;

    /// Runs the transfer; returns once the hypervisor considers it finished.
    async fn migrate_to_destination(&self, uri: &str, options: &MigrateOptions) -> Result<()>;

    async fn is_persistent(&self) -> Result<bool>;

    async fn abort_job(&self) -> Result<()>;
}
