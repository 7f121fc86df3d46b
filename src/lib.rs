pub mod address;
pub mod config;
pub mod downtime;
pub mod error;
pub mod hypervisor;
pub mod logger;
pub mod migration;
pub mod progress;
pub mod retry;
pub mod virsh;
pub mod vm;

pub use error::FerryError;
pub use migration::{MigrationCoordinator, MigrationJob, MigrationStat, MigrationStatus};
pub use vm::{PostCopyPhase, Vm, VmStatus};

pub type Result<T> = std::result::Result<T, FerryError>;

// Convenience re-exports for driver implementations
pub use hypervisor::{CreateResponse, CreateStatus, DomainEvent, Hypervisor, JobStats, JobType};
pub use progress::{Progress, ProgressSnapshot, ongoing};
