pub mod assessment;
pub mod command;
pub mod config;
pub mod copy;
pub mod device;
pub mod error;
pub mod lock;
pub mod model;
pub mod monitor;
pub mod persistence;
pub mod progress;
pub mod report;
pub mod safety;
pub mod store;
pub mod test_utils;
pub mod verify;
pub mod workflow;

pub use command::{CommandOutput, CommandRunner};
pub use config::MigrationConfig;
pub use copy::{CopyRequest, CopyTool, RsyncCopyTool};
pub use device::{DriveDiscovery, DriveHealth, DriveInfo, DriveRole};
pub use error::{ErrorKind, FerryError};
pub use model::{MigrationAssessment, MigrationMetadata, MigrationRecord, MigrationStatus};
pub use monitor::{FreeSpace, HealthReport, HealthStatus, ProgressSnapshot, SpaceProbe};
pub use report::{MigrationReport, MigrationStatistics};
pub use safety::{FormatApproval, FormatGuard};
pub use workflow::MigrationManager;
