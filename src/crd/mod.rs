//! Custom Resource Definitions for the director backup operator
//!
//! - BackupRequest: intent to save or restore a namespace
//! - Backup: the saved bundle a restore loads from

mod backup;
mod backup_request;

pub use backup::{Backup, BackupSpec, ConfigMapList, ObjectList, SecretList};
pub use backup_request::{
    operation_in_progress, BackupMode, BackupRequest, BackupRequestSpec, BackupRequestStatus,
    BackupState,
};
