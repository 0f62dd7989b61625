//! Director Backup Operator
//!
//! A Kubernetes operator that saves and restores a namespace of
//! director-managed infrastructure: networks, bare-metal and VM sets, the
//! control plane, and the disks of every VM.
//!
//! ## Custom Resources
//!
//! - `BackupRequest`: Asks for a save, restore or clean restore of its namespace
//! - `Backup`: Bundle holding the saved objects and VM snapshot names
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: director.infra.io/v1beta1
//! kind: BackupRequest
//! metadata:
//!   name: nightly
//! spec:
//!   mode: save
//!   includeVMImages: true
//! ```

pub mod backup;
pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;

pub use config::BackupConfig;
pub use controllers::{BackupRequestController, Controller, Saga};
pub use crd::{
    operation_in_progress, Backup, BackupMode, BackupRequest, BackupRequestSpec,
    BackupRequestStatus, BackupSpec, BackupState,
};
pub use error::{OperatorError, Result};
