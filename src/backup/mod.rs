//! Backup saga building blocks
//!
//! Everything the BackupRequest controller composes: the managed kind table,
//! the cluster access seam, inventory collection, the quiesce check, the
//! namespace cleaner, the HA command executor and the VM orchestrator.

pub mod cleaner;
pub mod ha;
pub mod inventory;
pub mod kinds;
pub mod quiesce;
pub mod snapshot;
pub mod store;

#[cfg(test)]
pub(crate) mod fake;

pub use ha::{CommandRunner, ExecOutput, PodExecRunner};
pub use inventory::Inventory;
pub use kinds::{ManagedKind, MANAGED_KINDS};
pub use quiesce::{HoldUp, QuiesceReport};
pub use snapshot::{MarkerKind, VmOrchestrator};
pub use store::{KubeStore, ResourceStore};
