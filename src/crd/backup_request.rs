//! BackupRequest CRD
//!
//! The intent object that drives one save or restore of a whole namespace.

use crate::conditions::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Spec for a BackupRequest resource
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "director.infra.io",
    version = "v1beta1",
    kind = "BackupRequest",
    namespaced,
    status = "BackupRequestStatus",
    shortname = "backupreq",
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Restore Source","type":"string","jsonPath":".spec.restoreSource"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.currentState"}"#,
    printcolumn = r#"{"name":"Completed","type":"date","jsonPath":".status.completionTimestamp"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequestSpec {
    /// Whether to save a new bundle or restore an existing one
    #[serde(default)]
    pub mode: BackupMode,

    /// Snapshot (save) or restore (restore modes) the disks of every VM-set member
    #[serde(default, rename = "includeVMImages")]
    pub include_vm_images: bool,

    /// Name of the Backup bundle to restore from (restore modes only)
    #[serde(default)]
    pub restore_source: Option<String>,
}

/// Operation requested by a BackupRequest
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum BackupMode {
    /// Capture the namespace into a new Backup bundle
    #[default]
    Save,
    /// Load a bundle over whatever is in the namespace
    Restore,
    /// Delete everything managed in the namespace, then load a bundle
    CleanRestore,
}

impl BackupMode {
    pub fn is_restore(&self) -> bool {
        matches!(self, BackupMode::Restore | BackupMode::CleanRestore)
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupMode::Save => "save",
            BackupMode::Restore => "restore",
            BackupMode::CleanRestore => "cleanRestore",
        };
        f.write_str(s)
    }
}

/// States of the backup saga
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum BackupState {
    /// Nothing has happened yet
    #[default]
    Empty,
    Quiescing,
    Saving,
    Saved,
    SaveError,
    Cleaning,
    Loading,
    Reconciling,
    Restored,
    RestoreError,
}

impl BackupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupState::Empty => "Empty",
            BackupState::Quiescing => "Quiescing",
            BackupState::Saving => "Saving",
            BackupState::Saved => "Saved",
            BackupState::SaveError => "SaveError",
            BackupState::Cleaning => "Cleaning",
            BackupState::Loading => "Loading",
            BackupState::Reconciling => "Reconciling",
            BackupState::Restored => "Restored",
            BackupState::RestoreError => "RestoreError",
        }
    }

    /// Terminal states receive no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupState::Saved
                | BackupState::SaveError
                | BackupState::Restored
                | BackupState::RestoreError
        )
    }

    /// The error state a request in `mode` falls into on a fatal error.
    pub fn error_for(mode: BackupMode) -> Self {
        if mode.is_restore() {
            BackupState::RestoreError
        } else {
            BackupState::SaveError
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a BackupRequest resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequestStatus {
    /// Current saga state
    #[serde(default)]
    pub current_state: BackupState,

    /// VM name to the snapshot name that was saved or restored for it
    #[serde(default, rename = "vmSnapshotNames")]
    pub vm_snapshot_names: BTreeMap<String, String>,

    /// When the request reached Saved or Restored
    #[serde(default)]
    pub completion_timestamp: Option<String>,

    /// Conditions; exactly one is "True" once the request has started
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl BackupRequest {
    /// Persisted state, `Empty` for a request that was never reconciled.
    pub fn state(&self) -> BackupState {
        self.status
            .as_ref()
            .map(|s| s.current_state)
            .unwrap_or_default()
    }

    /// Marker scoping the snapshot/restore resources created for this request.
    ///
    /// Built from the name and creation time so a re-created request with the
    /// same name never adopts an older request's markers.
    pub fn snapshot_marker(&self) -> Option<String> {
        let created = self.metadata.creation_timestamp.as_ref()?;
        let name = self.metadata.name.as_ref()?;
        Some(format!("{}-{}", name, created.0.timestamp()))
    }
}

impl BackupRequestSpec {
    /// Static checks on a request; restore modes must name their bundle.
    pub fn validate(&self) -> Result<(), String> {
        if self.mode.is_restore() && self.restore_source.as_deref().unwrap_or("").is_empty() {
            return Err(format!("mode {} requires restoreSource", self.mode));
        }
        Ok(())
    }
}

/// First non-terminal state among `requests`, if any.
///
/// Admission checks use this to refuse a second active request in a namespace.
pub fn operation_in_progress(requests: &[BackupRequest]) -> Option<BackupState> {
    requests
        .iter()
        .map(BackupRequest::state)
        .find(|state| *state != BackupState::Empty && !state.is_terminal())
}
