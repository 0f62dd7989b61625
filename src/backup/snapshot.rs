//! VM snapshot/restore orchestrator
//!
//! Drives disk snapshots (save) or disk restores (restore) of every VM-set
//! member, one VM per VM-set per pass. A VM is powered off (and fenced out of
//! its HA cluster where fencing applies) before its marker resource is
//! created, and powered back on and rejoined once the marker is ready. The
//! request status records each finished VM, so a pass only needs that map to
//! know what is left.

use crate::backup::ha::{cluster_action, ClusterAction, CommandRunner};
use crate::backup::store::ResourceStore;
use crate::config::BackupConfig;
use crate::error::{OperatorError, Result};
use ipnet::IpNet;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Run strategy that keeps a powered-on VM running.
pub const RUN_STRATEGY_RERUN_ON_FAILURE: &str = "RerunOnFailure";

/// Fencing only applies to HA clusters that keep quorum with one member out.
const MIN_FENCED_VM_COUNT: i64 = 3;

/// Snapshot-layer resource created per VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `VirtualMachineSnapshot`, ready once `status.readyToUse`
    Snapshot,
    /// `VirtualMachineRestore`, ready once `status.complete`
    Restore,
}

impl MarkerKind {
    pub fn kind(&self) -> &'static str {
        match self {
            MarkerKind::Snapshot => "VirtualMachineSnapshot",
            MarkerKind::Restore => "VirtualMachineRestore",
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: "snapshot.kubevirt.io".to_string(),
            version: "v1alpha1".to_string(),
            api_version: "snapshot.kubevirt.io/v1alpha1".to_string(),
            kind: self.kind().to_string(),
            plural: format!("{}s", self.kind().to_lowercase()),
        }
    }

    /// Whether `marker` is the one that saves or restores `snapshot_name`.
    fn matches(&self, marker: &DynamicObject, snapshot_name: &str) -> bool {
        match self {
            MarkerKind::Snapshot => marker.name_any() == snapshot_name,
            MarkerKind::Restore => {
                marker.data["spec"]["virtualMachineSnapshotName"].as_str() == Some(snapshot_name)
            }
        }
    }

    fn is_ready(&self, marker: &DynamicObject) -> bool {
        let field = match self {
            MarkerKind::Snapshot => "readyToUse",
            MarkerKind::Restore => "complete",
        };
        marker.data["status"][field].as_bool().unwrap_or(false)
    }
}

/// What a pass does to each VM.
#[derive(Debug, Clone, Copy)]
pub enum VmPassMode<'a> {
    /// Snapshot every VM of the namespace's VM-sets
    Save,
    /// Restore every VM of the bundle's VM-sets from the bundle's snapshot names
    Restore {
        bundle: &'a str,
        snapshot_names: &'a BTreeMap<String, String>,
    },
}

impl VmPassMode<'_> {
    fn marker_kind(&self) -> MarkerKind {
        match self {
            VmPassMode::Save => MarkerKind::Snapshot,
            VmPassMode::Restore { .. } => MarkerKind::Restore,
        }
    }
}

/// Identity of the request a pass runs for.
#[derive(Debug, Clone)]
pub struct VmPassRequest<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    /// `<requestName>-<requestCreationUnixSeconds>`
    pub marker: &'a str,
}

/// VM power and readiness, read from the VirtualMachine object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VmState {
    run_strategy: Option<String>,
    ready: bool,
}

impl VmState {
    fn from_object(vm: &DynamicObject) -> Self {
        Self {
            run_strategy: vm.data["spec"]["runStrategy"].as_str().map(str::to_string),
            ready: vm.data["status"]["ready"].as_bool().unwrap_or(false),
        }
    }

    fn kept_running(&self) -> bool {
        self.run_strategy.as_deref() == Some(RUN_STRATEGY_RERUN_ON_FAILURE)
    }
}

pub fn power_on_patch() -> Value {
    json!({"spec": {"running": null, "runStrategy": RUN_STRATEGY_RERUN_ON_FAILURE}})
}

pub fn power_off_patch() -> Value {
    json!({"spec": {"runStrategy": null, "running": false}})
}

/// Members of a VM-set, sorted by name.
pub fn vm_set_members(vm_set: &DynamicObject) -> Vec<String> {
    let mut members: Vec<String> = vm_set.data["status"]["vmHosts"]
        .as_object()
        .map(|hosts| hosts.keys().cloned().collect())
        .unwrap_or_default();
    members.sort();
    members
}

fn vm_count(vm_set: &DynamicObject) -> i64 {
    vm_set.data["spec"]["vmCount"].as_i64().unwrap_or(0)
}

/// Address of `vm` on `network`, taken from the VM-set's reported CIDR.
pub fn vm_address(vm_set: &DynamicObject, vm: &str, network: &str) -> Result<String> {
    let cidr = vm_set.data["status"]["vmHosts"][vm]["ipAddresses"][network]
        .as_str()
        .ok_or_else(|| {
            OperatorError::InvalidState(format!(
                "VM {} of VmSet {} has no address on network {}",
                vm,
                vm_set.name_any(),
                network
            ))
        })?;
    let net: IpNet = cidr.parse().map_err(|e| {
        OperatorError::InvalidState(format!("VM {} address {} is not a CIDR: {}", vm, cidr, e))
    })?;
    Ok(net.addr().to_string())
}

/// Drives VM snapshots and restores for one request.
pub struct VmOrchestrator<'a> {
    store: &'a dyn ResourceStore,
    runner: &'a dyn CommandRunner,
    config: &'a BackupConfig,
}

impl<'a> VmOrchestrator<'a> {
    pub fn new(
        store: &'a dyn ResourceStore,
        runner: &'a dyn CommandRunner,
        config: &'a BackupConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Run one pass over `vm_sets`.
    ///
    /// VMs finished during this pass are added to `recorded`. Returns the VMs
    /// still pending afterwards, across all VM-sets; the caller advances once a
    /// pass returns an empty list.
    pub async fn run_pass(
        &self,
        request: &VmPassRequest<'_>,
        mode: VmPassMode<'_>,
        vm_sets: &[DynamicObject],
        fencing_enabled: bool,
        recorded: &mut BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let marker_kind = mode.marker_kind();
        let markers = self
            .store
            .list_markers(
                request.namespace,
                marker_kind,
                &self.config.marker_selector(request.marker),
            )
            .await?;

        let mut all_pending = Vec::new();

        for vm_set in vm_sets {
            let mut pending: Vec<String> = vm_set_members(vm_set)
                .into_iter()
                .filter(|vm| !recorded.contains_key(vm))
                .collect();
            debug!(
                request = %request.name,
                vm_set = %vm_set.name_any(),
                pending = pending.len(),
                "Processing VmSet"
            );

            // One VM at a time; move to the next only once this one is recorded
            while let Some(vm) = pending.first().cloned() {
                let snapshot_name = match mode {
                    VmPassMode::Save => format!("{}-{}", vm, request.marker),
                    VmPassMode::Restore {
                        bundle,
                        snapshot_names,
                    } => snapshot_names.get(&vm).cloned().ok_or_else(|| {
                        OperatorError::InvalidState(format!(
                            "no snapshot for VM {} in Backup {} (BackupRequest {})",
                            vm, bundle, request.name
                        ))
                    })?,
                };

                let fenced = fencing_enabled && vm_count(vm_set) >= MIN_FENCED_VM_COUNT;
                let address = if fenced {
                    Some(vm_address(vm_set, &vm, &self.config.ha_network)?)
                } else {
                    None
                };

                let done = match markers.iter().find(|m| marker_kind.matches(m, &snapshot_name)) {
                    Some(marker) => {
                        let ready = marker_kind.is_ready(marker);
                        self.finish_vm(request, &vm, ready, address.as_deref())
                            .await?
                    }
                    None => {
                        self.start_vm(request, mode, &vm, &snapshot_name, address.as_deref())
                            .await?;
                        false
                    }
                };

                if !done {
                    break;
                }
                info!(request = %request.name, "VM {} recorded as {}", vm, snapshot_name);
                recorded.insert(vm, snapshot_name);
                pending.remove(0);

                // A rejoin is this VM-set's disruptive step for the pass;
                // the HA cluster settles before the next member is fenced
                if address.is_some() {
                    break;
                }
            }

            all_pending.extend(pending);
        }

        Ok(all_pending)
    }

    /// The marker exists: bring the VM back once it is ready.
    ///
    /// Returns `true` when the VM is running, ready and back in its HA cluster.
    async fn finish_vm(
        &self,
        request: &VmPassRequest<'_>,
        vm: &str,
        marker_ready: bool,
        ha_address: Option<&str>,
    ) -> Result<bool> {
        if !marker_ready {
            debug!("Marker for VM {} not ready yet", vm);
            return Ok(false);
        }

        let Some(state) = self.vm_state(request.namespace, vm).await? else {
            return Ok(false);
        };

        if !state.kept_running() {
            self.store
                .patch_vm(request.namespace, vm, &power_on_patch())
                .await?;
            info!(request = %request.name, "Power-on request for VM {} accepted", vm);
            return Ok(false);
        }

        if !state.ready {
            return Ok(false);
        }

        match ha_address {
            Some(address) => {
                cluster_action(
                    self.runner,
                    self.config,
                    request.namespace,
                    address,
                    ClusterAction::Start,
                    vm,
                )
                .await
            }
            None => Ok(true),
        }
    }

    /// No marker yet: fence, power off, then create the marker.
    async fn start_vm(
        &self,
        request: &VmPassRequest<'_>,
        mode: VmPassMode<'_>,
        vm: &str,
        snapshot_name: &str,
        ha_address: Option<&str>,
    ) -> Result<()> {
        if let Some(address) = ha_address {
            let stopped = cluster_action(
                self.runner,
                self.config,
                request.namespace,
                address,
                ClusterAction::Stop,
                vm,
            )
            .await?;
            if !stopped {
                return Ok(());
            }
        }

        let Some(state) = self.vm_state(request.namespace, vm).await? else {
            return Ok(());
        };

        if state.ready {
            self.store
                .patch_vm(request.namespace, vm, &power_off_patch())
                .await?;
            info!(request = %request.name, "Shutdown request for VM {} accepted", vm);
        }

        let marker = self.build_marker(request, mode, vm, snapshot_name)?;
        match self
            .store
            .create_marker(request.namespace, mode.marker_kind(), &marker)
            .await
        {
            Ok(()) => {
                info!(
                    request = %request.name,
                    "Created {} {}",
                    mode.marker_kind().kind(),
                    marker.name_any()
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("{} {} already exists", mode.marker_kind().kind(), marker.name_any());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Power state of `vm`, `None` while the VM does not exist (a restore may
    /// still be recreating it).
    async fn vm_state(&self, namespace: &str, vm: &str) -> Result<Option<VmState>> {
        let state = self
            .store
            .get_vm(namespace, vm)
            .await?
            .map(|obj| VmState::from_object(&obj));
        if state.is_none() {
            debug!("VM {} not found, retrying next pass", vm);
        }
        Ok(state)
    }

    fn build_marker(
        &self,
        request: &VmPassRequest<'_>,
        mode: VmPassMode<'_>,
        vm: &str,
        snapshot_name: &str,
    ) -> Result<DynamicObject> {
        let vm_ref = json!({
            "apiGroup": "kubevirt.io",
            "kind": "VirtualMachine",
            "name": vm,
        });
        let (name, spec) = match mode {
            VmPassMode::Save => (snapshot_name.to_string(), json!({ "source": vm_ref })),
            VmPassMode::Restore { .. } => (
                format!("{}-{}", vm, request.marker),
                json!({
                    "target": vm_ref,
                    "virtualMachineSnapshotName": snapshot_name,
                }),
            ),
        };
        let ar = mode.marker_kind().api_resource();

        let data = json!({
            "apiVersion": ar.api_version,
            "kind": ar.kind,
            "metadata": {
                "name": name,
                "namespace": request.namespace,
                "labels": {
                    &self.config.marker_label: request.marker,
                    &self.config.request_label: request.name,
                },
            },
            "spec": spec,
        });
        Ok(serde_json::from_value(data)?)
    }
}
