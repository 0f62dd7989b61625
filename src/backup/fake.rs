//! In-memory store and scripted command runner for tests

use crate::backup::ha::{CommandRunner, ExecOutput};
use crate::backup::kinds::ManagedKind;
use crate::backup::snapshot::MarkerKind;
use crate::backup::store::ResourceStore;
use crate::crd::{Backup, BackupRequest};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// `k=v[,k=v]` against a label map.
fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[derive(Default)]
struct State {
    managed: BTreeMap<(String, String, String), DynamicObject>,
    config_maps: BTreeMap<Key, ConfigMap>,
    secrets: BTreeMap<Key, Secret>,
    backups: BTreeMap<Key, Backup>,
    requests: BTreeMap<Key, BackupRequest>,
    vms: BTreeMap<Key, DynamicObject>,
    vm_patches: Vec<(String, String, Value)>,
    markers: BTreeMap<(String, &'static str, String), DynamicObject>,
    applied: Vec<(String, String)>,
    deletes: usize,
    conflicting_deletes: BTreeSet<String>,
    conflicting_status_writes: usize,
    failing_lists: usize,
    status_writes: usize,
}

/// [`ResourceStore`] over in-memory maps.
///
/// VM patches are recorded, not applied.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn insert_managed(&self, namespace: &str, mut obj: DynamicObject) {
        let kind = obj.types.as_ref().unwrap().kind.clone();
        obj.metadata.namespace = Some(namespace.to_string());
        self.with(|s| {
            s.managed
                .insert((namespace.to_string(), kind, obj.name_any()), obj)
        });
    }

    pub fn remove_managed(&self, namespace: &str, kind: &str, name: &str) {
        self.with(|s| {
            s.managed
                .remove(&(namespace.to_string(), kind.to_string(), name.to_string()))
        });
    }

    pub fn managed(&self, namespace: &str, kind: &str, name: &str) -> Option<DynamicObject> {
        self.with(|s| {
            s.managed
                .get(&(namespace.to_string(), kind.to_string(), name.to_string()))
                .cloned()
        })
    }

    /// Set the reported state of every object in `namespace`.
    pub fn finish_all(&self, namespace: &str) {
        self.with(|s| {
            for ((ns, kind, _), obj) in s.managed.iter_mut() {
                if ns != namespace {
                    continue;
                }
                let Some(managed) = crate::backup::kinds::by_kind(kind) else {
                    continue;
                };
                let Some(state) = managed.finished.first() else {
                    continue;
                };
                obj.data["status"] = managed_status(kind, state);
            }
        });
    }

    pub fn insert_config_map(&self, namespace: &str, name: &str) {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm.metadata.namespace = Some(namespace.to_string());
        self.with(|s| s.config_maps.insert(key(namespace, name), cm));
    }

    pub fn insert_secret(&self, namespace: &str, name: &str) {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.metadata.namespace = Some(namespace.to_string());
        self.with(|s| s.secrets.insert(key(namespace, name), secret));
    }

    pub fn insert_backup(&self, namespace: &str, backup: Backup) {
        self.with(|s| s.backups.insert(key(namespace, &backup.name_any()), backup));
    }

    pub fn backups(&self, namespace: &str) -> Vec<Backup> {
        self.with(|s| {
            s.backups
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, b)| b.clone())
                .collect()
        })
    }

    pub fn insert_request(&self, mut request: BackupRequest) -> BackupRequest {
        request.metadata.resource_version = Some("1".to_string());
        let k = key(&request.namespace().unwrap(), &request.name_any());
        self.with(|s| s.requests.insert(k, request.clone()));
        request
    }

    pub fn request(&self, namespace: &str, name: &str) -> Option<BackupRequest> {
        self.with(|s| s.requests.get(&key(namespace, name)).cloned())
    }

    pub fn insert_vm(&self, namespace: &str, vm: DynamicObject) {
        self.with(|s| s.vms.insert(key(namespace, &vm.name_any()), vm));
    }

    pub fn vm_patches(&self, namespace: &str) -> Vec<(String, Value)> {
        self.with(|s| {
            s.vm_patches
                .iter()
                .filter(|(ns, _, _)| ns == namespace)
                .map(|(_, name, patch)| (name.clone(), patch.clone()))
                .collect()
        })
    }

    pub fn marker_names(&self, namespace: &str, kind: MarkerKind) -> Vec<String> {
        self.with(|s| {
            s.markers
                .keys()
                .filter(|(ns, k, _)| ns == namespace && *k == kind.kind())
                .map(|(_, _, name)| name.clone())
                .collect()
        })
    }

    pub fn marker(&self, namespace: &str, kind: MarkerKind, name: &str) -> Option<DynamicObject> {
        self.with(|s| {
            s.markers
                .get(&(namespace.to_string(), kind.kind(), name.to_string()))
                .cloned()
        })
    }

    pub fn set_marker_ready(&self, namespace: &str, kind: MarkerKind, name: &str) {
        let field = match kind {
            MarkerKind::Snapshot => "readyToUse",
            MarkerKind::Restore => "complete",
        };
        self.with(|s| {
            if let Some(marker) = s
                .markers
                .get_mut(&(namespace.to_string(), kind.kind(), name.to_string()))
            {
                marker.data["status"] = json!({ field: true });
            }
        });
    }

    /// Kind and name of every object applied, in order.
    pub fn applied(&self) -> Vec<(String, String)> {
        self.with(|s| s.applied.clone())
    }

    pub fn delete_count(&self) -> usize {
        self.with(|s| s.deletes)
    }

    pub fn status_writes(&self) -> usize {
        self.with(|s| s.status_writes)
    }

    /// Deletes of objects named `name` fail with a conflict.
    pub fn fail_deletes_with_conflict(&self, name: &str) {
        self.with(|s| s.conflicting_deletes.insert(name.to_string()));
    }

    /// The next `count` request status writes fail with a conflict.
    pub fn fail_status_writes_with_conflict(&self, count: usize) {
        self.with(|s| s.conflicting_status_writes = count);
    }

    /// The next `count` managed-kind lists fail like an unavailable API server.
    pub fn fail_lists_with_api_error(&self, count: usize) {
        self.with(|s| s.failing_lists = count);
    }

    fn delete(&self, name: &str, remove: impl FnOnce(&mut State) -> bool) -> Result<()> {
        self.with(|s| {
            s.deletes += 1;
            if s.conflicting_deletes.contains(name) {
                return Err(OperatorError::Conflict(format!("{} is being modified", name)));
            }
            if remove(s) {
                Ok(())
            } else {
                Err(OperatorError::NotFound(name.to_string()))
            }
        })
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn list_managed(
        &self,
        namespace: &str,
        kind: &ManagedKind,
    ) -> Result<Vec<DynamicObject>> {
        self.with(|s| {
            if s.failing_lists > 0 {
                s.failing_lists -= 1;
                return Err(OperatorError::KubeApi(
                    "ApiError: service unavailable (503)".to_string(),
                ));
            }
            Ok(s.managed
                .iter()
                .filter(|((ns, k, _), _)| ns == namespace && k == kind.kind)
                .map(|(_, obj)| obj.clone())
                .collect())
        })
    }

    async fn apply_managed(
        &self,
        namespace: &str,
        kind: &ManagedKind,
        obj: &DynamicObject,
    ) -> Result<()> {
        let name = obj.name_any();
        self.with(|s| {
            let k = (namespace.to_string(), kind.kind.to_string(), name.clone());
            let mut stored = obj.clone();
            if let Some(existing) = s.managed.get(&k) {
                if let Some(status) = existing.data.get("status") {
                    stored.data["status"] = status.clone();
                }
            }
            s.managed.insert(k, stored);
            s.applied.push((kind.kind.to_string(), name));
        });
        Ok(())
    }

    async fn patch_managed_status(
        &self,
        namespace: &str,
        kind: &ManagedKind,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        self.with(|s| {
            let k = (namespace.to_string(), kind.kind.to_string(), name.to_string());
            let obj = s
                .managed
                .get_mut(&k)
                .ok_or_else(|| OperatorError::NotFound(name.to_string()))?;
            obj.data["status"] = status["status"].clone();
            Ok(())
        })
    }

    async fn delete_managed(&self, namespace: &str, kind: &ManagedKind, name: &str) -> Result<()> {
        let k = (namespace.to_string(), kind.kind.to_string(), name.to_string());
        self.delete(name, |s| s.managed.remove(&k).is_some())
    }

    async fn list_config_maps(&self, namespace: &str, _selector: &str) -> Result<Vec<ConfigMap>> {
        Ok(self.with(|s| {
            s.config_maps
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, cm)| cm.clone())
                .collect()
        }))
    }

    async fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let name = config_map.name_any();
        self.with(|s| {
            s.config_maps.insert(key(namespace, &name), config_map.clone());
            s.applied.push(("ConfigMap".to_string(), name));
        });
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let k = key(namespace, name);
        self.delete(name, |s| s.config_maps.remove(&k).is_some())
    }

    async fn list_secrets(&self, namespace: &str, _selector: &str) -> Result<Vec<Secret>> {
        Ok(self.with(|s| {
            s.secrets
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, secret)| secret.clone())
                .collect()
        }))
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let name = secret.name_any();
        self.with(|s| {
            s.secrets.insert(key(namespace, &name), secret.clone());
            s.applied.push(("Secret".to_string(), name));
        });
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let k = key(namespace, name);
        self.delete(name, |s| s.secrets.remove(&k).is_some())
    }

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>> {
        Ok(self.with(|s| s.backups.get(&key(namespace, name)).cloned()))
    }

    async fn find_backup(&self, namespace: &str, selector: &str) -> Result<Option<Backup>> {
        Ok(self.with(|s| {
            s.backups
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, b)| b)
                .find(|b| matches_selector(b.labels(), selector))
                .cloned()
        }))
    }

    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<()> {
        self.with(|s| {
            let k = key(namespace, &backup.name_any());
            if s.backups.contains_key(&k) {
                return Err(OperatorError::Conflict(format!("{} already exists", k.1)));
            }
            s.backups.insert(k, backup.clone());
            Ok(())
        })
    }

    async fn update_request_status(&self, request: &BackupRequest) -> Result<BackupRequest> {
        self.with(|s| {
            if s.conflicting_status_writes > 0 {
                s.conflicting_status_writes -= 1;
                return Err(OperatorError::Conflict("request was modified".to_string()));
            }
            let k = key(&request.namespace().unwrap_or_default(), &request.name_any());
            let stored = s
                .requests
                .get_mut(&k)
                .ok_or_else(|| OperatorError::NotFound(k.1.clone()))?;
            if stored.metadata.resource_version != request.metadata.resource_version {
                return Err(OperatorError::Conflict("stale resourceVersion".to_string()));
            }

            let version: u64 = stored
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            stored.status = request.status.clone();
            stored.metadata.resource_version = Some((version + 1).to_string());
            s.status_writes += 1;
            Ok(stored.clone())
        })
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.with(|s| s.vms.get(&key(namespace, name)).cloned()))
    }

    async fn patch_vm(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.with(|s| {
            s.vm_patches
                .push((namespace.to_string(), name.to_string(), patch.clone()))
        });
        Ok(())
    }

    async fn list_markers(
        &self,
        namespace: &str,
        kind: MarkerKind,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        Ok(self.with(|s| {
            s.markers
                .iter()
                .filter(|((ns, k, _), m)| {
                    ns == namespace && *k == kind.kind() && matches_selector(m.labels(), selector)
                })
                .map(|(_, m)| m.clone())
                .collect()
        }))
    }

    async fn create_marker(
        &self,
        namespace: &str,
        kind: MarkerKind,
        marker: &DynamicObject,
    ) -> Result<()> {
        self.with(|s| {
            let k = (namespace.to_string(), kind.kind(), marker.name_any());
            if s.markers.contains_key(&k) {
                return Err(OperatorError::Conflict(format!("{} already exists", k.2)));
            }
            s.markers.insert(k, marker.clone());
            Ok(())
        })
    }
}

/// [`CommandRunner`] replaying queued outputs; succeeds once the queue is empty.
#[derive(Default)]
pub struct ScriptedRunner {
    outputs: Mutex<VecDeque<ExecOutput>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn push(&self, output: ExecOutput) {
        self.outputs.lock().unwrap().push_back(output);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run_in_admin_pod(&self, _namespace: &str, command: &str) -> Result<ExecOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        let next = self.outputs.lock().unwrap().pop_front();
        Ok(next.unwrap_or(ExecOutput {
            success: true,
            ..Default::default()
        }))
    }
}

/// Status body reporting `state` in the location `kind` uses.
pub fn managed_status(kind: &str, state: &str) -> Value {
    match crate::backup::kinds::by_kind(kind).map(|k| k.state_location) {
        Some(crate::backup::kinds::StateLocation::CurrentState) => json!({"currentState": state}),
        Some(crate::backup::kinds::StateLocation::ProvisioningStatus) => {
            json!({"provisioningStatus": {"state": state}})
        }
        _ => json!({}),
    }
}

pub fn managed_object(kind: &str, name: &str, status: Value) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "director.infra.io/v1beta1",
        "kind": kind,
        "metadata": {"name": name},
        "spec": {"owner": name, "settings": {"a": 1, "b": [true, null]}},
        "status": status,
    }))
    .unwrap()
}

/// VM-set whose members get consecutive ctlplane addresses from 192.168.24.10.
pub fn vm_set_object(name: &str, vm_count: i64, members: &[&str]) -> DynamicObject {
    let hosts: serde_json::Map<String, Value> = members
        .iter()
        .enumerate()
        .map(|(i, vm)| {
            (
                vm.to_string(),
                json!({"ipAddresses": {"ctlplane": format!("192.168.24.{}/24", 10 + i)}}),
            )
        })
        .collect();
    serde_json::from_value(json!({
        "apiVersion": "director.infra.io/v1beta1",
        "kind": "VmSet",
        "metadata": {"name": name},
        "spec": {"vmCount": vm_count},
        "status": {
            "provisioningStatus": {"state": "Provisioned"},
            "vmHosts": hosts,
        },
    }))
    .unwrap()
}

pub fn vm_object(name: &str, run_strategy: Option<&str>, ready: bool) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "kubevirt.io/v1",
        "kind": "VirtualMachine",
        "metadata": {"name": name},
        "spec": {"runStrategy": run_strategy},
        "status": {"ready": ready},
    }))
    .unwrap()
}
