//! Inventory collector
//!
//! Enumerates everything the backup saga manages in a namespace at one
//! instant. An inventory is rebuilt on every pass and never persisted.

use crate::backup::kinds::{ManagedKind, CONTROL_PLANE, MANAGED_KINDS, VM_SET};
use crate::backup::store::ResourceStore;
use crate::crd::{BackupSpec, ConfigMapList, ObjectList, SecretList};
use crate::error::Result;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use tracing::debug;

/// Managed objects, config maps and secrets present in a namespace.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Objects keyed by kind; kinds with no objects are absent
    pub resources: BTreeMap<&'static str, Vec<DynamicObject>>,
    pub config_maps: Vec<ConfigMap>,
    pub secrets: Vec<Secret>,
}

impl Inventory {
    /// List every managed kind plus the config maps and secrets matching `selector`.
    pub async fn collect(
        store: &dyn ResourceStore,
        namespace: &str,
        selector: &str,
    ) -> Result<Self> {
        let mut inventory = Inventory::default();

        for kind in MANAGED_KINDS {
            let objects = store.list_managed(namespace, kind).await?;
            if !objects.is_empty() {
                inventory.resources.insert(kind.kind, objects);
            }
        }
        inventory.config_maps = store.list_config_maps(namespace, selector).await?;
        inventory.secrets = store.list_secrets(namespace, selector).await?;

        debug!(
            namespace = %namespace,
            objects = inventory.object_count(),
            "Collected inventory"
        );
        Ok(inventory)
    }

    /// Objects of `kind` in the namespace.
    pub fn objects(&self, kind: &str) -> &[DynamicObject] {
        self.resources.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Managed kinds with at least one object, in table order.
    pub fn populated_kinds(
        &self,
    ) -> impl Iterator<Item = (&'static ManagedKind, &[DynamicObject])> + '_ {
        MANAGED_KINDS
            .iter()
            .filter_map(|kind| self.resources.get(kind.kind).map(|objs| (kind, objs.as_slice())))
    }

    pub fn object_count(&self) -> usize {
        self.resources.values().map(Vec::len).sum::<usize>()
            + self.config_maps.len()
            + self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_count() == 0
    }

    pub fn vm_sets(&self) -> &[DynamicObject] {
        self.objects(VM_SET)
    }

    /// The namespace's control plane, if one exists.
    pub fn control_plane(&self) -> Option<&DynamicObject> {
        self.objects(CONTROL_PLANE).first()
    }

    /// Bundle contents capturing this inventory.
    pub fn to_bundle_spec(&self, vm_snapshot_names: BTreeMap<String, String>) -> BackupSpec {
        let crs = self
            .resources
            .iter()
            .map(|(kind, items)| {
                (
                    kind.to_string(),
                    ObjectList {
                        items: items.clone(),
                    },
                )
            })
            .collect();

        BackupSpec {
            crs,
            config_maps: ConfigMapList {
                items: self.config_maps.clone(),
            },
            secrets: SecretList {
                items: self.secrets.clone(),
            },
            vm_snapshot_names,
        }
    }
}
