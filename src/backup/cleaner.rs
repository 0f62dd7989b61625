//! Namespace cleaner
//!
//! Used only by destructive restore: deletes everything the inventory holds
//! and reports clean once a pass finds nothing left.

use crate::backup::inventory::Inventory;
use crate::backup::kinds::by_kind;
use crate::backup::store::ResourceStore;
use crate::error::{OperatorError, Result};
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// A missing object counts as deleted; a conflict is left for the next pass.
fn tolerate(result: Result<()>, what: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!("{} already gone", what);
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            warn!("Conflict deleting {}, retrying next pass: {}", what, e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Delete every object in `inventory`.
///
/// Returns `true` when the inventory was already empty; otherwise issues the
/// deletes and returns `false` so the caller checks again on the next pass.
pub async fn clean_namespace(
    store: &dyn ResourceStore,
    namespace: &str,
    inventory: &Inventory,
) -> Result<bool> {
    if inventory.is_empty() {
        return Ok(true);
    }

    info!(
        namespace = %namespace,
        objects = inventory.object_count(),
        "Deleting managed objects"
    );

    for (kind_name, objects) in &inventory.resources {
        let kind = by_kind(kind_name).ok_or_else(|| {
            OperatorError::InvalidState(format!("unknown managed kind {}", kind_name))
        })?;
        for obj in objects {
            let name = obj.name_any();
            let what = format!("{} {}", kind.kind, name);
            tolerate(store.delete_managed(namespace, kind, &name).await, &what)?;
        }
    }

    for config_map in &inventory.config_maps {
        let name = config_map.name_any();
        let what = format!("ConfigMap {}", name);
        tolerate(store.delete_config_map(namespace, &name).await, &what)?;
    }

    for secret in &inventory.secrets {
        let name = secret.name_any();
        let what = format!("Secret {}", name);
        tolerate(store.delete_secret(namespace, &name).await, &what)?;
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fake::{managed_object, FakeStore};
    use serde_json::json;

    async fn populated_store() -> (FakeStore, Inventory) {
        let store = FakeStore::default();
        store.insert_managed("openstack", managed_object("Network", "ctlplane", json!({})));
        store.insert_managed("openstack", managed_object("VmSet", "controller", json!({})));
        store.insert_config_map("openstack", "tripleo-tarball");
        let inventory = Inventory::collect(&store, "openstack", "managed=true").await.unwrap();
        (store, inventory)
    }

    #[tokio::test]
    async fn test_empty_namespace_is_clean() {
        let store = FakeStore::default();
        let clean = clean_namespace(&store, "openstack", &Inventory::default()).await.unwrap();
        assert!(clean);
        assert_eq!(store.delete_count(), 0);
    }

    #[tokio::test]
    async fn test_deletes_everything_then_reports_clean() {
        let (store, inventory) = populated_store().await;

        let clean = clean_namespace(&store, "openstack", &inventory).await.unwrap();
        assert!(!clean);
        assert_eq!(store.delete_count(), 3);

        let inventory = Inventory::collect(&store, "openstack", "managed=true").await.unwrap();
        assert!(clean_namespace(&store, "openstack", &inventory).await.unwrap());
    }

    #[tokio::test]
    async fn test_not_found_is_ignored() {
        let (store, inventory) = populated_store().await;
        store.remove_managed("openstack", "Network", "ctlplane");

        let clean = clean_namespace(&store, "openstack", &inventory).await.unwrap();
        assert!(!clean);
    }

    #[tokio::test]
    async fn test_conflict_is_swallowed() {
        let (store, inventory) = populated_store().await;
        store.fail_deletes_with_conflict("ctlplane");

        let clean = clean_namespace(&store, "openstack", &inventory).await.unwrap();
        assert!(!clean);

        let remaining = Inventory::collect(&store, "openstack", "managed=true").await.unwrap();
        assert_eq!(remaining.objects("Network").len(), 1);
    }
}
