//! Resource store
//!
//! Every read and write the backup saga makes against the cluster goes
//! through [`ResourceStore`], so the saga can be driven against an in-memory
//! store in tests.

use crate::backup::kinds::ManagedKind;
use crate::backup::snapshot::MarkerKind;
use crate::crd::{Backup, BackupRequest};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;
use tracing::{debug, info};

/// Cluster operations used by the backup saga.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list_managed(&self, namespace: &str, kind: &ManagedKind) -> Result<Vec<DynamicObject>>;

    /// Create the object, or replace the existing one with the same name.
    async fn apply_managed(
        &self,
        namespace: &str,
        kind: &ManagedKind,
        obj: &DynamicObject,
    ) -> Result<()>;

    /// Merge `status` (a `{"status": ...}` body) into the object's status subresource.
    async fn patch_managed_status(
        &self,
        namespace: &str,
        kind: &ManagedKind,
        name: &str,
        status: &Value,
    ) -> Result<()>;

    async fn delete_managed(&self, namespace: &str, kind: &ManagedKind, name: &str) -> Result<()>;

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>>;
    async fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_secrets(&self, namespace: &str, selector: &str) -> Result<Vec<Secret>>;
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>>;
    /// First bundle matching `selector`.
    async fn find_backup(&self, namespace: &str, selector: &str) -> Result<Option<Backup>>;
    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<()>;

    /// Write the request's status, guarded by its resourceVersion.
    async fn update_request_status(&self, request: &BackupRequest) -> Result<BackupRequest>;

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>>;
    async fn patch_vm(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    async fn list_markers(
        &self,
        namespace: &str,
        kind: MarkerKind,
        selector: &str,
    ) -> Result<Vec<DynamicObject>>;
    async fn create_marker(
        &self,
        namespace: &str,
        kind: MarkerKind,
        marker: &DynamicObject,
    ) -> Result<()>;
}

/// VirtualMachine resource of the platform's virtualization layer.
pub fn vm_api_resource() -> ApiResource {
    ApiResource {
        group: "kubevirt.io".to_string(),
        version: "v1".to_string(),
        api_version: "kubevirt.io/v1".to_string(),
        kind: "VirtualMachine".to_string(),
        plural: "virtualmachines".to_string(),
    }
}

/// [`ResourceStore`] backed by the Kubernetes API.
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn dynamic(&self, namespace: &str, ar: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

/// Create `obj`, or replace the live object carrying over its resourceVersion.
async fn create_or_replace<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.meta().name.clone().ok_or_else(|| {
        OperatorError::InvalidState("object to apply has no name".to_string())
    })?;

    match api.get_opt(&name).await? {
        Some(existing) => {
            let mut obj = obj.clone();
            obj.meta_mut().resource_version = existing.resource_version();
            api.replace(&name, &PostParams::default(), &obj).await?;
            debug!("Replaced {}", name);
        }
        None => {
            api.create(&PostParams::default(), obj).await?;
            debug!("Created {}", name);
        }
    }
    Ok(())
}

async fn delete_named<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::default()).await?;
    Ok(())
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_managed(
        &self,
        namespace: &str,
        kind: &ManagedKind,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.dynamic(namespace, &kind.api_resource());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn apply_managed(
        &self,
        namespace: &str,
        kind: &ManagedKind,
        obj: &DynamicObject,
    ) -> Result<()> {
        let api = self.dynamic(namespace, &kind.api_resource());
        create_or_replace(&api, obj).await
    }

    async fn patch_managed_status(
        &self,
        namespace: &str,
        kind: &ManagedKind,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        let api = self.dynamic(namespace, &kind.api_resource());
        api.patch_status(name, &self.patch_params(), &Patch::Merge(status))
            .await?;
        Ok(())
    }

    async fn delete_managed(&self, namespace: &str, kind: &ManagedKind, name: &str) -> Result<()> {
        let api = self.dynamic(namespace, &kind.api_resource());
        delete_named(&api, name).await
    }

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        create_or_replace(&api, config_map).await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        delete_named(&api, name).await
    }

    async fn list_secrets(&self, namespace: &str, selector: &str) -> Result<Vec<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        create_or_replace(&api, secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        delete_named(&api, name).await
    }

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn find_backup(&self, namespace: &str, selector: &str) -> Result<Option<Backup>> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items.into_iter().next())
    }

    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<()> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), backup).await?;
        info!("Created Backup {} in namespace {}", backup.name_any(), namespace);
        Ok(())
    }

    async fn update_request_status(&self, request: &BackupRequest) -> Result<BackupRequest> {
        let namespace = request.namespace().ok_or_else(|| {
            OperatorError::InvalidState(format!(
                "BackupRequest {} has no namespace",
                request.name_any()
            ))
        })?;
        let api: Api<BackupRequest> = Api::namespaced(self.client.clone(), &namespace);

        // resourceVersion turns the merge patch into a compare-and-swap
        let patch = json!({
            "metadata": {"resourceVersion": request.resource_version()},
            "status": request.status,
        });
        let updated = api
            .patch_status(&request.name_any(), &self.patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(updated)
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        let api = self.dynamic(namespace, &vm_api_resource());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_vm(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api = self.dynamic(namespace, &vm_api_resource());
        api.patch(name, &self.patch_params(), &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn list_markers(
        &self,
        namespace: &str,
        kind: MarkerKind,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.dynamic(namespace, &kind.api_resource());
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn create_marker(
        &self,
        namespace: &str,
        kind: MarkerKind,
        marker: &DynamicObject,
    ) -> Result<()> {
        let api = self.dynamic(namespace, &kind.api_resource());
        api.create(&PostParams::default(), marker).await?;
        Ok(())
    }
}
