//! Backup CRD
//!
//! A Backup is the saved bundle for one namespace: every managed custom
//! resource grouped by kind, the deployment's config maps and secrets, and
//! the VM snapshot names recorded when disks were included.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Spec for a Backup resource
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "director.infra.io",
    version = "v1beta1",
    kind = "Backup",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Managed resources keyed by kind
    #[serde(default)]
    pub crs: BTreeMap<String, ObjectList>,

    /// Config maps matching the managed selector
    #[serde(default)]
    pub config_maps: ConfigMapList,

    /// Secrets matching the managed selector
    #[serde(default)]
    pub secrets: SecretList,

    /// VM name to snapshot name, present when VM images were included
    #[serde(default, rename = "vmSnapshotNames")]
    pub vm_snapshot_names: BTreeMap<String, String>,
}

/// Saved objects of one managed kind.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default)]
pub struct ObjectList {
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_list")]
    pub items: Vec<DynamicObject>,
}

/// Saved config maps.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default)]
pub struct ConfigMapList {
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_list")]
    pub items: Vec<ConfigMap>,
}

/// Saved secrets.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default)]
pub struct SecretList {
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_list")]
    pub items: Vec<Secret>,
}

/// Arrays of arbitrary objects; the API server must not prune their fields.
fn preserve_unknown_list(_gen: &mut SchemaGenerator) -> Schema {
    let mut items = SchemaObject::default();
    items.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    items.instance_type = Some(schemars::schema::InstanceType::Object.into());

    let mut list = SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Array.into()),
        ..Default::default()
    };
    list.array().items = Some(Schema::Object(items).into());
    Schema::Object(list)
}

impl BackupSpec {
    /// Objects saved for `kind`, empty when the kind was not captured.
    pub fn objects(&self, kind: &str) -> &[DynamicObject] {
        self.crs.get(kind).map(|l| l.items.as_slice()).unwrap_or(&[])
    }
}
