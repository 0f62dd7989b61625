//! Managed kind table
//!
//! Every director resource kind the backup saga captures, in load order,
//! together with where its status reports progress and which values mean
//! "finished". The quiesce check, the inventory and the reload all iterate
//! this table instead of handling kinds one by one.

use crate::config::API_GROUP;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DynamicObject};
use serde_json::{json, Value};

/// Value written into a reloaded object's state field until its own
/// controller reconciles it.
pub const WAITING_STATE: &str = "Waiting";

const API_VERSION: &str = "v1beta1";

/// Where a kind reports its provisioning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLocation {
    /// `status.currentState`
    CurrentState,
    /// `status.provisioningStatus.state`
    ProvisioningStatus,
    /// The kind has no state; it never holds up a backup
    None,
}

/// One managed resource kind.
#[derive(Debug, Clone, Copy)]
pub struct ManagedKind {
    pub kind: &'static str,
    pub plural: &'static str,
    pub state_location: StateLocation,
    pub finished: &'static [&'static str],
}

pub const NETWORK: &str = "Network";
pub const VM_SET: &str = "VmSet";
pub const CONTROL_PLANE: &str = "ControlPlane";

/// Managed kinds in the order a restore loads them.
pub const MANAGED_KINDS: &[ManagedKind] = &[
    ManagedKind {
        kind: NETWORK,
        plural: "networks",
        state_location: StateLocation::CurrentState,
        finished: &["Configured"],
    },
    ManagedKind {
        kind: "NetworkAttachment",
        plural: "networkattachments",
        state_location: StateLocation::CurrentState,
        finished: &["Attached"],
    },
    ManagedKind {
        kind: "NetworkConfig",
        plural: "networkconfigs",
        state_location: StateLocation::ProvisioningStatus,
        finished: &["Configured"],
    },
    ManagedKind {
        kind: "MacAddressRegistry",
        plural: "macaddressregistries",
        state_location: StateLocation::CurrentState,
        finished: &["Created"],
    },
    ManagedKind {
        kind: "IpSet",
        plural: "ipsets",
        state_location: StateLocation::None,
        finished: &[],
    },
    ManagedKind {
        kind: "ProvisionServer",
        plural: "provisionservers",
        state_location: StateLocation::ProvisioningStatus,
        finished: &["Provisioned"],
    },
    ManagedKind {
        kind: "BaremetalSet",
        plural: "baremetalsets",
        state_location: StateLocation::ProvisioningStatus,
        finished: &["Provisioned", "Empty"],
    },
    ManagedKind {
        kind: "AdminClient",
        plural: "adminclients",
        state_location: StateLocation::None,
        finished: &[],
    },
    ManagedKind {
        kind: VM_SET,
        plural: "vmsets",
        state_location: StateLocation::ProvisioningStatus,
        finished: &["Provisioned", "Empty"],
    },
    ManagedKind {
        kind: CONTROL_PLANE,
        plural: "controlplanes",
        state_location: StateLocation::ProvisioningStatus,
        finished: &["Provisioned"],
    },
];

/// Look a kind up by name.
pub fn by_kind(kind: &str) -> Option<&'static ManagedKind> {
    MANAGED_KINDS.iter().find(|k| k.kind == kind)
}

impl ManagedKind {
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: API_GROUP.to_string(),
            version: API_VERSION.to_string(),
            api_version: format!("{}/{}", API_GROUP, API_VERSION),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }

    /// State reported by `obj`, `None` when the kind has no state or the
    /// object has not reported one yet.
    pub fn current_state<'a>(&self, obj: &'a DynamicObject) -> Option<&'a str> {
        let status = obj.data.get("status")?;
        let state = match self.state_location {
            StateLocation::CurrentState => status.get("currentState"),
            StateLocation::ProvisioningStatus => status.get("provisioningStatus")?.get("state"),
            StateLocation::None => None,
        };
        state?.as_str()
    }

    /// Whether `obj` has stopped doing work.
    pub fn is_finished(&self, obj: &DynamicObject) -> bool {
        if self.state_location == StateLocation::None {
            return true;
        }
        self.current_state(obj)
            .is_some_and(|state| self.finished.contains(&state))
    }

    /// Status body marking a freshly loaded object as waiting on its controller.
    ///
    /// `None` for kinds without a state; those are loaded without a status write.
    pub fn waiting_status(&self, reason: &str) -> Option<Value> {
        let status = match self.state_location {
            StateLocation::CurrentState => json!({
                "currentState": WAITING_STATE,
                "conditions": [],
            }),
            StateLocation::ProvisioningStatus => json!({
                "provisioningStatus": {
                    "state": WAITING_STATE,
                    "reason": reason,
                },
            }),
            StateLocation::None => return None,
        };
        Some(json!({ "status": status }))
    }
}

/// Metadata for reloading a saved object into `namespace`.
///
/// Name, labels and annotations survive; server-populated fields do not.
pub fn reload_meta(meta: &ObjectMeta, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.clone(),
        namespace: Some(namespace.to_string()),
        labels: meta.labels.clone(),
        annotations: meta.annotations.clone(),
        ..Default::default()
    }
}

/// Copy of a saved object fit for create-or-update into a namespace.
///
/// Every non-status top-level field is kept verbatim.
pub fn for_reload(obj: &DynamicObject, namespace: &str) -> DynamicObject {
    let mut data = obj.data.clone();
    if let Value::Object(fields) = &mut data {
        fields.remove("status");
    }
    DynamicObject {
        types: obj.types.clone(),
        metadata: reload_meta(&obj.metadata, namespace),
        data,
    }
}
