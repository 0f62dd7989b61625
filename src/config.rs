//! Operator configuration
//!
//! Every label key, selector and name the backup components need is carried
//! here and passed in at construction; nothing reads globals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// API group shared by the director resource kinds, the backup request and the bundle.
pub const API_GROUP: &str = "director.infra.io";

fn default_field_manager() -> String {
    "director-backup-operator".to_string()
}
fn default_requeue_seconds() -> u64 {
    10
}
fn default_marker_label() -> String {
    format!("{}/backup-snapshot", API_GROUP)
}
fn default_request_label() -> String {
    format!("{}/backup-request", API_GROUP)
}
fn default_managed_selector() -> String {
    format!("app.kubernetes.io/managed-by={}", "director-operator")
}
fn default_admin_pod_selector() -> String {
    "app.kubernetes.io/component=admin-client".to_string()
}
fn default_admin_container() -> String {
    "admin-client".to_string()
}
fn default_admin_user() -> String {
    "cloud-admin".to_string()
}
fn default_ha_network() -> String {
    "ctlplane".to_string()
}

/// Configuration for the backup request controller and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Field manager used for patches
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Fixed revisit interval for requests that are still in progress
    #[serde(default = "default_requeue_seconds")]
    pub requeue_seconds: u64,

    /// Label carrying the per-request marker on snapshot/restore resources
    #[serde(default = "default_marker_label")]
    pub marker_label: String,

    /// Label naming the owning request on bundles and markers
    #[serde(default = "default_request_label")]
    pub request_label: String,

    /// Selector for the config maps and secrets that belong to the deployment
    #[serde(default = "default_managed_selector")]
    pub managed_selector: String,

    /// Selector for the administrative pod used for HA commands
    #[serde(default = "default_admin_pod_selector")]
    pub admin_pod_selector: String,

    /// Container inside the administrative pod
    #[serde(default = "default_admin_container")]
    pub admin_container: String,

    /// User that HA commands ssh in as
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// Network whose address is used to reach a VM's HA tooling
    #[serde(default = "default_ha_network")]
    pub ha_network: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            field_manager: default_field_manager(),
            requeue_seconds: default_requeue_seconds(),
            marker_label: default_marker_label(),
            request_label: default_request_label(),
            managed_selector: default_managed_selector(),
            admin_pod_selector: default_admin_pod_selector(),
            admin_container: default_admin_container(),
            admin_user: default_admin_user(),
            ha_network: default_ha_network(),
        }
    }
}

impl BackupConfig {
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    /// Label selector matching every marker and the bundle of one request.
    pub fn marker_selector(&self, marker: &str) -> String {
        format!("{}={}", self.marker_label, marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = BackupConfig::default();
        assert_eq!(cfg.requeue_interval(), Duration::from_secs(10));
        assert_eq!(cfg.marker_label, "director.infra.io/backup-snapshot");
        assert_eq!(cfg.admin_user, "cloud-admin");
        assert_eq!(cfg.ha_network, "ctlplane");
    }

    #[test]
    fn test_config_serde_defaults_match_default_impl() {
        let cfg: BackupConfig = serde_json::from_str("{}").unwrap();
        let default = BackupConfig::default();
        assert_eq!(cfg.requeue_seconds, default.requeue_seconds);
        assert_eq!(cfg.request_label, default.request_label);
        assert_eq!(cfg.managed_selector, default.managed_selector);
    }

    #[test]
    fn test_config_serde_override() {
        let json = r#"{"requeueSeconds": 3, "haNetwork": "provisioning"}"#;
        let cfg: BackupConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.requeue_seconds, 3);
        assert_eq!(cfg.ha_network, "provisioning");
        assert_eq!(cfg.admin_container, "admin-client");
    }

    #[test]
    fn test_selectors() {
        let cfg = BackupConfig::default();
        assert_eq!(
            cfg.marker_selector("nightly-1700000000"),
            "director.infra.io/backup-snapshot=nightly-1700000000"
        );
    }
}
