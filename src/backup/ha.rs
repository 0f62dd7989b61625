//! Remote command executor
//!
//! HA cluster membership of a VM is changed by running `pcs` over ssh from
//! the namespace's administrative pod. The command's stderr decides whether
//! the attempt should be retried, ignored or treated as fatal.

use crate::config::BackupConfig;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use std::fmt;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Transient failures: try again on the next pass.
const RETRYABLE: &[&str] = &[
    "Connection refused",
    "No route to host",
    "unable to start all nodes",
    "unable to stop all nodes",
];

/// The VM has no HA tooling to manage; treat the command as done.
const IGNORABLE: &[&str] = &["pcs: command not found", "Permission denied"];

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Runs a shell command inside the namespace's administrative pod.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_in_admin_pod(&self, namespace: &str, command: &str) -> Result<ExecOutput>;
}

/// [`CommandRunner`] that execs into the first pod matching the configured selector.
pub struct PodExecRunner {
    client: Client,
    pod_selector: String,
    container: String,
}

impl PodExecRunner {
    pub fn new(client: Client, config: &BackupConfig) -> Self {
        Self {
            client,
            pod_selector: config.admin_pod_selector.clone(),
            container: config.admin_container.clone(),
        }
    }
}

#[async_trait]
impl CommandRunner for PodExecRunner {
    async fn run_in_admin_pod(&self, namespace: &str, command: &str) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods
            .list(&ListParams::default().labels(&self.pod_selector))
            .await?
            .items
            .into_iter()
            .next()
            .ok_or_else(|| {
                OperatorError::Configuration(format!(
                    "no pod matching {} in namespace {}",
                    self.pod_selector, namespace
                ))
            })?;

        let params = AttachParams::default()
            .container(self.container.clone())
            .stdout(true)
            .stderr(true);
        let mut process = pods
            .exec(&pod.name_any(), vec!["sh", "-c", command], &params)
            .await?;

        let mut stdout_reader = process.stdout();
        let mut stderr_reader = process.stderr();
        let read_stdout = async {
            let mut out = String::new();
            if let Some(reader) = stdout_reader.as_mut() {
                reader.read_to_string(&mut out).await.map_err(|e| {
                    OperatorError::RemoteCommand(format!("reading stdout: {}", e))
                })?;
            }
            Ok::<_, OperatorError>(out)
        };
        let read_stderr = async {
            let mut err = String::new();
            if let Some(reader) = stderr_reader.as_mut() {
                reader.read_to_string(&mut err).await.map_err(|e| {
                    OperatorError::RemoteCommand(format!("reading stderr: {}", e))
                })?;
            }
            Ok::<_, OperatorError>(err)
        };
        let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);

        // The exec status only reports "Success" or "Failure" with a message
        let success = match process.take_status() {
            Some(status) => status
                .await
                .and_then(|s| serde_json::to_value(&s).ok())
                .is_some_and(|s| s["status"] == "Success"),
            None => false,
        };
        process
            .join()
            .await
            .map_err(|e| OperatorError::RemoteCommand(e.to_string()))?;

        Ok(ExecOutput {
            stdout: stdout?,
            stderr: stderr?,
            success,
        })
    }
}

/// HA membership change applied to one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAction {
    Start,
    Stop,
}

impl fmt::Display for ClusterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterAction::Start => f.write_str("start"),
            ClusterAction::Stop => f.write_str("stop"),
        }
    }
}

pub fn ha_command(admin_user: &str, address: &str, action: ClusterAction, node: &str) -> String {
    format!(
        "ssh {}@{} sudo pcs cluster {} {}",
        admin_user, address, action, node
    )
}

/// Classify a failed command by its stderr.
///
/// `Ok(false)` means retry on the next pass, `Ok(true)` means the failure is
/// harmless and the step counts as done, `Err` is fatal.
pub fn classify_failure(stderr: &str) -> Result<bool> {
    if RETRYABLE.iter().any(|s| stderr.contains(s)) {
        return Ok(false);
    }
    if IGNORABLE.iter().any(|s| stderr.contains(s)) {
        return Ok(true);
    }
    Err(OperatorError::RemoteCommand(stderr.trim().to_string()))
}

/// Change HA membership of `node`, reached at `address`.
///
/// Returns `true` once the change is done (or safely skipped).
pub async fn cluster_action(
    runner: &dyn CommandRunner,
    config: &BackupConfig,
    namespace: &str,
    address: &str,
    action: ClusterAction,
    node: &str,
) -> Result<bool> {
    let command = ha_command(&config.admin_user, address, action, node);
    info!(namespace = %namespace, node = %node, "HA cluster {}", action);

    let output = runner.run_in_admin_pod(namespace, &command).await?;
    debug!(stdout = %output.stdout, stderr = %output.stderr, "HA cluster {} output", action);

    if output.success {
        return Ok(true);
    }

    let done = classify_failure(&output.stderr)?;
    if !done {
        warn!(node = %node, stderr = %output.stderr, "HA cluster {} not done yet", action);
    }
    Ok(done)
}
