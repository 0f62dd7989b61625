//! BackupRequest Controller
//!
//! Drives each BackupRequest through its saga. Every pass reads the request's
//! persisted state, does the work that state calls for, and writes the next
//! state back. Nothing is held in memory between passes, so a restarted
//! operator resumes from the persisted status.
//!
//! Save:         Empty -> Quiescing -> Saving -> Saved | SaveError
//! Restore:      Empty -> Loading -> Reconciling -> Restored | RestoreError
//! CleanRestore: Empty -> Cleaning -> Loading -> Reconciling -> Restored | RestoreError

use crate::backup::cleaner::clean_namespace;
use crate::backup::ha::{CommandRunner, PodExecRunner};
use crate::backup::inventory::Inventory;
use crate::backup::kinds::{for_reload, reload_meta, CONTROL_PLANE, MANAGED_KINDS, VM_SET};
use crate::backup::quiesce::{evaluate, evaluate_restored};
use crate::backup::snapshot::{MarkerKind, VmOrchestrator, VmPassMode, VmPassRequest};
use crate::backup::store::{KubeStore, ResourceStore};
use crate::conditions::{normalized, update_current_condition};
use crate::config::BackupConfig;
use crate::controllers::error_policy_backoff;
use crate::crd::{Backup, BackupMode, BackupRequest, BackupRequestStatus, BackupState};
use crate::error::{OperatorError, Result};
use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Whether the namespace's control plane asks for HA fencing.
fn fencing_enabled(control_plane: Option<&DynamicObject>) -> bool {
    control_plane
        .and_then(|cp| cp.data["spec"]["enableFencing"].as_bool())
        .unwrap_or(false)
}

/// The saga itself, independent of how it is scheduled.
pub struct Saga {
    store: Arc<dyn ResourceStore>,
    runner: Arc<dyn CommandRunner>,
    config: Arc<BackupConfig>,
}

impl Saga {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        runner: Arc<dyn CommandRunner>,
        config: Arc<BackupConfig>,
    ) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Run one pass for `request`.
    ///
    /// Fatal errors move the request to its mode's error state and are
    /// returned; transient platform errors are left for the next pass.
    pub async fn reconcile(&self, request: &BackupRequest) -> Result<Action> {
        let name = request.name_any();
        let state = request.state();
        let mode = request.spec.mode;

        if state.is_terminal() {
            debug!(request = %name, state = %state, "Request finished, nothing to do");
            return Ok(Action::await_change());
        }

        info!(request = %name, mode = %mode, state = %state, "Reconciling BackupRequest");

        let mut current = request.clone();
        let result = match mode {
            BackupMode::Save => self.save_pass(&mut current).await,
            BackupMode::Restore | BackupMode::CleanRestore => self.restore_pass(&mut current).await,
        };

        match result {
            Ok(()) if current.state().is_terminal() => Ok(Action::await_change()),
            Ok(()) => Ok(Action::requeue(self.config.requeue_interval())),
            Err(e) if e.is_transient() => {
                warn!(request = %name, "Transient error during pass, retrying: {}", e);
                Ok(Action::requeue(self.config.requeue_interval()))
            }
            Err(e) => {
                error!(request = %name, state = %current.state(), "BackupRequest failed: {}", e);
                let failed = BackupState::error_for(mode);
                let message = e.to_string();
                if let Err(write_err) = self.transition(&mut current, failed, &message).await {
                    warn!(request = %name, "Failed to record {}: {}", failed, write_err);
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Move `request` to `state`, keeping the rest of its status.
    async fn transition(
        &self,
        request: &mut BackupRequest,
        state: BackupState,
        message: &str,
    ) -> Result<()> {
        let mut status = request.status.clone().unwrap_or_default();
        status.current_state = state;
        self.write_status(request, status, message).await
    }

    /// Single status write path.
    ///
    /// Promotes the condition named after the new state, then skips the write
    /// when nothing but timestamps would change. On success `request` holds
    /// the stored object, so later writes in the same pass use its
    /// resourceVersion.
    async fn write_status(
        &self,
        request: &mut BackupRequest,
        mut status: BackupRequestStatus,
        message: &str,
    ) -> Result<()> {
        let previous = request.status.clone().unwrap_or_default();
        let state = status.current_state;
        update_current_condition(&mut status.conditions, state.as_str(), state.as_str(), message);

        let unchanged = previous.current_state == status.current_state
            && previous.vm_snapshot_names == status.vm_snapshot_names
            && previous.completion_timestamp == status.completion_timestamp
            && normalized(&previous.conditions) == normalized(&status.conditions);
        if unchanged {
            return Ok(());
        }

        if previous.current_state != state {
            info!(
                request = %request.name_any(),
                from = %previous.current_state,
                to = %state,
                "BackupRequest state transition"
            );
        }

        let mut updated = request.clone();
        updated.status = Some(status);
        *request = self.store.update_request_status(&updated).await?;
        Ok(())
    }

    fn namespace(request: &BackupRequest) -> Result<String> {
        request.namespace().ok_or_else(|| {
            OperatorError::InvalidState(format!(
                "BackupRequest {} has no namespace",
                request.name_any()
            ))
        })
    }

    async fn inventory(&self, namespace: &str) -> Result<Inventory> {
        Inventory::collect(self.store.as_ref(), namespace, &self.config.managed_selector).await
    }

    fn orchestrator(&self) -> VmOrchestrator<'_> {
        VmOrchestrator::new(self.store.as_ref(), self.runner.as_ref(), &self.config)
    }

    fn marker(request: &BackupRequest) -> Result<String> {
        request.snapshot_marker().ok_or_else(|| {
            OperatorError::InvalidState(format!(
                "BackupRequest {} has no creation timestamp",
                request.name_any()
            ))
        })
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    async fn save_pass(&self, request: &mut BackupRequest) -> Result<()> {
        if request.state() == BackupState::Empty {
            let message = "Waiting for all controllers to finish";
            self.transition(request, BackupState::Quiescing, message)
                .await?;
        }

        match request.state() {
            BackupState::Quiescing => self.quiesce(request).await,
            BackupState::Saving => self.save(request).await,
            other => Err(OperatorError::InvalidState(format!(
                "state {} is not part of the save saga",
                other
            ))),
        }
    }

    async fn quiesce(&self, request: &mut BackupRequest) -> Result<()> {
        let namespace = Self::namespace(request)?;
        let inventory = self.inventory(&namespace).await?;

        let report = evaluate(&inventory);
        if !report.quiesced() {
            debug!(request = %request.name_any(), "Waiting on {}", report);
            let message = format!("Waiting for controllers to finish: {}", report);
            return self.transition(request, BackupState::Quiescing, &message).await;
        }

        self.transition(request, BackupState::Saving, "All controllers finished, saving")
            .await
    }

    async fn save(&self, request: &mut BackupRequest) -> Result<()> {
        let name = request.name_any();
        let namespace = Self::namespace(request)?;
        let marker = Self::marker(request)?;
        let inventory = self.inventory(&namespace).await?;
        let mut status = request.status.clone().unwrap_or_default();

        if request.spec.include_vm_images {
            let pass = VmPassRequest {
                namespace: &namespace,
                name: &name,
                marker: &marker,
            };
            let pending = self
                .orchestrator()
                .run_pass(
                    &pass,
                    VmPassMode::Save,
                    inventory.vm_sets(),
                    fencing_enabled(inventory.control_plane()),
                    &mut status.vm_snapshot_names,
                )
                .await?;

            if !pending.is_empty() {
                let message = format!("Waiting for VM snapshots: {}", pending.join(", "));
                return self.write_status(request, status, &message).await;
            }
        }

        let bundle_name = self
            .ensure_bundle(&name, &marker, &namespace, &inventory, &status.vm_snapshot_names)
            .await?;

        status.current_state = BackupState::Saved;
        status.completion_timestamp = Some(Utc::now().to_rfc3339());
        let message = format!("Saved to Backup {}", bundle_name);
        self.write_status(request, status, &message).await
    }

    /// Bundle for this request, created on first call and reused afterwards.
    ///
    /// Bundles outlive their request, so they are found by the request's
    /// marker rather than its name: a re-created request never adopts the
    /// bundle of an earlier one.
    async fn ensure_bundle(
        &self,
        request: &str,
        marker: &str,
        namespace: &str,
        inventory: &Inventory,
        vm_snapshot_names: &BTreeMap<String, String>,
    ) -> Result<String> {
        let selector = self.config.marker_selector(marker);
        if let Some(existing) = self.store.find_backup(namespace, &selector).await? {
            debug!(request = %request, "Reusing Backup {}", existing.name_any());
            return Ok(existing.name_any());
        }

        let bundle_name = format!("{}-{}", request, Utc::now().timestamp());
        let mut bundle = Backup::new(
            &bundle_name,
            inventory.to_bundle_spec(vm_snapshot_names.clone()),
        );
        bundle.metadata.namespace = Some(namespace.to_string());
        bundle.metadata.labels = Some(BTreeMap::from([
            (self.config.request_label.clone(), request.to_string()),
            (self.config.marker_label.clone(), marker.to_string()),
        ]));

        self.store.create_backup(namespace, &bundle).await?;
        info!(
            request = %request,
            objects = inventory.object_count(),
            "Saved namespace {} to Backup {}", namespace, bundle_name
        );
        Ok(bundle_name)
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    async fn load_bundle(&self, request: &BackupRequest, namespace: &str) -> Result<Backup> {
        request
            .spec
            .validate()
            .map_err(OperatorError::Configuration)?;
        let source = request.spec.restore_source.clone().unwrap_or_default();

        self.store
            .get_backup(namespace, &source)
            .await?
            .ok_or_else(|| {
                OperatorError::Configuration(format!(
                    "Backup {} to restore from does not exist in namespace {}",
                    source, namespace
                ))
            })
    }

    async fn restore_pass(&self, request: &mut BackupRequest) -> Result<()> {
        let namespace = Self::namespace(request)?;
        let bundle = self.load_bundle(request, &namespace).await?;

        if request.state() == BackupState::Empty {
            if request.spec.mode == BackupMode::CleanRestore {
                self.transition(request, BackupState::Cleaning, "Removing managed objects")
                    .await?;
            } else {
                self.transition(request, BackupState::Loading, "Loading Backup").await?;
            }
        }

        match request.state() {
            BackupState::Cleaning => self.clean(request, &namespace).await,
            BackupState::Loading => self.load(request, &namespace, &bundle).await,
            BackupState::Reconciling => self.await_restored(request, &namespace, &bundle).await,
            other => Err(OperatorError::InvalidState(format!(
                "state {} is not part of the restore saga",
                other
            ))),
        }
    }

    async fn clean(&self, request: &mut BackupRequest, namespace: &str) -> Result<()> {
        let inventory = self.inventory(namespace).await?;

        if !clean_namespace(self.store.as_ref(), namespace, &inventory).await? {
            let message = format!("Waiting for {} objects to be deleted", inventory.object_count());
            return self.transition(request, BackupState::Cleaning, &message).await;
        }

        self.transition(request, BackupState::Loading, "Namespace clean, loading Backup")
            .await
    }

    async fn load(
        &self,
        request: &mut BackupRequest,
        namespace: &str,
        bundle: &Backup,
    ) -> Result<()> {
        let name = request.name_any();
        let bundle_name = bundle.name_any();
        let reason = format!("Restored by BackupRequest {}", name);

        for kind in MANAGED_KINDS {
            for saved in bundle.spec.objects(kind.kind) {
                let obj = for_reload(saved, namespace);
                let obj_name = obj.name_any();
                self.store.apply_managed(namespace, kind, &obj).await?;
                if let Some(status) = kind.waiting_status(&reason) {
                    self.store
                        .patch_managed_status(namespace, kind, &obj_name, &status)
                        .await?;
                }
                debug!(request = %name, "Loaded {} {}", kind.kind, obj_name);
            }
        }

        for saved in &bundle.spec.config_maps.items {
            let mut config_map = saved.clone();
            config_map.metadata = reload_meta(&saved.metadata, namespace);
            self.store.apply_config_map(namespace, &config_map).await?;
        }
        for saved in &bundle.spec.secrets.items {
            let mut secret = saved.clone();
            secret.metadata = reload_meta(&saved.metadata, namespace);
            self.store.apply_secret(namespace, &secret).await?;
        }

        let mut status = request.status.clone().unwrap_or_default();
        if request.spec.include_vm_images {
            let marker = Self::marker(request)?;
            let pass = VmPassRequest {
                namespace,
                name: &name,
                marker: &marker,
            };
            let mode = VmPassMode::Restore {
                bundle: &bundle_name,
                snapshot_names: &bundle.spec.vm_snapshot_names,
            };
            let pending = self
                .orchestrator()
                .run_pass(
                    &pass,
                    mode,
                    bundle.spec.objects(VM_SET),
                    fencing_enabled(bundle.spec.objects(CONTROL_PLANE).first()),
                    &mut status.vm_snapshot_names,
                )
                .await?;

            if !pending.is_empty() {
                let message = format!("Waiting for VM restores: {}", pending.join(", "));
                return self.write_status(request, status, &message).await;
            }
        }

        status.current_state = BackupState::Reconciling;
        let message = format!(
            "Loaded Backup {}, waiting for controllers to reconcile",
            bundle_name
        );
        self.write_status(request, status, &message).await
    }

    async fn await_restored(
        &self,
        request: &mut BackupRequest,
        namespace: &str,
        bundle: &Backup,
    ) -> Result<()> {
        let inventory = self.inventory(namespace).await?;

        let report = evaluate_restored(&bundle.spec, &inventory);
        if !report.quiesced() {
            let message = format!("Waiting for restored objects to reconcile: {}", report);
            return self.transition(request, BackupState::Reconciling, &message).await;
        }

        let mut status = request.status.clone().unwrap_or_default();
        status.current_state = BackupState::Restored;
        status.completion_timestamp = Some(Utc::now().to_rfc3339());
        let message = format!("Restored from Backup {}", bundle.name_any());
        self.write_status(request, status, &message).await
    }
}

/// Schedules the saga for every BackupRequest.
pub struct BackupRequestController {
    client: Client,
    config: Arc<BackupConfig>,
    namespace: Option<String>,
}

impl BackupRequestController {
    /// Create a new backup request controller; `namespace` limits the watch to one namespace
    pub fn new(client: Client, config: BackupConfig, namespace: Option<String>) -> Self {
        Self {
            client,
            config: Arc::new(config),
            namespace,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn marker_api(&self, kind: MarkerKind) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match &self.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

/// Request named by an object's request label.
fn owning_request<K: ResourceExt>(obj: &K, label: &str) -> Option<ObjectRef<BackupRequest>> {
    let name = obj.labels().get(label)?;
    let namespace = obj.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

#[async_trait::async_trait]
impl crate::controllers::Controller for BackupRequestController {
    async fn run(&self) -> Result<()> {
        let requests: Api<BackupRequest> = self.api();
        let backups: Api<Backup> = self.api();

        let field_manager = self.config.field_manager.clone();
        let store = Arc::new(KubeStore::new(self.client.clone(), field_manager));
        let runner = Arc::new(PodExecRunner::new(self.client.clone(), &self.config));
        let saga = Arc::new(Saga::new(store, runner, Arc::clone(&self.config)));

        info!("Starting BackupRequest controller");

        let label = self.config.request_label.clone();
        let backup_label = label.clone();
        let snapshot_label = label.clone();
        let restore_label = label;

        Controller::new(requests, Config::default())
            .watches(backups, Config::default(), move |backup: Backup| {
                owning_request(&backup, &backup_label)
            })
            .watches_with(
                self.marker_api(MarkerKind::Snapshot),
                MarkerKind::Snapshot.api_resource(),
                Config::default(),
                move |marker: DynamicObject| owning_request(&marker, &snapshot_label),
            )
            .watches_with(
                self.marker_api(MarkerKind::Restore),
                MarkerKind::Restore.api_resource(),
                Config::default(),
                move |marker: DynamicObject| owning_request(&marker, &restore_label),
            )
            .shutdown_on_signal()
            .run(
                |request, saga| async move { saga.reconcile(&request).await },
                |request, error, saga| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(request, error, saga)
                },
                saga,
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled BackupRequest: {}", obj.name);
                    }
                    Err(e) => {
                        warn!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "backup-request"
    }
}
