//! VM Manager - owns every VM from provisioning to deletion
//!
//! The VmManager is responsible for:
//! - Provisioning VM directories and disk images
//! - Launching the hypervisor and resolving the daemonized pid
//! - Keeping the live process table consistent with persisted metadata
//! - Handing out console, QMP and snapshot access for running VMs

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use nix::sys::signal::Signal;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::config::{
    ConfigPatch, ConfigUpdate, NetworkMode, NewVm, VmConfig, VmMetadata, VmRecord, VmStatus,
};
use super::handle::{ProcessHandle, ProcessRegistry};
use super::lifecycle::{
    acceleration_available, build_launch_args, check_access, create_disk_image, disk_info,
    is_alive, launch, monitor_endpoint, probe_hypervisor, process_stats, qmp_endpoint,
    resolve_pid, send_signal, wait_for_exit, DiskInfo, ProcessStats,
};
use super::store::{validate_vm_name, VmStore};
use crate::command::CommandRunner;
use crate::config::ControlPlaneConfig;
use crate::error::{Error, Result};
use crate::metrics::{outcome, VM_LIFECYCLE};
use crate::monitor::{validate_response, Console, ConsoleClient, Endpoint, QmpClient};
use crate::network::NetworkFabric;
use crate::snapshot::{SnapshotIndex, SnapshotOrchestrator};

/// Optical drive QEMU assigns to `-cdrom`
const CDROM_DEVICE: &str = "ide1-cd0";

/// What a successful start produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub name: String,
    pub pid: u32,
    pub vnc_port: u16,
    pub console_endpoint: Endpoint,
    pub qmp_endpoint: Endpoint,
    pub boots_from_iso: bool,
    pub command: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedVm {
    pub record: VmRecord,
    pub disk: DiskInfo,
    pub started: Option<StartOutcome>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub name: String,
    pub dir: PathBuf,
    pub dir_removed: bool,
}

/// Manages every VM under one storage root
pub struct VmManager {
    store: VmStore,
    registry: Arc<ProcessRegistry>,
    runner: Arc<dyn CommandRunner>,
    fabric: Arc<NetworkFabric>,
    snapshot_index: SnapshotIndex,
    config: ControlPlaneConfig,
}

impl VmManager {
    /// Manager with its own empty process table
    pub fn new(config: ControlPlaneConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_registry(config, runner, Arc::new(ProcessRegistry::new()))
    }

    pub fn with_registry(
        config: ControlPlaneConfig,
        runner: Arc<dyn CommandRunner>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        let fabric = Arc::new(NetworkFabric::new(
            Arc::clone(&runner),
            config.network.clone(),
        ));
        Self {
            store: VmStore::new(&config.storage_dir),
            snapshot_index: SnapshotIndex::new(&config.snapshot_dir),
            registry,
            runner,
            fabric,
            config,
        }
    }

    pub fn store(&self) -> &VmStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn fabric(&self) -> &Arc<NetworkFabric> {
        &self.fabric
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    async fn require_vm(&self, name: &str) -> Result<()> {
        if self.store.exists(name).await {
            Ok(())
        } else {
            Err(Error::not_found("vm", name))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Provisioning
    // ─────────────────────────────────────────────────────────────────────────

    /// Write the VM directory, `config.json` and `metadata.json`
    pub async fn create_directory(
        &self,
        name: &str,
        config: &VmConfig,
    ) -> Result<(VmConfig, VmMetadata)> {
        self.store.create_directory(name, config).await
    }

    /// Directory, disk image and documents for a new VM; optionally start it
    #[instrument(skip(self, request), fields(vm = %request.name))]
    pub async fn create_vm(&self, request: NewVm) -> Result<CreatedVm> {
        let result = self.create_vm_inner(request).await;
        VM_LIFECYCLE
            .with_label_values(&["create", outcome(&result)])
            .inc();
        result
    }

    async fn create_vm_inner(&self, request: NewVm) -> Result<CreatedVm> {
        validate_vm_name(&request.name)?;
        if self.store.exists(&request.name).await {
            return Err(Error::Conflict(format!("vm {} already exists", request.name)));
        }

        let name = request.name.clone();
        let start = request.start;
        let dir = self.store.vm_dir(&name);
        let config = request.into_config(&dir);

        tokio::fs::create_dir_all(&dir).await?;
        if let Err(e) = create_disk_image(
            self.runner.as_ref(),
            &self.config.hypervisor.img_binary,
            &config.disk_path,
            &config.disk_format,
            &config.disk_size,
        )
        .await
        {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %cleanup, "failed to clean up after disk creation error");
            }
            return Err(e);
        }

        let (config, _) = self.store.create_directory(&name, &config).await?;
        let disk = disk_info(
            self.runner.as_ref(),
            &self.config.hypervisor.img_binary,
            &config.disk_path,
        )
        .await?;

        let started = if start {
            Some(self.start_inner(&config).await?)
        } else {
            None
        };

        info!(vm = %name, disk = %config.disk_path.display(), "vm created");
        Ok(CreatedVm {
            record: self.describe(&name).await?,
            disk,
            started,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Start / stop / restart
    // ─────────────────────────────────────────────────────────────────────────

    /// Launch the hypervisor for `config`
    #[instrument(skip(self, config), fields(vm = %config.name))]
    pub async fn start(&self, config: &VmConfig) -> Result<StartOutcome> {
        let result = self.start_inner(config).await;
        VM_LIFECYCLE
            .with_label_values(&["start", outcome(&result)])
            .inc();
        result
    }

    /// Start from the persisted `config.json`
    pub async fn start_by_name(&self, name: &str) -> Result<StartOutcome> {
        self.require_vm(name).await?;
        let config = self.store.config(name).await?;
        self.start(&config).await
    }

    async fn start_inner(&self, config: &VmConfig) -> Result<StartOutcome> {
        let name = config.name.as_str();
        validate_vm_name(name)?;
        self.require_vm(name).await?;

        if self.is_running(name).await? {
            return Err(Error::Conflict(format!("vm {} is already running", name)));
        }

        check_access(&config.disk_path, true, "disk image")?;

        let metadata = self
            .store
            .read_metadata(name)
            .await?
            .unwrap_or_default();
        if metadata.is_mount_iso {
            if let Some(iso) = &config.iso_path {
                check_access(iso, false, "iso image")?;
            }
        }

        let binary = self.config.hypervisor.binary.as_str();
        probe_hypervisor(self.runner.as_ref(), binary).await?;
        self.prepare_network(&config.network).await?;

        let accelerate = acceleration_available(&self.config.hypervisor.accel_device).await;
        if !accelerate {
            warn!(
                device = %self.config.hypervisor.accel_device.display(),
                "hardware acceleration unavailable, running in emulation mode"
            );
        }

        let dir = self.store.vm_dir(name);
        let plan = build_launch_args(binary, config, &metadata, &dir, accelerate);

        // QEMU refuses to bind over a socket left by a crashed instance
        for endpoint in [&plan.console_endpoint, &plan.qmp_endpoint] {
            if let Endpoint::Unix { path } = endpoint {
                let _ = tokio::fs::remove_file(path).await;
            }
        }

        launch(self.runner.as_ref(), &plan).await?;
        let pid = resolve_pid(self.runner.as_ref(), binary, name).await?;

        let command = plan.command_line();
        let console = Arc::new(ConsoleClient::new(
            plan.console_endpoint.clone(),
            &self.config.console,
        ));
        self.registry
            .insert(ProcessHandle::new(
                name.to_string(),
                pid,
                config.disk_path.clone(),
                plan.console_endpoint.clone(),
                plan.qmp_endpoint.clone(),
                command.clone(),
                console,
                false,
            ))
            .await;

        let installing = plan.boots_from_iso && !metadata.installed;
        self.store
            .update_metadata(name, |m| {
                m.status = VmStatus::Running;
                m.last_pid = Some(pid);
                m.last_command = Some(command.clone());
                m.last_run_time = Some(Utc::now());
                m.installing = installing;
                m.console_endpoint = Some(plan.console_endpoint.clone());
                m.qmp_endpoint = Some(plan.qmp_endpoint.clone());
            })
            .await?;

        info!(vm = name, pid, iso = plan.boots_from_iso, "vm started");
        Ok(StartOutcome {
            name: name.to_string(),
            pid,
            vnc_port: config.vnc_port(),
            console_endpoint: plan.console_endpoint,
            qmp_endpoint: plan.qmp_endpoint,
            boots_from_iso: plan.boots_from_iso,
            command,
        })
    }

    /// Bridges must already exist; taps are created on demand
    async fn prepare_network(&self, network: &NetworkMode) -> Result<()> {
        match network {
            NetworkMode::Bridge { bridge } => {
                if !self.fabric.interface_exists(bridge).await? {
                    return Err(Error::PreconditionFailed(format!(
                        "bridge {} does not exist",
                        bridge
                    )));
                }
            }
            NetworkMode::Tap { tap, bridge } => {
                if !self.fabric.interface_exists(tap).await? {
                    self.fabric.create_tap(tap, bridge.as_deref()).await?;
                }
            }
            NetworkMode::User { .. } | NetworkMode::None => {}
        }
        Ok(())
    }

    /// SIGTERM the VM and mark it stopped
    ///
    /// Signal delivery is best-effort: an already-dead or unknown process
    /// still ends with a `stopped` record and no handle.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn stop(&self, name: &str, pid: Option<u32>) -> Result<()> {
        let result = self.stop_inner(name, pid).await;
        VM_LIFECYCLE
            .with_label_values(&["stop", outcome(&result)])
            .inc();
        result
    }

    async fn stop_inner(&self, name: &str, pid: Option<u32>) -> Result<()> {
        self.require_vm(name).await?;

        match self.target_pid(name, pid).await? {
            Some(pid) => match send_signal(pid, Signal::SIGTERM) {
                Ok(()) => info!(vm = name, pid, "sent SIGTERM"),
                Err(e) => debug!(vm = name, pid, error = %e, "termination signal not delivered"),
            },
            None => debug!(vm = name, "no pid known, marking stopped"),
        }

        self.registry.remove(name).await;
        self.store
            .update_metadata(name, |m| {
                m.status = VmStatus::Stopped;
                m.installing = false;
                m.last_stop_time = Some(Utc::now());
            })
            .await?;
        Ok(())
    }

    /// Explicit pid, else the tracked handle, else the last recorded pid
    async fn target_pid(&self, name: &str, pid: Option<u32>) -> Result<Option<u32>> {
        if pid.is_some() {
            return Ok(pid);
        }
        if let Some(handle) = self.registry.get(name).await {
            return Ok(Some(handle.pid));
        }
        Ok(self
            .store
            .read_metadata(name)
            .await?
            .and_then(|m| m.last_pid))
    }

    /// Stop (escalating to SIGKILL), settle, start from persisted config
    ///
    /// Any failure is recorded in metadata as `error` before being returned.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn restart(&self, name: &str, pid: Option<u32>) -> Result<StartOutcome> {
        let result = self.restart_inner(name, pid).await;
        VM_LIFECYCLE
            .with_label_values(&["restart", outcome(&result)])
            .inc();

        if let Err(e) = &result {
            let reason = e.to_string();
            let recorded = self
                .store
                .update_metadata(name, |m| {
                    m.status = VmStatus::Error;
                    m.last_error = Some(reason.clone());
                    m.last_error_time = Some(Utc::now());
                })
                .await;
            if let Err(meta_err) = recorded {
                warn!(vm = name, error = %meta_err, "failed to record restart error");
            }
        }
        result
    }

    async fn restart_inner(&self, name: &str, pid: Option<u32>) -> Result<StartOutcome> {
        self.require_vm(name).await?;

        if let Some(pid) = self.target_pid(name, pid).await?.filter(|p| is_alive(*p)) {
            let timing = &self.config.lifecycle;
            self.stop_inner(name, Some(pid)).await?;

            if !wait_for_exit(pid, timing.stop_grace(), timing.stop_poll()).await {
                warn!(vm = name, pid, "graceful stop timed out, sending SIGKILL");
                if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                    warn!(vm = name, pid, error = %e, "SIGKILL not delivered");
                }
                wait_for_exit(pid, timing.stop_grace(), timing.stop_poll()).await;
            }

            tokio::time::sleep(timing.restart_settle()).await;
        }

        let config = self.store.config(name).await?;
        let outcome = self.start_inner(&config).await?;

        self.store
            .update_metadata(name, |m| m.last_restart = Some(Utc::now()))
            .await?;
        info!(vm = name, pid = outcome.pid, "vm restarted");
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delete / query
    // ─────────────────────────────────────────────────────────────────────────

    /// Forget the VM; with `purge` its directory goes too
    ///
    /// The process is never signalled. Callers stop the VM first.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn delete(&self, name: &str, purge: bool) -> Result<DeleteOutcome> {
        let result = self.delete_inner(name, purge).await;
        VM_LIFECYCLE
            .with_label_values(&["delete", outcome(&result)])
            .inc();
        result
    }

    async fn delete_inner(&self, name: &str, purge: bool) -> Result<DeleteOutcome> {
        self.require_vm(name).await?;

        if let Some(handle) = self.registry.remove(name).await {
            if is_alive(handle.pid) {
                warn!(vm = name, pid = handle.pid, "deleting a vm whose process is still alive");
            }
        }

        let dir = self.store.vm_dir(name);
        if purge {
            self.store.remove(name).await?;
        }

        info!(vm = name, purge, "vm deleted");
        Ok(DeleteOutcome {
            name: name.to_string(),
            dir,
            dir_removed: purge,
        })
    }

    /// Every VM directory merged with the reconciled process table
    pub async fn list_all(&self) -> Result<Vec<VmRecord>> {
        let dropped = self.registry.prune(is_alive).await;
        if !dropped.is_empty() {
            debug!(vms = ?dropped, "dropped handles of exited vms");
        }

        let names = self.store.list_names().await?;
        join_all(names.iter().map(|name| self.describe(name)))
            .await
            .into_iter()
            .collect()
    }

    pub async fn info(&self, name: &str) -> Result<VmRecord> {
        self.require_vm(name).await?;
        self.describe(name).await
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.running_handle(name).await?.is_some())
    }

    async fn describe(&self, name: &str) -> Result<VmRecord> {
        let config = self.store.read_config(name).await?;
        let metadata = self.store.read_metadata(name).await?;
        let handle = self
            .live_handle(name, config.as_ref(), metadata.as_ref())
            .await;

        let status = match (&handle, &metadata) {
            (Some(_), _) => VmStatus::Running,
            (None, Some(m)) if m.status == VmStatus::Running => VmStatus::Stopped,
            (None, Some(m)) => m.status,
            (None, None) => VmStatus::Unknown,
        };

        Ok(VmRecord {
            name: name.to_string(),
            dir: self.store.vm_dir(name),
            partial: config.is_none() || metadata.is_none(),
            running: handle.is_some(),
            pid: handle.map(|h| h.pid),
            status,
            config,
            metadata,
        })
    }

    async fn running_handle(&self, name: &str) -> Result<Option<Arc<ProcessHandle>>> {
        let config = self.store.read_config(name).await?;
        let metadata = self.store.read_metadata(name).await?;
        Ok(self
            .live_handle(name, config.as_ref(), metadata.as_ref())
            .await)
    }

    /// Reconcile one VM: drop a dead handle, adopt a live unrecorded one
    async fn live_handle(
        &self,
        name: &str,
        config: Option<&VmConfig>,
        metadata: Option<&VmMetadata>,
    ) -> Option<Arc<ProcessHandle>> {
        if let Some(handle) = self.registry.get(name).await {
            if is_alive(handle.pid) {
                return Some(handle);
            }
            debug!(vm = name, pid = handle.pid, "dropping stale process handle");
            self.registry.remove(name).await;
        }

        let metadata = metadata.filter(|m| m.status == VmStatus::Running)?;
        let pid = metadata.last_pid.filter(|p| is_alive(*p))?;

        let dir = self.store.vm_dir(name);
        let console_endpoint = metadata
            .console_endpoint
            .clone()
            .unwrap_or_else(|| monitor_endpoint(&dir));
        let qmp = metadata
            .qmp_endpoint
            .clone()
            .unwrap_or_else(|| qmp_endpoint(&dir));
        let console = Arc::new(ConsoleClient::new(
            console_endpoint.clone(),
            &self.config.console,
        ));

        info!(vm = name, pid, "adopting running vm");
        Some(
            self.registry
                .insert(ProcessHandle::new(
                    name.to_string(),
                    pid,
                    config.map(|c| c.disk_path.clone()).unwrap_or_default(),
                    console_endpoint,
                    qmp,
                    metadata.last_command.clone().unwrap_or_default(),
                    console,
                    true,
                ))
                .await,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration & media
    // ─────────────────────────────────────────────────────────────────────────

    /// Rewrite `config.json`; a running VM keeps its old settings until restarted
    pub async fn update_config(&self, name: &str, patch: ConfigPatch) -> Result<ConfigUpdate> {
        self.require_vm(name).await?;
        let mut config = self.store.config(name).await?;
        let changed = patch.apply(&mut config);
        if changed {
            self.store.write_config(name, &config).await?;
        }
        let restart_required = changed && self.is_running(name).await?;
        Ok(ConfigUpdate {
            config,
            restart_required,
        })
    }

    /// Attach or eject the install medium
    ///
    /// A running VM is changed live over the text console first; metadata is
    /// only committed when the console reply carries no error marker.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn toggle_iso_mount(&self, name: &str, mount: bool) -> Result<VmMetadata> {
        let result = self.toggle_iso_mount_inner(name, mount).await;
        VM_LIFECYCLE
            .with_label_values(&["iso", outcome(&result)])
            .inc();
        result
    }

    async fn toggle_iso_mount_inner(&self, name: &str, mount: bool) -> Result<VmMetadata> {
        self.require_vm(name).await?;
        let config = self.store.config(name).await?;
        let iso = match (&config.iso_path, mount) {
            (Some(iso), true) => Some(iso),
            (None, true) => {
                return Err(Error::PreconditionFailed(format!(
                    "vm {} has no iso configured",
                    name
                )))
            }
            (_, false) => None,
        };

        if let Some(handle) = self.running_handle(name).await? {
            let command = match iso {
                Some(iso) => format!("change {} {}", CDROM_DEVICE, iso.display()),
                None => format!("eject -f {}", CDROM_DEVICE),
            };
            let response = handle.console().execute(&command).await?;
            validate_response(&response, &command)?;
        }

        let metadata = self
            .store
            .update_metadata(name, |m| {
                m.is_mount_iso = mount;
                if !mount {
                    m.iso_unmount_time = Some(Utc::now());
                    m.installed = true;
                    m.installing = false;
                }
            })
            .await?;
        info!(vm = name, mount, "iso mount toggled");
        Ok(metadata)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Access to running VMs
    // ─────────────────────────────────────────────────────────────────────────

    async fn require_running(&self, name: &str) -> Result<Arc<ProcessHandle>> {
        self.require_vm(name).await?;
        self.running_handle(name)
            .await?
            .ok_or_else(|| Error::PreconditionFailed(format!("vm {} is not running", name)))
    }

    /// The shared text console client of a running VM
    pub async fn console(&self, name: &str) -> Result<Arc<ConsoleClient>> {
        Ok(self.require_running(name).await?.console())
    }

    /// A fresh, negotiated QMP connection to a running VM
    pub async fn qmp(&self, name: &str) -> Result<QmpClient> {
        let handle = self.require_running(name).await?;
        QmpClient::connect_negotiated(&handle.qmp_endpoint, &self.config.qmp).await
    }

    /// Snapshot orchestrator bound to a running VM's console and disk
    pub async fn snapshots(&self, name: &str) -> Result<SnapshotOrchestrator> {
        let handle = self.require_running(name).await?;
        let console: Arc<dyn Console> = handle.console();
        let config = self.store.config(name).await?;
        Ok(SnapshotOrchestrator::new(
            name,
            console,
            self.snapshot_index.clone(),
            self.config.snapshot.clone(),
        )
        .with_disk(config.disk_path))
    }

    pub async fn process_stats(&self, name: &str) -> Result<ProcessStats> {
        let handle = self.require_running(name).await?;
        process_stats(self.runner.as_ref(), handle.pid).await
    }
}

impl std::fmt::Debug for VmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmManager")
            .field("storage_dir", &self.store.root())
            .field("snapshot_dir", &self.snapshot_index.dir())
            .finish()
    }
}
