//! Persisted VM documents
//!
//! Each VM directory holds two JSON files:
//! - `config.json` - operator-authored hardware description ([`VmConfig`])
//! - `metadata.json` - system-maintained run state ([`VmMetadata`])

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::Endpoint;
use crate::network::Protocol;

pub const DEFAULT_MEMORY_MIB: u32 = 2048;
pub const DEFAULT_CPU_CORES: u32 = 2;
pub const DEFAULT_DISK_SIZE: &str = "20G";
pub const DEFAULT_DISK_FORMAT: &str = "qcow2";
pub const DEFAULT_BOOT_ORDER: &str = "c";

/// Base port for `-vnc :N` displays
pub const VNC_BASE_PORT: u16 = 5900;

/// Host port forwarded into a user-mode NAT guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Guest network wiring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum NetworkMode {
    /// QEMU's built-in NAT with optional host forwards
    User {
        #[serde(default, rename = "portForwards")]
        port_forwards: Vec<PortForward>,
    },
    /// Attached to an existing host bridge through the QEMU bridge helper
    Bridge { bridge: String },
    /// Dedicated tap, created on start if absent
    Tap {
        tap: String,
        #[serde(default)]
        bridge: Option<String>,
    },
    None,
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::User {
            port_forwards: Vec::new(),
        }
    }
}

/// `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub name: String,
    /// MiB
    pub memory: u32,
    pub cpu_cores: u32,
    pub disk_path: PathBuf,
    pub disk_size: String,
    pub disk_format: String,
    pub boot_order: String,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub iso_path: Option<PathBuf>,
    /// VNC display offset; the server listens on 5900 + display
    #[serde(default)]
    pub display: u16,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl VmConfig {
    pub fn vnc_port(&self) -> u16 {
        VNC_BASE_PORT.saturating_add(self.display)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Created,
    Running,
    Stopped,
    Error,
    /// Directory present without readable metadata
    Unknown,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStatus::Created => "created",
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Error => "error",
            VmStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

fn default_true() -> bool {
    true
}

/// `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmMetadata {
    pub status: VmStatus,
    #[serde(default)]
    pub last_pid: Option<u32>,
    #[serde(default)]
    pub last_command: Option<String>,
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_restart: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_time: Option<DateTime<Utc>>,
    /// Attach the ISO and boot from it on the next start
    #[serde(default = "default_true")]
    pub is_mount_iso: bool,
    #[serde(default)]
    pub installed: bool,
    /// Running from the install medium for the first time
    #[serde(default)]
    pub installing: bool,
    #[serde(default)]
    pub iso_unmount_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub console_endpoint: Option<Endpoint>,
    #[serde(default)]
    pub qmp_endpoint: Option<Endpoint>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl VmMetadata {
    /// Fresh metadata for a newly created VM
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            status: VmStatus::Created,
            last_pid: None,
            last_command: None,
            last_run_time: None,
            last_stop_time: None,
            last_restart: None,
            last_error: None,
            last_error_time: None,
            is_mount_iso: true,
            installed: false,
            installing: false,
            iso_unmount_time: None,
            console_endpoint: None,
            qmp_endpoint: None,
            created_at: now,
            modified_at: now,
        }
    }
}

impl Default for VmMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Request to provision a VM; unset fields take the defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NewVm {
    pub name: String,
    pub memory: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub disk_size: Option<String>,
    pub disk_format: Option<String>,
    pub boot_order: Option<String>,
    pub network: Option<NetworkMode>,
    pub iso_path: Option<PathBuf>,
    pub display: Option<u16>,
    /// Start right after provisioning
    pub start: bool,
}

impl NewVm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Resolve every default once; the disk lands inside `vm_dir`
    pub fn into_config(self, vm_dir: &Path) -> VmConfig {
        let disk_format = self
            .disk_format
            .unwrap_or_else(|| DEFAULT_DISK_FORMAT.to_string());
        let now = Utc::now();
        VmConfig {
            disk_path: vm_dir.join(format!("disk.{}", disk_format)),
            name: self.name,
            memory: self.memory.unwrap_or(DEFAULT_MEMORY_MIB),
            cpu_cores: self.cpu_cores.unwrap_or(DEFAULT_CPU_CORES),
            disk_size: self
                .disk_size
                .unwrap_or_else(|| DEFAULT_DISK_SIZE.to_string()),
            disk_format,
            boot_order: self
                .boot_order
                .unwrap_or_else(|| DEFAULT_BOOT_ORDER.to_string()),
            network: self.network.unwrap_or_default(),
            iso_path: self.iso_path,
            display: self.display.unwrap_or(0),
            created_at: now,
            modified_at: now,
        }
    }
}

/// Partial update to `config.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigPatch {
    pub memory: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub boot_order: Option<String>,
    pub network: Option<NetworkMode>,
    pub iso_path: Option<PathBuf>,
    pub display: Option<u16>,
}

impl ConfigPatch {
    /// Apply to `config`; returns whether anything changed
    pub fn apply(self, config: &mut VmConfig) -> bool {
        let before = config.clone();
        if let Some(memory) = self.memory {
            config.memory = memory;
        }
        if let Some(cpu_cores) = self.cpu_cores {
            config.cpu_cores = cpu_cores;
        }
        if let Some(boot_order) = self.boot_order {
            config.boot_order = boot_order;
        }
        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(iso_path) = self.iso_path {
            config.iso_path = Some(iso_path);
        }
        if let Some(display) = self.display {
            config.display = display;
        }

        let changed = *config != before;
        if changed {
            config.modified_at = Utc::now();
        }
        changed
    }
}

/// Result of `update_config`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub config: VmConfig,
    /// The VM is running with the old settings
    pub restart_required: bool,
}

/// Persisted documents merged with the live process table
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub name: String,
    pub dir: PathBuf,
    pub config: Option<VmConfig>,
    pub metadata: Option<VmMetadata>,
    /// Derived: `running` when the pid is alive, persisted status otherwise
    pub status: VmStatus,
    pub running: bool,
    pub pid: Option<u32>,
    /// Directory exists but a document is missing or unreadable
    pub partial: bool,
}
