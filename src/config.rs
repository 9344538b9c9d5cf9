//! Control-plane configuration
//!
//! One structure, loaded once from TOML at startup, carries every tunable the
//! core uses: paths, binaries, protocol timeouts and the settle intervals the
//! snapshot and restart sequences wait on. Missing keys fall back to the
//! defaults below, so an empty file (or no file at all) is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Root holding one working directory per VM
    pub storage_dir: PathBuf,
    /// Directory holding one snapshot index document per VM
    pub snapshot_dir: PathBuf,
    pub hypervisor: HypervisorConfig,
    pub console: ConsoleConfig,
    pub qmp: QmpConfig,
    pub lifecycle: LifecycleConfig,
    pub snapshot: SnapshotConfig,
    pub network: FabricConfig,
    pub logging: LoggingConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./vm-storage"),
            snapshot_dir: PathBuf::from("./data/snapshots"),
            hypervisor: HypervisorConfig::default(),
            console: ConsoleConfig::default(),
            qmp: QmpConfig::default(),
            lifecycle: LifecycleConfig::default(),
            snapshot: SnapshotConfig::default(),
            network: FabricConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Reject values that would make the control plane hang or misbehave
    pub fn validate(&self) -> Result<()> {
        if self.hypervisor.binary.trim().is_empty() {
            return Err(Error::Config("hypervisor.binary must not be empty".into()));
        }
        if self.hypervisor.img_binary.trim().is_empty() {
            return Err(Error::Config("hypervisor.img_binary must not be empty".into()));
        }
        if self.console.command_timeout_ms == 0 {
            return Err(Error::Config("console.command_timeout_ms must be > 0".into()));
        }
        if self.qmp.connect_timeout_ms == 0 || self.qmp.command_timeout_ms == 0 {
            return Err(Error::Config("qmp timeouts must be > 0".into()));
        }
        if self.qmp.event_capacity == 0 {
            return Err(Error::Config("qmp.event_capacity must be > 0".into()));
        }
        if self.lifecycle.stop_poll_ms == 0 {
            return Err(Error::Config("lifecycle.stop_poll_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Serialize back to TOML (used by `qemuvisor config` to print the effective config)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// External binaries and devices the lifecycle manager depends on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub binary: String,
    pub img_binary: String,
    /// Hardware acceleration is enabled only when this device exists
    pub accel_device: PathBuf,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            img_binary: "qemu-img".to_string(),
            accel_device: PathBuf::from("/dev/kvm"),
        }
    }
}

/// Text console (HMP) client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub command_timeout_ms: u64,
    /// Pause between the first prompt and writing the command
    pub settle_delay_ms: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 30_000,
            settle_delay_ms: 200,
        }
    }
}

impl ConsoleConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// JSON control channel (QMP) client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QmpConfig {
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Buffered events per subscriber before slow receivers start lagging
    pub event_capacity: usize,
}

impl Default for QmpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            command_timeout_ms: 30_000,
            event_capacity: 64,
        }
    }
}

impl QmpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Stop/restart timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long a SIGTERM'd process gets before SIGKILL during restart
    pub stop_grace_ms: u64,
    pub stop_poll_ms: u64,
    /// Pause between stop and start during restart
    pub restart_settle_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: 10_000,
            stop_poll_ms: 250,
            restart_settle_ms: 3_000,
        }
    }
}

impl LifecycleConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

/// Waits inserted between snapshot console steps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// After `stop`, before `loadvm`
    pub pause_settle_ms: u64,
    /// After `loadvm`, before verification queries
    pub load_verify_delay_ms: u64,
    /// After `savevm`, before measuring the disk image
    pub size_settle_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            pause_settle_ms: 1_000,
            load_verify_delay_ms: 2_000,
            size_settle_ms: 1_000,
        }
    }
}

impl SnapshotConfig {
    /// All waits disabled; handy for driving the orchestrator against mocks
    pub fn immediate() -> Self {
        Self {
            pause_settle_ms: 0,
            load_verify_delay_ms: 0,
            size_settle_ms: 0,
        }
    }

    pub fn pause_settle(&self) -> Duration {
        Duration::from_millis(self.pause_settle_ms)
    }

    pub fn load_verify_delay(&self) -> Duration {
        Duration::from_millis(self.load_verify_delay_ms)
    }

    pub fn size_settle(&self) -> Duration {
        Duration::from_millis(self.size_settle_ms)
    }
}

/// Host network fabric settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Where dnsmasq range files are written for bridges with DHCP
    pub dhcp_config_dir: PathBuf,
    /// Kernel per-interface counter table
    pub net_dev_path: PathBuf,
    /// Gap between the two counter samples used to compute rates
    pub rate_sample_ms: u64,
    pub dns_server: String,
    pub dhcp_lease: String,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            dhcp_config_dir: PathBuf::from("/tmp"),
            net_dev_path: PathBuf::from("/proc/net/dev"),
            rate_sample_ms: 1_000,
            dns_server: "8.8.8.8".to_string(),
            dhcp_lease: "12h".to_string(),
        }
    }
}

impl FabricConfig {
    pub fn rate_sample(&self) -> Duration {
        Duration::from_millis(self.rate_sample_ms)
    }
}

/// Log output settings, consumed by [`crate::tracing::init_tracing`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    pub filter: String,
    pub json: bool,
    /// Export spans over OTLP when set (e.g. "http://localhost:4317")
    pub otlp_endpoint: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,qemuvisor=debug".to_string(),
            json: false,
            otlp_endpoint: None,
        }
    }
}
