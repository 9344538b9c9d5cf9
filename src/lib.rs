//! qemuvisor - control plane for QEMU guests
//!
//! This library drives already-installed QEMU binaries on a Linux host: it
//! launches and tracks guest processes, talks to both monitor sockets, runs
//! snapshot sequences over the text console and wires guest networking
//! through the host's `ip`, `iptables` and `tc` tools.
//!
//! # Modules
//!
//! - `vm` - VM records, launch arguments and process lifecycle
//! - `monitor` - HMP text console and QMP JSON clients
//! - `snapshot` - internal snapshot create/load/delete/rename
//! - `network` - bridges, taps, port forwards, shaping, interface stats
//! - `command` - subprocess seam shared by `vm` and `network`
//! - `config` - TOML configuration with defaults
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - log and OpenTelemetry initialization
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use qemuvisor::{ControlPlaneConfig, NewVm, SystemRunner, VmManager};
//!
//! let manager = VmManager::new(ControlPlaneConfig::default(), Arc::new(SystemRunner));
//! let created = manager.create_vm(NewVm::new("debian")).await?;
//! let started = manager.start_by_name(&created.record.name).await?;
//!
//! let snapshots = manager.snapshots("debian").await?;
//! snapshots.create("fresh-install", "before first boot").await?;
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod network;
pub mod snapshot;
pub mod tracing;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use config::ControlPlaneConfig;
pub use error::{Error, ErrorKind, Result};
pub use monitor::{Console, ConsoleClient, Endpoint, QmpClient};
pub use network::NetworkFabric;
pub use snapshot::SnapshotOrchestrator;
pub use vm::{NewVm, ProcessRegistry, VmConfig, VmManager};
