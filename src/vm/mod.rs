//! QEMU guest lifecycle
//!
//! This module provides:
//! - Persisted VM documents (`config.json`, `metadata.json`)
//! - The live process table and its reconciliation against pids
//! - Launch argument construction and process plumbing
//! - [`VmManager`], the entry point for every lifecycle operation

pub mod config;
pub mod handle;
pub mod lifecycle;
pub mod manager;
pub mod store;

pub use config::{
    ConfigPatch, ConfigUpdate, NetworkMode, NewVm, PortForward, VmConfig, VmMetadata, VmRecord,
    VmStatus,
};
pub use handle::{ProcessHandle, ProcessRegistry};
pub use lifecycle::{build_launch_args, DiskInfo, LaunchPlan, ProcessStats};
pub use manager::{CreatedVm, DeleteOutcome, StartOutcome, VmManager};
pub use store::VmStore;
