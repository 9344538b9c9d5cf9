//! Prometheus metrics for the control plane
//!
//! Counters are bumped by the lifecycle manager, both monitor clients, the
//! snapshot orchestrator and every host command the fabric shells out to.
//! `gather_text()` renders the default registry in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // VM Lifecycle Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Lifecycle operations by kind and outcome.
    ///
    /// Labels:
    /// - operation: "create", "start", "stop", "restart", "delete", "iso"
    /// - outcome: "ok" or "error"
    pub static ref VM_LIFECYCLE: CounterVec = register_counter_vec!(
        "qemuvisor_vm_lifecycle_total",
        "VM lifecycle operations by outcome",
        &["operation", "outcome"]
    ).expect("failed to register VM_LIFECYCLE metric");

    /// VMs currently tracked as running in the process registry.
    pub static ref VMS_RUNNING: Gauge = register_gauge!(
        "qemuvisor_vms_running",
        "VMs currently tracked as running"
    ).expect("failed to register VMS_RUNNING metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Monitor Channel Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Console commands issued.
    ///
    /// Labels:
    /// - kind: "long" for savevm/loadvm/delvm/migrate, "short" otherwise
    /// - outcome: "ok", "error" or "timeout"
    pub static ref CONSOLE_COMMANDS: CounterVec = register_counter_vec!(
        "qemuvisor_console_commands_total",
        "Text console commands by outcome",
        &["kind", "outcome"]
    ).expect("failed to register CONSOLE_COMMANDS metric");

    /// Wall time from connect to cleaned response.
    pub static ref CONSOLE_COMMAND_DURATION: HistogramVec = register_histogram_vec!(
        "qemuvisor_console_command_duration_seconds",
        "Text console round-trip time",
        &["kind"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).expect("failed to register CONSOLE_COMMAND_DURATION metric");

    pub static ref QMP_COMMANDS: CounterVec = register_counter_vec!(
        "qemuvisor_qmp_commands_total",
        "QMP commands by outcome",
        &["command", "outcome"]
    ).expect("failed to register QMP_COMMANDS metric");

    pub static ref QMP_EVENTS: CounterVec = register_counter_vec!(
        "qemuvisor_qmp_events_total",
        "Asynchronous QMP events received",
        &["event"]
    ).expect("failed to register QMP_EVENTS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Snapshot & Host Tooling Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    pub static ref SNAPSHOT_OPERATIONS: CounterVec = register_counter_vec!(
        "qemuvisor_snapshot_operations_total",
        "Snapshot operations by outcome",
        &["operation", "outcome"]
    ).expect("failed to register SNAPSHOT_OPERATIONS metric");

    /// Host tool invocations (ip, tc, iptables, qemu-img, pgrep, ...).
    pub static ref HOST_COMMANDS: CounterVec = register_counter_vec!(
        "qemuvisor_host_commands_total",
        "Host tool invocations by outcome",
        &["program", "outcome"]
    ).expect("failed to register HOST_COMMANDS metric");
}

/// Label value for a result
pub fn outcome<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
