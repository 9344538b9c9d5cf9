//! VM lifecycle through the manager with an emulated host toolchain
//!
//! `FakeHypervisor` stands in for qemu-img, the hypervisor binary, pgrep and
//! ps. Launches "resolve" to a pid chosen by the test; tests that start a VM
//! use this test process's own pid so liveness checks see a real process,
//! and never stop those VMs.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use qemuvisor::command::{CommandOutput, CommandRunner};
use qemuvisor::config::ControlPlaneConfig;
use qemuvisor::vm::{NetworkMode, NewVm, VmManager, VmStatus};
use qemuvisor::{ErrorKind, Result};

struct FakeHypervisor {
    pid: u32,
    fail_disk: AtomicBool,
    broken_binary: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeHypervisor {
    fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            fail_disk: AtomicBool::new(false),
            broken_binary: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn launches(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("qemu-system-x86_64 ") && !c.ends_with("--version"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeHypervisor {
    async fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", program, args.join(" ")));
        let parts: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = match (program, parts.as_slice()) {
            ("qemu-img", ["create", "-f", _, path, _]) => {
                if self.fail_disk.load(Ordering::SeqCst) {
                    CommandOutput::failed(1, "qemu-img: disk.qcow2: Could not create image: No space left on device")
                } else {
                    std::fs::write(path, b"QFI\xfb").unwrap();
                    CommandOutput::ok(format!("Formatting '{}', fmt=qcow2", path))
                }
            }
            ("qemu-img", ["info", "--output=json", path]) => CommandOutput::ok(
                json!({
                    "filename": path,
                    "format": "qcow2",
                    "virtual-size": 21_474_836_480u64,
                    "actual-size": 200_704u64,
                    "dirty-flag": false,
                })
                .to_string(),
            ),
            ("qemu-system-x86_64", _) if self.broken_binary.load(Ordering::SeqCst) => {
                CommandOutput::failed(1, "qemu-system-x86_64: error while loading shared libraries")
            }
            ("qemu-system-x86_64", ["--version"]) => {
                CommandOutput::ok("QEMU emulator version 8.2.2\nCopyright (c) 2003-2023\n")
            }
            ("qemu-system-x86_64", _) => CommandOutput::ok(""),
            ("pgrep", _) => CommandOutput::ok(format!("{}\n", self.pid)),
            ("ps", _) => CommandOutput::ok("  1.5  3.2 123456\n"),
            ("ip", ["link", "show"]) => CommandOutput::ok(
                "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\n    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00\n",
            ),
            ("ip", ["addr", "show"]) => CommandOutput::ok(
                "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN group default qlen 1000\n    inet 127.0.0.1/8 scope host lo\n",
            ),
            (other, _) => CommandOutput::failed(127, format!("{}: not emulated", other)),
        };
        Ok(output)
    }
}

fn config(root: &Path) -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.storage_dir = root.join("vms");
    config.snapshot_dir = root.join("snapshots");
    config.hypervisor.accel_device = root.join("no-kvm");
    config.lifecycle.stop_grace_ms = 200;
    config.lifecycle.stop_poll_ms = 10;
    config.lifecycle.restart_settle_ms = 0;
    config.console.command_timeout_ms = 2_000;
    config.console.settle_delay_ms = 10;
    config
}

fn manager(root: &Path, host: &Arc<FakeHypervisor>) -> VmManager {
    let runner: Arc<dyn CommandRunner> = host.clone();
    VmManager::new(config(root), runner)
}

fn own_pid() -> u32 {
    std::process::id()
}

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_create_directory_writes_exactly_two_documents() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);

    let vm_dir = manager.store().vm_dir("alpine");
    let config = NewVm::new("alpine").into_config(&vm_dir);
    let (_, metadata) = manager.create_directory("alpine", &config).await.unwrap();

    assert_eq!(metadata.status, VmStatus::Created);
    assert_eq!(dir_entries(&vm_dir), vec!["config.json", "metadata.json"]);

    let err = manager
        .create_directory("alpine", &config)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_create_vm_provisions_disk_and_documents() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);

    let mut request = NewVm::new("debian");
    request.memory = Some(4096);
    let created = manager.create_vm(request).await.unwrap();

    assert!(created.started.is_none());
    assert_eq!(created.disk.virtual_size, 21_474_836_480);
    assert_eq!(created.record.status, VmStatus::Created);
    assert!(!created.record.running);
    assert!(!created.record.partial);
    let config = created.record.config.unwrap();
    assert_eq!(config.memory, 4096);
    assert_eq!(config.cpu_cores, 2);
    assert_eq!(config.disk_path, created.record.dir.join("disk.qcow2"));
    assert_eq!(
        dir_entries(&created.record.dir),
        vec!["config.json", "disk.qcow2", "metadata.json"]
    );

    let err = manager.create_vm(NewVm::new("debian")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_failed_disk_creation_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    host.fail_disk.store(true, Ordering::SeqCst);
    let manager = manager(dir.path(), &host);

    let err = manager.create_vm(NewVm::new("debian")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(!manager.store().vm_dir("debian").exists());
}

#[tokio::test]
async fn test_invalid_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);

    let err = manager.create_vm(NewVm::new("../escape")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert!(host.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_start_records_process_and_refuses_second_start() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);

    let mut request = NewVm::new("web");
    request.display = Some(3);
    request.network = Some(NetworkMode::User {
        port_forwards: vec![qemuvisor::vm::PortForward {
            host_port: 8080,
            guest_port: 80,
            protocol: qemuvisor::network::Protocol::Tcp,
        }],
    });
    request.start = true;
    let created = manager.create_vm(request).await.unwrap();

    let started = created.started.unwrap();
    assert_eq!(started.pid, own_pid());
    assert_eq!(started.vnc_port, 5903);
    assert!(!started.boots_from_iso);
    assert!(started.command.contains("-name web"));
    assert!(started.command.contains("hostfwd=tcp::8080-:80"));
    assert!(!started.command.contains("-enable-kvm"));
    assert_eq!(host.launches().len(), 1);

    let info = manager.info("web").await.unwrap();
    assert!(info.running);
    assert_eq!(info.status, VmStatus::Running);
    assert_eq!(info.pid, Some(own_pid()));
    let metadata = info.metadata.unwrap();
    assert_eq!(metadata.last_pid, Some(own_pid()));
    assert!(metadata.last_run_time.is_some());
    assert_eq!(metadata.last_command.as_deref(), Some(started.command.as_str()));

    let err = manager.start_by_name("web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(host.launches().len(), 1);

    let stats = manager.process_stats("web").await.unwrap();
    assert_eq!(stats.rss_kib, 123_456);
}

#[tokio::test]
async fn test_running_vm_is_adopted_by_a_fresh_manager() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let first = manager(dir.path(), &host);
    let mut request = NewVm::new("web");
    request.start = true;
    first.create_vm(request).await.unwrap();

    // A new manager process starts with an empty process table
    let second = manager(dir.path(), &host);
    assert!(second.registry().is_empty().await);
    assert!(second.is_running("web").await.unwrap());
    let handle = second.registry().get("web").await.unwrap();
    assert!(handle.adopted);
    assert_eq!(handle.pid, own_pid());
}

#[tokio::test]
async fn test_stale_running_record_reports_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);
    manager.create_vm(NewVm::new("ghost")).await.unwrap();

    // Claims to be running under a pid that cannot exist
    manager
        .store()
        .update_metadata("ghost", |m| {
            m.status = VmStatus::Running;
            m.last_pid = Some(i32::MAX as u32);
        })
        .await
        .unwrap();

    let info = manager.info("ghost").await.unwrap();
    assert!(!info.running);
    assert_eq!(info.status, VmStatus::Stopped);
    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn test_stop_signals_process_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);
    manager.create_vm(NewVm::new("worker")).await.unwrap();

    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();

    manager.stop("worker", Some(pid)).await.unwrap();
    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(sigterm()));

    // Process already gone: still succeeds and keeps the stopped record
    manager.stop("worker", Some(pid)).await.unwrap();
    manager.stop("worker", None).await.unwrap();

    let metadata = manager.store().read_metadata("worker").await.unwrap().unwrap();
    assert_eq!(metadata.status, VmStatus::Stopped);
    assert!(metadata.last_stop_time.is_some());
    assert!(!metadata.installing);

    let err = manager.stop("missing", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

fn sigterm() -> i32 {
    nix::sys::signal::Signal::SIGTERM as i32
}

/// Block until `pid` has exec'd into `comm`
fn wait_for_exec(pid: u32, comm: &str) {
    let path = format!("/proc/{}/comm", pid);
    for _ in 0..200 {
        if std::fs::read_to_string(&path).map(|c| c.trim() == comm).unwrap_or(false) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("pid {} never became {}", pid, comm);
}

#[tokio::test]
async fn test_restart_escalates_to_sigkill_and_starts_again() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);
    manager.create_vm(NewVm::new("stubborn")).await.unwrap();

    let mut child = std::process::Command::new("sh")
        .args(["-c", "trap '' TERM; exec sleep 30"])
        .spawn()
        .unwrap();
    let pid = child.id();
    wait_for_exec(pid, "sleep");
    // Reap as soon as it dies so liveness polling sees it gone
    let reaper = std::thread::spawn(move || child.wait().unwrap());

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        manager.restart("stubborn", Some(pid)),
    )
    .await
    .unwrap()
    .unwrap();

    let status = reaper.join().unwrap();
    assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGKILL as i32));
    assert_eq!(outcome.pid, own_pid());
    assert_eq!(host.launches().len(), 1);

    let metadata = manager.store().read_metadata("stubborn").await.unwrap().unwrap();
    assert_eq!(metadata.status, VmStatus::Running);
    assert_eq!(metadata.last_pid, Some(own_pid()));
    assert!(metadata.last_stop_time.is_some());
    assert!(metadata.last_restart.is_some());
}

#[tokio::test]
async fn test_start_without_disk_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);

    let vm_dir = manager.store().vm_dir("diskless");
    let config = NewVm::new("diskless").into_config(&vm_dir);
    manager.create_directory("diskless", &config).await.unwrap();

    let err = manager.start_by_name("diskless").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(host.launches().is_empty());
}

#[tokio::test]
async fn test_start_on_missing_bridge_is_precondition_failure() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);

    let mut request = NewVm::new("bridged");
    request.network = Some(NetworkMode::Bridge {
        bridge: "br-absent".to_string(),
    });
    manager.create_vm(request).await.unwrap();

    let err = manager.start_by_name("bridged").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert!(host.launches().is_empty());
}

#[tokio::test]
async fn test_failed_restart_is_recorded_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);
    manager.create_vm(NewVm::new("flaky")).await.unwrap();
    host.broken_binary.store(true, Ordering::SeqCst);

    let err = manager.restart("flaky", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    let metadata = manager.store().read_metadata("flaky").await.unwrap().unwrap();
    assert_eq!(metadata.status, VmStatus::Error);
    assert!(metadata.last_error.is_some());
    assert!(metadata.last_error_time.is_some());
}

#[tokio::test]
async fn test_restart_of_stopped_vm_starts_it() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);
    manager.create_vm(NewVm::new("cold")).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), manager.restart("cold", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.pid, own_pid());

    let metadata = manager.store().read_metadata("cold").await.unwrap().unwrap();
    assert_eq!(metadata.status, VmStatus::Running);
    assert!(metadata.last_restart.is_some());
}

#[tokio::test]
async fn test_iso_toggle_on_stopped_vm() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);

    manager.create_vm(NewVm::new("no-media")).await.unwrap();
    let err = manager.toggle_iso_mount("no-media", true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let iso: PathBuf = dir.path().join("installer.iso");
    std::fs::write(&iso, b"CD001").unwrap();
    let mut request = NewVm::new("installer");
    request.iso_path = Some(iso);
    manager.create_vm(request).await.unwrap();

    let metadata = manager.toggle_iso_mount("installer", false).await.unwrap();
    assert!(!metadata.is_mount_iso);
    assert!(metadata.installed);
    assert!(metadata.iso_unmount_time.is_some());

    let metadata = manager.toggle_iso_mount("installer", true).await.unwrap();
    assert!(metadata.is_mount_iso);
}

const MONITOR_BANNER: &str = "QEMU 8.2.2 monitor - type 'help' for more information\r\n(qemu) ";

/// Text monitor on `path` that fails every command while `reject` is set
fn spawn_monitor(path: &Path, reject: Arc<AtomicBool>) -> Arc<Mutex<Vec<String>>> {
    let listener = UnixListener::bind(path).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&received);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = Arc::clone(&log);
            let reject = Arc::clone(&reject);
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                write.write_all(MONITOR_BANNER.as_bytes()).await.unwrap();

                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let command = line.trim_end().to_string();
                log.lock().unwrap().push(command.clone());

                let reply = if reject.load(Ordering::SeqCst) {
                    format!("{}\r\nDevice 'ide1-cd0' not found\r\n(qemu) ", command)
                } else {
                    format!("{}\r\n(qemu) ", command)
                };
                let _ = write.write_all(reply.as_bytes()).await;

                let mut rest = String::new();
                let _ = reader.read_line(&mut rest).await;
            });
        }
    });

    received
}

#[tokio::test]
async fn test_iso_toggle_on_running_vm_goes_through_console() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);

    let iso: PathBuf = dir.path().join("installer.iso");
    std::fs::write(&iso, b"CD001").unwrap();
    let mut request = NewVm::new("live");
    request.iso_path = Some(iso.clone());
    request.start = true;
    let created = manager.create_vm(request).await.unwrap();
    let disk_path = created.record.config.unwrap().disk_path;

    // Start clears stale sockets, so the monitor comes up afterwards
    let reject = Arc::new(AtomicBool::new(true));
    let received = spawn_monitor(
        &created.record.dir.join("monitor.sock"),
        Arc::clone(&reject),
    );

    let before = manager.store().read_metadata("live").await.unwrap().unwrap();
    assert!(before.is_mount_iso);

    let err = manager.toggle_iso_mount("live", false).await.unwrap_err();
    assert!(matches!(err, qemuvisor::Error::Protocol(_)));
    let unchanged = manager.store().read_metadata("live").await.unwrap().unwrap();
    assert!(unchanged.is_mount_iso);
    assert!(unchanged.iso_unmount_time.is_none());
    assert_eq!(unchanged.installed, before.installed);

    reject.store(false, Ordering::SeqCst);
    let ejected = manager.toggle_iso_mount("live", false).await.unwrap();
    assert!(!ejected.is_mount_iso);
    assert!(ejected.installed);
    assert!(ejected.iso_unmount_time.is_some());

    let mounted = manager.toggle_iso_mount("live", true).await.unwrap();
    assert!(mounted.is_mount_iso);

    assert_eq!(
        *received.lock().unwrap(),
        vec![
            "eject -f ide1-cd0".to_string(),
            "eject -f ide1-cd0".to_string(),
            format!("change ide1-cd0 {}", iso.display()),
        ]
    );
    let config = manager.store().config("live").await.unwrap();
    assert_eq!(config.disk_path, disk_path);
    assert_eq!(config.iso_path, Some(iso));
}

#[tokio::test]
async fn test_list_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);
    manager.create_vm(NewVm::new("beta")).await.unwrap();
    manager.create_vm(NewVm::new("alpha")).await.unwrap();

    let names: Vec<String> = manager
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    let kept = manager.delete("beta", false).await.unwrap();
    assert!(!kept.dir_removed);
    assert!(kept.dir.exists());

    let purged = manager.delete("alpha", true).await.unwrap();
    assert!(purged.dir_removed);
    assert!(!purged.dir.exists());
    assert_eq!(
        manager.delete("alpha", true).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_running_only_operations_need_a_process() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHypervisor::new(own_pid());
    let manager = manager(dir.path(), &host);
    manager.create_vm(NewVm::new("idle")).await.unwrap();

    assert_eq!(
        manager.console("idle").await.unwrap_err().kind(),
        ErrorKind::PreconditionFailed
    );
    assert_eq!(
        manager.snapshots("idle").await.err().unwrap().kind(),
        ErrorKind::PreconditionFailed
    );
    assert_eq!(
        manager.console("nobody").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}
