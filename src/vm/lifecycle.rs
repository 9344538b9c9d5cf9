//! Hypervisor process plumbing
//!
//! Building the launch command, probing the host, resolving the daemonized
//! pid and signalling it. Everything that execs goes through a
//! [`CommandRunner`]; signals and access checks go straight to `nix`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{access, AccessFlags, Pid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::{NetworkMode, VmConfig, VmMetadata};
use crate::command::{args, display_command, run_checked, CommandRunner};
use crate::error::{Error, Result};
use crate::monitor::Endpoint;

pub const MONITOR_SOCKET: &str = "monitor.sock";
pub const QMP_SOCKET: &str = "qmp.sock";

/// Text console socket of a VM
pub fn monitor_endpoint(vm_dir: &Path) -> Endpoint {
    Endpoint::unix(vm_dir.join(MONITOR_SOCKET))
}

/// QMP socket of a VM
pub fn qmp_endpoint(vm_dir: &Path) -> Endpoint {
    Endpoint::unix(vm_dir.join(QMP_SOCKET))
}

/// Everything needed to exec one VM
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub console_endpoint: Endpoint,
    pub qmp_endpoint: Endpoint,
    /// `-cdrom` attached and boot order forced to `d`
    pub boots_from_iso: bool,
}

impl LaunchPlan {
    pub fn command_line(&self) -> String {
        display_command(&self.program, &self.args)
    }
}

/// Deterministic argument list for `config`
///
/// Same inputs, same output: no clock, no filesystem, no environment.
pub fn build_launch_args(
    binary: &str,
    config: &VmConfig,
    metadata: &VmMetadata,
    vm_dir: &Path,
    accelerate: bool,
) -> LaunchPlan {
    let console_endpoint = monitor_endpoint(vm_dir);
    let qmp_endpoint = qmp_endpoint(vm_dir);

    let mut argv = vec![
        "-name".to_string(),
        config.name.clone(),
        "-m".to_string(),
        config.memory.to_string(),
        "-smp".to_string(),
        config.cpu_cores.to_string(),
        "-drive".to_string(),
        format!(
            "file={},format={}",
            config.disk_path.display(),
            config.disk_format
        ),
        "-vnc".to_string(),
        format!(":{}", config.display),
        "-monitor".to_string(),
        console_endpoint.qemu_arg(),
        "-qmp".to_string(),
        qmp_endpoint.qemu_arg(),
        "-daemonize".to_string(),
    ];

    let iso = config.iso_path.as_ref().filter(|_| metadata.is_mount_iso);
    match iso {
        Some(iso) => {
            argv.push("-cdrom".to_string());
            argv.push(iso.display().to_string());
            argv.push("-boot".to_string());
            argv.push("d".to_string());
        }
        None => {
            argv.push("-boot".to_string());
            argv.push(config.boot_order.clone());
        }
    }

    argv.extend(network_args(&config.network));

    if accelerate {
        argv.push("-enable-kvm".to_string());
    }

    LaunchPlan {
        program: binary.to_string(),
        args: argv,
        console_endpoint,
        qmp_endpoint,
        boots_from_iso: iso.is_some(),
    }
}

fn network_args(mode: &NetworkMode) -> Vec<String> {
    const DEVICE: &str = "virtio-net-pci,netdev=net0";

    let netdev = match mode {
        NetworkMode::None => return args(&["-nic", "none"]),
        NetworkMode::User { port_forwards } => {
            let mut netdev = "user,id=net0".to_string();
            for fwd in port_forwards {
                netdev.push_str(&format!(
                    ",hostfwd={}::{}-:{}",
                    fwd.protocol, fwd.host_port, fwd.guest_port
                ));
            }
            netdev
        }
        NetworkMode::Bridge { bridge } => format!("bridge,id=net0,br={}", bridge),
        NetworkMode::Tap { tap, .. } => {
            format!("tap,id=net0,ifname={},script=no,downscript=no", tap)
        }
    };

    vec![
        "-netdev".to_string(),
        netdev,
        "-device".to_string(),
        DEVICE.to_string(),
    ]
}

/// `<binary> --version`; the first line of output on success
pub async fn probe_hypervisor(runner: &dyn CommandRunner, binary: &str) -> Result<String> {
    let output = runner
        .output(binary, &args(&["--version"]))
        .await
        .map_err(|e| Error::Unavailable(format!("{} is not usable: {}", binary, e)))?;
    if !output.success {
        return Err(Error::Unavailable(format!(
            "{} --version failed: {}",
            binary,
            output.stderr.trim()
        )));
    }
    let version = output.stdout.lines().next().unwrap_or_default().trim().to_string();
    debug!(binary, version = %version, "hypervisor probed");
    Ok(version)
}

/// Check the calling process may read (and optionally write) `path`
pub fn check_access(path: &Path, write: bool, what: &'static str) -> Result<()> {
    let mut flags = AccessFlags::R_OK;
    if write {
        flags |= AccessFlags::W_OK;
    }
    access(path, flags).map_err(|errno| match errno {
        Errno::ENOENT | Errno::ENOTDIR => Error::not_found(what, path.display().to_string()),
        Errno::EACCES | Errno::EPERM | Errno::EROFS => {
            Error::PermissionDenied(format!("{} {}: {}", what, path.display(), errno))
        }
        other => Error::Unavailable(format!("{} {}: {}", what, path.display(), other)),
    })
}

/// Hardware acceleration is used only when the device node exists
pub async fn acceleration_available(device: &Path) -> bool {
    tokio::fs::metadata(device).await.is_ok()
}

/// Run the daemonizing launch; returns once the parent has exited
pub async fn launch(runner: &dyn CommandRunner, plan: &LaunchPlan) -> Result<()> {
    info!(command = %plan.command_line(), "launching hypervisor");
    run_checked(runner, &plan.program, &plan.args).await?;
    Ok(())
}

/// Pattern matching the launched process and nothing with a longer name
pub fn pid_pattern(binary: &str, name: &str) -> String {
    format!(
        "{}.*-name {}( |$)",
        binary.replace('.', "\\."),
        name.replace('.', "\\.")
    )
}

/// Newest process whose command line matches this VM
pub async fn resolve_pid(runner: &dyn CommandRunner, binary: &str, name: &str) -> Result<u32> {
    let pattern = pid_pattern(binary, name);
    let output = runner
        .output("pgrep", &["-n".to_string(), "-f".to_string(), pattern.clone()])
        .await?;
    if !output.success {
        return Err(Error::Unavailable(format!(
            "no process matches {:?} after launch",
            pattern
        )));
    }
    output
        .stdout
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u32>().ok())
        .ok_or_else(|| {
            Error::Unavailable(format!(
                "unparsable pgrep output for {}: {:?}",
                name, output.stdout
            ))
        })
}

/// Signal 0 probe; a process we may not signal still exists
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Deliver `signal` to `pid`; init and process groups are refused
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    if pid <= 1 || pid > i32::MAX as u32 {
        return Err(Error::InvalidInput(format!("refusing to signal pid {}", pid)));
    }
    kill(Pid::from_raw(pid as i32), signal).map_err(|errno| match errno {
        Errno::ESRCH => Error::not_found("process", pid.to_string()),
        Errno::EPERM => Error::PermissionDenied(format!("cannot signal pid {}", pid)),
        other => Error::Unavailable(format!("kill({}, {}): {}", pid, signal, other)),
    })
}

/// Poll until `pid` is gone or `grace` elapses; true when it exited
pub async fn wait_for_exit(pid: u32, grace: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// `qemu-img create -f <format> <path> <size>`
pub async fn create_disk_image(
    runner: &dyn CommandRunner,
    img_binary: &str,
    path: &Path,
    format: &str,
    size: &str,
) -> Result<()> {
    let argv = vec![
        "create".to_string(),
        "-f".to_string(),
        format.to_string(),
        path.display().to_string(),
        size.to_string(),
    ];
    run_checked(runner, img_binary, &argv).await?;
    info!(path = %path.display(), format, size, "disk image created");
    Ok(())
}

/// Subset of `qemu-img info --output=json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiskInfo {
    pub filename: PathBuf,
    pub format: String,
    pub virtual_size: u64,
    #[serde(default)]
    pub actual_size: Option<u64>,
}

pub async fn disk_info(runner: &dyn CommandRunner, img_binary: &str, path: &Path) -> Result<DiskInfo> {
    let argv = vec![
        "info".to_string(),
        "--output=json".to_string(),
        path.display().to_string(),
    ];
    let output = run_checked(runner, img_binary, &argv).await?;
    Ok(serde_json::from_str(&output.stdout)?)
}

/// Resource usage of a running VM process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStats {
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub rss_kib: u64,
}

/// `ps -o %cpu=,%mem=,rss= -p <pid>`
pub async fn process_stats(runner: &dyn CommandRunner, pid: u32) -> Result<ProcessStats> {
    let mut argv = args(&["-o", "%cpu=,%mem=,rss=", "-p"]);
    argv.push(pid.to_string());
    let output = runner.output("ps", &argv).await?;
    if !output.success {
        return Err(Error::not_found("process", pid.to_string()));
    }
    parse_ps_line(pid, &output.stdout)
}

fn parse_ps_line(pid: u32, stdout: &str) -> Result<ProcessStats> {
    let fields: Vec<&str> = stdout.split_whitespace().collect();
    let parsed = match fields.as_slice() {
        [cpu, mem, rss, ..] => cpu
            .parse::<f64>()
            .ok()
            .zip(mem.parse::<f64>().ok())
            .zip(rss.parse::<u64>().ok()),
        _ => None,
    };
    let ((cpu_percent, memory_percent), rss_kib) = parsed
        .ok_or_else(|| Error::Protocol(format!("unexpected ps output: {:?}", stdout.trim())))?;
    Ok(ProcessStats {
        pid,
        cpu_percent,
        memory_percent,
        rss_kib,
    })
}
