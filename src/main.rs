//! qemuvisor CLI - thin shell over the control-plane library
//!
//! Every subcommand maps onto one library call and prints its result as JSON.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use serde::Serialize;

use qemuvisor::config::ControlPlaneConfig;
use qemuvisor::network::{BridgeRequest, DhcpRange, PortForwardRule, Protocol, ShapingPolicy};
use qemuvisor::snapshot::{ListQuery, SortKey, SortOrder};
use qemuvisor::tracing::{init_tracing, shutdown_tracing};
use qemuvisor::vm::{NetworkMode, NewVm, PortForward};
use qemuvisor::{SystemRunner, VmManager};

type CliResult<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "qemuvisor", version, about = "Control plane for QEMU guests")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "QEMUVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage VM records and processes
    #[command(subcommand)]
    Vm(VmCommand),
    /// Internal snapshots of a running VM
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Host bridges, taps, forwards and shaping
    #[command(subcommand)]
    Net(NetCommand),
    /// Query a running VM over QMP
    #[command(subcommand)]
    Qmp(QmpCommand),
    /// Print metrics in the Prometheus text format
    Metrics,
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum VmCommand {
    Create(CreateArgs),
    Start { name: String },
    Stop {
        name: String,
        #[arg(long)]
        pid: Option<u32>,
    },
    Restart {
        name: String,
        #[arg(long)]
        pid: Option<u32>,
    },
    Delete {
        name: String,
        /// Also remove the VM directory
        #[arg(long)]
        purge: bool,
    },
    List,
    Info { name: String },
    /// Attach or eject the install ISO
    Iso {
        name: String,
        #[arg(value_enum)]
        action: IsoAction,
    },
    /// Resource usage of the running process
    Stats { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum IsoAction {
    Mount,
    Eject,
}

#[derive(Clone, Copy, ValueEnum)]
enum NetworkKind {
    User,
    Bridge,
    Tap,
    None,
}

#[derive(Args)]
struct CreateArgs {
    name: String,
    /// MiB
    #[arg(long)]
    memory: Option<u32>,
    #[arg(long)]
    cpus: Option<u32>,
    #[arg(long)]
    disk_size: Option<String>,
    #[arg(long)]
    disk_format: Option<String>,
    #[arg(long)]
    boot: Option<String>,
    #[arg(long)]
    iso: Option<PathBuf>,
    #[arg(long)]
    display: Option<u16>,
    #[arg(long, value_enum, default_value = "user")]
    network: NetworkKind,
    /// Bridge device for bridge/tap networking
    #[arg(long)]
    bridge: Option<String>,
    /// Tap device for tap networking
    #[arg(long)]
    tap: Option<String>,
    /// Host forward as HOST:GUEST[/udp], repeatable
    #[arg(long = "forward", value_parser = parse_forward)]
    forwards: Vec<PortForward>,
    /// Start the VM once provisioned
    #[arg(long)]
    start: bool,
}

#[derive(Subcommand)]
enum SnapshotCommand {
    Create {
        vm: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Load { vm: String, name: String },
    Delete { vm: String, name: String },
    Rename {
        vm: String,
        old: String,
        new: String,
        #[arg(long)]
        description: Option<String>,
    },
    List {
        vm: String,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, value_enum, default_value = "created-at")]
        sort: SortArg,
        #[arg(long, value_enum, default_value = "desc")]
        order: OrderArg,
    },
    Show { vm: String, name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    CreatedAt,
    Name,
    Size,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Asc,
    Desc,
}

#[derive(Subcommand)]
enum NetCommand {
    BridgeCreate {
        name: String,
        #[arg(long)]
        ip: Ipv4Addr,
        #[arg(long, default_value = "255.255.255.0")]
        netmask: Ipv4Addr,
        /// First DHCP address; enables the dnsmasq config together with --dhcp-end
        #[arg(long, requires = "dhcp_end")]
        dhcp_start: Option<Ipv4Addr>,
        #[arg(long, requires = "dhcp_start")]
        dhcp_end: Option<Ipv4Addr>,
        #[arg(long)]
        lease: Option<String>,
    },
    BridgeDelete { name: String },
    Bridges,
    TapCreate {
        name: String,
        #[arg(long)]
        bridge: Option<String>,
    },
    TapDelete { name: String },
    Taps,
    Interfaces,
    Stats { name: Option<String> },
    Forward(ForwardArgs),
    Unforward(ForwardArgs),
    Shape {
        interface: String,
        #[arg(long, default_value = "100mbit")]
        bandwidth: String,
        #[arg(long, default_value = "0ms")]
        delay: String,
        #[arg(long, default_value = "0%")]
        loss: String,
    },
}

#[derive(Args)]
struct ForwardArgs {
    #[arg(long)]
    host_port: u16,
    #[arg(long)]
    guest_ip: Ipv4Addr,
    #[arg(long)]
    guest_port: u16,
    #[arg(long, default_value = "tcp")]
    protocol: Protocol,
}

impl From<ForwardArgs> for PortForwardRule {
    fn from(args: ForwardArgs) -> Self {
        PortForwardRule {
            host_port: args.host_port,
            guest_ip: args.guest_ip,
            guest_port: args.guest_port,
            protocol: args.protocol,
        }
    }
}

#[derive(Subcommand)]
enum QmpCommand {
    Status { vm: String },
    /// Stream events until `count` have arrived
    Events {
        vm: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

fn parse_forward(value: &str) -> std::result::Result<PortForward, String> {
    let (ports, protocol) = match value.split_once('/') {
        Some((ports, proto)) => (ports, proto.parse::<Protocol>().map_err(|e| e.to_string())?),
        None => (value, Protocol::Tcp),
    };
    let (host, guest) = ports
        .split_once(':')
        .ok_or_else(|| format!("expected HOST:GUEST, got {:?}", value))?;
    Ok(PortForward {
        host_port: host.parse().map_err(|_| format!("invalid host port {:?}", host))?,
        guest_port: guest.parse().map_err(|_| format!("invalid guest port {:?}", guest))?,
        protocol,
    })
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match ControlPlaneConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    };
    if cli.json_logs {
        config.logging.json = true;
    }

    if let Err(e) = init_tracing("qemuvisor", &config.logging) {
        eprintln!("warning: logging disabled: {}", e);
    }

    let result = run(cli.command, config).await;
    shutdown_tracing();

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: ControlPlaneConfig) -> CliResult {
    match command {
        Commands::Metrics => {
            print!("{}", qemuvisor::metrics::gather_text());
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        other => {
            let manager = VmManager::new(config, Arc::new(SystemRunner));
            match other {
                Commands::Vm(cmd) => run_vm(&manager, cmd).await,
                Commands::Snapshot(cmd) => run_snapshot(&manager, cmd).await,
                Commands::Net(cmd) => run_net(&manager, cmd).await,
                Commands::Qmp(cmd) => run_qmp(&manager, cmd).await,
                Commands::Metrics | Commands::Config => Ok(()),
            }
        }
    }
}

async fn run_vm(manager: &VmManager, command: VmCommand) -> CliResult {
    match command {
        VmCommand::Create(args) => {
            let network = match args.network {
                NetworkKind::User => NetworkMode::User {
                    port_forwards: args.forwards,
                },
                NetworkKind::Bridge => NetworkMode::Bridge {
                    bridge: args.bridge.ok_or("--bridge is required for bridge networking")?,
                },
                NetworkKind::Tap => NetworkMode::Tap {
                    tap: args.tap.ok_or("--tap is required for tap networking")?,
                    bridge: args.bridge,
                },
                NetworkKind::None => NetworkMode::None,
            };
            let request = NewVm {
                name: args.name,
                memory: args.memory,
                cpu_cores: args.cpus,
                disk_size: args.disk_size,
                disk_format: args.disk_format,
                boot_order: args.boot,
                network: Some(network),
                iso_path: args.iso,
                display: args.display,
                start: args.start,
            };
            print_json(&manager.create_vm(request).await?)
        }
        VmCommand::Start { name } => print_json(&manager.start_by_name(&name).await?),
        VmCommand::Stop { name, pid } => {
            manager.stop(&name, pid).await?;
            print_json(&manager.info(&name).await?)
        }
        VmCommand::Restart { name, pid } => print_json(&manager.restart(&name, pid).await?),
        VmCommand::Delete { name, purge } => print_json(&manager.delete(&name, purge).await?),
        VmCommand::List => print_json(&manager.list_all().await?),
        VmCommand::Info { name } => print_json(&manager.info(&name).await?),
        VmCommand::Iso { name, action } => {
            let mount = matches!(action, IsoAction::Mount);
            print_json(&manager.toggle_iso_mount(&name, mount).await?)
        }
        VmCommand::Stats { name } => print_json(&manager.process_stats(&name).await?),
    }
}

async fn run_snapshot(manager: &VmManager, command: SnapshotCommand) -> CliResult {
    match command {
        SnapshotCommand::Create {
            vm,
            name,
            description,
        } => print_json(&manager.snapshots(&vm).await?.create(&name, &description).await?),
        SnapshotCommand::Load { vm, name } => {
            print_json(&manager.snapshots(&vm).await?.load(&name).await?)
        }
        SnapshotCommand::Delete { vm, name } => {
            manager.snapshots(&vm).await?.delete(&name).await?;
            Ok(())
        }
        SnapshotCommand::Rename {
            vm,
            old,
            new,
            description,
        } => {
            let orchestrator = manager.snapshots(&vm).await?;
            print_json(&orchestrator.rename(&old, &new, description.as_deref()).await?)
        }
        SnapshotCommand::List {
            vm,
            page,
            limit,
            sort,
            order,
        } => {
            let query = ListQuery {
                page,
                limit,
                sort_by: match sort {
                    SortArg::CreatedAt => SortKey::CreatedAt,
                    SortArg::Name => SortKey::Name,
                    SortArg::Size => SortKey::Size,
                },
                order: match order {
                    OrderArg::Asc => SortOrder::Asc,
                    OrderArg::Desc => SortOrder::Desc,
                },
            };
            print_json(&manager.snapshots(&vm).await?.list(&query).await?)
        }
        SnapshotCommand::Show { vm, name } => {
            print_json(&manager.snapshots(&vm).await?.detail(&name).await?)
        }
    }
}

async fn run_net(manager: &VmManager, command: NetCommand) -> CliResult {
    let fabric = manager.fabric();
    match command {
        NetCommand::BridgeCreate {
            name,
            ip,
            netmask,
            dhcp_start,
            dhcp_end,
            lease,
        } => {
            let mut request = BridgeRequest::new(name, ip, netmask);
            if let (Some(start), Some(end)) = (dhcp_start, dhcp_end) {
                request.dhcp = Some(DhcpRange { start, end, lease });
            }
            print_json(&fabric.create_bridge(request).await?)
        }
        NetCommand::BridgeDelete { name } => Ok(fabric.delete_bridge(&name).await?),
        NetCommand::Bridges => print_json(&fabric.get_bridges().await?),
        NetCommand::TapCreate { name, bridge } => {
            print_json(&fabric.create_tap(&name, bridge.as_deref()).await?)
        }
        NetCommand::TapDelete { name } => Ok(fabric.delete_tap(&name).await?),
        NetCommand::Taps => print_json(&fabric.get_tap_interfaces().await?),
        NetCommand::Interfaces => print_json(&fabric.get_all_interfaces().await?),
        NetCommand::Stats { name: Some(name) } => {
            print_json(&fabric.get_network_stats(&name).await?)
        }
        NetCommand::Stats { name: None } => print_json(&fabric.get_all_network_stats().await?),
        NetCommand::Forward(args) => Ok(fabric.setup_port_forward(&args.into()).await?),
        NetCommand::Unforward(args) => Ok(fabric.remove_port_forward(&args.into()).await?),
        NetCommand::Shape {
            interface,
            bandwidth,
            delay,
            loss,
        } => {
            let policy = ShapingPolicy {
                bandwidth,
                delay,
                loss,
            };
            Ok(fabric.setup_traffic_control(&interface, &policy).await?)
        }
    }
}

async fn run_qmp(manager: &VmManager, command: QmpCommand) -> CliResult {
    match command {
        QmpCommand::Status { vm } => {
            let client = manager.qmp(&vm).await?;
            let status = client.query_status().await;
            client.close().await;
            print_json(&status?)
        }
        QmpCommand::Events { vm, count } => {
            let client = manager.qmp(&vm).await?;
            let mut events = Box::pin(client.events()).take(count);
            while let Some(event) = events.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            client.close().await;
            Ok(())
        }
    }
}
