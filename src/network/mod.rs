//! Host network fabric for guest networking
//!
//! Bridges, taps, NAT port forwards and traffic shaping are all done by
//! shelling out to `ip`, `iptables` and `tc`; interface state is read back
//! by parsing `ip link show` / `ip addr show` and `/proc/net/dev`.
//!
//! The OS is always authoritative. [`NetworkFabric`] keeps a small cache of
//! bridges and taps it created (creation time, requested bridge) but every
//! precondition is checked against live `ip` output.

pub mod fabric;
pub mod parse;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use fabric::NetworkFabric;
pub use parse::{cidr_from_netmask, extract_primary_ip, format_bytes, parse_interface_list};

/// Transport protocol for a port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::InvalidInput(format!("unknown protocol {other:?}"))),
        }
    }
}

/// Interface class inferred from naming convention and link flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Bridge,
    Tap,
    Loopback,
    Wireless,
    Ethernet,
    Virtual,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "inet")]
    Ipv4,
    #[serde(rename = "inet6")]
    Ipv6,
}

/// One `inet`/`inet6` line of `ip addr show`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub family: AddressFamily,
    /// Address with prefix length, e.g. "192.168.50.1/24"
    pub address: String,
    pub scope: Option<String>,
    pub flags: Vec<String>,
}

impl InterfaceAddress {
    /// Address without the prefix length
    pub fn ip(&self) -> &str {
        self.address.split('/').next().unwrap_or(&self.address)
    }
}

/// A host network device as reported by `ip`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    pub status: LinkState,
    pub mtu: u32,
    pub mac: Option<String>,
    pub flags: Vec<String>,
    /// Bridge this device is enslaved to
    pub bridge: Option<String>,
    pub addresses: Vec<InterfaceAddress>,
}

impl NetworkInterface {
    pub fn is_up(&self) -> bool {
        self.status == LinkState::Up
    }
}

/// Address range handed to the external DHCP helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    /// Lease time such as "12h"; the fabric default applies when `None`
    pub lease: Option<String>,
}

/// Parameters for [`NetworkFabric::create_bridge`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp: Option<DhcpRange>,
}

impl BridgeRequest {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            ip,
            netmask,
            dhcp: None,
        }
    }
}

/// Cached knowledge about a bridge created through the fabric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub name: String,
    /// "ip/cidr" assigned at creation
    pub address: String,
    pub dhcp_config: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// Cached knowledge about a tap created through the fabric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapRecord {
    pub name: String,
    pub bridge: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Live bridge state plus the taps attached to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub interface: NetworkInterface,
    pub attached_taps: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Live tap state merged with the local cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapInfo {
    pub name: String,
    pub status: LinkState,
    pub bridge: Option<String>,
    pub ip: Option<String>,
    pub addresses: Vec<InterfaceAddress>,
    pub mac: Option<String>,
    pub mtu: u32,
    pub flags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// One DNAT rule in the nat PREROUTING chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub host_port: u16,
    pub guest_ip: Ipv4Addr,
    pub guest_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Shaping applied by [`NetworkFabric::setup_traffic_control`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingPolicy {
    /// tc rate, e.g. "100mbit"
    pub bandwidth: String,
    /// netem delay, e.g. "50ms"
    pub delay: String,
    /// netem loss, e.g. "1%"
    pub loss: String,
}

impl Default for ShapingPolicy {
    fn default() -> Self {
        Self {
            bandwidth: "100mbit".to_string(),
            delay: "0ms".to_string(),
            loss: "0%".to_string(),
        }
    }
}

impl ShapingPolicy {
    /// netem is only layered in when delay or loss is requested
    pub fn needs_netem(&self) -> bool {
        self.delay != "0ms" || self.loss != "0%"
    }
}

/// The sixteen counters of one `/proc/net/dev` row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub rx_fifo: u64,
    pub rx_frame: u64,
    pub rx_compressed: u64,
    pub rx_multicast: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
    pub tx_fifo: u64,
    pub tx_collisions: u64,
    pub tx_carrier: u64,
    pub tx_compressed: u64,
}

impl InterfaceCounters {
    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }

    pub fn total_packets(&self) -> u64 {
        self.rx_packets.saturating_add(self.tx_packets)
    }
}

/// Throughput computed from two counter samples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRates {
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
    pub rx_formatted: String,
    pub tx_formatted: String,
    pub sampled_over_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedTotals {
    pub rx_bytes: String,
    pub tx_bytes: String,
    pub total_bytes: String,
}

/// Statistics for one interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub interface: String,
    pub status: LinkState,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub mtu: u32,
    pub counters: InterfaceCounters,
    /// `None` when the second sample could not be taken
    pub rates: Option<TrafficRates>,
    pub formatted: FormattedTotals,
    pub timestamp: DateTime<Utc>,
}

/// Per-interface entry of [`NetworkFabric::get_all_network_stats`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatsEntry {
    Stats(Box<InterfaceStats>),
    Failed { error: String },
}
