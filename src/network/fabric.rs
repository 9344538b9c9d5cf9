//! Bridge, tap, NAT and shaping operations against the host
//!
//! Every mutation is a sequence of host commands run through the injected
//! [`CommandRunner`]; failures carry the tool's stderr unchanged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::parse::{
    cidr_from_netmask, extract_primary_ip, format_byte_value, format_bytes, parse_interface_list,
    parse_net_dev,
};
use super::{
    BridgeInfo, BridgeRecord, BridgeRequest, FormattedTotals, InterfaceCounters, InterfaceStats,
    InterfaceType, NetworkInterface, PortForwardRule, ShapingPolicy, StatsEntry, TapInfo,
    TapRecord, TrafficRates,
};
use crate::command::{args, run_checked, CommandRunner, CommandOutput};
use crate::config::FabricConfig;
use crate::error::{Error, Result};

/// Linux IFNAMSIZ minus the trailing NUL
const MAX_INTERFACE_NAME: usize = 15;

/// Configures bridges, taps, port forwards and shaping on the host
pub struct NetworkFabric {
    runner: Arc<dyn CommandRunner>,
    config: FabricConfig,
    bridges: RwLock<HashMap<String, BridgeRecord>>,
    taps: RwLock<HashMap<String, TapRecord>>,
}

impl NetworkFabric {
    pub fn new(runner: Arc<dyn CommandRunner>, config: FabricConfig) -> Self {
        Self {
            runner,
            config,
            bridges: RwLock::new(HashMap::new()),
            taps: RwLock::new(HashMap::new()),
        }
    }

    async fn ip(&self, parts: &[&str]) -> Result<CommandOutput> {
        run_checked(self.runner.as_ref(), "ip", &args(parts)).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bridges
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bridge, assign its address and bring it up
    ///
    /// With `dhcp` set, a dnsmasq range file is written for the bridge; the
    /// helper itself is not started.
    #[instrument(skip(self, request), fields(bridge = %request.name))]
    pub async fn create_bridge(&self, request: BridgeRequest) -> Result<BridgeRecord> {
        validate_interface_name(request.name.as_str())?;
        let cidr = cidr_from_netmask(request.netmask)?;

        if self.interface_exists(request.name.as_str()).await? {
            return Err(Error::Conflict(format!(
                "network device {} already exists",
                request.name
            )));
        }

        let address = format!("{}/{}", request.ip, cidr);
        self.ip(&["link", "add", "name", request.name.as_str(), "type", "bridge"])
            .await?;
        self.ip(&["addr", "add", address.as_str(), "dev", request.name.as_str()])
            .await?;
        self.ip(&["link", "set", request.name.as_str(), "up"]).await?;

        let dhcp_config = match &request.dhcp {
            Some(range) => Some(self.write_dhcp_config(&request, range).await?),
            None => None,
        };

        let record = BridgeRecord {
            name: request.name.clone(),
            address,
            dhcp_config,
            created_at: Utc::now(),
        };
        self.bridges
            .write()
            .await
            .insert(record.name.clone(), record.clone());

        info!(address = %record.address, "bridge created");
        Ok(record)
    }

    async fn write_dhcp_config(
        &self,
        request: &BridgeRequest,
        range: &super::DhcpRange,
    ) -> Result<std::path::PathBuf> {
        let lease = range
            .lease
            .clone()
            .unwrap_or_else(|| self.config.dhcp_lease.clone());
        let content = format!(
            "interface={}\ndhcp-range={},{},{}\ndhcp-option=3,{}\ndhcp-option=6,{}\n",
            request.name, range.start, range.end, lease, request.ip, self.config.dns_server
        );

        tokio::fs::create_dir_all(&self.config.dhcp_config_dir).await?;
        let path = self
            .config
            .dhcp_config_dir
            .join(format!("dnsmasq-{}.conf", request.name));
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), "dhcp range written");
        Ok(path)
    }

    /// Delete a bridge
    ///
    /// Attached taps do not block deletion; they are logged and left detached.
    #[instrument(skip(self))]
    pub async fn delete_bridge(&self, name: &str) -> Result<()> {
        let interfaces = self.get_all_interfaces().await?;
        if !interfaces.iter().any(|i| i.name == name) {
            return Err(Error::not_found("bridge", name));
        }

        let attached: Vec<&str> = interfaces
            .iter()
            .filter(|i| i.bridge.as_deref() == Some(name))
            .map(|i| i.name.as_str())
            .collect();
        if !attached.is_empty() {
            warn!(taps = ?attached, "deleting bridge with attached devices");
        }

        self.ip(&["link", "delete", name]).await?;

        if let Some(record) = self.bridges.write().await.remove(name) {
            if let Some(path) = record.dhcp_config {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %e, "dhcp range file not removed");
                }
            }
        }

        info!("bridge deleted");
        Ok(())
    }

    /// Live state of one bridge with its attached taps
    pub async fn get_bridge_info(&self, name: &str) -> Result<BridgeInfo> {
        let interfaces = self.get_all_interfaces().await?;
        let interface = interfaces
            .iter()
            .find(|i| i.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found("bridge", name))?;

        let attached_taps = interfaces
            .iter()
            .filter(|i| i.bridge.as_deref() == Some(name))
            .map(|i| i.name.clone())
            .collect();
        let created_at = self.bridges.read().await.get(name).map(|r| r.created_at);

        Ok(BridgeInfo {
            interface,
            attached_taps,
            created_at,
        })
    }

    /// All bridge devices on the host
    pub async fn get_bridges(&self) -> Result<Vec<BridgeInfo>> {
        let interfaces = self.get_all_interfaces().await?;
        let cache = self.bridges.read().await;

        Ok(interfaces
            .iter()
            .filter(|i| i.kind == InterfaceType::Bridge)
            .map(|bridge| BridgeInfo {
                interface: bridge.clone(),
                attached_taps: interfaces
                    .iter()
                    .filter(|i| i.bridge.as_deref() == Some(bridge.name.as_str()))
                    .map(|i| i.name.clone())
                    .collect(),
                created_at: cache.get(&bridge.name).map(|r| r.created_at),
            })
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Taps
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a tap, bring it up and optionally enslave it to `bridge`
    #[instrument(skip(self))]
    pub async fn create_tap(&self, name: &str, bridge: Option<&str>) -> Result<TapRecord> {
        validate_interface_name(name)?;

        let interfaces = self.get_all_interfaces().await?;
        if interfaces.iter().any(|i| i.name == name) {
            return Err(Error::Conflict(format!(
                "network device {} already exists",
                name
            )));
        }
        if let Some(bridge) = bridge {
            if !interfaces.iter().any(|i| i.name == bridge) {
                return Err(Error::not_found("bridge", bridge));
            }
        }

        self.ip(&["tuntap", "add", "dev", name, "mode", "tap"]).await?;
        self.ip(&["link", "set", name, "up"]).await?;
        if let Some(bridge) = bridge {
            self.ip(&["link", "set", name, "master", bridge]).await?;
        }

        let record = TapRecord {
            name: name.to_string(),
            bridge: bridge.map(str::to_string),
            created_at: Utc::now(),
        };
        self.taps
            .write()
            .await
            .insert(record.name.clone(), record.clone());

        info!("tap created");
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn delete_tap(&self, name: &str) -> Result<()> {
        if !self.interface_exists(name).await? {
            return Err(Error::not_found("tap", name));
        }

        self.ip(&["link", "delete", name]).await?;
        self.taps.write().await.remove(name);

        info!("tap deleted");
        Ok(())
    }

    /// Tap devices merged with what the fabric remembers about them
    pub async fn get_tap_interfaces(&self) -> Result<Vec<TapInfo>> {
        let interfaces = self.get_all_interfaces().await?;
        let cache = self.taps.read().await;

        Ok(interfaces
            .into_iter()
            .filter(|i| i.kind == InterfaceType::Tap)
            .map(|iface| {
                let cached = cache.get(&iface.name);
                TapInfo {
                    bridge: iface
                        .bridge
                        .clone()
                        .or_else(|| cached.and_then(|c| c.bridge.clone())),
                    ip: extract_primary_ip(&iface.addresses),
                    created_at: cached.map(|c| c.created_at),
                    name: iface.name,
                    status: iface.status,
                    addresses: iface.addresses,
                    mac: iface.mac,
                    mtu: iface.mtu,
                    flags: iface.flags,
                }
            })
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Interfaces & statistics
    // ─────────────────────────────────────────────────────────────────────────

    /// Every device on the host, from `ip link show` merged with `ip addr show`
    pub async fn get_all_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        let links = self.ip(&["link", "show"]).await?;
        let addrs = self.ip(&["addr", "show"]).await?;
        Ok(parse_interface_list(&links.stdout, &addrs.stdout))
    }

    pub async fn interface_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .get_all_interfaces()
            .await?
            .iter()
            .any(|i| i.name == name))
    }

    /// Counters and sampled rates for one interface
    ///
    /// Blocks for the configured sample interval while measuring rates.
    pub async fn get_network_stats(&self, name: &str) -> Result<InterfaceStats> {
        let interfaces = self.get_all_interfaces().await?;
        let iface = interfaces
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::not_found("interface", name))?;
        self.stats_for(iface).await
    }

    /// Statistics for every interface, sampled concurrently
    pub async fn get_all_network_stats(&self) -> Result<BTreeMap<String, StatsEntry>> {
        let interfaces = self.get_all_interfaces().await?;
        let names: Vec<String> = interfaces.iter().map(|i| i.name.clone()).collect();

        let results = join_all(interfaces.into_iter().map(|iface| self.stats_for(iface))).await;

        Ok(names
            .into_iter()
            .zip(results)
            .map(|(name, result)| {
                let entry = match result {
                    Ok(stats) => StatsEntry::Stats(Box::new(stats)),
                    Err(e) => StatsEntry::Failed {
                        error: e.to_string(),
                    },
                };
                (name, entry)
            })
            .collect())
    }

    async fn stats_for(&self, iface: NetworkInterface) -> Result<InterfaceStats> {
        let counters = self
            .read_counters(&iface.name)
            .await?
            .ok_or_else(|| Error::not_found("interface statistics", iface.name.clone()))?;

        let rates = match self.sample_rates(&iface.name, counters).await {
            Ok(rates) => rates,
            Err(e) => {
                debug!(interface = %iface.name, error = %e, "rate sample failed");
                None
            }
        };

        Ok(InterfaceStats {
            ip: extract_primary_ip(&iface.addresses),
            status: iface.status,
            mac: iface.mac,
            mtu: iface.mtu,
            formatted: FormattedTotals {
                rx_bytes: format_bytes(counters.rx_bytes),
                tx_bytes: format_bytes(counters.tx_bytes),
                total_bytes: format_bytes(counters.total_bytes()),
            },
            counters,
            rates,
            timestamp: Utc::now(),
            interface: iface.name,
        })
    }

    async fn read_counters(&self, name: &str) -> Result<Option<InterfaceCounters>> {
        let data = tokio::fs::read_to_string(&self.config.net_dev_path).await?;
        Ok(parse_net_dev(&data, name))
    }

    /// Second sample after the configured wait; rate = delta / real elapsed
    async fn sample_rates(
        &self,
        name: &str,
        first: InterfaceCounters,
    ) -> Result<Option<TrafficRates>> {
        let started = Instant::now();
        tokio::time::sleep(self.config.rate_sample()).await;
        let Some(second) = self.read_counters(name).await? else {
            return Ok(None);
        };

        let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
        let rx = second.rx_bytes.saturating_sub(first.rx_bytes) as f64 / elapsed;
        let tx = second.tx_bytes.saturating_sub(first.tx_bytes) as f64 / elapsed;

        Ok(Some(TrafficRates {
            rx_bytes_per_sec: rx,
            tx_bytes_per_sec: tx,
            rx_formatted: format!("{}/s", format_byte_value(rx)),
            tx_formatted: format!("{}/s", format_byte_value(tx)),
            sampled_over_ms: started.elapsed().as_millis() as u64,
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // NAT & shaping
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a DNAT rule; repeated calls append repeated rules
    #[instrument(skip(self))]
    pub async fn setup_port_forward(&self, rule: &PortForwardRule) -> Result<()> {
        run_checked(self.runner.as_ref(), "iptables", &nat_rule_args("-A", rule)).await?;
        info!(
            host_port = rule.host_port,
            guest = %format!("{}:{}", rule.guest_ip, rule.guest_port),
            protocol = %rule.protocol,
            "port forward installed"
        );
        Ok(())
    }

    /// Remove one matching DNAT rule
    #[instrument(skip(self))]
    pub async fn remove_port_forward(&self, rule: &PortForwardRule) -> Result<()> {
        run_checked(self.runner.as_ref(), "iptables", &nat_rule_args("-D", rule)).await?;
        info!(host_port = rule.host_port, "port forward removed");
        Ok(())
    }

    /// Replace the root qdisc of `interface` with a rate-limited HTB class,
    /// plus netem delay/loss underneath when requested
    #[instrument(skip(self))]
    pub async fn setup_traffic_control(&self, interface: &str, policy: &ShapingPolicy) -> Result<()> {
        let tc = |parts: &[&str]| args(parts);

        // Nothing to delete is the normal case on a fresh interface
        if let Err(e) = run_checked(
            self.runner.as_ref(),
            "tc",
            &tc(&["qdisc", "del", "dev", interface, "root"]),
        )
        .await
        {
            debug!(error = %e, "no existing root qdisc removed");
        }

        run_checked(
            self.runner.as_ref(),
            "tc",
            &tc(&["qdisc", "add", "dev", interface, "root", "handle", "1:", "htb", "default", "30"]),
        )
        .await?;
        run_checked(
            self.runner.as_ref(),
            "tc",
            &tc(&[
                "class", "add", "dev", interface, "parent", "1:", "classid", "1:1", "htb", "rate",
                policy.bandwidth.as_str(),
            ]),
        )
        .await?;

        if policy.needs_netem() {
            run_checked(
                self.runner.as_ref(),
                "tc",
                &tc(&[
                    "qdisc", "add", "dev", interface, "parent", "1:1", "handle", "10:", "netem",
                    "delay", policy.delay.as_str(), "loss", policy.loss.as_str(),
                ]),
            )
            .await?;
        }

        info!(bandwidth = %policy.bandwidth, delay = %policy.delay, loss = %policy.loss, "traffic shaping applied");
        Ok(())
    }
}

fn nat_rule_args(action: &str, rule: &PortForwardRule) -> Vec<String> {
    let dport = rule.host_port.to_string();
    let destination = format!("{}:{}", rule.guest_ip, rule.guest_port);
    args(&[
        "-t",
        "nat",
        action,
        "PREROUTING",
        "-p",
        rule.protocol.as_str(),
        "--dport",
        dport.as_str(),
        "-j",
        "DNAT",
        "--to-destination",
        destination.as_str(),
    ])
}

/// Reject names the kernel would refuse or the tools would misparse
pub fn validate_interface_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "invalid interface name {:?}",
            name
        )))
    }
}
