//! Parsers for `ip` and `/proc/net/dev` output
//!
//! Pure functions; the fabric feeds them whatever the tools printed.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use lazy_static::lazy_static;
use regex::Regex;

use super::{
    AddressFamily, InterfaceAddress, InterfaceCounters, InterfaceType, LinkState, NetworkInterface,
};
use crate::error::{Error, Result};

lazy_static! {
    /// `3: br-test: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ...`
    /// `7: veth1@if6: <...> mtu 1500 ...`
    static ref LINK_HEADER_RE: Regex =
        Regex::new(r"^\d+:\s+([^:@\s]+)(?:@[^:\s]*)?:\s*<([^>]*)>.*?\bmtu (\d+)")
            .expect("static regex");
    static ref MASTER_RE: Regex = Regex::new(r"\bmaster (\S+)").expect("static regex");
    static ref MAC_RE: Regex =
        Regex::new(r"link/ether ([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5})").expect("static regex");
    static ref ADDR_RE: Regex = Regex::new(r"^inet(6)?\s+(\S+)").expect("static regex");
    static ref SCOPE_RE: Regex = Regex::new(r"\bscope (\S+)").expect("static regex");
}

const ADDRESS_FLAGS: [&str; 6] = [
    "temporary",
    "deprecated",
    "tentative",
    "dadfailed",
    "permanent",
    "dynamic",
];

/// Parse `ip link show` and merge addresses from `ip addr show`
pub fn parse_interface_list(link_output: &str, addr_output: &str) -> Vec<NetworkInterface> {
    let mut interfaces = parse_links(link_output);
    let mut addresses = parse_addresses(addr_output);
    for iface in &mut interfaces {
        if let Some(addrs) = addresses.remove(&iface.name) {
            iface.addresses = addrs;
        }
    }
    interfaces
}

/// Parse `ip link show` into interfaces without addresses
pub fn parse_links(output: &str) -> Vec<NetworkInterface> {
    let mut interfaces: Vec<NetworkInterface> = Vec::new();

    for raw in output.lines() {
        let line = raw.trim();
        if let Some(caps) = LINK_HEADER_RE.captures(line) {
            let name = caps[1].to_string();
            let flags: Vec<String> = caps[2]
                .split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
            let mtu = caps[3].parse().unwrap_or(0);
            let status = if flags.iter().any(|f| f == "UP") {
                LinkState::Up
            } else {
                LinkState::Down
            };
            let bridge = MASTER_RE.captures(line).map(|c| c[1].to_string());
            let kind = classify_interface(&name, &flags, line);

            interfaces.push(NetworkInterface {
                name,
                kind,
                status,
                mtu,
                mac: MAC_RE.captures(line).map(|c| c[1].to_string()),
                flags,
                bridge,
                addresses: Vec::new(),
            });
        } else if let Some(current) = interfaces.last_mut() {
            // Continuation lines belong to the last header
            if current.mac.is_none() {
                current.mac = MAC_RE.captures(line).map(|c| c[1].to_string());
            }
        }
    }

    interfaces
}

/// Parse `ip addr show` into name → addresses
pub fn parse_addresses(output: &str) -> HashMap<String, Vec<InterfaceAddress>> {
    let mut map: HashMap<String, Vec<InterfaceAddress>> = HashMap::new();
    let mut current: Option<String> = None;

    for raw in output.lines() {
        let line = raw.trim();
        if let Some(caps) = LINK_HEADER_RE.captures(line) {
            let name = caps[1].to_string();
            map.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let (Some(name), Some(caps)) = (current.as_ref(), ADDR_RE.captures(line)) else {
            continue;
        };
        let family = if caps.get(1).is_some() {
            AddressFamily::Ipv6
        } else {
            AddressFamily::Ipv4
        };
        let flags = line
            .split_whitespace()
            .filter(|word| ADDRESS_FLAGS.contains(word))
            .map(str::to_string)
            .collect();

        map.entry(name.clone()).or_default().push(InterfaceAddress {
            family,
            address: caps[2].to_string(),
            scope: SCOPE_RE.captures(line).map(|c| c[1].to_string()),
            flags,
        });
    }

    map
}

/// Infer an interface class from its name, flags and header line
pub fn classify_interface(name: &str, flags: &[String], line: &str) -> InterfaceType {
    if name == "lo" || flags.iter().any(|f| f == "LOOPBACK") {
        return InterfaceType::Loopback;
    }
    // libvirt-managed
    if name.starts_with("virbr") {
        return InterfaceType::Virtual;
    }
    if name.starts_with("br") {
        return InterfaceType::Bridge;
    }
    if name.starts_with("tap") || name.starts_with("tun") {
        return InterfaceType::Tap;
    }

    // "master <bridge>" names the parent, not this device
    let own = MASTER_RE.replace_all(line, "");
    if own.contains("bridge") {
        return InterfaceType::Bridge;
    }

    if name.starts_with("wl") || name.starts_with("wifi") {
        InterfaceType::Wireless
    } else if name.starts_with("eth") || name.starts_with("en") {
        InterfaceType::Ethernet
    } else if name.starts_with("docker") || name.starts_with("veth") {
        InterfaceType::Virtual
    } else {
        InterfaceType::Unknown
    }
}

/// Counters for `name` from the `/proc/net/dev` table
pub fn parse_net_dev(data: &str, name: &str) -> Option<InterfaceCounters> {
    let prefix = format!("{}:", name);
    let line = data.lines().map(str::trim).find(|l| l.starts_with(&prefix))?;

    let values: Vec<u64> = line[prefix.len()..]
        .split_whitespace()
        .map(|v| v.parse().unwrap_or(0))
        .collect();
    if values.len() < 16 {
        return None;
    }

    Some(InterfaceCounters {
        rx_bytes: values[0],
        rx_packets: values[1],
        rx_errors: values[2],
        rx_dropped: values[3],
        rx_fifo: values[4],
        rx_frame: values[5],
        rx_compressed: values[6],
        rx_multicast: values[7],
        tx_bytes: values[8],
        tx_packets: values[9],
        tx_errors: values[10],
        tx_dropped: values[11],
        tx_fifo: values[12],
        tx_collisions: values[13],
        tx_carrier: values[14],
        tx_compressed: values[15],
    })
}

/// Prefix length for a dotted netmask; non-contiguous masks are rejected
pub fn cidr_from_netmask(netmask: Ipv4Addr) -> Result<u8> {
    let bits = u32::from(netmask);
    let ones = bits.count_ones();
    let expected = u32::MAX.checked_shl(32 - ones).unwrap_or(0);
    if bits != expected {
        return Err(Error::InvalidInput(format!(
            "netmask {} is not contiguous",
            netmask
        )));
    }
    Ok(ones as u8)
}

/// Preferred address to show for an interface
///
/// First global-scope IPv4 outside 127/8, else any IPv4 outside 127/8.
pub fn extract_primary_ip(addresses: &[InterfaceAddress]) -> Option<String> {
    let candidates = || {
        addresses
            .iter()
            .filter(|a| a.family == AddressFamily::Ipv4 && !a.ip().starts_with("127."))
    };

    candidates()
        .find(|a| a.scope.as_deref() == Some("global"))
        .or_else(|| candidates().next())
        .map(|a| a.ip().to_string())
}

/// Human-readable byte count, base 1024: `0 B`, `1.5 KB`, `2 MB`
pub fn format_bytes(bytes: u64) -> String {
    format_byte_value(bytes as f64)
}

/// As [`format_bytes`] for fractional values such as per-second rates
pub fn format_byte_value(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if !bytes.is_finite() || bytes <= 0.0 {
        return "0 B".to_string();
    }

    let exponent = (bytes.ln() / 1024f64.ln()).floor().clamp(0.0, 4.0) as usize;
    let value = bytes / 1024f64.powi(exponent as i32);
    let mut text = format!("{:.2}", value);
    if text.contains('.') {
        text = text.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{} {}", text, UNITS[exponent])
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK_OUTPUT: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000
    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000
    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff
3: br-test: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT group default qlen 1000
    link/ether 3a:1b:2c:3d:4e:5f brd ff:ff:ff:ff:ff:ff
4: tap0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc fq_codel master br-test state DOWN mode DEFAULT group default qlen 1000
    link/ether 6e:aa:bb:cc:dd:ee brd ff:ff:ff:ff:ff:ff
5: veth1@if4: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT group default qlen 1000
    link/ether 0a:0b:0c:0d:0e:0f brd ff:ff:ff:ff:ff:ff link-netnsid 0
";

    const ADDR_OUTPUT: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN group default qlen 1000
    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
    inet 127.0.0.1/8 scope host lo
       valid_lft forever preferred_lft forever
    inet6 ::1/128 scope host
       valid_lft forever preferred_lft forever
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP group default qlen 1000
    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff
    inet 10.0.2.15/24 brd 10.0.2.255 scope global dynamic eth0
       valid_lft 86000sec preferred_lft 86000sec
3: br-test: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000
    link/ether 3a:1b:2c:3d:4e:5f brd ff:ff:ff:ff:ff:ff
    inet 192.168.50.1/24 scope global br-test
       valid_lft forever preferred_lft forever
    inet6 fe80::381b:2cff:fe3d:4e5f/64 scope link
       valid_lft forever preferred_lft forever
4: tap0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc fq_codel master br-test state DOWN group default qlen 1000
    link/ether 6e:aa:bb:cc:dd:ee brd ff:ff:ff:ff:ff:ff
";

    fn find<'a>(list: &'a [NetworkInterface], name: &str) -> &'a NetworkInterface {
        list.iter().find(|i| i.name == name).unwrap()
    }

    #[test]
    fn test_classifies_bridge_tap_and_loopback() {
        let list = parse_interface_list(LINK_OUTPUT, ADDR_OUTPUT);
        assert_eq!(list.len(), 5);

        let lo = find(&list, "lo");
        assert_eq!(lo.kind, InterfaceType::Loopback);
        assert_eq!(lo.mtu, 65536);

        let bridge = find(&list, "br-test");
        assert_eq!(bridge.kind, InterfaceType::Bridge);
        assert!(bridge.is_up());
        assert_eq!(bridge.mac.as_deref(), Some("3a:1b:2c:3d:4e:5f"));
        assert_eq!(bridge.addresses[0].address, "192.168.50.1/24");
        assert_eq!(bridge.addresses[1].family, AddressFamily::Ipv6);

        let tap = find(&list, "tap0");
        assert_eq!(tap.kind, InterfaceType::Tap);
        assert_eq!(tap.bridge.as_deref(), Some(bridge.name.as_str()));
        assert!(tap.addresses.is_empty());

        assert_eq!(find(&list, "eth0").kind, InterfaceType::Ethernet);
        let veth = find(&list, "veth1");
        assert_eq!(veth.kind, InterfaceType::Virtual);
        assert_eq!(veth.status, LinkState::Down);
    }

    #[test]
    fn test_address_scope_and_flags() {
        let map = parse_addresses(ADDR_OUTPUT);
        let eth0 = &map["eth0"];
        assert_eq!(eth0[0].scope.as_deref(), Some("global"));
        assert_eq!(eth0[0].flags, vec!["dynamic".to_string()]);
        assert_eq!(eth0[0].ip(), "10.0.2.15");
        assert_eq!(map["lo"][0].scope.as_deref(), Some("host"));
    }

    #[test]
    fn test_classify_bridge_keyword_ignores_master() {
        let flags = vec!["UP".to_string()];
        assert_eq!(
            classify_interface("vnet3", &flags, "9: vnet3: <UP> mtu 1500 master mybridge"),
            InterfaceType::Unknown
        );
        assert_eq!(
            classify_interface("lan0", &flags, "9: lan0: <UP> mtu 1500 bridge"),
            InterfaceType::Bridge
        );
        assert_eq!(classify_interface("wlp2s0", &flags, ""), InterfaceType::Wireless);
        assert_eq!(classify_interface("docker0", &flags, ""), InterfaceType::Virtual);
        assert_eq!(
            classify_interface("virbr0", &flags, "4: virbr0: <UP> mtu 1500 bridge"),
            InterfaceType::Virtual
        );
    }

    #[test]
    fn test_parse_net_dev() {
        let data = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    5000      50    0    0    0     0          0         0     5000      50    0    0    0     0       0          0
br-test: 123456    789    1    2    0     0          0         3    654321     987    0    4    0     0       0          0
";
        let counters = parse_net_dev(data, "br-test").unwrap();
        assert_eq!(counters.rx_bytes, 123456);
        assert_eq!(counters.rx_packets, 789);
        assert_eq!(counters.rx_dropped, 2);
        assert_eq!(counters.rx_multicast, 3);
        assert_eq!(counters.tx_bytes, 654321);
        assert_eq!(counters.tx_dropped, 4);
        assert_eq!(counters.total_bytes(), 777777);
        assert!(parse_net_dev(data, "eth9").is_none());
    }

    #[test]
    fn test_cidr_from_netmask() {
        assert_eq!(cidr_from_netmask(Ipv4Addr::new(255, 255, 255, 0)).unwrap(), 24);
        assert_eq!(cidr_from_netmask(Ipv4Addr::new(255, 255, 240, 0)).unwrap(), 20);
        assert_eq!(cidr_from_netmask(Ipv4Addr::new(0, 0, 0, 0)).unwrap(), 0);
        assert_eq!(cidr_from_netmask(Ipv4Addr::new(255, 255, 255, 255)).unwrap(), 32);
        assert!(cidr_from_netmask(Ipv4Addr::new(255, 0, 255, 0)).is_err());
    }

    #[test]
    fn test_extract_primary_ip() {
        let map = parse_addresses(ADDR_OUTPUT);
        assert_eq!(extract_primary_ip(&map["br-test"]).as_deref(), Some("192.168.50.1"));
        assert_eq!(extract_primary_ip(&map["lo"]), None);
        assert_eq!(extract_primary_ip(&[]), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_bytes(1_234_567_890), "1.15 GB");
        assert_eq!(format_byte_value(0.4), "0.4 B");
    }
}
