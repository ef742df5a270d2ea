//! Shell command builders for the EVPN data plane.
//!
//! Every mutation the agent performs on the kernel, OVS or FRR is built
//! here as a command string and executed through the shared
//! `CommandRunner`, so the exact commands stay unit-testable.

use evpn_agent_common::shell::{
    shellquote, BRIDGE_CMD, IP_CMD, OVS_VSCTL_CMD, SYSCTL_CMD, VTYSH_CMD,
};

/// Build bridge creation command.
pub fn build_add_bridge_cmd(name: &str) -> String {
    format!("{} link add {} type bridge", IP_CMD, shellquote(name))
}

/// Build bridge VLAN-filtering enable command.
///
/// `vlan_default_pvid 1` keeps untagged traffic on VLAN 1 so tenant
/// VLANs never collide with the default.
pub fn build_set_bridge_vlan_filtering_cmd(name: &str) -> String {
    format!(
        "{} link set {} type bridge vlan_filtering 1 vlan_default_pvid 1",
        IP_CMD,
        shellquote(name)
    )
}

/// Build veth pair creation command.
pub fn build_add_veth_cmd(name: &str, peer: &str) -> String {
    format!(
        "{} link add {} type veth peer name {}",
        IP_CMD,
        shellquote(name),
        shellquote(peer)
    )
}

/// Build link bring-up command.
pub fn build_set_link_up_cmd(device: &str) -> String {
    format!("{} link set dev {} up", IP_CMD, shellquote(device))
}

/// Build link enslave command.
pub fn build_set_link_master_cmd(device: &str, master: &str) -> String {
    format!(
        "{} link set dev {} master {}",
        IP_CMD,
        shellquote(device),
        shellquote(master)
    )
}

/// Build link release command.
pub fn build_set_link_nomaster_cmd(device: &str) -> String {
    format!("{} link set dev {} nomaster", IP_CMD, shellquote(device))
}

/// Build link MTU command.
pub fn build_set_link_mtu_cmd(device: &str, mtu: u32) -> String {
    format!("{} link set dev {} mtu {}", IP_CMD, shellquote(device), mtu)
}

/// Build link deletion command.
pub fn build_del_link_cmd(device: &str) -> String {
    format!("{} link del {}", IP_CMD, shellquote(device))
}

/// Build VRF creation command with its routing table id.
pub fn build_add_vrf_cmd(name: &str, table_id: u32) -> String {
    format!(
        "{} link add {} type vrf table {}",
        IP_CMD,
        shellquote(name),
        table_id
    )
}

/// Build VXLAN device creation command.
pub fn build_add_vxlan_cmd(name: &str, vni: u32, local_ip: &str, dstport: u16) -> String {
    format!(
        "{} link add {} type vxlan id {} local {} dstport {}",
        IP_CMD,
        shellquote(name),
        vni,
        shellquote(local_ip),
        dstport
    )
}

/// Build bridge VLAN sub-interface (IRB) creation command.
pub fn build_add_vlan_device_cmd(bridge: &str, vlan_id: u16) -> String {
    let irb = crate::types::irb_name(bridge, vlan_id);
    format!(
        "{} link add link {} name {} type vlan id {}",
        IP_CMD,
        shellquote(bridge),
        shellquote(&irb),
        vlan_id
    )
}

/// Build bridge-port MAC learning toggle command.
pub fn build_bridge_link_learning_cmd(device: &str, enabled: bool) -> String {
    format!(
        "{} link set dev {} learning {}",
        BRIDGE_CMD,
        shellquote(device),
        if enabled { "on" } else { "off" }
    )
}

/// Build bridge-port neighbor suppression toggle command.
pub fn build_bridge_link_neigh_suppress_cmd(device: &str, enabled: bool) -> String {
    format!(
        "{} link set dev {} neigh_suppress {}",
        BRIDGE_CMD,
        shellquote(device),
        if enabled { "on" } else { "off" }
    )
}

/// Build bridge VLAN membership command for a bridge port.
pub fn build_bridge_vlan_add_cmd(device: &str, vlan_id: u16, pvid: bool, untagged: bool) -> String {
    let mut cmd = format!(
        "{} vlan add dev {} vid {}",
        BRIDGE_CMD,
        shellquote(device),
        vlan_id
    );
    if pvid {
        cmd.push_str(" pvid");
    }
    if untagged {
        cmd.push_str(" untagged");
    }
    cmd
}

/// Build bridge VLAN removal command.
pub fn build_bridge_vlan_del_cmd(device: &str, vlan_id: u16) -> String {
    format!(
        "{} vlan del dev {} vid {}",
        BRIDGE_CMD,
        shellquote(device),
        vlan_id
    )
}

/// Build static FDB entry command.
pub fn build_fdb_add_cmd(mac: &str, device: &str, vlan_id: u16) -> String {
    format!(
        "{} fdb add {} dev {} vlan {} master static",
        BRIDGE_CMD,
        shellquote(mac),
        shellquote(device),
        vlan_id
    )
}

/// Build static neighbor entry command.
pub fn build_neigh_add_cmd(ip: &str, mac: &str, device: &str) -> String {
    format!(
        "{} neigh add {} lladdr {} dev {} nud permanent",
        IP_CMD,
        shellquote(ip),
        shellquote(mac),
        shellquote(device)
    )
}

/// Build address assignment command.
pub fn build_addr_add_cmd(address: &str, device: &str) -> String {
    format!(
        "{} addr add {} dev {}",
        IP_CMD,
        shellquote(address),
        shellquote(device)
    )
}

/// Build route replace command in a VRF table.
pub fn build_route_replace_cmd(destination: &str, nexthop: &str, table_id: u32, ipv6: bool) -> String {
    format!(
        "{}{} route replace {} via {} table {}",
        IP_CMD,
        if ipv6 { " -6" } else { "" },
        shellquote(destination),
        shellquote(nexthop),
        table_id
    )
}

/// Build routing table flush command.
pub fn build_route_flush_table_cmd(table_id: u32) -> String {
    format!("{} route flush table {}", IP_CMD, table_id)
}

/// Build link listing command; parse the output with
/// [`parse_link_names`].
pub fn build_list_links_cmd() -> String {
    format!("{} -o link show", IP_CMD)
}

/// Build IPv4 address listing command for one device.
pub fn build_list_ipv4_addresses_cmd(device: &str) -> String {
    format!("{} -o -4 addr show dev {}", IP_CMD, shellquote(device))
}

/// Translate an interface name into its sysctl path component.
///
/// sysctl treats dots as separators, so VLAN sub-interfaces such as
/// `br-evpn.200` must be written with a slash.
fn sysctl_device(device: &str) -> String {
    device.replace('.', "/")
}

/// Build proxy-ARP enable command.
pub fn build_proxy_arp_cmd(device: &str) -> String {
    format!(
        "{} -w net.ipv4.conf.{}.proxy_arp=1",
        SYSCTL_CMD,
        sysctl_device(device)
    )
}

/// Build proxy-NDP enable command.
pub fn build_proxy_ndp_cmd(device: &str) -> String {
    format!(
        "{} -w net.ipv6.conf.{}.proxy_ndp=1",
        SYSCTL_CMD,
        sysctl_device(device)
    )
}

/// Build OVS port listing command.
pub fn build_ovs_list_ports_cmd(bridge: &str) -> String {
    format!("{} list-ports {}", OVS_VSCTL_CMD, shellquote(bridge))
}

/// Build OVS internal port creation command.
pub fn build_ovs_add_internal_port_cmd(bridge: &str, port: &str) -> String {
    format!(
        "{} add-port {} {} -- set interface {} type=internal",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port),
        shellquote(port)
    )
}

/// Build OVS port attach command for an existing interface.
pub fn build_ovs_add_port_cmd(bridge: &str, port: &str) -> String {
    format!(
        "{} add-port {} {}",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port)
    )
}

/// Build OVS port removal command.
pub fn build_ovs_del_port_cmd(bridge: &str, port: &str) -> String {
    format!(
        "{} del-port {} {}",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port)
    )
}

/// Build OVS port tag assignment command.
pub fn build_ovs_set_port_tag_cmd(port: &str, tag: u16) -> String {
    format!("{} set port {} tag={}", OVS_VSCTL_CMD, shellquote(port), tag)
}

/// Build OVS port tag query command.
pub fn build_ovs_get_port_tag_cmd(port: &str) -> String {
    format!("{} get Port {} tag", OVS_VSCTL_CMD, shellquote(port))
}

/// Build OVN bridge-mappings query command.
pub fn build_ovs_get_bridge_mappings_cmd() -> String {
    format!(
        "{} get Open_vSwitch . external_ids:ovn-bridge-mappings",
        OVS_VSCTL_CMD
    )
}

/// Build chassis id query command.
pub fn build_ovs_get_system_id_cmd() -> String {
    format!(
        "{} get Open_vSwitch . external_ids:system-id",
        OVS_VSCTL_CMD
    )
}

/// Build FRR configuration apply command.
pub fn build_vtysh_apply_cmd(config_path: &str) -> String {
    format!("{} -f {}", VTYSH_CMD, shellquote(config_path))
}

/// Build FRR router-id query command.
pub fn build_vtysh_show_bgp_summary_cmd() -> String {
    format!(
        "{} -c {}",
        VTYSH_CMD,
        shellquote("show ip bgp summary json")
    )
}

/// Parse device names out of `ip -o link show` output.
///
/// Lines look like `12: vxlan-200@NONE: <BROADCAST,...> mtu 1500 ...`;
/// the veth `@peer` suffix is stripped.
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, ':');
            let _index = fields.next()?;
            let name = fields.next()?.trim();
            let name = name.split('@').next()?.trim();
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

/// Parse the IPv4 addresses out of `ip -o -4 addr show dev X` output.
///
/// Lines look like `2: eth0    inet 192.0.2.10/24 brd ... scope global eth0`.
pub fn parse_ipv4_addresses(output: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "inet" {
                if let Some(ip) = fields.next().and_then(|addr| addr.split('/').next()) {
                    addresses.push(ip.to_string());
                }
                break;
            }
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_add_bridge_cmd() {
        let cmd = build_add_bridge_cmd("br-evpn");
        assert_eq!(cmd, "/sbin/ip link add \"br-evpn\" type bridge");
    }

    #[test]
    fn test_build_set_bridge_vlan_filtering_cmd() {
        let cmd = build_set_bridge_vlan_filtering_cmd("br-evpn");
        assert!(cmd.contains("vlan_filtering 1"));
        assert!(cmd.contains("vlan_default_pvid 1"));
    }

    #[test]
    fn test_build_add_veth_cmd() {
        let cmd = build_add_veth_cmd("veth-to-ovs", "veth-to-evpn");
        assert_eq!(
            cmd,
            "/sbin/ip link add \"veth-to-ovs\" type veth peer name \"veth-to-evpn\""
        );
    }

    #[test]
    fn test_build_add_vrf_cmd() {
        let cmd = build_add_vrf_cmd("vrf-200", 1_000_200);
        assert_eq!(cmd, "/sbin/ip link add \"vrf-200\" type vrf table 1000200");
    }

    #[test]
    fn test_build_add_vxlan_cmd() {
        let cmd = build_add_vxlan_cmd("vxlan-200", 200, "192.0.2.10", 4789);
        assert_eq!(
            cmd,
            "/sbin/ip link add \"vxlan-200\" type vxlan id 200 local \"192.0.2.10\" dstport 4789"
        );
    }

    #[test]
    fn test_build_add_vlan_device_cmd() {
        let cmd = build_add_vlan_device_cmd("br-evpn", 200);
        assert_eq!(
            cmd,
            "/sbin/ip link add link \"br-evpn\" name \"br-evpn.200\" type vlan id 200"
        );
    }

    #[test]
    fn test_build_bridge_vlan_add_cmd_tagged() {
        let cmd = build_bridge_vlan_add_cmd("vxlan-200", 200, false, false);
        assert_eq!(cmd, "/sbin/bridge vlan add dev \"vxlan-200\" vid 200");
    }

    #[test]
    fn test_build_bridge_vlan_add_cmd_pvid_untagged() {
        let cmd = build_bridge_vlan_add_cmd("evpn-200", 200, true, true);
        assert_eq!(
            cmd,
            "/sbin/bridge vlan add dev \"evpn-200\" vid 200 pvid untagged"
        );
    }

    #[test]
    fn test_build_bridge_link_toggles() {
        assert_eq!(
            build_bridge_link_learning_cmd("vxlan-200", false),
            "/sbin/bridge link set dev \"vxlan-200\" learning off"
        );
        assert_eq!(
            build_bridge_link_neigh_suppress_cmd("vxlan-200", true),
            "/sbin/bridge link set dev \"vxlan-200\" neigh_suppress on"
        );
    }

    #[test]
    fn test_build_fdb_add_cmd() {
        let cmd = build_fdb_add_cmd("aa:bb:cc:dd:ee:ff", "veth-to-ovs", 200);
        assert_eq!(
            cmd,
            "/sbin/bridge fdb add \"aa:bb:cc:dd:ee:ff\" dev \"veth-to-ovs\" vlan 200 master static"
        );
    }

    #[test]
    fn test_build_neigh_add_cmd() {
        let cmd = build_neigh_add_cmd("10.0.0.2", "aa:bb:cc:dd:ee:ff", "br-evpn.200");
        assert_eq!(
            cmd,
            "/sbin/ip neigh add \"10.0.0.2\" lladdr \"aa:bb:cc:dd:ee:ff\" dev \"br-evpn.200\" nud permanent"
        );
    }

    #[test]
    fn test_build_route_replace_cmd() {
        assert_eq!(
            build_route_replace_cmd("10.8.0.0/24", "10.0.0.2", 1_000_300, false),
            "/sbin/ip route replace \"10.8.0.0/24\" via \"10.0.0.2\" table 1000300"
        );
        assert_eq!(
            build_route_replace_cmd("2001:db8::/64", "2001:db8::1", 1_000_300, true),
            "/sbin/ip -6 route replace \"2001:db8::/64\" via \"2001:db8::1\" table 1000300"
        );
    }

    #[test]
    fn test_build_sysctl_cmds() {
        assert_eq!(
            build_proxy_arp_cmd("br-evpn.200"),
            "/sbin/sysctl -w net.ipv4.conf.br-evpn/200.proxy_arp=1"
        );
        assert_eq!(
            build_proxy_ndp_cmd("eth0"),
            "/sbin/sysctl -w net.ipv6.conf.eth0.proxy_ndp=1"
        );
    }

    #[test]
    fn test_build_ovs_cmds() {
        assert_eq!(
            build_ovs_add_internal_port_cmd("br-int", "evpn-200"),
            "/usr/bin/ovs-vsctl add-port \"br-int\" \"evpn-200\" -- set interface \"evpn-200\" type=internal"
        );
        assert_eq!(
            build_ovs_set_port_tag_cmd("evpn-200", 7),
            "/usr/bin/ovs-vsctl set port \"evpn-200\" tag=7"
        );
        assert_eq!(
            build_ovs_get_port_tag_cmd("patch-x-to-br-int"),
            "/usr/bin/ovs-vsctl get Port \"patch-x-to-br-int\" tag"
        );
    }

    #[test]
    fn test_build_vtysh_cmds() {
        assert_eq!(
            build_vtysh_apply_cmd("/tmp/frr-123.conf"),
            "/usr/bin/vtysh -f \"/tmp/frr-123.conf\""
        );
        assert_eq!(
            build_vtysh_show_bgp_summary_cmd(),
            "/usr/bin/vtysh -c \"show ip bgp summary json\""
        );
    }

    #[test]
    fn test_parse_link_names() {
        let output = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN
12: vxlan-200@NONE: <BROADCAST,MULTICAST,UP> mtu 1450 qdisc noqueue master br-evpn
13: veth-to-ovs@veth-to-evpn: <BROADCAST,MULTICAST,UP> mtu 1500 qdisc noqueue";
        let names = parse_link_names(output);
        assert_eq!(names, vec!["lo", "vxlan-200", "veth-to-ovs"]);
    }

    #[test]
    fn test_parse_ipv4_addresses() {
        let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever
1: lo    inet 192.0.2.10/32 scope global lo\\       valid_lft forever";
        assert_eq!(parse_ipv4_addresses(output), vec!["127.0.0.1", "192.0.2.10"]);
        assert!(parse_ipv4_addresses("").is_empty());
    }

    #[test]
    fn test_shellquote_safety() {
        let cmd = build_del_link_cmd("vxlan-1; rm -rf /");
        assert!(cmd.contains("\"vxlan-1; rm -rf /\""));
    }
}
