//! Type definitions for the EVPN agent.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix of kernel VRF devices managed by this agent.
pub const VRF_PREFIX: &str = "vrf-";

/// Prefix of kernel VXLAN devices managed by this agent.
pub const VXLAN_PREFIX: &str = "vxlan-";

/// Prefix of OVS internal ports managed by this agent.
pub const INTERNAL_PORT_PREFIX: &str = "evpn-";

/// Offset added to a VNI to obtain the VRF routing table id.
pub const ROUTE_TABLE_OFFSET: u32 = 1_000_000;

/// Maximum length of a Linux interface name.
pub const IFNAME_MAX_LEN: usize = 15;

/// Returns the VRF device name for a VNI.
pub fn vrf_name(vni: u32) -> String {
    format!("{VRF_PREFIX}{vni}")
}

/// Returns the VXLAN device name for a VNI.
pub fn vxlan_name(vni: u32) -> String {
    format!("{VXLAN_PREFIX}{vni}")
}

/// Returns the OVS internal port name for a VNI, truncated to the
/// kernel interface-name limit.
pub fn internal_port_name(vni: u32) -> String {
    let mut name = format!("{INTERNAL_PORT_PREFIX}{vni}");
    name.truncate(IFNAME_MAX_LEN);
    name
}

/// Returns the IRB (bridge VLAN sub-interface) name.
pub fn irb_name(bridge: &str, vlan_id: u16) -> String {
    format!("{bridge}.{vlan_id}")
}

/// Returns the VRF routing table id for a VNI.
pub fn route_table_id(vni: u32) -> u32 {
    vni + ROUTE_TABLE_OFFSET
}

/// EVPN service type of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvpnType {
    /// Layer-2 extension with symmetric IRB; gets an OVS internal port.
    L2,
    /// Layer-3 routing only (default).
    L3,
}

impl FromStr for EvpnType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "l2" => EvpnType::L2,
            // Unknown values route as L3, matching the OVN annotation default.
            _ => EvpnType::L3,
        })
    }
}

impl EvpnType {
    /// Returns the type as annotated in OVN.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvpnType::L2 => "l2",
            EvpnType::L3 => "l3",
        }
    }
}

/// Everything the agent knows about one EVPN network.
///
/// A network exists iff at least one EVPN-annotated port binding
/// references its datapath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// OVN datapath UUID.
    pub id: String,
    /// VXLAN Network Identifier (24-bit).
    pub vni: u32,
    /// EVPN service type.
    pub evpn_type: EvpnType,
    /// BGP AS number for the FRR VRF instance.
    pub bgp_as: String,
    /// Bridge VLAN chosen by the allocator.
    pub bridge_vlan: u16,
    /// OVN-side VLAN tag, resolved lazily for L2 internal ports.
    pub ovn_vlan: Option<u16>,
    /// BGP route targets (imported and exported).
    pub route_targets: Vec<String>,
    /// BGP route distinguishers.
    pub route_distinguishers: Vec<String>,
    /// Import-only route targets.
    pub import_targets: Vec<String>,
    /// Export-only route targets.
    pub export_targets: Vec<String>,
    /// Optional BGP local preference.
    pub local_pref: Option<u32>,
    /// MTU for the network devices.
    pub mtu: u32,
}

impl NetworkInfo {
    /// Returns the VRF device name for this network.
    pub fn vrf_name(&self) -> String {
        vrf_name(self.vni)
    }

    /// Returns the VXLAN device name for this network.
    pub fn vxlan_name(&self) -> String {
        vxlan_name(self.vni)
    }

    /// Returns the OVS internal port name for this network.
    pub fn internal_port_name(&self) -> String {
        internal_port_name(self.vni)
    }

    /// Returns the VRF routing table id for this network.
    pub fn route_table_id(&self) -> u32 {
        route_table_id(self.vni)
    }
}

/// A port tracked by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// MAC address from `Port_Binding.mac`.
    pub mac: String,
    /// IP addresses from `Port_Binding.mac` (may be empty).
    pub ips: Vec<String>,
    /// Datapath UUID of the network the port belongs to.
    pub network_id: String,
    /// Bridge VLAN of that network.
    pub bridge_vlan: u16,
}

/// A kernel VRF tracked by the network manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfInfo {
    /// Kernel routing table id (`vni + 1_000_000`).
    pub table_id: u32,
    /// VNI the VRF serves.
    pub vni: u32,
    /// Datapath UUIDs of the networks attached to this VRF.
    pub networks: BTreeSet<String>,
}

/// A custom route from a port association
/// (`neutron_bgpvpn:routes` JSON entries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    /// Destination prefix, e.g. `10.8.0.0/24`.
    pub destination: String,
    /// Nexthop address.
    pub nexthop: String,
}
