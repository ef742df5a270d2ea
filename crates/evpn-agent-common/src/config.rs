//! Typed configuration for the EVPN agent.
//!
//! Every option the core consumes is declared here with its documented
//! default. The structure is deserializable so a deployment can load it
//! from a file; the daemon falls back to `Default` when none is given.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

/// Default values for agent configuration.
pub mod defaults {
    /// Default UDP destination port for VXLAN encapsulation (IANA).
    pub const EVPN_UDP_DSTPORT: u16 = 4789;

    /// Default Linux bridge for EVPN VNI devices.
    pub const EVPN_BRIDGE: &str = "br-evpn";

    /// Default veth name on the EVPN bridge side.
    pub const EVPN_BRIDGE_VETH: &str = "veth-to-ovs";

    /// Default veth name on the OVS side.
    pub const EVPN_OVS_VETH: &str = "veth-to-evpn";

    /// Default OVS integration bridge.
    pub const OVS_BRIDGE: &str = "br-int";

    /// Default lower bound of the bridge VLAN allocation range.
    pub const EVPN_VLAN_RANGE_MIN: u16 = 100;

    /// Default upper bound of the bridge VLAN allocation range (802.1Q max).
    pub const EVPN_VLAN_RANGE_MAX: u16 = 4094;

    /// Default MTU for EVPN network devices.
    pub const NETWORK_DEVICE_MTU: u32 = 1500;

    /// Smallest MTU accepted for EVPN network devices.
    pub const NETWORK_DEVICE_MTU_MIN: u32 = 68;

    /// Largest MTU accepted for EVPN network devices.
    pub const NETWORK_DEVICE_MTU_MAX: u32 = 9000;

    /// Default BGP AS number.
    pub const BGP_AS: &str = "64999";

    /// Default routing table id for the BGP VRF.
    pub const BGP_VRF_TABLE_ID: u32 = 10;

    /// Default full reconcile period, seconds.
    pub const RECONCILE_INTERVAL_SECS: u64 = 300;

    /// Default FRR reconcile period, seconds.
    pub const FRR_RECONCILE_INTERVAL_SECS: u64 = 15;

    /// Default OVN transaction timeout, seconds.
    pub const OVSDB_CONNECTION_TIMEOUT_SECS: u64 = 180;
}

/// Exposing mechanism supported by the EVPN driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposingMethod {
    /// Expose routes in VRFs with EVPN Type-5.
    Vrf,
    /// Mix of methods based on port annotations.
    Dynamic,
}

impl ExposingMethod {
    /// Returns the method name as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposingMethod::Vrf => "vrf",
            ExposingMethod::Dynamic => "dynamic",
        }
    }
}

impl FromStr for ExposingMethod {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vrf" => Ok(ExposingMethod::Vrf),
            "dynamic" => Ok(ExposingMethod::Dynamic),
            other => Err(AgentError::config_invalid(
                "exposing_method",
                format!("'{other}' is not supported, use 'vrf' or 'dynamic'"),
            )),
        }
    }
}

/// Agent configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// IP address of the local VXLAN tunnel endpoint. `None` resolves
    /// the address from `evpn_nic`, falling back to the loopback.
    pub evpn_local_ip: Option<String>,

    /// Network interface to take the VTEP IP from when `evpn_local_ip`
    /// is not set.
    pub evpn_nic: Option<String>,

    /// UDP destination port for VXLAN encapsulation.
    pub evpn_udp_dstport: u16,

    /// Linux bridge all EVPN VXLAN devices are enslaved to.
    pub evpn_bridge: String,

    /// Veth end attached to the EVPN bridge.
    pub evpn_bridge_veth: String,

    /// Veth end attached to the OVS integration bridge.
    pub evpn_ovs_veth: String,

    /// OVS integration bridge name.
    pub ovs_bridge: String,

    /// Lower bound of the bridge VLAN allocation range.
    pub evpn_vlan_range_min: u16,

    /// Upper bound of the bridge VLAN allocation range.
    pub evpn_vlan_range_max: u16,

    /// Default MTU for EVPN devices when OVN does not provide one.
    pub network_device_mtu: u32,

    /// Pre-populate the bridge FDB from OVN port bindings.
    pub evpn_static_fdb: bool,

    /// Pre-populate the kernel neighbor table from OVN port bindings.
    pub evpn_static_neighbors: bool,

    /// Delete the kernel VRF device when its last network detaches.
    pub delete_vrf_on_disconnect: bool,

    /// Flush the BGP VRF routing table at startup.
    pub clear_vrf_routes_on_startup: bool,

    /// Routing table id of the BGP VRF.
    pub bgp_vrf_table_id: u32,

    /// BGP autonomous system number used for FRR configuration.
    pub bgp_as: String,

    /// BGP router id; resolved from FRR when not set.
    pub bgp_router_id: Option<String>,

    /// Exposing mechanism for this driver.
    pub exposing_method: ExposingMethod,

    /// Also expose ports on tenant networks.
    pub expose_tenant_networks: bool,

    /// Seconds between full reconcile passes.
    pub reconcile_interval_secs: u64,

    /// Seconds between FRR reconcile passes.
    pub frr_reconcile_interval_secs: u64,

    /// Timeout for OVN database transactions, seconds.
    pub ovsdb_connection_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            evpn_local_ip: None,
            evpn_nic: None,
            evpn_udp_dstport: defaults::EVPN_UDP_DSTPORT,
            evpn_bridge: defaults::EVPN_BRIDGE.to_string(),
            evpn_bridge_veth: defaults::EVPN_BRIDGE_VETH.to_string(),
            evpn_ovs_veth: defaults::EVPN_OVS_VETH.to_string(),
            ovs_bridge: defaults::OVS_BRIDGE.to_string(),
            evpn_vlan_range_min: defaults::EVPN_VLAN_RANGE_MIN,
            evpn_vlan_range_max: defaults::EVPN_VLAN_RANGE_MAX,
            network_device_mtu: defaults::NETWORK_DEVICE_MTU,
            evpn_static_fdb: true,
            evpn_static_neighbors: true,
            delete_vrf_on_disconnect: false,
            clear_vrf_routes_on_startup: false,
            bgp_vrf_table_id: defaults::BGP_VRF_TABLE_ID,
            bgp_as: defaults::BGP_AS.to_string(),
            bgp_router_id: None,
            exposing_method: ExposingMethod::Vrf,
            expose_tenant_networks: false,
            reconcile_interval_secs: defaults::RECONCILE_INTERVAL_SECS,
            frr_reconcile_interval_secs: defaults::FRR_RECONCILE_INTERVAL_SECS,
            ovsdb_connection_timeout_secs: defaults::OVSDB_CONNECTION_TIMEOUT_SECS,
        }
    }
}

impl AgentConfig {
    /// Validates the configuration, clamping the MTU into its legal range.
    ///
    /// Fatal misconfigurations return [`AgentError::ConfigInvalid`].
    pub fn validate(&mut self) -> AgentResult<()> {
        if self.evpn_vlan_range_min < 2 {
            return Err(AgentError::config_invalid(
                "evpn_vlan_range_min",
                "must be at least 2",
            ));
        }
        if self.evpn_vlan_range_max > 4094 {
            return Err(AgentError::config_invalid(
                "evpn_vlan_range_max",
                "must not exceed 4094",
            ));
        }
        if self.evpn_vlan_range_min > self.evpn_vlan_range_max {
            return Err(AgentError::config_invalid(
                "evpn_vlan_range_min",
                "must not exceed evpn_vlan_range_max",
            ));
        }
        if self.bgp_as.is_empty() {
            return Err(AgentError::config_invalid("bgp_AS", "must not be empty"));
        }

        let clamped = self
            .network_device_mtu
            .clamp(defaults::NETWORK_DEVICE_MTU_MIN, defaults::NETWORK_DEVICE_MTU_MAX);
        if clamped != self.network_device_mtu {
            tracing::warn!(
                configured = self.network_device_mtu,
                clamped,
                "network_device_mtu out of range, clamping"
            );
            self.network_device_mtu = clamped;
        }

        Ok(())
    }
}
