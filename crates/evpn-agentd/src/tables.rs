//! OVN table and key constants for the EVPN agent.

/// OVN Southbound tables the agent subscribes to.
pub const OVN_TABLES: &[&str] = &[
    "Port_Binding",
    "Chassis",
    "Datapath_Binding",
    "Load_Balancer",
    "Chassis_Private",
];

/// Port_Binding type for OVN-internal patch ports.
pub const PORT_TYPE_PATCH: &str = "patch";

/// Port_Binding type for localnet ports.
pub const PORT_TYPE_LOCALNET: &str = "localnet";

/// Port_Binding type for chassis-redirect (gateway) ports.
pub const PORT_TYPE_CHASSISREDIRECT: &str = "chassisredirect";

/// `external_ids` keys carrying EVPN configuration.
///
/// A port is EVPN-enabled iff both the VNI and the AS key are set.
pub mod external_ids {
    /// 24-bit VXLAN Network Identifier.
    pub const VNI: &str = "neutron_bgpvpn:vni";

    /// BGP AS number (string).
    pub const BGP_AS: &str = "neutron_bgpvpn:as";

    /// EVPN type: `l2` (symmetric IRB) or `l3` (default).
    pub const EVPN_TYPE: &str = "neutron_bgpvpn:type";

    /// JSON list or single route-target string.
    pub const ROUTE_TARGETS: &str = "neutron_bgpvpn:route_targets";

    /// JSON list or single route-distinguisher string.
    pub const ROUTE_DISTINGUISHERS: &str = "neutron_bgpvpn:rds";

    /// JSON list or single import-target string.
    pub const IMPORT_TARGETS: &str = "neutron_bgpvpn:import_targets";

    /// JSON list or single export-target string.
    pub const EXPORT_TARGETS: &str = "neutron_bgpvpn:export_targets";

    /// Optional integer-string local preference.
    pub const LOCAL_PREF: &str = "neutron_bgpvpn:local_pref";

    /// JSON list of `{destination, nexthop}` custom routes.
    pub const ROUTES: &str = "neutron_bgpvpn:routes";

    /// Network MTU on Datapath_Binding.
    pub const MTU: &str = "neutron:mtu";
}
