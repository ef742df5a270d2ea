//! Row fixtures for driver tests.

use evpn_agentd::ovn::PortBinding;
use evpn_agentd::tables::external_ids;

/// Builder for `Port_Binding` fixtures.
pub struct PortBindingBuilder {
    row: PortBinding,
}

impl PortBindingBuilder {
    /// Starts a row for a logical port on a datapath.
    pub fn new(logical_port: &str, datapath: &str) -> Self {
        Self {
            row: PortBinding {
                logical_port: logical_port.to_string(),
                datapath: datapath.to_string(),
                ..Default::default()
            },
        }
    }

    /// Sets the port type (`patch`, `localnet`, `chassisredirect`, ...).
    pub fn port_type(mut self, port_type: &str) -> Self {
        self.row.port_type = port_type.to_string();
        self
    }

    /// Sets the `mac` column's first element (`"MAC IP1 IP2 …"`).
    pub fn mac_field(mut self, mac_field: &str) -> Self {
        self.row.mac = vec![mac_field.to_string()];
        self
    }

    /// Binds the port to a chassis.
    pub fn chassis(mut self, chassis: &str) -> Self {
        self.row.chassis = Some(chassis.to_string());
        self
    }

    /// Adds one `external_ids` entry.
    pub fn external_id(mut self, key: &str, value: &str) -> Self {
        self.row
            .external_ids
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Adds the EVPN annotations that make the port EVPN-enabled.
    pub fn evpn(self, vni: u32, bgp_as: &str, evpn_type: &str) -> Self {
        self.external_id(external_ids::VNI, &vni.to_string())
            .external_id(external_ids::BGP_AS, bgp_as)
            .external_id(external_ids::EVPN_TYPE, evpn_type)
    }

    /// Adds a JSON route-targets list.
    pub fn route_targets(self, targets: &[&str]) -> Self {
        let json = serde_json::to_string(targets).unwrap();
        self.external_id(external_ids::ROUTE_TARGETS, &json)
    }

    /// Finishes the row.
    pub fn build(self) -> PortBinding {
        self.row
    }
}
