//! OVN Southbound capability interface.
//!
//! The agent treats the OVN Southbound database as an external observable
//! store: the IDL connection machinery lives outside this crate and hands
//! the driver an implementation of [`SbClient`] plus a stream of row
//! events. Row contents are modelled as plain data.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use evpn_agent_common::AgentResult;

use crate::tables::{external_ids, PORT_TYPE_CHASSISREDIRECT, PORT_TYPE_PATCH};

/// One `Port_Binding` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// The OVN logical port name.
    pub logical_port: String,
    /// Port type; empty for plain VIF ports.
    pub port_type: String,
    /// Datapath UUID of the logical switch the port sits on.
    pub datapath: String,
    /// `mac` column; element 0 is `"MAC IP1 IP2 …"` when populated.
    pub mac: Vec<String>,
    /// Chassis the port is bound to, if any.
    pub chassis: Option<String>,
    /// `external_ids` column.
    pub external_ids: HashMap<String, String>,
}

impl PortBinding {
    /// Returns true for OVN-internal patch ports.
    pub fn is_patch(&self) -> bool {
        self.port_type == PORT_TYPE_PATCH
    }

    /// Returns true for chassis-redirect (gateway) ports.
    pub fn is_chassisredirect(&self) -> bool {
        self.port_type == PORT_TYPE_CHASSISREDIRECT
    }

    /// Returns true when the port carries EVPN annotations
    /// (both the VNI and the AS key must be present).
    pub fn is_evpn_annotated(&self) -> bool {
        self.external_ids.contains_key(external_ids::VNI)
            && self.external_ids.contains_key(external_ids::BGP_AS)
    }
}

/// One `Datapath_Binding` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapathBinding {
    /// Datapath UUID.
    pub uuid: String,
    /// `external_ids` column.
    pub external_ids: HashMap<String, String>,
}

/// Read access to the OVN Southbound database.
///
/// Implemented by the deployment's IDL integration; tests use the
/// in-memory mock from `evpn-agent-test`.
#[async_trait]
pub trait SbClient: Send + Sync {
    /// Lists all `Port_Binding` rows.
    async fn list_port_bindings(&self) -> AgentResult<Vec<PortBinding>>;

    /// Fetches a `Datapath_Binding` row by UUID.
    async fn get_datapath(&self, uuid: &str) -> AgentResult<Option<DatapathBinding>>;

    /// Returns the provider network name and VLAN tag list for a
    /// datapath, scoped to the given OVN bridge-mapping network names.
    async fn network_name_and_tag(
        &self,
        datapath: &str,
        bridge_networks: &[String],
    ) -> AgentResult<Option<(String, Vec<u16>)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_with_ids(ids: &[(&str, &str)]) -> PortBinding {
        PortBinding {
            logical_port: "p1".to_string(),
            external_ids: ids
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_evpn_annotated() {
        let both = port_with_ids(&[
            (external_ids::VNI, "200"),
            (external_ids::BGP_AS, "64999"),
        ]);
        assert!(both.is_evpn_annotated());

        let vni_only = port_with_ids(&[(external_ids::VNI, "200")]);
        assert!(!vni_only.is_evpn_annotated());

        let neither = port_with_ids(&[]);
        assert!(!neither.is_evpn_annotated());
    }

    #[test]
    fn test_port_type_predicates() {
        let mut port = PortBinding {
            port_type: "patch".to_string(),
            ..Default::default()
        };
        assert!(port.is_patch());
        assert!(!port.is_chassisredirect());

        port.port_type = "chassisredirect".to_string();
        assert!(port.is_chassisredirect());
    }
}
