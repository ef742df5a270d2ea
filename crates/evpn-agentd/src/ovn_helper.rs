//! OVN EVPN query helper.
//!
//! EVPN-specific query and parsing utilities on top of the generic OVN
//! Southbound client: VLAN-tag resolution with caching and bounded retry
//! against eventual consistency, EVPN attribute parsing from
//! `external_ids`, port-info extraction, gateway-IP extraction and MTU
//! resolution.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use evpn_agent_common::{AgentConfig, AgentError, AgentResult, CommandRunner, Latch};

use crate::commands::{build_ovs_get_bridge_mappings_cmd, build_ovs_get_port_tag_cmd};
use crate::ovn::{DatapathBinding, PortBinding, SbClient};
use crate::tables::external_ids;
use crate::types::EvpnType;

/// Attempts made to resolve an OVN VLAN tag before giving up.
const VLAN_TAG_MAX_ATTEMPTS: u32 = 10;

/// Gap between VLAN tag resolution attempts.
const VLAN_TAG_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Final MTU fallback when neither OVN nor the configuration provide one.
const DEFAULT_MTU: u32 = 1500;

/// EVPN annotations read from a port binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvpnAttrs {
    /// 24-bit VXLAN Network Identifier.
    pub vni: u32,
    /// BGP AS number.
    pub bgp_as: String,
    /// EVPN service type (defaults to L3).
    pub evpn_type: EvpnType,
}

/// MAC and IP addresses parsed from `Port_Binding.mac[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPort {
    /// MAC address.
    pub mac: String,
    /// IP addresses; may be empty.
    pub ips: Vec<String>,
}

/// OVN EVPN query and parsing helper.
pub struct OvnEvpnHelper {
    sb: Arc<Latch<Arc<dyn SbClient>>>,
    runner: Arc<dyn CommandRunner>,
    config: Arc<AgentConfig>,
    // Guards only the VLAN tag cache; no other work happens under it.
    vlan_cache: Mutex<HashMap<String, u16>>,
}

impl OvnEvpnHelper {
    /// Creates a helper over the late-bound Southbound handle.
    pub fn new(
        sb: Arc<Latch<Arc<dyn SbClient>>>,
        runner: Arc<dyn CommandRunner>,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            sb,
            runner,
            config,
            vlan_cache: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // VLAN tag resolution
    // ------------------------------------------------------------------

    /// Resolves the VLAN tag OVN uses internally for a network.
    ///
    /// Checks the cache, then retries the query strategies against the
    /// eventually-consistent database. Exhausting the retries raises
    /// [`AgentError::PortNotFound`].
    pub async fn get_ovn_vlan_tag(&self, network_id: &str) -> AgentResult<u16> {
        if let Some(tag) = self.cached_vlan_tag(network_id) {
            debug!(network = %network_id, tag, "VLAN tag cache hit");
            return Ok(tag);
        }

        for attempt in 1..=VLAN_TAG_MAX_ATTEMPTS {
            if let Some(tag) = self.query_vlan_tag(network_id).await {
                self.vlan_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(network_id.to_string(), tag);
                info!(
                    network = %network_id,
                    tag,
                    attempt,
                    "Resolved OVN VLAN tag"
                );
                return Ok(tag);
            }

            if attempt < VLAN_TAG_MAX_ATTEMPTS {
                debug!(
                    network = %network_id,
                    attempt,
                    "OVN VLAN tag not ready, retrying"
                );
                tokio::time::sleep(VLAN_TAG_RETRY_DELAY).await;
            }
        }

        Err(AgentError::port_not_found(format!(
            "OVN localnet/patch port for network {network_id}"
        )))
    }

    fn cached_vlan_tag(&self, network_id: &str) -> Option<u16> {
        self.vlan_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(network_id)
            .copied()
    }

    /// Clears the VLAN tag cache for one network, or entirely.
    pub fn clear_vlan_cache(&self, network_id: Option<&str>) {
        let mut cache = self.vlan_cache.lock().unwrap_or_else(|e| e.into_inner());
        match network_id {
            Some(id) => {
                cache.remove(id);
                debug!(network = %id, "Cleared VLAN tag cache entry");
            }
            None => {
                cache.clear();
                debug!("Cleared entire VLAN tag cache");
            }
        }
    }

    /// One resolution round: provider-network query, then patch-port tag.
    async fn query_vlan_tag(&self, network_id: &str) -> Option<u16> {
        // Strategy A: bridge-mapping-scoped provider network query.
        let sb = self.sb.wait().await;
        let bridge_networks = self.bridge_mapping_networks().await;
        match sb.network_name_and_tag(network_id, &bridge_networks).await {
            Ok(Some((_name, tags))) if !tags.is_empty() => {
                debug!(network = %network_id, tag = tags[0], "Localnet query succeeded");
                return Some(tags[0]);
            }
            Ok(_) => {}
            Err(e) => debug!(network = %network_id, error = %e, "Localnet query failed"),
        }

        // Strategy B: OVS patch-port tag, used by EVPN L2 networks that
        // have no localnet port.
        match self.query_patch_port_tag(network_id, &sb).await {
            Ok(found) => found,
            Err(e) => {
                debug!(network = %network_id, error = %e, "Patch port tag query failed");
                None
            }
        }
    }

    /// Scans patch ports on the datapath and queries their OVS tag.
    async fn query_patch_port_tag(
        &self,
        network_id: &str,
        sb: &Arc<dyn SbClient>,
    ) -> AgentResult<Option<u16>> {
        let ports = sb.list_port_bindings().await?;

        for port in ports
            .iter()
            .filter(|p| p.datapath == network_id && p.is_patch())
        {
            let candidates = [
                format!("patch-{}-to-br-int", port.logical_port),
                format!("patch-{}-to-{}", port.logical_port, self.config.ovs_bridge),
                port.logical_port.clone(),
            ];

            for ovs_port in &candidates {
                let cmd = build_ovs_get_port_tag_cmd(ovs_port);
                let result = match self.runner.run(&cmd).await {
                    Ok(result) => result,
                    Err(e) => {
                        debug!(port = %ovs_port, error = %e, "OVS tag query failed");
                        continue;
                    }
                };
                if !result.success() {
                    continue;
                }
                if let Some(tag) = parse_ovs_tag(&result.stdout) {
                    debug!(port = %ovs_port, tag, "Found VLAN tag on OVS port");
                    return Ok(Some(tag));
                }
            }
        }

        Ok(None)
    }

    /// Returns the OVN bridge-mapping network names from the local OVS.
    ///
    /// The mapping string looks like `physnet1:br-ex,physnet2:br-data`;
    /// the network names are the keys.
    pub async fn bridge_mapping_networks(&self) -> Vec<String> {
        let cmd = build_ovs_get_bridge_mappings_cmd();
        let output = match self.runner.run(&cmd).await {
            Ok(result) if result.success() => result.stdout,
            Ok(_) | Err(_) => {
                debug!("No OVN bridge mappings configured");
                return Vec::new();
            }
        };

        output
            .trim()
            .trim_matches('"')
            .split(',')
            .filter_map(|pair| pair.split(':').next())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    // ------------------------------------------------------------------
    // external_ids parsing
    // ------------------------------------------------------------------

    /// Reads the EVPN annotations of a port binding.
    ///
    /// Returns `None` unless both the VNI and the AS key are present and
    /// the VNI is a valid 24-bit value.
    pub fn evpn_attrs(port: &PortBinding) -> Option<EvpnAttrs> {
        let vni_str = port.external_ids.get(external_ids::VNI)?;
        let bgp_as = port.external_ids.get(external_ids::BGP_AS)?;

        let vni = match vni_str.parse::<u32>() {
            Ok(vni) if vni > 0 && vni < (1 << 24) => vni,
            _ => {
                warn!(
                    port = %port.logical_port,
                    vni = %vni_str,
                    "Ignoring port with invalid VNI"
                );
                return None;
            }
        };

        let evpn_type = port
            .external_ids
            .get(external_ids::EVPN_TYPE)
            .map(|s| EvpnType::from_str(s).unwrap_or(EvpnType::L3))
            .unwrap_or(EvpnType::L3);

        Some(EvpnAttrs {
            vni,
            bgp_as: bgp_as.clone(),
            evpn_type,
        })
    }

    /// Parses a list-valued `external_ids` attribute.
    ///
    /// The value is a JSON list if it parses as one, otherwise the raw
    /// string is a singleton list. Absence yields an empty list.
    pub fn parse_list_attr(ids: &HashMap<String, String>, key: &str) -> Vec<String> {
        let Some(raw) = ids.get(key) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(values) => values,
            Err(_) => vec![raw.clone()],
        }
    }

    /// Parses the optional local-preference attribute.
    pub fn parse_local_pref(ids: &HashMap<String, String>) -> Option<u32> {
        let raw = ids.get(external_ids::LOCAL_PREF)?;
        match raw.parse::<u32>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(value = %raw, "Ignoring malformed local_pref");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Port info and gateway IPs
    // ------------------------------------------------------------------

    /// Parses `Port_Binding.mac[0]` as `"MAC IP1 IP2 …"`.
    ///
    /// `["unknown"]` and empty values mean "no info".
    pub fn extract_port_info(port: &PortBinding) -> Option<ParsedPort> {
        let first = port.mac.first()?;
        if first == "unknown" {
            debug!(port = %port.logical_port, "Port has no MAC information");
            return None;
        }

        let mut fields = first.split_whitespace();
        let mac = fields.next()?.to_string();
        let ips = fields.map(str::to_string).collect();

        Some(ParsedPort { mac, ips })
    }

    /// Extracts gateway IPs for a network from its patch ports.
    ///
    /// Each IP must carry a prefix length; invalid entries are logged
    /// and dropped. Query failures yield an empty list.
    pub async fn extract_gateway_ips(&self, network_id: &str) -> Vec<String> {
        let sb = self.sb.wait().await;
        let ports = match sb.list_port_bindings().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(network = %network_id, error = %e, "Failed to query gateway IPs");
                return Vec::new();
            }
        };

        let mut gateway_ips = Vec::new();
        for port in ports
            .iter()
            .filter(|p| p.datapath == network_id && p.is_patch())
        {
            let Some(info) = Self::extract_port_info(port) else {
                continue;
            };
            for ip in &info.ips {
                match ip.parse::<IpNet>() {
                    Ok(net) => gateway_ips.push(net.to_string()),
                    Err(_) => {
                        warn!(
                            port = %port.logical_port,
                            ip = %ip,
                            "Dropping gateway IP without a valid prefix"
                        );
                    }
                }
            }
        }

        if !gateway_ips.is_empty() {
            info!(
                network = %network_id,
                count = gateway_ips.len(),
                "Extracted gateway IPs"
            );
        }
        gateway_ips
    }

    // ------------------------------------------------------------------
    // MTU resolution
    // ------------------------------------------------------------------

    /// Resolves the network MTU: `neutron:mtu` on the datapath, then the
    /// configured default, then 1500.
    pub fn get_network_mtu(&self, datapath: Option<&DatapathBinding>) -> u32 {
        if let Some(datapath) = datapath {
            if let Some(mtu_str) = datapath.external_ids.get(external_ids::MTU) {
                if let Ok(mtu) = mtu_str.parse::<u32>() {
                    debug!(mtu, "MTU from datapath external_ids");
                    return mtu;
                }
                warn!(value = %mtu_str, "Malformed neutron:mtu, falling back");
            }
        }

        if self.config.network_device_mtu > 0 {
            return self.config.network_device_mtu;
        }

        DEFAULT_MTU
    }
}

/// Parses the OVS textual tag formats: `"N"`, `[]`, `set(N)`.
pub fn parse_ovs_tag(raw: &str) -> Option<u16> {
    let trimmed = raw.trim().trim_matches('"');
    if trimmed.is_empty() || trimmed == "[]" || trimmed == "set()" {
        return None;
    }
    let cleaned = trimmed.replace("set(", "").replace(')', "");
    cleaned.trim().parse::<u16>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(mac: &[&str]) -> PortBinding {
        PortBinding {
            logical_port: "p1".to_string(),
            mac: mac.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_ovs_tag_formats() {
        assert_eq!(parse_ovs_tag("100"), Some(100));
        assert_eq!(parse_ovs_tag("\"100\""), Some(100));
        assert_eq!(parse_ovs_tag("set(100)"), Some(100));
        assert_eq!(parse_ovs_tag("[]"), None);
        assert_eq!(parse_ovs_tag("set()"), None);
        assert_eq!(parse_ovs_tag(""), None);
        assert_eq!(parse_ovs_tag("garbage"), None);
    }

    #[test]
    fn test_extract_port_info() {
        let info =
            OvnEvpnHelper::extract_port_info(&port(&["aa:bb:cc:dd:ee:ff 10.0.0.2 fd00::2"]))
                .unwrap();
        assert_eq!(info.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(info.ips, vec!["10.0.0.2", "fd00::2"]);
    }

    #[test]
    fn test_extract_port_info_mac_only() {
        let info = OvnEvpnHelper::extract_port_info(&port(&["aa:bb:cc:dd:ee:ff"])).unwrap();
        assert_eq!(info.mac, "aa:bb:cc:dd:ee:ff");
        assert!(info.ips.is_empty());
    }

    #[test]
    fn test_extract_port_info_unknown() {
        assert!(OvnEvpnHelper::extract_port_info(&port(&["unknown"])).is_none());
        assert!(OvnEvpnHelper::extract_port_info(&port(&[])).is_none());
    }

    #[test]
    fn test_parse_list_attr() {
        let mut ids = HashMap::new();
        ids.insert(
            external_ids::ROUTE_TARGETS.to_string(),
            r#"["64999:100", "64999:200"]"#.to_string(),
        );
        ids.insert(
            external_ids::IMPORT_TARGETS.to_string(),
            "64999:300".to_string(),
        );

        assert_eq!(
            OvnEvpnHelper::parse_list_attr(&ids, external_ids::ROUTE_TARGETS),
            vec!["64999:100", "64999:200"]
        );
        assert_eq!(
            OvnEvpnHelper::parse_list_attr(&ids, external_ids::IMPORT_TARGETS),
            vec!["64999:300"]
        );
        assert!(OvnEvpnHelper::parse_list_attr(&ids, external_ids::EXPORT_TARGETS).is_empty());
    }

    #[test]
    fn test_parse_local_pref() {
        let mut ids = HashMap::new();
        ids.insert(external_ids::LOCAL_PREF.to_string(), "500".to_string());
        assert_eq!(OvnEvpnHelper::parse_local_pref(&ids), Some(500));

        ids.insert(external_ids::LOCAL_PREF.to_string(), "high".to_string());
        assert_eq!(OvnEvpnHelper::parse_local_pref(&ids), None);
    }

    #[test]
    fn test_evpn_attrs() {
        let mut binding = port(&[]);
        binding
            .external_ids
            .insert(external_ids::VNI.to_string(), "200".to_string());
        binding
            .external_ids
            .insert(external_ids::BGP_AS.to_string(), "64999".to_string());
        binding
            .external_ids
            .insert(external_ids::EVPN_TYPE.to_string(), "l2".to_string());

        let attrs = OvnEvpnHelper::evpn_attrs(&binding).unwrap();
        assert_eq!(attrs.vni, 200);
        assert_eq!(attrs.bgp_as, "64999");
        assert_eq!(attrs.evpn_type, EvpnType::L2);
    }

    #[test]
    fn test_evpn_attrs_default_type_is_l3() {
        let mut binding = port(&[]);
        binding
            .external_ids
            .insert(external_ids::VNI.to_string(), "300".to_string());
        binding
            .external_ids
            .insert(external_ids::BGP_AS.to_string(), "64999".to_string());

        let attrs = OvnEvpnHelper::evpn_attrs(&binding).unwrap();
        assert_eq!(attrs.evpn_type, EvpnType::L3);
    }

    #[test]
    fn test_evpn_attrs_rejects_invalid_vni() {
        let mut binding = port(&[]);
        binding
            .external_ids
            .insert(external_ids::VNI.to_string(), "16777216".to_string());
        binding
            .external_ids
            .insert(external_ids::BGP_AS.to_string(), "64999".to_string());
        assert!(OvnEvpnHelper::evpn_attrs(&binding).is_none());

        binding
            .external_ids
            .insert(external_ids::VNI.to_string(), "not-a-number".to_string());
        assert!(OvnEvpnHelper::evpn_attrs(&binding).is_none());
    }
}
