//! FRR configuration emitter.
//!
//! Renders BGP EVPN VRF configuration as plain text and applies it
//! transactionally: the rendered block is written to a temporary file and
//! handed to `vtysh -f`. The temp file is removed afterwards regardless
//! of the outcome. Application failures surface as [`AgentError::Frr`]
//! and are healed by the periodic FRR resync.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use evpn_agent_common::{AgentConfig, AgentError, AgentResult, CommandRunner};

use crate::commands::{build_vtysh_apply_cmd, build_vtysh_show_bgp_summary_cmd};
use crate::types::NetworkInfo;

/// Incrementally built FRR configuration block.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    lines: Vec<String>,
}

impl ConfigBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one configuration line.
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Renders the block with a trailing newline.
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// VRF reconfiguration action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrfAction {
    /// Declare the VRF and its BGP instance.
    AddVrf,
    /// Remove the VRF and its BGP instance.
    DelVrf,
}

/// Parameters for one VRF's FRR configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfFrrConfig {
    /// VRF device name (`vrf-<VNI>`).
    pub vrf_name: String,
    /// VXLAN Network Identifier.
    pub vni: u32,
    /// BGP AS of the VRF-scoped instance.
    pub bgp_as: String,
    /// Route targets imported and exported.
    pub route_targets: Vec<String>,
    /// Route distinguishers; the first wins, `local_ip:vni` otherwise.
    pub route_distinguishers: Vec<String>,
    /// Import-only targets.
    pub import_targets: Vec<String>,
    /// Export-only targets.
    pub export_targets: Vec<String>,
    /// Local VTEP address, used for the default RD.
    pub local_ip: String,
    /// Optional local preference applied to inbound fabric routes.
    pub local_pref: Option<u32>,
}

impl VrfFrrConfig {
    /// Builds the FRR parameters for a network.
    pub fn from_network(info: &NetworkInfo, local_ip: &str) -> Self {
        Self {
            vrf_name: info.vrf_name(),
            vni: info.vni,
            bgp_as: info.bgp_as.clone(),
            route_targets: info.route_targets.clone(),
            route_distinguishers: info.route_distinguishers.clone(),
            import_targets: info.import_targets.clone(),
            export_targets: info.export_targets.clone(),
            local_ip: local_ip.to_string(),
            local_pref: info.local_pref,
        }
    }

    /// Name of the local-preference route-map for this VRF.
    pub fn route_map_name(&self) -> String {
        format!("{}-lp", self.vrf_name)
    }
}

/// Renders the `add-vrf` configuration block.
pub fn render_add_vrf(cfg: &VrfFrrConfig, redistribute: &[String]) -> String {
    let mut out = ConfigBuilder::new();

    if let Some(local_pref) = cfg.local_pref {
        out.push(format!("route-map {} permit 10", cfg.route_map_name()));
        out.push(format!(" set local-preference {local_pref}"));
        out.push("exit");
        out.push("");
    }

    out.push(format!("vrf {}", cfg.vrf_name));
    out.push(format!(" vni {}", cfg.vni));
    out.push("exit-vrf");
    out.push("");
    out.push(format!("router bgp {} vrf {}", cfg.bgp_as, cfg.vrf_name));
    if cfg.local_pref.is_some() {
        out.push(" neighbor fabric peer-group");
    }

    for family in ["ipv4", "ipv6"] {
        out.push(format!(" address-family {family} unicast"));
        for redist in redistribute {
            out.push(format!("  redistribute {redist}"));
        }
        if cfg.local_pref.is_some() {
            out.push(format!(
                "  neighbor fabric route-map {} in",
                cfg.route_map_name()
            ));
        }
        out.push(" exit-address-family");
    }

    out.push(" address-family l2vpn evpn");
    out.push("  advertise ipv4 unicast");
    out.push("  advertise ipv6 unicast");
    match cfg.route_distinguishers.first() {
        Some(rd) => out.push(format!("  rd {rd}")),
        None => out.push(format!("  rd {}:{}", cfg.local_ip, cfg.vni)),
    }
    for rt in &cfg.route_targets {
        out.push(format!("  route-target import {rt}"));
        out.push(format!("  route-target export {rt}"));
    }
    for rt in &cfg.export_targets {
        out.push(format!("  route-target export {rt}"));
    }
    for rt in &cfg.import_targets {
        out.push(format!("  route-target import {rt}"));
    }
    out.push(" exit-address-family");

    out.render()
}

/// Renders the `del-vrf` configuration block.
pub fn render_del_vrf(cfg: &VrfFrrConfig) -> String {
    let mut out = ConfigBuilder::new();
    out.push(format!("no vrf {}", cfg.vrf_name));
    out.push(format!("no router bgp {} vrf {}", cfg.bgp_as, cfg.vrf_name));
    if cfg.local_pref.is_some() {
        out.push(format!("no route-map {}", cfg.route_map_name()));
    }
    out.render()
}

/// Renders the VRF route-leaking block between a VRF and the global
/// BGP instance.
pub fn render_vrf_leak(
    vrf_name: &str,
    bgp_as: &str,
    router_id: &str,
    redistribute: &[String],
) -> String {
    let mut out = ConfigBuilder::new();
    out.push(format!("router bgp {bgp_as}"));
    for family in ["ipv4", "ipv6"] {
        out.push(format!(" address-family {family} unicast"));
        out.push(format!("  import vrf {vrf_name}"));
        out.push(" exit-address-family");
    }
    out.push("");
    out.push(format!("router bgp {bgp_as} vrf {vrf_name}"));
    out.push(format!(" bgp router-id {router_id}"));
    for family in ["ipv4", "ipv6"] {
        out.push(format!(" address-family {family} unicast"));
        for redist in redistribute {
            out.push(format!("  redistribute {redist}"));
        }
        out.push(" exit-address-family");
    }
    out.render()
}

/// Renders the base EVPN block (`advertise-all-vni`).
pub fn render_base_config(bgp_as: &str) -> String {
    let mut out = ConfigBuilder::new();
    out.push(format!("router bgp {bgp_as}"));
    out.push(" address-family l2vpn evpn");
    out.push("  advertise-all-vni");
    out.push(" exit-address-family");
    out.push("exit");
    out.render()
}

/// Applies rendered FRR configuration through `vtysh`.
pub struct FrrEmitter {
    runner: Arc<dyn CommandRunner>,
    config: Arc<AgentConfig>,
    redistribute: Mutex<BTreeSet<String>>,
}

impl FrrEmitter {
    /// Creates an emitter with the default redistribute set `{connected}`.
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<AgentConfig>) -> Self {
        Self {
            runner,
            config,
            redistribute: Mutex::new(BTreeSet::from(["connected".to_string()])),
        }
    }

    /// Replaces the default redistribute set used by the templates.
    pub fn set_default_redistribute(&self, options: impl IntoIterator<Item = String>) {
        let mut redistribute = self.redistribute.lock().unwrap_or_else(|e| e.into_inner());
        *redistribute = options.into_iter().collect();
    }

    fn redistribute_list(&self) -> Vec<String> {
        self.redistribute
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Renders and applies one VRF reconfiguration.
    pub async fn reconfigure_vrf(&self, cfg: &VrfFrrConfig, action: VrfAction) -> AgentResult<()> {
        info!(vrf = %cfg.vrf_name, vni = cfg.vni, ?action, "FRR VRF reconfiguration");
        let text = match action {
            VrfAction::AddVrf => render_add_vrf(cfg, &self.redistribute_list()),
            VrfAction::DelVrf => render_del_vrf(cfg),
        };
        self.apply(&text).await
    }

    /// Emits `advertise-all-vni` under the global BGP instance.
    ///
    /// No-op when the AS is unknown.
    pub async fn ensure_base_config(&self) -> AgentResult<()> {
        if self.config.bgp_as.is_empty() {
            warn!("Cannot configure base EVPN without a BGP AS number");
            return Ok(());
        }
        self.apply(&render_base_config(&self.config.bgp_as)).await
    }

    /// Leaks a VRF's routes into the global BGP instance and back.
    ///
    /// A router-id is required; without one the leak is skipped.
    pub async fn vrf_leak(&self, vrf_name: &str, bgp_as: &str) -> AgentResult<()> {
        let Some(router_id) = self.router_id().await else {
            error!(vrf = %vrf_name, "Unknown router-id, needed for route leaking");
            return Ok(());
        };
        let text = render_vrf_leak(vrf_name, bgp_as, &router_id, &self.redistribute_list());
        self.apply(&text).await
    }

    /// Resolves the BGP router id: configuration first, then
    /// `show ip bgp summary json`.
    async fn router_id(&self) -> Option<String> {
        if let Some(router_id) = &self.config.bgp_router_id {
            return Some(router_id.clone());
        }

        let output = match self.runner.run_ok(&build_vtysh_show_bgp_summary_cmd()).await {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "BGP summary query failed");
                return None;
            }
        };

        let summary: serde_json::Value = serde_json::from_str(&output).ok()?;
        summary
            .get("ipv4Unicast")?
            .get("routerId")?
            .as_str()
            .map(str::to_string)
    }

    /// Writes the configuration to a temp file and runs `vtysh -f` on it.
    ///
    /// The temp file is deleted when it drops, on success and failure
    /// alike.
    pub async fn apply(&self, config_text: &str) -> AgentResult<()> {
        let mut file = tempfile::Builder::new()
            .prefix("frr-")
            .suffix(".conf")
            .tempfile()
            .map_err(|e| AgentError::frr(format!("failed to create config file: {e}")))?;
        file.write_all(config_text.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| AgentError::frr(format!("failed to write config file: {e}")))?;

        let path = file.path().to_string_lossy().to_string();
        debug!(path = %path, "Applying FRR configuration");

        self.runner
            .run_ok(&build_vtysh_apply_cmd(&path))
            .await
            .map_err(|e| AgentError::frr(format!("vtysh apply failed: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vrf_config() -> VrfFrrConfig {
        VrfFrrConfig {
            vrf_name: "vrf-200".to_string(),
            vni: 200,
            bgp_as: "64999".to_string(),
            route_targets: vec!["64999:200".to_string()],
            route_distinguishers: vec![],
            import_targets: vec![],
            export_targets: vec![],
            local_ip: "192.0.2.10".to_string(),
            local_pref: None,
        }
    }

    fn redistribute() -> Vec<String> {
        vec!["connected".to_string()]
    }

    #[test]
    fn test_render_add_vrf() {
        let rendered = render_add_vrf(&vrf_config(), &redistribute());
        assert_eq!(
            rendered,
            "\
vrf vrf-200
 vni 200
exit-vrf

router bgp 64999 vrf vrf-200
 address-family ipv4 unicast
  redistribute connected
 exit-address-family
 address-family ipv6 unicast
  redistribute connected
 exit-address-family
 address-family l2vpn evpn
  advertise ipv4 unicast
  advertise ipv6 unicast
  rd 192.0.2.10:200
  route-target import 64999:200
  route-target export 64999:200
 exit-address-family
"
        );
    }

    #[test]
    fn test_render_add_vrf_explicit_rd_and_targets() {
        let mut cfg = vrf_config();
        cfg.route_distinguishers = vec!["64999:1".to_string(), "64999:2".to_string()];
        cfg.export_targets = vec!["65000:999".to_string()];
        cfg.import_targets = vec!["65000:111".to_string()];

        let rendered = render_add_vrf(&cfg, &redistribute());
        assert!(rendered.contains("  rd 64999:1\n"));
        assert!(!rendered.contains("64999:2"));
        assert!(rendered.contains("  route-target export 65000:999\n"));
        assert!(rendered.contains("  route-target import 65000:111\n"));
        assert!(!rendered.contains("route-target import 65000:999"));
        assert!(!rendered.contains("route-target export 65000:111"));
    }

    #[test]
    fn test_render_add_vrf_local_pref() {
        let mut cfg = vrf_config();
        cfg.local_pref = Some(500);

        let rendered = render_add_vrf(&cfg, &redistribute());
        assert!(rendered.starts_with(
            "\
route-map vrf-200-lp permit 10
 set local-preference 500
exit
"
        ));
        assert!(rendered.contains(" neighbor fabric peer-group\n"));
        let inbound = rendered
            .matches("  neighbor fabric route-map vrf-200-lp in\n")
            .count();
        assert_eq!(inbound, 2);
    }

    #[test]
    fn test_render_del_vrf() {
        let rendered = render_del_vrf(&vrf_config());
        assert_eq!(
            rendered,
            "\
no vrf vrf-200
no router bgp 64999 vrf vrf-200
"
        );
    }

    #[test]
    fn test_render_del_vrf_with_local_pref() {
        let mut cfg = vrf_config();
        cfg.local_pref = Some(500);
        let rendered = render_del_vrf(&cfg);
        assert!(rendered.ends_with("no route-map vrf-200-lp\n"));
    }

    #[test]
    fn test_render_vrf_leak() {
        let rendered = render_vrf_leak("vrf-200", "64999", "192.0.2.1", &redistribute());
        assert_eq!(
            rendered,
            "\
router bgp 64999
 address-family ipv4 unicast
  import vrf vrf-200
 exit-address-family
 address-family ipv6 unicast
  import vrf vrf-200
 exit-address-family

router bgp 64999 vrf vrf-200
 bgp router-id 192.0.2.1
 address-family ipv4 unicast
  redistribute connected
 exit-address-family
 address-family ipv6 unicast
  redistribute connected
 exit-address-family
"
        );
    }

    #[test]
    fn test_render_base_config() {
        assert_eq!(
            render_base_config("64999"),
            "\
router bgp 64999
 address-family l2vpn evpn
  advertise-all-vni
 exit-address-family
exit
"
        );
    }

    #[test]
    fn test_set_default_redistribute() {
        use async_trait::async_trait;
        use evpn_agent_common::ExecResult;

        struct NullRunner;

        #[async_trait]
        impl CommandRunner for NullRunner {
            async fn run(&self, _cmd: &str) -> evpn_agent_common::AgentResult<ExecResult> {
                Ok(ExecResult::ok(""))
            }
        }

        let emitter = FrrEmitter::new(
            std::sync::Arc::new(NullRunner),
            std::sync::Arc::new(AgentConfig::default()),
        );
        assert_eq!(emitter.redistribute_list(), vec!["connected".to_string()]);

        emitter.set_default_redistribute(["kernel".to_string(), "connected".to_string()]);
        assert_eq!(
            emitter.redistribute_list(),
            vec!["connected".to_string(), "kernel".to_string()]
        );
    }

    #[test]
    fn test_from_network() {
        let info = NetworkInfo {
            id: "dp-1".to_string(),
            vni: 300,
            evpn_type: crate::types::EvpnType::L3,
            bgp_as: "64999".to_string(),
            bridge_vlan: 300,
            ovn_vlan: None,
            route_targets: vec!["64999:300".to_string()],
            route_distinguishers: vec![],
            import_targets: vec![],
            export_targets: vec![],
            local_pref: Some(200),
            mtu: 1500,
        };
        let cfg = VrfFrrConfig::from_network(&info, "192.0.2.10");
        assert_eq!(cfg.vrf_name, "vrf-300");
        assert_eq!(cfg.vni, 300);
        assert_eq!(cfg.local_pref, Some(200));
        assert_eq!(cfg.local_ip, "192.0.2.10");
    }
}
