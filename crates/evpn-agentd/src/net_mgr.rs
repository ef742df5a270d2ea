//! EVPN network infrastructure manager.
//!
//! Creates and tears down the per-tenant VRF / VXLAN / IRB /
//! internal-port topology. Resources are created in a fixed order; every
//! successfully created resource is registered for rollback before the
//! next one is attempted, and a failure unwinds the registered resources
//! in reverse with best-effort deletion.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use evpn_agent_common::{AgentConfig, AgentError, AgentResult, CommandRunner};

use crate::commands::{
    build_add_vlan_device_cmd, build_add_vrf_cmd, build_add_vxlan_cmd, build_addr_add_cmd,
    build_bridge_link_learning_cmd, build_bridge_link_neigh_suppress_cmd,
    build_bridge_vlan_add_cmd, build_bridge_vlan_del_cmd, build_del_link_cmd,
    build_ovs_add_internal_port_cmd,
    build_ovs_del_port_cmd, build_ovs_list_ports_cmd, build_ovs_set_port_tag_cmd,
    build_proxy_arp_cmd, build_proxy_ndp_cmd, build_set_link_master_cmd,
    build_set_link_mtu_cmd, build_set_link_nomaster_cmd, build_set_link_up_cmd,
};
use crate::frr::{FrrEmitter, VrfAction, VrfFrrConfig};
use crate::ovn_helper::OvnEvpnHelper;
use crate::types::{irb_name, EvpnType, NetworkInfo, VrfInfo};

/// A resource created during one `ensure_infrastructure` run, recorded
/// in creation order for rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resource {
    Vrf(String),
    Vxlan(String),
    Irb(String),
    InternalPort(String),
}

/// Manages the kernel and OVS resource set of EVPN networks.
pub struct NetworkManager {
    runner: Arc<dyn CommandRunner>,
    config: Arc<AgentConfig>,
    helper: Arc<OvnEvpnHelper>,
    frr: Arc<FrrEmitter>,
    /// VRF device name -> record.
    vrfs: HashMap<String, VrfInfo>,
}

impl NetworkManager {
    /// Creates a manager with no tracked VRFs.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: Arc<AgentConfig>,
        helper: Arc<OvnEvpnHelper>,
        frr: Arc<FrrEmitter>,
    ) -> Self {
        Self {
            runner,
            config,
            helper,
            frr,
            vrfs: HashMap::new(),
        }
    }

    /// Returns the tracked VRFs.
    pub fn vrfs(&self) -> &HashMap<String, VrfInfo> {
        &self.vrfs
    }

    /// Creates the full resource set for a network.
    ///
    /// On failure every resource created by this call is destroyed again
    /// and the network is detached from its VRF record.
    #[instrument(skip(self, info), fields(network = %info.id, vni = info.vni))]
    pub async fn ensure_infrastructure(
        &mut self,
        info: &mut NetworkInfo,
        local_ip: &str,
    ) -> AgentResult<()> {
        info!(
            bridge_vlan = info.bridge_vlan,
            evpn_type = info.evpn_type.as_str(),
            "Ensuring network infrastructure"
        );

        let mut created = Vec::new();
        match self.build(info, local_ip, &mut created).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Infrastructure build failed, rolling back");
                self.detach_network(info);
                self.rollback(&created).await;
                Err(AgentError::resource_build_failed(&info.id, e.to_string()))
            }
        }
    }

    async fn build(
        &mut self,
        info: &mut NetworkInfo,
        local_ip: &str,
        created: &mut Vec<Resource>,
    ) -> AgentResult<()> {
        let bridge = self.config.evpn_bridge.clone();

        // 1. VRF, shared by all networks with the same VNI.
        let vrf = info.vrf_name();
        if !self.vrfs.contains_key(&vrf) {
            self.runner
                .run_ensure(&build_add_vrf_cmd(&vrf, info.route_table_id()))
                .await?;
            self.runner.run_ok(&build_set_link_up_cmd(&vrf)).await?;
            created.push(Resource::Vrf(vrf.clone()));
            self.vrfs.insert(
                vrf.clone(),
                VrfInfo {
                    table_id: info.route_table_id(),
                    vni: info.vni,
                    networks: BTreeSet::new(),
                },
            );
            info!(vrf = %vrf, table_id = info.route_table_id(), "Created VRF");
        }
        if let Some(vrf_info) = self.vrfs.get_mut(&vrf) {
            vrf_info.networks.insert(info.id.clone());
        }

        // 2. VXLAN enslaved to the EVPN bridge; the fabric VLAN is
        // tagged-not-PVID on both the VXLAN and the veth-to-OVS port.
        let vxlan = info.vxlan_name();
        self.runner
            .run_ensure(&build_add_vxlan_cmd(
                &vxlan,
                info.vni,
                local_ip,
                self.config.evpn_udp_dstport,
            ))
            .await?;
        created.push(Resource::Vxlan(vxlan.clone()));
        self.runner
            .run_ok(&build_set_link_mtu_cmd(&vxlan, info.mtu))
            .await?;
        self.runner
            .run_ok(&build_set_link_master_cmd(&vxlan, &bridge))
            .await?;
        self.runner
            .run_ok(&build_bridge_link_learning_cmd(&vxlan, false))
            .await?;
        self.runner
            .run_ok(&build_bridge_link_neigh_suppress_cmd(&vxlan, true))
            .await?;
        self.runner.run_ok(&build_set_link_up_cmd(&vxlan)).await?;
        self.runner
            .run_ok(&build_bridge_vlan_add_cmd(
                &vxlan,
                info.bridge_vlan,
                false,
                false,
            ))
            .await?;
        self.runner
            .run_ok(&build_bridge_vlan_add_cmd(
                &self.config.evpn_bridge_veth,
                info.bridge_vlan,
                false,
                false,
            ))
            .await?;

        // 3. IRB sub-interface in the VRF, with proxy ARP/NDP and the
        // network's gateway addresses.
        let irb = irb_name(&bridge, info.bridge_vlan);
        self.runner
            .run_ensure(&build_add_vlan_device_cmd(&bridge, info.bridge_vlan))
            .await?;
        created.push(Resource::Irb(irb.clone()));
        self.runner
            .run_ok(&build_set_link_mtu_cmd(&irb, info.mtu))
            .await?;
        self.runner
            .run_ok(&build_set_link_master_cmd(&irb, &vrf))
            .await?;
        self.runner.run_ok(&build_set_link_up_cmd(&irb)).await?;
        self.runner.run_ok(&build_proxy_arp_cmd(&irb)).await?;
        self.runner.run_ok(&build_proxy_ndp_cmd(&irb)).await?;

        for gateway_ip in self.helper.extract_gateway_ips(&info.id).await {
            match self
                .runner
                .run_ensure(&build_addr_add_cmd(&gateway_ip, &irb))
                .await
            {
                Ok(_) => info!(ip = %gateway_ip, irb = %irb, "Added gateway IP"),
                Err(e) => warn!(ip = %gateway_ip, error = %e, "Failed to add gateway IP"),
            }
        }

        // 4. OVS internal port, L2 networks only. Its OVS tag is the
        // OVN-side VLAN, while the bridge side uses the allocated VLAN
        // as untagged PVID.
        if info.evpn_type == EvpnType::L2 {
            let port = info.internal_port_name();
            let ovn_vlan = match info.ovn_vlan {
                Some(tag) => tag,
                None => {
                    let tag = self.helper.get_ovn_vlan_tag(&info.id).await?;
                    info.ovn_vlan = Some(tag);
                    tag
                }
            };
            info!(port = %port, ovn_vlan, "Creating OVS internal port");

            let ports_output = self
                .runner
                .run_ok(&build_ovs_list_ports_cmd(&self.config.ovs_bridge))
                .await?;
            if !ports_output.lines().any(|line| line.trim() == port) {
                self.runner
                    .run_ok(&build_ovs_add_internal_port_cmd(
                        &self.config.ovs_bridge,
                        &port,
                    ))
                    .await?;
            }
            created.push(Resource::InternalPort(port.clone()));
            self.runner
                .run_ok(&build_ovs_set_port_tag_cmd(&port, ovn_vlan))
                .await?;
            self.runner.run_ok(&build_set_link_up_cmd(&port)).await?;
            self.runner
                .run_ok(&build_set_link_mtu_cmd(&port, info.mtu))
                .await?;
            self.runner
                .run_ok(&build_set_link_master_cmd(&port, &bridge))
                .await?;
            self.runner
                .run_ok(&build_bridge_vlan_add_cmd(
                    &port,
                    info.bridge_vlan,
                    true,
                    true,
                ))
                .await?;
            self.runner
                .run_ok(&build_bridge_link_learning_cmd(&port, true))
                .await?;
        } else {
            debug!("L3 network, no internal port");
        }

        // 5. FRR VRF declaration.
        self.frr
            .reconfigure_vrf(&VrfFrrConfig::from_network(info, local_ip), VrfAction::AddVrf)
            .await?;

        Ok(())
    }

    /// Destroys a network's resource set in strict reverse order, then
    /// tears the VRF down once its last network detaches. Best-effort:
    /// failures are logged, never raised.
    #[instrument(skip(self, info), fields(network = %info.id, vni = info.vni))]
    pub async fn cleanup_infrastructure(&mut self, info: &NetworkInfo) {
        info!("Cleaning up network infrastructure");

        let irb = irb_name(&self.config.evpn_bridge, info.bridge_vlan);
        if let Err(e) = self.runner.run_delete(&build_del_link_cmd(&irb)).await {
            warn!(device = %irb, error = %e, "Failed to delete IRB");
        }

        let vxlan = info.vxlan_name();
        if let Err(e) = self.runner.run_delete(&build_del_link_cmd(&vxlan)).await {
            warn!(device = %vxlan, error = %e, "Failed to delete VXLAN");
        }

        // Deleting the VXLAN drops its VLAN membership, but the shared
        // veth port keeps the tag unless removed explicitly.
        let veth = self.config.evpn_bridge_veth.clone();
        if let Err(e) = self
            .runner
            .run_delete(&build_bridge_vlan_del_cmd(&veth, info.bridge_vlan))
            .await
        {
            warn!(device = %veth, vlan = info.bridge_vlan, error = %e, "Failed to drop bridge VLAN");
        }

        if info.evpn_type == EvpnType::L2 {
            self.cleanup_internal_port(&info.internal_port_name()).await;
        }

        self.release_vrf_for(info).await;
    }

    /// Removes the network from its VRF record and destroys the VRF when
    /// the record empties.
    async fn release_vrf_for(&mut self, info: &NetworkInfo) {
        let vrf = info.vrf_name();
        let Some(vrf_info) = self.vrfs.get_mut(&vrf) else {
            return;
        };
        vrf_info.networks.remove(&info.id);
        if !vrf_info.networks.is_empty() {
            return;
        }

        info!(vrf = %vrf, "Last network detached, removing VRF");
        let frr_cfg = VrfFrrConfig {
            vrf_name: vrf.clone(),
            vni: info.vni,
            bgp_as: info.bgp_as.clone(),
            route_targets: Vec::new(),
            route_distinguishers: Vec::new(),
            import_targets: Vec::new(),
            export_targets: Vec::new(),
            local_ip: String::new(),
            local_pref: info.local_pref,
        };
        if let Err(e) = self.frr.reconfigure_vrf(&frr_cfg, VrfAction::DelVrf).await {
            warn!(vrf = %vrf, error = %e, "Failed to remove VRF from FRR");
        }

        if self.config.delete_vrf_on_disconnect {
            if let Err(e) = self.runner.run_delete(&build_del_link_cmd(&vrf)).await {
                warn!(vrf = %vrf, error = %e, "Failed to delete VRF device");
            }
        }

        self.vrfs.remove(&vrf);
    }

    /// Detaches and removes an orphaned VRF device found on the host.
    ///
    /// Emits the FRR `del-vrf` for it and deletes the kernel device; an
    /// untracked device has nothing else referencing it.
    pub async fn remove_orphan_vrf(&mut self, vrf_device: &str, vni: u32) {
        warn!(vrf = %vrf_device, vni, "Removing orphaned VRF");
        let frr_cfg = VrfFrrConfig {
            vrf_name: vrf_device.to_string(),
            vni,
            bgp_as: self.config.bgp_as.clone(),
            route_targets: Vec::new(),
            route_distinguishers: Vec::new(),
            import_targets: Vec::new(),
            export_targets: Vec::new(),
            local_ip: String::new(),
            local_pref: None,
        };
        if let Err(e) = self.frr.reconfigure_vrf(&frr_cfg, VrfAction::DelVrf).await {
            warn!(vrf = %vrf_device, error = %e, "Failed to remove orphan VRF from FRR");
        }
        if let Err(e) = self
            .runner
            .run_delete(&build_del_link_cmd(vrf_device))
            .await
        {
            warn!(vrf = %vrf_device, error = %e, "Failed to delete orphan VRF device");
        }
    }

    /// Drops VRF records whose networks all disappeared, removing their
    /// FRR configuration (and devices when configured). Used by the full
    /// sync after rebuilding the live network set.
    pub async fn prune_stale_vrfs(&mut self, live_networks: &BTreeSet<String>) {
        let stale: Vec<(String, VrfInfo)> = self
            .vrfs
            .iter()
            .filter(|(_, vrf_info)| {
                vrf_info.networks.is_disjoint(live_networks)
            })
            .map(|(name, vrf_info)| (name.clone(), vrf_info.clone()))
            .collect();

        for (vrf, vrf_info) in stale {
            warn!(vrf = %vrf, "Pruning VRF with no live networks");
            let frr_cfg = VrfFrrConfig {
                vrf_name: vrf.clone(),
                vni: vrf_info.vni,
                bgp_as: self.config.bgp_as.clone(),
                route_targets: Vec::new(),
                route_distinguishers: Vec::new(),
                import_targets: Vec::new(),
                export_targets: Vec::new(),
                local_ip: String::new(),
                local_pref: None,
            };
            if let Err(e) = self.frr.reconfigure_vrf(&frr_cfg, VrfAction::DelVrf).await {
                warn!(vrf = %vrf, error = %e, "Failed to remove stale VRF from FRR");
            }
            if self.config.delete_vrf_on_disconnect {
                if let Err(e) = self.runner.run_delete(&build_del_link_cmd(&vrf)).await {
                    warn!(vrf = %vrf, error = %e, "Failed to delete stale VRF device");
                }
            }
            self.vrfs.remove(&vrf);
        }
    }

    /// Removes an orphaned OVS internal port found on the host.
    pub async fn remove_orphan_internal_port(&self, port: &str) {
        self.cleanup_internal_port(port).await;
    }

    /// Retains only live network ids inside the surviving VRF records.
    pub fn retain_live_networks(&mut self, live_networks: &BTreeSet<String>) {
        for vrf_info in self.vrfs.values_mut() {
            vrf_info
                .networks
                .retain(|network| live_networks.contains(network));
        }
    }

    async fn cleanup_internal_port(&self, port: &str) {
        debug!(port = %port, "Cleaning up internal port");

        if let Err(e) = self.runner.run(&build_set_link_nomaster_cmd(port)).await {
            debug!(port = %port, error = %e, "nomaster failed");
        }

        match self
            .runner
            .run_ok(&build_ovs_list_ports_cmd(&self.config.ovs_bridge))
            .await
        {
            Ok(output) => {
                if output.lines().any(|line| line.trim() == port) {
                    if let Err(e) = self
                        .runner
                        .run_ok(&build_ovs_del_port_cmd(&self.config.ovs_bridge, port))
                        .await
                    {
                        debug!(port = %port, error = %e, "OVS del-port failed");
                    }
                }
            }
            Err(e) => debug!(error = %e, "OVS list-ports failed"),
        }

        if let Err(e) = self.runner.run_delete(&build_del_link_cmd(port)).await {
            debug!(port = %port, error = %e, "Device delete failed");
        }
    }

    fn detach_network(&mut self, info: &NetworkInfo) {
        if let Some(vrf_info) = self.vrfs.get_mut(&info.vrf_name()) {
            vrf_info.networks.remove(&info.id);
        }
    }

    /// Walks the rollback list in reverse, destroying each resource
    /// with best-effort deletion.
    async fn rollback(&mut self, created: &[Resource]) {
        warn!(count = created.len(), "Rolling back created resources");
        for resource in created.iter().rev() {
            match resource {
                Resource::InternalPort(port) => self.cleanup_internal_port(port).await,
                Resource::Vxlan(device) | Resource::Irb(device) => {
                    if let Err(e) = self.runner.run_delete(&build_del_link_cmd(device)).await {
                        warn!(device = %device, error = %e, "Rollback delete failed");
                    }
                }
                Resource::Vrf(vrf) => {
                    if let Err(e) = self.runner.run_delete(&build_del_link_cmd(vrf)).await {
                        warn!(vrf = %vrf, error = %e, "Rollback VRF delete failed");
                    }
                    self.vrfs.remove(vrf);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evpn_agent_common::{ExecResult, Latch};
    use std::sync::Mutex;

    use crate::ovn::{DatapathBinding, PortBinding, SbClient};

    struct EmptySb;

    #[async_trait]
    impl SbClient for EmptySb {
        async fn list_port_bindings(&self) -> AgentResult<Vec<PortBinding>> {
            Ok(Vec::new())
        }

        async fn get_datapath(&self, _uuid: &str) -> AgentResult<Option<DatapathBinding>> {
            Ok(None)
        }

        async fn network_name_and_tag(
            &self,
            _datapath: &str,
            _bridge_networks: &[String],
        ) -> AgentResult<Option<(String, Vec<u16>)>> {
            Ok(None)
        }
    }

    struct ScriptedRunner {
        commands: Mutex<Vec<String>>,
        fail_matching: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                fail_matching: Mutex::new(Vec::new()),
            })
        }

        fn fail_on(&self, marker: &str) {
            self.fail_matching.lock().unwrap().push(marker.to_string());
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn contains(&self, fragment: &str) -> bool {
            self.commands().iter().any(|c| c.contains(fragment))
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &str) -> AgentResult<ExecResult> {
            self.commands.lock().unwrap().push(cmd.to_string());
            let fail = self
                .fail_matching
                .lock()
                .unwrap()
                .iter()
                .any(|marker| cmd.contains(marker));
            if fail {
                return Ok(ExecResult::failed(2, "Operation not permitted"));
            }
            // vtysh -f writes nothing; list commands return nothing.
            Ok(ExecResult::ok(""))
        }
    }

    fn manager(runner: Arc<ScriptedRunner>) -> NetworkManager {
        let config = Arc::new(AgentConfig::default());
        let sb: Arc<Latch<Arc<dyn SbClient>>> = Arc::new(Latch::new());
        sb.set(Arc::new(EmptySb));
        let helper = Arc::new(OvnEvpnHelper::new(
            Arc::clone(&sb),
            runner.clone(),
            Arc::clone(&config),
        ));
        let frr = Arc::new(FrrEmitter::new(runner.clone(), Arc::clone(&config)));
        NetworkManager::new(runner, config, helper, frr)
    }

    fn l3_network(id: &str, vni: u32) -> NetworkInfo {
        NetworkInfo {
            id: id.to_string(),
            vni,
            evpn_type: EvpnType::L3,
            bgp_as: "64999".to_string(),
            bridge_vlan: vni as u16,
            ovn_vlan: None,
            route_targets: vec![format!("64999:{vni}")],
            route_distinguishers: Vec::new(),
            import_targets: Vec::new(),
            export_targets: Vec::new(),
            local_pref: None,
            mtu: 1500,
        }
    }

    #[tokio::test]
    async fn test_ensure_infrastructure_l3() {
        let runner = ScriptedRunner::new();
        let mut mgr = manager(runner.clone());
        let mut info = l3_network("dp-1", 200);

        mgr.ensure_infrastructure(&mut info, "192.0.2.10")
            .await
            .unwrap();

        assert!(runner.contains("ip link add \"vrf-200\" type vrf table 1000200"));
        assert!(runner.contains("type vxlan id 200 local \"192.0.2.10\" dstport 4789"));
        assert!(runner.contains("name \"br-evpn.200\" type vlan id 200"));
        assert!(runner.contains("learning off"));
        assert!(runner.contains("neigh_suppress on"));
        // L3 networks get no internal port.
        assert!(!runner.contains("evpn-200"));
        assert!(runner.contains("vtysh -f"));

        let vrf = mgr.vrfs().get("vrf-200").unwrap();
        assert_eq!(vrf.table_id, 1_000_200);
        assert!(vrf.networks.contains("dp-1"));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_for_vrf() {
        let runner = ScriptedRunner::new();
        let mut mgr = manager(runner.clone());

        let mut first = l3_network("dp-1", 200);
        mgr.ensure_infrastructure(&mut first, "192.0.2.10")
            .await
            .unwrap();
        let mut second = l3_network("dp-2", 200);
        second.bridge_vlan = 201;
        mgr.ensure_infrastructure(&mut second, "192.0.2.10")
            .await
            .unwrap();

        let vrf_creates = runner
            .commands()
            .iter()
            .filter(|c| c.contains("type vrf table"))
            .count();
        assert_eq!(vrf_creates, 1);
        assert_eq!(mgr.vrfs().get("vrf-200").unwrap().networks.len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_on_irb_failure() {
        let runner = ScriptedRunner::new();
        runner.fail_on("type vlan id 200");
        let mut mgr = manager(runner.clone());
        let mut info = l3_network("dp-1", 200);

        let result = mgr.ensure_infrastructure(&mut info, "192.0.2.10").await;
        assert!(matches!(
            result,
            Err(AgentError::ResourceBuildFailed { .. })
        ));

        // The VXLAN and the VRF created earlier are deleted again.
        assert!(runner.contains("ip link del \"vxlan-200\""));
        assert!(runner.contains("ip link del \"vrf-200\""));
        assert!(mgr.vrfs().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_vrf_on_last_detach() {
        let runner = ScriptedRunner::new();
        let mut mgr = manager(runner.clone());
        let mut info = l3_network("dp-1", 200);
        mgr.ensure_infrastructure(&mut info, "192.0.2.10")
            .await
            .unwrap();

        mgr.cleanup_infrastructure(&info).await;

        assert!(runner.contains("ip link del \"br-evpn.200\""));
        assert!(runner.contains("ip link del \"vxlan-200\""));
        assert!(mgr.vrfs().is_empty());
        // delete_vrf_on_disconnect defaults to false: device stays.
        assert!(!runner.contains("ip link del \"vrf-200\""));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_shared_vrf() {
        let runner = ScriptedRunner::new();
        let mut mgr = manager(runner.clone());

        let mut first = l3_network("dp-1", 200);
        mgr.ensure_infrastructure(&mut first, "192.0.2.10")
            .await
            .unwrap();
        let mut second = l3_network("dp-2", 200);
        second.bridge_vlan = 201;
        mgr.ensure_infrastructure(&mut second, "192.0.2.10")
            .await
            .unwrap();

        mgr.cleanup_infrastructure(&first).await;

        let vrf = mgr.vrfs().get("vrf-200").unwrap();
        assert!(!vrf.networks.contains("dp-1"));
        assert!(vrf.networks.contains("dp-2"));
    }

    #[tokio::test]
    async fn test_prune_stale_vrfs() {
        let runner = ScriptedRunner::new();
        let mut mgr = manager(runner.clone());
        let mut info = l3_network("dp-1", 200);
        mgr.ensure_infrastructure(&mut info, "192.0.2.10")
            .await
            .unwrap();

        let live = BTreeSet::new();
        mgr.prune_stale_vrfs(&live).await;

        assert!(mgr.vrfs().is_empty());
    }
}
