//! EVPN driver: event reconciliation engine.
//!
//! Routes OVN port-binding events and periodic resync ticks into
//! idempotent data plane mutations. Every public entry point serializes
//! on one mutex, so handlers execute strictly one at a time; that lock
//! also protects the network manager, the VLAN allocator, the FDB
//! manager and the network/port maps.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use evpn_agent_common::{AgentConfig, AgentError, AgentResult, CommandRunner, Latch};

use crate::commands::{
    build_add_bridge_cmd, build_add_veth_cmd, build_del_link_cmd, build_list_ipv4_addresses_cmd,
    build_list_links_cmd, build_ovs_add_port_cmd, build_ovs_get_system_id_cmd,
    build_ovs_list_ports_cmd,
    build_route_flush_table_cmd, build_route_replace_cmd, build_set_bridge_vlan_filtering_cmd,
    build_set_link_master_cmd, build_set_link_up_cmd, parse_ipv4_addresses, parse_link_names,
};
use crate::fdb::{FdbEntry, FdbManager, NeighborEntry};
use crate::frr::{FrrEmitter, VrfAction, VrfFrrConfig};
use crate::metrics::Metrics;
use crate::net_mgr::NetworkManager;
use crate::ovn::{PortBinding, SbClient};
use crate::ovn_helper::OvnEvpnHelper;
use crate::tables::external_ids;
use crate::types::{
    irb_name, EvpnType, NetworkInfo, PortInfo, StaticRoute, VrfInfo, INTERNAL_PORT_PREFIX,
    VRF_PREFIX, VXLAN_PREFIX,
};
use crate::vlan_alloc::{VlanAllocator, VlanStats};

/// Structured events produced by the OVN watchers.
#[derive(Debug, Clone)]
pub enum EvpnEvent {
    /// An EVPN-annotated subnet was attached to a logical router.
    SubnetRouterAttached(PortBinding),
    /// An EVPN-annotated subnet was detached from a logical router.
    SubnetRouterDetached(PortBinding),
    /// A port was bound to the local chassis.
    PortBoundToChassis(PortBinding),
    /// A port was unbound from the local chassis.
    PortUnboundFromChassis(PortBinding),
    /// A localnet port appeared on a datapath.
    LocalnetCreated(PortBinding),
    /// A localnet port disappeared from a datapath.
    LocalnetDeleted(PortBinding),
    /// A per-port EVPN association was created.
    PortAssociationCreated(PortBinding),
    /// A per-port EVPN association was deleted.
    PortAssociationDeleted(PortBinding),
    /// A tenant port was created (only when tenant exposure is enabled).
    TenantPortCreated(PortBinding),
    /// A tenant port was deleted.
    TenantPortDeleted(PortBinding),
    /// A tenant port appeared on a remote chassis. EVPN Type-2
    /// signaling replaces explicit exposure, so this is a no-op.
    RemoteIpExposed(PortBinding),
    /// A tenant port disappeared on a remote chassis. No-op.
    RemoteIpWithdrawn(PortBinding),
}

/// State behind the driver mutex.
struct DriverState {
    config: Arc<AgentConfig>,
    runner: Arc<dyn CommandRunner>,
    sb: Arc<Latch<Arc<dyn SbClient>>>,
    helper: Arc<OvnEvpnHelper>,
    frr: Arc<FrrEmitter>,
    net_mgr: NetworkManager,
    fdb: FdbManager,
    vlans: VlanAllocator,
    /// Datapath UUID -> network record.
    networks: HashMap<String, NetworkInfo>,
    /// Logical port -> port record.
    ports: HashMap<String, PortInfo>,
    metrics: Metrics,
    /// Local VTEP address, resolved in `start()`.
    local_ip: Option<String>,
}

/// The OVN EVPN driver.
pub struct EvpnDriver {
    config: Arc<AgentConfig>,
    sb: Arc<Latch<Arc<dyn SbClient>>>,
    state: Mutex<DriverState>,
}

impl EvpnDriver {
    /// Creates a driver. The OVN connection is handed over later via
    /// [`EvpnDriver::start`]; accessors block on the latch until then.
    pub fn new(config: Arc<AgentConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        let sb: Arc<Latch<Arc<dyn SbClient>>> = Arc::new(Latch::new());
        let helper = Arc::new(OvnEvpnHelper::new(
            Arc::clone(&sb),
            Arc::clone(&runner),
            Arc::clone(&config),
        ));
        let frr = Arc::new(FrrEmitter::new(Arc::clone(&runner), Arc::clone(&config)));
        let net_mgr = NetworkManager::new(
            Arc::clone(&runner),
            Arc::clone(&config),
            Arc::clone(&helper),
            Arc::clone(&frr),
        );
        let fdb = FdbManager::new(
            Arc::clone(&runner),
            config.evpn_static_fdb,
            config.evpn_static_neighbors,
        );
        let vlans = VlanAllocator::new(config.evpn_vlan_range_min, config.evpn_vlan_range_max);

        let state = DriverState {
            config: Arc::clone(&config),
            runner,
            sb: Arc::clone(&sb),
            helper,
            frr,
            net_mgr,
            fdb,
            vlans,
            networks: HashMap::new(),
            ports: HashMap::new(),
            metrics: Metrics::default(),
            local_ip: None,
        };

        Self {
            config,
            sb,
            state: Mutex::new(state),
        }
    }

    /// Initializes the host-wide EVPN prerequisites, resolves the VTEP
    /// address, and publishes the OVN Southbound handle.
    pub async fn start(&self, sb: Arc<dyn SbClient>) -> AgentResult<()> {
        info!(
            exposing_method = self.config.exposing_method.as_str(),
            "Starting OVN EVPN driver"
        );

        let mut state = self.state.lock().await;

        match state.runner.run_ok(&build_ovs_get_system_id_cmd()).await {
            Ok(chassis) => info!(chassis = %chassis.trim_matches('"'), "Loaded chassis"),
            Err(e) => debug!(error = %e, "Chassis id unavailable"),
        }

        state.ensure_prerequisites().await?;

        let local_ip = state.resolve_local_vtep_ip().await?;
        info!(vtep = %local_ip, "Resolved local VTEP address");
        state.local_ip = Some(local_ip);

        if state.config.clear_vrf_routes_on_startup {
            info!(
                table = state.config.bgp_vrf_table_id,
                "Clearing VRF routes on startup"
            );
            let cmd = build_route_flush_table_cmd(state.config.bgp_vrf_table_id);
            if let Err(e) = state.runner.run_ok(&cmd).await {
                warn!(error = %e, "Failed to flush VRF routes");
            }
        }

        self.sb.set(sb);
        info!("OVN EVPN driver started");
        Ok(())
    }

    /// Dispatches one watcher event. Handler failures are contained:
    /// logged, counted, and dropped.
    pub async fn handle_event(&self, event: EvpnEvent) {
        let mut state = self.state.lock().await;
        let result = match event {
            EvpnEvent::SubnetRouterAttached(row) => state.expose_subnet(&row).await,
            EvpnEvent::SubnetRouterDetached(row) => state.withdraw_subnet(&row).await,
            EvpnEvent::PortBoundToChassis(row) => {
                let cr_lrp = row.is_chassisredirect();
                state.expose_ip(&row, cr_lrp).await
            }
            EvpnEvent::PortUnboundFromChassis(row) => {
                let cr_lrp = row.is_chassisredirect();
                state.withdraw_ip(&row, cr_lrp).await
            }
            EvpnEvent::LocalnetCreated(row) | EvpnEvent::LocalnetDeleted(row) => {
                state.handle_localnet_change(&row).await
            }
            EvpnEvent::PortAssociationCreated(row) => state.expose_port_association(&row).await,
            EvpnEvent::PortAssociationDeleted(row) => state.withdraw_port_association(&row).await,
            EvpnEvent::TenantPortCreated(row) => {
                if state.config.expose_tenant_networks {
                    state.expose_ip(&row, false).await
                } else {
                    debug!(port = %row.logical_port, "Tenant exposure disabled");
                    Ok(())
                }
            }
            EvpnEvent::TenantPortDeleted(row) => {
                if state.config.expose_tenant_networks {
                    state.withdraw_ip(&row, false).await
                } else {
                    Ok(())
                }
            }
            EvpnEvent::RemoteIpExposed(row) | EvpnEvent::RemoteIpWithdrawn(row) => {
                debug!(port = %row.logical_port, "Remote IP event is a no-op in EVPN mode");
                Ok(())
            }
        };

        if let Err(e) = result {
            state.metrics.sync_errors_total += 1;
            warn!(error = %e, "Event handler failed");
        }
    }

    /// Runs a full sync against the OVN database.
    ///
    /// On failure the previous network snapshot is restored and the
    /// error re-raised for the supervisor.
    pub async fn sync(&self) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        state.sync().await
    }

    /// Re-emits the FRR configuration of every known VRF. Resilient to
    /// FRR restarts.
    pub async fn frr_sync(&self) {
        let mut state = self.state.lock().await;
        state.frr_sync().await;
    }

    /// Returns a snapshot of the live networks.
    pub async fn networks(&self) -> HashMap<String, NetworkInfo> {
        self.state.lock().await.networks.clone()
    }

    /// Returns a snapshot of the tracked ports.
    pub async fn ports(&self) -> HashMap<String, PortInfo> {
        self.state.lock().await.ports.clone()
    }

    /// Returns a snapshot of the tracked VRFs.
    pub async fn vrfs(&self) -> HashMap<String, VrfInfo> {
        self.state.lock().await.net_mgr.vrfs().clone()
    }

    /// Returns the current metrics.
    pub async fn metrics(&self) -> Metrics {
        let mut state = self.state.lock().await;
        state.update_gauges();
        state.metrics.clone()
    }

    /// Returns the VLAN allocator statistics.
    pub async fn vlan_stats(&self) -> VlanStats {
        self.state.lock().await.vlans.stats()
    }
}

impl DriverState {
    fn vtep_ip(&self) -> AgentResult<String> {
        self.local_ip
            .clone()
            .ok_or_else(|| AgentError::internal("VTEP address unresolved, driver not started"))
    }

    /// Host-wide EVPN prerequisites: one VLAN-filtering bridge, one veth
    /// pair joining that bridge to OVS, base FRR EVPN configuration.
    async fn ensure_prerequisites(&mut self) -> AgentResult<()> {
        info!("Setting up EVPN prerequisites");
        let bridge = self.config.evpn_bridge.clone();
        let evpn_veth = self.config.evpn_bridge_veth.clone();
        let ovs_veth = self.config.evpn_ovs_veth.clone();
        let ovs_bridge = self.config.ovs_bridge.clone();

        self.runner
            .run_ensure(&build_add_bridge_cmd(&bridge))
            .await?;
        self.runner
            .run_ok(&build_set_bridge_vlan_filtering_cmd(&bridge))
            .await?;
        self.runner.run_ok(&build_set_link_up_cmd(&bridge)).await?;

        let links = parse_link_names(&self.runner.run_ok(&build_list_links_cmd()).await?);
        if !links.iter().any(|name| name == &evpn_veth) {
            info!(veth = %evpn_veth, peer = %ovs_veth, "Creating veth pair");
            self.runner
                .run_ensure(&build_add_veth_cmd(&evpn_veth, &ovs_veth))
                .await?;
        }
        self.runner
            .run_ok(&build_set_link_master_cmd(&evpn_veth, &bridge))
            .await?;
        self.runner
            .run_ok(&build_set_link_up_cmd(&evpn_veth))
            .await?;
        self.runner.run_ok(&build_set_link_up_cmd(&ovs_veth)).await?;

        match self
            .runner
            .run_ok(&build_ovs_list_ports_cmd(&ovs_bridge))
            .await
        {
            Ok(ports) => {
                if !ports.lines().any(|line| line.trim() == ovs_veth) {
                    info!(port = %ovs_veth, bridge = %ovs_bridge, "Adding veth to OVS");
                    if let Err(e) = self
                        .runner
                        .run_ok(&build_ovs_add_port_cmd(&ovs_bridge, &ovs_veth))
                        .await
                    {
                        warn!(error = %e, "Failed to add OVS port");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list OVS ports"),
        }

        self.frr.ensure_base_config().await?;
        info!("EVPN prerequisites ready");
        Ok(())
    }

    /// Resolves the VTEP: configured address, then the first IPv4 on the
    /// configured NIC, then a non-loopback address on `lo`.
    async fn resolve_local_vtep_ip(&self) -> AgentResult<String> {
        if let Some(ip) = &self.config.evpn_local_ip {
            return Ok(ip.clone());
        }

        if let Some(nic) = &self.config.evpn_nic {
            match self
                .runner
                .run_ok(&build_list_ipv4_addresses_cmd(nic))
                .await
            {
                Ok(output) => {
                    if let Some(ip) = parse_ipv4_addresses(&output).into_iter().next() {
                        return Ok(ip);
                    }
                    warn!(nic = %nic, "No IPv4 address on configured NIC");
                }
                Err(e) => warn!(nic = %nic, error = %e, "Failed to query NIC addresses"),
            }
        }

        if let Ok(output) = self
            .runner
            .run_ok(&build_list_ipv4_addresses_cmd("lo"))
            .await
        {
            if let Some(ip) = parse_ipv4_addresses(&output)
                .into_iter()
                .find(|ip| !ip.starts_with("127."))
            {
                return Ok(ip);
            }
        }

        Err(AgentError::config_invalid(
            "evpn_local_ip",
            "no VTEP address available, set evpn_local_ip or evpn_nic",
        ))
    }

    /// Builds the network record for an EVPN-annotated port binding,
    /// allocating its bridge VLAN.
    async fn build_network_info(&mut self, row: &PortBinding) -> AgentResult<NetworkInfo> {
        let attrs = OvnEvpnHelper::evpn_attrs(row).ok_or_else(|| {
            AgentError::ovn_query(
                "evpn_attrs",
                format!("port {} carries no EVPN annotations", row.logical_port),
            )
        })?;

        let network_id = row.datapath.clone();
        let bridge_vlan = self.vlans.allocate(&network_id, attrs.vni)?;

        let sb = self.sb.wait().await;
        let datapath = match sb.get_datapath(&network_id).await {
            Ok(datapath) => datapath,
            Err(e) => {
                debug!(network = %network_id, error = %e, "Datapath lookup failed");
                None
            }
        };
        let mtu = self.helper.get_network_mtu(datapath.as_ref());

        Ok(NetworkInfo {
            id: network_id,
            vni: attrs.vni,
            evpn_type: attrs.evpn_type,
            bgp_as: attrs.bgp_as,
            bridge_vlan,
            ovn_vlan: None,
            route_targets: OvnEvpnHelper::parse_list_attr(
                &row.external_ids,
                external_ids::ROUTE_TARGETS,
            ),
            route_distinguishers: OvnEvpnHelper::parse_list_attr(
                &row.external_ids,
                external_ids::ROUTE_DISTINGUISHERS,
            ),
            import_targets: OvnEvpnHelper::parse_list_attr(
                &row.external_ids,
                external_ids::IMPORT_TARGETS,
            ),
            export_targets: OvnEvpnHelper::parse_list_attr(
                &row.external_ids,
                external_ids::EXPORT_TARGETS,
            ),
            local_pref: OvnEvpnHelper::parse_local_pref(&row.external_ids),
            mtu,
        })
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    #[instrument(skip(self, row), fields(port = %row.logical_port))]
    async fn expose_subnet(&mut self, row: &PortBinding) -> AgentResult<()> {
        info!("Exposing EVPN subnet");

        let mut info = self.build_network_info(row).await?;
        let local_ip = self.vtep_ip()?;
        self.net_mgr
            .ensure_infrastructure(&mut info, &local_ip)
            .await?;
        self.networks.insert(info.id.clone(), info);
        Ok(())
    }

    #[instrument(skip(self, row), fields(port = %row.logical_port))]
    async fn withdraw_subnet(&mut self, row: &PortBinding) -> AgentResult<()> {
        let network_id = &row.datapath;
        let Some(info) = self.networks.remove(network_id) else {
            debug!(network = %network_id, "Network not tracked");
            return Ok(());
        };

        info!(network = %network_id, vlan = info.bridge_vlan, "Withdrawing EVPN subnet");
        self.net_mgr.cleanup_infrastructure(&info).await;

        let irb = irb_name(&self.config.evpn_bridge, info.bridge_vlan);
        self.fdb.cleanup_device(&irb);
        self.helper.clear_vlan_cache(Some(network_id));
        self.ports.retain(|_, port| port.network_id != info.id);
        self.vlans.release(&info.id);
        Ok(())
    }

    #[instrument(skip(self, row), fields(port = %row.logical_port))]
    async fn expose_ip(&mut self, row: &PortBinding, cr_lrp: bool) -> AgentResult<()> {
        if cr_lrp {
            debug!("Gateway port bound, nothing to seed");
            return Ok(());
        }

        let Some(info) = self.networks.get(&row.datapath) else {
            debug!("Port is not on an EVPN network");
            return Ok(());
        };
        let (network_id, evpn_type, bridge_vlan) =
            (info.id.clone(), info.evpn_type, info.bridge_vlan);

        let Some(parsed) = OvnEvpnHelper::extract_port_info(row) else {
            debug!("Port has no MAC information");
            return Ok(());
        };

        info!(mac = %parsed.mac, ips = ?parsed.ips, "Seeding forwarding state for port");
        let bridge = self.config.evpn_bridge.clone();
        let bridge_port = self.config.evpn_bridge_veth.clone();
        match evpn_type {
            EvpnType::L2 => {
                self.fdb
                    .ensure_fdb_entry(&parsed.mac, bridge_vlan, &bridge, &bridge_port)
                    .await;
            }
            EvpnType::L3 => {
                let irb = irb_name(&bridge, bridge_vlan);
                for ip in &parsed.ips {
                    self.fdb.ensure_neighbor_entry(ip, &parsed.mac, &irb).await;
                }
            }
        }

        self.ports.insert(
            row.logical_port.clone(),
            PortInfo {
                mac: parsed.mac,
                ips: parsed.ips,
                network_id,
                bridge_vlan,
            },
        );
        Ok(())
    }

    #[instrument(skip(self, row), fields(port = %row.logical_port))]
    async fn withdraw_ip(&mut self, row: &PortBinding, cr_lrp: bool) -> AgentResult<()> {
        if cr_lrp {
            return Ok(());
        }
        // Kernel FDB/neighbor entries are reaped by device removal or
        // the next full sync.
        if let Some(port) = self.ports.remove(&row.logical_port) {
            info!(mac = %port.mac, "Dropped port record");
        }
        Ok(())
    }

    #[instrument(skip(self, row), fields(port = %row.logical_port))]
    async fn expose_port_association(&mut self, row: &PortBinding) -> AgentResult<()> {
        info!("Exposing port association");

        if !self.networks.contains_key(&row.datapath) {
            let mut info = self.build_network_info(row).await?;
            let local_ip = self.vtep_ip()?;
            self.net_mgr
                .ensure_infrastructure(&mut info, &local_ip)
                .await?;
            self.networks.insert(info.id.clone(), info);
        }

        self.expose_ip(row, false).await?;

        if let Some(raw_routes) = row.external_ids.get(external_ids::ROUTES).cloned() {
            let table_id = match self.networks.get(&row.datapath) {
                Some(info) => info.route_table_id(),
                None => return Ok(()),
            };
            self.add_port_custom_routes(&raw_routes, table_id).await;
        }
        Ok(())
    }

    #[instrument(skip(self, row), fields(port = %row.logical_port))]
    async fn withdraw_port_association(&mut self, row: &PortBinding) -> AgentResult<()> {
        // Infrastructure teardown is left to the next full sync.
        self.ports.remove(&row.logical_port);
        Ok(())
    }

    /// Localnet changes can shift the OVN VLAN tag, so drop the cached
    /// tag and reconcile everything.
    async fn handle_localnet_change(&mut self, row: &PortBinding) -> AgentResult<()> {
        info!(network = %row.datapath, "Localnet port changed, resyncing");
        self.helper.clear_vlan_cache(Some(&row.datapath));
        self.sync().await
    }

    /// Inserts custom routes from a port association into the VRF table.
    async fn add_port_custom_routes(&mut self, raw: &str, table_id: u32) {
        let routes: Vec<StaticRoute> = match serde_json::from_str(raw) {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, "Failed to parse custom routes");
                return;
            }
        };

        for route in routes {
            let ipv6 = match route.destination.parse::<ipnet::IpNet>() {
                Ok(ipnet::IpNet::V4(_)) => false,
                Ok(ipnet::IpNet::V6(_)) => true,
                Err(_) => {
                    warn!(destination = %route.destination, "Invalid route destination");
                    continue;
                }
            };
            let cmd =
                build_route_replace_cmd(&route.destination, &route.nexthop, table_id, ipv6);
            match self.runner.run_ok(&cmd).await {
                Ok(_) => info!(
                    destination = %route.destination,
                    nexthop = %route.nexthop,
                    table = table_id,
                    "Added custom route"
                ),
                Err(e) => warn!(
                    destination = %route.destination,
                    error = %e,
                    "Failed to add custom route"
                ),
            }
        }
    }

    // ------------------------------------------------------------------
    // Full sync
    // ------------------------------------------------------------------

    async fn sync(&mut self) -> AgentResult<()> {
        info!("Starting EVPN sync");
        let started = Instant::now();
        let snapshot = self.networks.clone();

        match self.run_sync().await {
            Ok(()) => {
                self.metrics.sync_count += 1;
                self.metrics.last_sync_duration_secs = started.elapsed().as_secs_f64();
                self.metrics.last_sync_time = Some(Utc::now());
                self.update_gauges();
                info!(
                    networks = self.networks.len(),
                    vrfs = self.net_mgr.vrfs().len(),
                    ports = self.ports.len(),
                    duration_secs = self.metrics.last_sync_duration_secs,
                    "EVPN sync completed"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "EVPN sync failed, restoring snapshot");
                self.networks = snapshot;
                self.metrics.sync_errors_total += 1;
                Err(e)
            }
        }
    }

    async fn run_sync(&mut self) -> AgentResult<()> {
        self.networks.clear();
        self.ports.clear();
        self.fdb.reset();

        let sb = self.sb.wait().await;
        let all_ports = sb.list_port_bindings().await?;
        let evpn_ports: Vec<PortBinding> = all_ports
            .into_iter()
            .filter(PortBinding::is_evpn_annotated)
            .collect();
        info!(count = evpn_ports.len(), "Found EVPN annotated ports");

        let mut by_network: HashMap<String, Vec<PortBinding>> = HashMap::new();
        for port in evpn_ports {
            by_network.entry(port.datapath.clone()).or_default().push(port);
        }

        for (network_id, ports) in by_network {
            if let Err(e) = self.sync_network(&network_id, &ports).await {
                warn!(network = %network_id, error = %e, "Failed to sync network");
                self.metrics.sync_errors_total += 1;
            }
        }

        let live: BTreeSet<String> = self.networks.keys().cloned().collect();
        self.net_mgr.retain_live_networks(&live);
        self.net_mgr.prune_stale_vrfs(&live).await;
        self.cleanup_orphan_devices().await;
        self.vlans.cleanup_stale(&live);

        Ok(())
    }

    /// Rebuilds one network and batch-seeds forwarding state for all of
    /// its ports.
    async fn sync_network(
        &mut self,
        network_id: &str,
        ports: &[PortBinding],
    ) -> AgentResult<()> {
        debug!(network = %network_id, ports = ports.len(), "Syncing network");

        // All ports of a datapath carry the same EVPN annotations; any
        // one of them works as the sample.
        let mut info = self.build_network_info(&ports[0]).await?;
        let local_ip = self.vtep_ip()?;
        self.net_mgr
            .ensure_infrastructure(&mut info, &local_ip)
            .await?;

        let bridge = self.config.evpn_bridge.clone();
        let bridge_port = self.config.evpn_bridge_veth.clone();
        let irb = irb_name(&bridge, info.bridge_vlan);

        let mut fdb_entries = Vec::new();
        let mut neighbor_entries = Vec::new();
        for port in ports {
            let Some(parsed) = OvnEvpnHelper::extract_port_info(port) else {
                continue;
            };
            match info.evpn_type {
                EvpnType::L2 => fdb_entries.push(FdbEntry {
                    mac: parsed.mac.clone(),
                    vlan: info.bridge_vlan,
                }),
                EvpnType::L3 => {
                    for ip in &parsed.ips {
                        neighbor_entries.push(NeighborEntry {
                            ip: ip.clone(),
                            mac: parsed.mac.clone(),
                            device: irb.clone(),
                        });
                    }
                }
            }
            self.ports.insert(
                port.logical_port.clone(),
                PortInfo {
                    mac: parsed.mac,
                    ips: parsed.ips,
                    network_id: info.id.clone(),
                    bridge_vlan: info.bridge_vlan,
                },
            );
        }

        self.fdb
            .batch_add_fdb(&fdb_entries, &bridge, &bridge_port)
            .await;
        self.fdb.batch_add_neighbors(&neighbor_entries).await;

        self.networks.insert(info.id.clone(), info);
        Ok(())
    }

    /// Deletes host devices with agent prefixes whose identifier is not
    /// live anymore.
    async fn cleanup_orphan_devices(&mut self) {
        let output = match self.runner.run_ok(&build_list_links_cmd()).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Failed to list host links");
                return;
            }
        };

        let live_vnis: HashSet<u32> = self.networks.values().map(|n| n.vni).collect();

        for name in parse_link_names(&output) {
            if let Some(vni_str) = name.strip_prefix(VXLAN_PREFIX) {
                let Ok(vni) = vni_str.parse::<u32>() else {
                    continue;
                };
                if !live_vnis.contains(&vni) {
                    warn!(device = %name, vni, "Deleting orphaned VXLAN device");
                    if let Err(e) = self.runner.run_delete(&build_del_link_cmd(&name)).await {
                        warn!(device = %name, error = %e, "Failed to delete orphan VXLAN");
                    }
                }
            } else if let Some(vni_str) = name.strip_prefix(VRF_PREFIX) {
                if self.net_mgr.vrfs().contains_key(&name) {
                    continue;
                }
                let Ok(vni) = vni_str.parse::<u32>() else {
                    continue;
                };
                self.net_mgr.remove_orphan_vrf(&name, vni).await;
            } else if let Some(vni_str) = name.strip_prefix(INTERNAL_PORT_PREFIX) {
                let Ok(vni) = vni_str.parse::<u32>() else {
                    continue;
                };
                if !live_vnis.contains(&vni) {
                    warn!(device = %name, vni, "Removing orphaned internal port");
                    self.net_mgr.remove_orphan_internal_port(&name).await;
                }
            }
        }
    }

    /// Re-applies the FRR configuration of every tracked VRF using the
    /// latest per-network parameters.
    async fn frr_sync(&mut self) {
        debug!("Syncing FRR EVPN configuration");

        if let Err(e) = self.frr.ensure_base_config().await {
            warn!(error = %e, "Failed to ensure base EVPN configuration");
            self.metrics.sync_errors_total += 1;
        }

        let Ok(local_ip) = self.vtep_ip() else {
            debug!("VTEP unresolved, skipping FRR VRF sync");
            return;
        };

        let configs: Vec<VrfFrrConfig> = self
            .net_mgr
            .vrfs()
            .values()
            .filter_map(|vrf_info| {
                vrf_info
                    .networks
                    .iter()
                    .find_map(|id| self.networks.get(id))
                    .map(|info| VrfFrrConfig::from_network(info, &local_ip))
            })
            .collect();

        for cfg in configs {
            if let Err(e) = self.frr.reconfigure_vrf(&cfg, VrfAction::AddVrf).await {
                warn!(vrf = %cfg.vrf_name, error = %e, "FRR VRF resync failed");
                self.metrics.sync_errors_total += 1;
            }
        }
    }

    fn update_gauges(&mut self) {
        self.metrics.networks_total = self.networks.len();
        self.metrics.networks_l2 = self
            .networks
            .values()
            .filter(|n| n.evpn_type == EvpnType::L2)
            .count();
        self.metrics.networks_l3 = self
            .networks
            .values()
            .filter(|n| n.evpn_type == EvpnType::L3)
            .count();
        self.metrics.vrfs_total = self.net_mgr.vrfs().len();
        self.metrics.ports_total = self.ports.len();
        let fdb_stats = self.fdb.stats();
        self.metrics.record_fdb_stats(&fdb_stats);
        self.metrics.vlan_stats = self.vlans.stats();
    }
}

/// Drives the agent: publishes the OVN handle, runs the initial full
/// sync, then serves watcher events and the two periodic workers until
/// the event stream closes.
pub async fn run(
    driver: Arc<EvpnDriver>,
    sb: Arc<dyn SbClient>,
    mut events: mpsc::Receiver<EvpnEvent>,
) -> AgentResult<()> {
    driver.start(sb).await?;

    if let Err(e) = driver.sync().await {
        warn!(error = %e, "Initial sync failed, retrying at the next tick");
    }

    let mut reconcile = tokio::time::interval(Duration::from_secs(
        driver.config.reconcile_interval_secs,
    ));
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut frr_reconcile = tokio::time::interval(Duration::from_secs(
        driver.config.frr_reconcile_interval_secs,
    ));
    frr_reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both intervals fire immediately once; the initial sync covered that.
    reconcile.tick().await;
    frr_reconcile.tick().await;

    loop {
        tokio::select! {
            maybe_event = events.recv() => match maybe_event {
                Some(event) => driver.handle_event(event).await,
                None => {
                    info!("Event stream closed, shutting down");
                    return Ok(());
                }
            },
            _ = reconcile.tick() => {
                if let Err(e) = driver.sync().await {
                    warn!(error = %e, "Periodic sync failed");
                }
            }
            _ = frr_reconcile.tick() => driver.frr_sync().await,
        }
    }
}
