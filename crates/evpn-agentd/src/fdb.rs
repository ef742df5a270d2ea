//! Bridge FDB and kernel neighbor table manager.
//!
//! Seeding the forwarding database and the ARP/NDP cache is an
//! optimization: the EVPN control plane would learn these mappings
//! dynamically, but static entries trigger immediate Type-2 MACIP
//! advertisement and suppress initial flooding.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use evpn_agent_common::CommandRunner;

use crate::commands::{build_fdb_add_cmd, build_neigh_add_cmd};

/// One FDB entry to seed: MAC on a bridge VLAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbEntry {
    /// MAC address.
    pub mac: String,
    /// Bridge VLAN id.
    pub vlan: u16,
}

/// One neighbor entry to seed: IP-to-MAC on an IRB device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    /// IP address.
    pub ip: String,
    /// MAC address.
    pub mac: String,
    /// IRB device name.
    pub device: String,
}

/// FDB/neighbor seeding statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbStats {
    /// Recorded FDB entries across all bridges.
    pub fdb_entries_total: usize,
    /// Recorded neighbor entries across all devices.
    pub neighbor_entries_total: usize,
}

/// Idempotent, best-effort FDB and neighbor table writer.
pub struct FdbManager {
    runner: Arc<dyn CommandRunner>,
    static_fdb_enabled: bool,
    static_neighbors_enabled: bool,
    /// bridge -> set of (mac, vlan) recorded on it.
    bridge_fdb_entries: HashMap<String, HashSet<(String, u16)>>,
    /// IRB device -> set of (ip, mac) recorded on it.
    static_neighbors: HashMap<String, HashSet<(String, String)>>,
}

impl FdbManager {
    /// Creates a manager; the flags come from `evpn_static_fdb` and
    /// `evpn_static_neighbors`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        static_fdb_enabled: bool,
        static_neighbors_enabled: bool,
    ) -> Self {
        Self {
            runner,
            static_fdb_enabled,
            static_neighbors_enabled,
            bridge_fdb_entries: HashMap::new(),
            static_neighbors: HashMap::new(),
        }
    }

    /// Inserts a static FDB entry unless `(mac, vlan)` is already
    /// recorded for the bridge. Failures are logged, not retried here.
    #[instrument(skip(self))]
    pub async fn ensure_fdb_entry(&mut self, mac: &str, vlan: u16, bridge: &str, port: &str) {
        if !self.static_fdb_enabled {
            return;
        }

        let key = (mac.to_string(), vlan);
        let recorded = self
            .bridge_fdb_entries
            .get(bridge)
            .is_some_and(|entries| entries.contains(&key));
        if recorded {
            return;
        }

        let cmd = build_fdb_add_cmd(mac, port, vlan);
        match self.runner.run_ensure(&cmd).await {
            Ok(_) => {
                self.bridge_fdb_entries
                    .entry(bridge.to_string())
                    .or_default()
                    .insert(key);
                debug!(mac, vlan, bridge, "Added static FDB entry");
            }
            Err(e) => {
                warn!(mac, vlan, error = %e, "Failed to add FDB entry");
            }
        }
    }

    /// Inserts a static neighbor entry unless `(ip, mac)` is already
    /// recorded for the device.
    #[instrument(skip(self))]
    pub async fn ensure_neighbor_entry(&mut self, ip: &str, mac: &str, device: &str) {
        if !self.static_neighbors_enabled {
            return;
        }

        let key = (ip.to_string(), mac.to_string());
        let recorded = self
            .static_neighbors
            .get(device)
            .is_some_and(|entries| entries.contains(&key));
        if recorded {
            return;
        }

        let cmd = build_neigh_add_cmd(ip, mac, device);
        match self.runner.run_ensure(&cmd).await {
            Ok(_) => {
                self.static_neighbors
                    .entry(device.to_string())
                    .or_default()
                    .insert(key);
                debug!(ip, mac, device, "Added static neighbor entry");
            }
            Err(e) => {
                warn!(ip, mac, device, error = %e, "Failed to add neighbor entry");
            }
        }
    }

    /// Applies [`Self::ensure_fdb_entry`] over a batch. Partial failure
    /// is tolerated per entry.
    pub async fn batch_add_fdb(&mut self, entries: &[FdbEntry], bridge: &str, port: &str) {
        if !self.static_fdb_enabled {
            return;
        }
        let before = self.stats().fdb_entries_total;
        for entry in entries {
            self.ensure_fdb_entry(&entry.mac, entry.vlan, bridge, port)
                .await;
        }
        let added = self.stats().fdb_entries_total - before;
        if added > 0 {
            debug!(added, "Batch added FDB entries");
        }
    }

    /// Applies [`Self::ensure_neighbor_entry`] over a batch.
    pub async fn batch_add_neighbors(&mut self, entries: &[NeighborEntry]) {
        if !self.static_neighbors_enabled {
            return;
        }
        let before = self.stats().neighbor_entries_total;
        for entry in entries {
            self.ensure_neighbor_entry(&entry.ip, &entry.mac, &entry.device)
                .await;
        }
        let added = self.stats().neighbor_entries_total - before;
        if added > 0 {
            debug!(added, "Batch added neighbor entries");
        }
    }

    /// Discards the manager's record for a device. Kernel state is not
    /// touched; device removal reaps the kernel entries.
    pub fn cleanup_device(&mut self, device: &str) {
        self.bridge_fdb_entries.remove(device);
        self.static_neighbors.remove(device);
    }

    /// Drops all records. Used by the full sync before re-seeding.
    pub fn reset(&mut self) {
        self.bridge_fdb_entries.clear();
        self.static_neighbors.clear();
    }

    /// Returns true if `(mac, vlan)` is recorded for the bridge.
    pub fn has_fdb_entry(&self, bridge: &str, mac: &str, vlan: u16) -> bool {
        self.bridge_fdb_entries
            .get(bridge)
            .is_some_and(|entries| entries.contains(&(mac.to_string(), vlan)))
    }

    /// Returns seeding statistics.
    pub fn stats(&self) -> FdbStats {
        FdbStats {
            fdb_entries_total: self.bridge_fdb_entries.values().map(HashSet::len).sum(),
            neighbor_entries_total: self.static_neighbors.values().map(HashSet::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evpn_agent_common::{AgentResult, ExecResult};
    use std::sync::Mutex;

    struct RecordingRunner {
        commands: Mutex<Vec<String>>,
        fail_matching: Option<&'static str>,
    }

    impl RecordingRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                fail_matching: None,
            })
        }

        fn failing(marker: &'static str) -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                fail_matching: Some(marker),
            })
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, cmd: &str) -> AgentResult<ExecResult> {
            self.commands.lock().unwrap().push(cmd.to_string());
            if let Some(marker) = self.fail_matching {
                if cmd.contains(marker) {
                    return Ok(ExecResult::failed(2, "Operation not permitted"));
                }
            }
            Ok(ExecResult::ok(""))
        }
    }

    #[tokio::test]
    async fn test_ensure_fdb_entry_records_once() {
        let runner = RecordingRunner::new();
        let mut mgr = FdbManager::new(runner.clone(), true, true);

        mgr.ensure_fdb_entry("aa:bb:cc:dd:ee:ff", 200, "br-evpn", "veth-to-ovs")
            .await;
        mgr.ensure_fdb_entry("aa:bb:cc:dd:ee:ff", 200, "br-evpn", "veth-to-ovs")
            .await;

        assert_eq!(runner.commands().len(), 1);
        assert!(mgr.has_fdb_entry("br-evpn", "aa:bb:cc:dd:ee:ff", 200));
        assert_eq!(mgr.stats().fdb_entries_total, 1);
    }

    #[tokio::test]
    async fn test_disabled_flags_are_noops() {
        let runner = RecordingRunner::new();
        let mut mgr = FdbManager::new(runner.clone(), false, false);

        mgr.ensure_fdb_entry("aa:bb:cc:dd:ee:ff", 200, "br-evpn", "veth-to-ovs")
            .await;
        mgr.ensure_neighbor_entry("10.0.0.2", "aa:bb:cc:dd:ee:ff", "br-evpn.200")
            .await;

        assert!(runner.commands().is_empty());
        assert_eq!(mgr.stats(), FdbStats::default());
    }

    #[tokio::test]
    async fn test_failed_insert_is_not_recorded() {
        let runner = RecordingRunner::failing("fdb add");
        let mut mgr = FdbManager::new(runner.clone(), true, true);

        mgr.ensure_fdb_entry("aa:bb:cc:dd:ee:ff", 200, "br-evpn", "veth-to-ovs")
            .await;

        assert!(!mgr.has_fdb_entry("br-evpn", "aa:bb:cc:dd:ee:ff", 200));
        assert_eq!(mgr.stats().fdb_entries_total, 0);
    }

    #[tokio::test]
    async fn test_batch_tolerates_partial_failure() {
        let runner = RecordingRunner::failing("\"11:11:11:11:11:11\"");
        let mut mgr = FdbManager::new(runner.clone(), true, true);

        let entries = vec![
            FdbEntry {
                mac: "11:11:11:11:11:11".to_string(),
                vlan: 200,
            },
            FdbEntry {
                mac: "22:22:22:22:22:22".to_string(),
                vlan: 200,
            },
        ];
        mgr.batch_add_fdb(&entries, "br-evpn", "veth-to-ovs").await;

        assert_eq!(mgr.stats().fdb_entries_total, 1);
        assert!(mgr.has_fdb_entry("br-evpn", "22:22:22:22:22:22", 200));
    }

    #[tokio::test]
    async fn test_batch_add_neighbors() {
        let runner = RecordingRunner::new();
        let mut mgr = FdbManager::new(runner.clone(), true, true);

        let entries = vec![
            NeighborEntry {
                ip: "10.0.0.2".to_string(),
                mac: "aa:bb:cc:dd:ee:ff".to_string(),
                device: "br-evpn.200".to_string(),
            },
            NeighborEntry {
                ip: "10.0.0.3".to_string(),
                mac: "aa:bb:cc:dd:ee:00".to_string(),
                device: "br-evpn.200".to_string(),
            },
        ];
        mgr.batch_add_neighbors(&entries).await;

        assert_eq!(mgr.stats().neighbor_entries_total, 2);
        assert_eq!(runner.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_device() {
        let runner = RecordingRunner::new();
        let mut mgr = FdbManager::new(runner.clone(), true, true);

        mgr.ensure_neighbor_entry("10.0.0.2", "aa:bb:cc:dd:ee:ff", "br-evpn.200")
            .await;
        assert_eq!(mgr.stats().neighbor_entries_total, 1);

        mgr.cleanup_device("br-evpn.200");
        assert_eq!(mgr.stats().neighbor_entries_total, 0);
        // Only the original insert hit the kernel; cleanup does not.
        assert_eq!(runner.commands().len(), 1);
    }
}
