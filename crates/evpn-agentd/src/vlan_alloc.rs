//! Bridge VLAN allocator.
//!
//! Maps tenant networks onto the finite bridge VLAN space. VLANs map to
//! network ids (not VNIs), preferring VNI = VLAN when that slot is free,
//! and probing deterministically from the VNI otherwise. Nothing is
//! persisted; the mapping is rebuilt from OVN on every restart.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use evpn_agent_common::{AgentError, AgentResult};

/// Allocation statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanStats {
    /// Live allocations.
    pub total_allocated: usize,
    /// Free slots remaining.
    pub free_vlans: usize,
    /// Cumulative successful allocations.
    pub allocations: u64,
    /// Cumulative releases.
    pub releases: u64,
    /// Times the preferred (VNI = VLAN) slot was occupied.
    pub conflicts: u64,
}

/// Collision-free network-id ⇌ bridge-VLAN allocator.
#[derive(Debug)]
pub struct VlanAllocator {
    vlan_min: u16,
    vlan_max: u16,
    network_to_vlan: HashMap<String, u16>,
    vlan_to_network: HashMap<u16, String>,
    free_pool: BTreeSet<u16>,
    allocations: u64,
    releases: u64,
    conflicts: u64,
}

impl VlanAllocator {
    /// Creates an allocator over the inclusive range `[vlan_min, vlan_max]`.
    pub fn new(vlan_min: u16, vlan_max: u16) -> Self {
        let free_pool = (vlan_min..=vlan_max).collect::<BTreeSet<u16>>();
        info!(
            vlan_min,
            vlan_max,
            free = free_pool.len(),
            "VLAN allocator initialized"
        );
        Self {
            vlan_min,
            vlan_max,
            network_to_vlan: HashMap::new(),
            vlan_to_network: HashMap::new(),
            free_pool,
            allocations: 0,
            releases: 0,
            conflicts: 0,
        }
    }

    /// Allocates a bridge VLAN for a network, preferring `vlan == vni`.
    ///
    /// Idempotent: a network that already holds a VLAN gets the same
    /// VLAN back with no side effects.
    pub fn allocate(&mut self, network_id: &str, vni: u32) -> AgentResult<u16> {
        if let Some(&vlan) = self.network_to_vlan.get(network_id) {
            return Ok(vlan);
        }

        let preferred = u16::try_from(vni).ok().filter(|v| {
            (self.vlan_min..=self.vlan_max).contains(v)
        });

        let vlan = match preferred {
            Some(v) if self.free_pool.contains(&v) => {
                debug!(vlan = v, network = %network_id, "Direct VNI to VLAN mapping");
                v
            }
            Some(v) => {
                debug!(vlan = v, vni, "Preferred VLAN occupied, probing");
                self.conflicts += 1;
                self.find_free_vlan(vni)?
            }
            None => {
                debug!(vni, "VNI outside VLAN range, probing");
                self.find_free_vlan(vni)?
            }
        };

        self.network_to_vlan.insert(network_id.to_string(), vlan);
        self.vlan_to_network.insert(vlan, network_id.to_string());
        self.free_pool.remove(&vlan);
        self.allocations += 1;

        info!(vlan, network = %network_id, vni, "Allocated bridge VLAN");
        Ok(vlan)
    }

    /// Releases a network's VLAN. No-op for unknown networks.
    pub fn release(&mut self, network_id: &str) {
        let Some(vlan) = self.network_to_vlan.remove(network_id) else {
            debug!(network = %network_id, "Network has no VLAN allocation");
            return;
        };
        self.vlan_to_network.remove(&vlan);
        self.free_pool.insert(vlan);
        self.releases += 1;
        info!(vlan, network = %network_id, "Released bridge VLAN");
    }

    /// Returns the VLAN held by a network, if any.
    pub fn get_vlan(&self, network_id: &str) -> Option<u16> {
        self.network_to_vlan.get(network_id).copied()
    }

    /// Releases every allocation whose network is not in `active`.
    pub fn cleanup_stale(&mut self, active: &BTreeSet<String>) {
        let stale: Vec<String> = self
            .network_to_vlan
            .keys()
            .filter(|id| !active.contains(*id))
            .cloned()
            .collect();
        if !stale.is_empty() {
            warn!(count = stale.len(), "Cleaning stale VLAN allocations");
            for network_id in stale {
                self.release(&network_id);
            }
        }
    }

    /// Deterministic probe starting at the VNI, wrapping inside the range.
    fn find_free_vlan(&self, vni: u32) -> AgentResult<u16> {
        if self.free_pool.is_empty() {
            return Err(AgentError::VlanIdExhausted);
        }

        let range = i64::from(self.vlan_max) - i64::from(self.vlan_min) + 1;
        let base = (i64::from(vni) - i64::from(self.vlan_min)).rem_euclid(range);
        for offset in 0..range {
            let candidate = ((base + offset) % range) + i64::from(self.vlan_min);
            // candidate stays within [vlan_min, vlan_max], so the cast holds.
            let candidate = candidate as u16;
            if self.free_pool.contains(&candidate) {
                return Ok(candidate);
            }
        }

        Err(AgentError::VlanIdExhausted)
    }

    /// Returns allocation statistics.
    pub fn stats(&self) -> VlanStats {
        VlanStats {
            total_allocated: self.network_to_vlan.len(),
            free_vlans: self.free_pool.len(),
            allocations: self.allocations,
            releases: self.releases,
            conflicts: self.conflicts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> VlanAllocator {
        VlanAllocator::new(100, 4094)
    }

    #[test]
    fn test_preferred_vni_mapping() {
        let mut alloc = allocator();
        let vlan = alloc.allocate("net-a", 200).unwrap();
        assert_eq!(vlan, 200);
        assert_eq!(alloc.stats().conflicts, 0);
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let mut alloc = allocator();
        let first = alloc.allocate("net-a", 200).unwrap();
        let second = alloc.allocate("net-a", 200).unwrap();
        assert_eq!(first, second);
        assert_eq!(alloc.stats().allocations, 1);
        assert_eq!(alloc.stats().total_allocated, 1);
    }

    #[test]
    fn test_conflict_probes_next_slot() {
        let mut alloc = allocator();
        assert_eq!(alloc.allocate("net-a", 200).unwrap(), 200);
        // Same VNI on a different datapath: preferred slot is taken.
        let vlan = alloc.allocate("net-b", 200).unwrap();
        assert_eq!(vlan, 201);
        assert_eq!(alloc.stats().conflicts, 1);
    }

    #[test]
    fn test_vni_out_of_range_uses_probe() {
        let mut alloc = allocator();
        let vlan = alloc.allocate("net-a", 100_000).unwrap();
        assert!((100..=4094).contains(&vlan));
        // Out-of-range VNIs are not conflicts.
        assert_eq!(alloc.stats().conflicts, 0);
    }

    #[test]
    fn test_release_round_trip() {
        let mut alloc = allocator();
        let before = alloc.stats().free_vlans;
        let vlan = alloc.allocate("net-a", 300).unwrap();
        assert_eq!(alloc.stats().free_vlans, before - 1);

        alloc.release("net-a");
        assert_eq!(alloc.stats().free_vlans, before);
        assert_eq!(alloc.get_vlan("net-a"), None);

        // The slot is immediately reusable.
        assert_eq!(alloc.allocate("net-b", 300).unwrap(), vlan);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut alloc = allocator();
        alloc.release("never-seen");
        assert_eq!(alloc.stats().releases, 0);
    }

    #[test]
    fn test_bijection_invariant() {
        let mut alloc = VlanAllocator::new(100, 110);
        for i in 0..8 {
            alloc.allocate(&format!("net-{i}"), 105).unwrap();
        }
        let stats = alloc.stats();
        assert_eq!(stats.total_allocated + stats.free_vlans, 11);

        let mut seen = BTreeSet::new();
        for i in 0..8 {
            let vlan = alloc.get_vlan(&format!("net-{i}")).unwrap();
            assert!(seen.insert(vlan), "VLAN {vlan} allocated twice");
        }
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = VlanAllocator::new(100, 102);
        alloc.allocate("a", 100).unwrap();
        alloc.allocate("b", 101).unwrap();
        alloc.allocate("c", 102).unwrap();
        assert!(matches!(
            alloc.allocate("d", 100),
            Err(AgentError::VlanIdExhausted)
        ));
    }

    #[test]
    fn test_cleanup_stale() {
        let mut alloc = allocator();
        alloc.allocate("live", 200).unwrap();
        alloc.allocate("stale", 300).unwrap();

        let active: BTreeSet<String> = ["live".to_string()].into_iter().collect();
        alloc.cleanup_stale(&active);

        assert!(alloc.get_vlan("live").is_some());
        assert!(alloc.get_vlan("stale").is_none());
        assert_eq!(alloc.stats().releases, 1);
    }
}
