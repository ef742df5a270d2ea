//! Sync metrics for the EVPN driver.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::fdb::FdbStats;
use crate::vlan_alloc::VlanStats;

/// Counters and gauges updated by the reconciler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    /// Completed full syncs.
    pub sync_count: u64,
    /// Errors raised by syncs and event handlers.
    pub sync_errors_total: u64,
    /// Duration of the last full sync, seconds.
    pub last_sync_duration_secs: f64,
    /// Completion time of the last full sync.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Live EVPN networks.
    pub networks_total: usize,
    /// Live L2 networks.
    pub networks_l2: usize,
    /// Live L3 networks.
    pub networks_l3: usize,
    /// Live VRFs.
    pub vrfs_total: usize,
    /// Tracked ports.
    pub ports_total: usize,
    /// Seeded FDB entries.
    pub fdb_entries_total: usize,
    /// Seeded neighbor entries.
    pub neighbor_entries_total: usize,
    /// VLAN allocator statistics.
    pub vlan_stats: VlanStats,
}

impl Metrics {
    /// Folds the FDB manager statistics into the gauges.
    pub fn record_fdb_stats(&mut self, stats: &FdbStats) {
        self.fdb_entries_total = stats.fdb_entries_total;
        self.neighbor_entries_total = stats.neighbor_entries_total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_metrics() {
        let metrics = Metrics::default();
        assert_eq!(metrics.sync_count, 0);
        assert_eq!(metrics.sync_errors_total, 0);
        assert!(metrics.last_sync_time.is_none());
    }

    #[test]
    fn test_record_fdb_stats() {
        let mut metrics = Metrics::default();
        metrics.record_fdb_stats(&FdbStats {
            fdb_entries_total: 3,
            neighbor_entries_total: 5,
        });
        assert_eq!(metrics.fdb_entries_total, 3);
        assert_eq!(metrics.neighbor_entries_total, 5);
    }
}
