//! evpn-agentd - OVN to EVPN/VXLAN fabric control agent
//!
//! Watches the OVN Southbound database and translates tenant-network
//! events into a concrete kernel and BGP data plane: Linux VRFs, VXLAN
//! tunnels, bridge VLANs, FDB and neighbor entries, and FRR BGP EVPN
//! configuration, reconciling the two sides against drift.

pub mod commands;
pub mod driver;
pub mod fdb;
pub mod frr;
pub mod metrics;
pub mod net_mgr;
pub mod ovn;
pub mod ovn_helper;
pub mod tables;
pub mod types;
pub mod vlan_alloc;

pub use driver::{run, EvpnDriver, EvpnEvent};
pub use fdb::{FdbEntry, FdbManager, FdbStats, NeighborEntry};
pub use frr::{FrrEmitter, VrfAction, VrfFrrConfig};
pub use metrics::Metrics;
pub use net_mgr::NetworkManager;
pub use ovn::{DatapathBinding, PortBinding, SbClient};
pub use ovn_helper::OvnEvpnHelper;
pub use types::{EvpnType, NetworkInfo, PortInfo, StaticRoute, VrfInfo};
pub use vlan_alloc::{VlanAllocator, VlanStats};
