//! In-memory OVN Southbound database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use evpn_agent_common::AgentResult;
use evpn_agentd::ovn::{DatapathBinding, PortBinding, SbClient};

/// Mock Southbound client backed by plain maps.
#[derive(Default)]
pub struct MockSbClient {
    port_bindings: Mutex<Vec<PortBinding>>,
    datapaths: Mutex<HashMap<String, DatapathBinding>>,
    /// datapath -> (network name, VLAN tags)
    network_tags: Mutex<HashMap<String, (String, Vec<u16>)>>,
    /// datapath -> queries still answered with "not found" before the
    /// tag becomes visible (models eventual consistency).
    deferred_tags: Mutex<HashMap<String, usize>>,
    tag_queries: AtomicUsize,
}

impl MockSbClient {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one `Port_Binding` row.
    pub fn add_port_binding(&self, row: PortBinding) {
        self.port_bindings.lock().unwrap().push(row);
    }

    /// Replaces all `Port_Binding` rows.
    pub fn set_port_bindings(&self, rows: Vec<PortBinding>) {
        *self.port_bindings.lock().unwrap() = rows;
    }

    /// Removes rows by logical port name.
    pub fn remove_port_binding(&self, logical_port: &str) {
        self.port_bindings
            .lock()
            .unwrap()
            .retain(|row| row.logical_port != logical_port);
    }

    /// Adds one `Datapath_Binding` row.
    pub fn add_datapath(&self, row: DatapathBinding) {
        self.datapaths.lock().unwrap().insert(row.uuid.clone(), row);
    }

    /// Sets the provider network name and VLAN tags for a datapath.
    pub fn set_network_tag(&self, datapath: &str, name: &str, tags: Vec<u16>) {
        self.network_tags
            .lock()
            .unwrap()
            .insert(datapath.to_string(), (name.to_string(), tags));
    }

    /// Makes the next `misses` tag queries for a datapath come back
    /// empty before the configured tag is revealed.
    pub fn defer_network_tag(&self, datapath: &str, misses: usize) {
        self.deferred_tags
            .lock()
            .unwrap()
            .insert(datapath.to_string(), misses);
    }

    /// Number of `network_name_and_tag` queries served.
    pub fn tag_query_count(&self) -> usize {
        self.tag_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SbClient for MockSbClient {
    async fn list_port_bindings(&self) -> AgentResult<Vec<PortBinding>> {
        Ok(self.port_bindings.lock().unwrap().clone())
    }

    async fn get_datapath(&self, uuid: &str) -> AgentResult<Option<DatapathBinding>> {
        Ok(self.datapaths.lock().unwrap().get(uuid).cloned())
    }

    async fn network_name_and_tag(
        &self,
        datapath: &str,
        _bridge_networks: &[String],
    ) -> AgentResult<Option<(String, Vec<u16>)>> {
        self.tag_queries.fetch_add(1, Ordering::SeqCst);

        {
            let mut deferred = self.deferred_tags.lock().unwrap();
            if let Some(misses) = deferred.get_mut(datapath) {
                if *misses > 0 {
                    *misses -= 1;
                    return Ok(None);
                }
            }
        }

        Ok(self.network_tags.lock().unwrap().get(datapath).cloned())
    }
}
