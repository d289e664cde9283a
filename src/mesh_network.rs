//! A mesh network's set of provisioned nodes.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::constants::address::{UNICAST_MAX, UNICAST_MIN};
use crate::error::NodeError;
use crate::node::ProvisionedNode;
use crate::types::UnicastAddress;

/// Nodes of one network, keyed by device UUID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshNetwork {
    id: Uuid,
    name: String,
    nodes: BTreeMap<Uuid, ProvisionedNode>,
}

impl MeshNetwork {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a node; rejects foreign networks, duplicate devices and overlapping addresses.
    pub fn add_node(&mut self, node: ProvisionedNode) -> Result<(), NodeError> {
        if node.network_id() != self.id {
            return Err(NodeError::InvalidState(format!(
                "node {} belongs to network {}",
                node.identity().device_uuid(),
                node.network_id()
            )));
        }

        let uuid = node.identity().device_uuid();
        if self.nodes.contains_key(&uuid) {
            return Err(NodeError::InvalidState(format!(
                "node {} is already part of the network",
                uuid
            )));
        }

        let first = node.identity().unicast_address().value();
        let last = node.identity().last_address().value();
        if let Some(existing) = self.nodes.values().find(|n| {
            let id = n.identity();
            first <= id.last_address().value() && id.unicast_address().value() <= last
        }) {
            return Err(NodeError::InvalidState(format!(
                "address range {:#06x}..={:#06x} overlaps node {}",
                first,
                last,
                existing.identity().device_uuid()
            )));
        }

        tracing::info!("➕ Node {} joined network {}", uuid, self.id);
        self.nodes.insert(uuid, node);
        Ok(())
    }

    pub fn remove_node(&mut self, device_uuid: &Uuid) -> Option<ProvisionedNode> {
        let removed = self.nodes.remove(device_uuid);
        if removed.is_some() {
            tracing::info!("➖ Node {} removed from network {}", device_uuid, self.id);
        }
        removed
    }

    pub fn node(&self, device_uuid: &Uuid) -> Option<&ProvisionedNode> {
        self.nodes.get(device_uuid)
    }

    pub fn node_mut(&mut self, device_uuid: &Uuid) -> Option<&mut ProvisionedNode> {
        self.nodes.get_mut(device_uuid)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ProvisionedNode> + '_ {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node owning `address`, if any of its elements sits there.
    pub fn node_by_address(&self, address: u16) -> Option<&ProvisionedNode> {
        self.nodes
            .values()
            .find(|n| n.identity().owns_address(address))
    }

    /// Lowest base address with room for `element_count` consecutive elements.
    pub fn next_available_unicast(&self, element_count: u8) -> Option<UnicastAddress> {
        if element_count == 0 {
            return None;
        }
        let mut ranges: Vec<(u16, u16)> = self
            .nodes
            .values()
            .map(|n| {
                let id = n.identity();
                (id.unicast_address().value(), id.last_address().value())
            })
            .collect();
        ranges.sort_unstable();

        let needed = u32::from(element_count);
        let mut candidate = u32::from(UNICAST_MIN);
        for (first, last) in ranges {
            if candidate + needed <= u32::from(first) {
                break;
            }
            candidate = candidate.max(u32::from(last) + 1);
        }

        if candidate + needed - 1 > u32::from(UNICAST_MAX) {
            return None;
        }
        u16::try_from(candidate)
            .ok()
            .and_then(|c| UnicastAddress::new(c).ok())
    }
}
