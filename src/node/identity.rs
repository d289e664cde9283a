//! Immutable device identity captured when provisioning completes.

use uuid::Uuid;

use crate::constants::node::MAX_TTL;
use crate::error::NodeError;
use crate::types::{Key128, UnicastAddress};

/// Who the device is and where it lives in the address space.
///
/// Nothing here changes after the node exists; there are no setters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    device_uuid: Uuid,
    device_key: Key128,
    unicast_address: UnicastAddress,
    element_count: u8,
    ttl: u8,
    /// Milliseconds since the Unix epoch
    provisioned_at: i64,
}

impl NodeIdentity {
    pub fn new(
        device_uuid: Uuid,
        device_key: Key128,
        unicast_address: UnicastAddress,
        element_count: u8,
        ttl: u8,
        provisioned_at: i64,
    ) -> Result<Self, NodeError> {
        if element_count == 0 {
            return Err(NodeError::Malformed(
                "a node must have at least one element".to_string(),
            ));
        }
        // The last element must still be a unicast address.
        unicast_address.offset(u16::from(element_count) - 1)?;

        if ttl > MAX_TTL {
            return Err(NodeError::Malformed(format!(
                "ttl {} exceeds {}",
                ttl, MAX_TTL
            )));
        }

        Ok(Self {
            device_uuid,
            device_key,
            unicast_address,
            element_count,
            ttl,
            provisioned_at,
        })
    }

    pub fn device_uuid(&self) -> Uuid {
        self.device_uuid
    }

    pub fn device_key(&self) -> &Key128 {
        &self.device_key
    }

    pub fn unicast_address(&self) -> UnicastAddress {
        self.unicast_address
    }

    pub fn element_count(&self) -> u8 {
        self.element_count
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn provisioned_at(&self) -> i64 {
        self.provisioned_at
    }

    /// Last unicast address owned by this node.
    pub fn last_address(&self) -> UnicastAddress {
        // Range was validated in `new`.
        UnicastAddress::new(self.unicast_address.value() + u16::from(self.element_count) - 1)
            .unwrap_or(self.unicast_address)
    }

    pub fn owns_address(&self, address: u16) -> bool {
        (self.unicast_address.value()..=self.last_address().value()).contains(&address)
    }
}
