//! Versioned snapshot of a provisioned node, for the persistence collaborator.
//!
//! Keys are stored as lowercase hex and every collection as a plain list, so
//! the record does not depend on how the in-memory model stores things.
//! Derived transport keys are never written; `restore` recomputes them.
//!
//! Schema history:
//! - v1: single `legacy.network_key` + padded `legacy.key_index`, and
//!   application keys in `legacy.application_keys`
//! - v2: `network_keys` / `application_keys` collections

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::replay::MAX_SEQ_AUTH;
use crate::constants::snapshot::{CURRENT_SCHEMA, SCHEMA_V1};
use crate::error::NodeError;
use crate::node::migration;
use crate::node::{
    ApplicationKey, CompositionInfo, Element, ElementRegistry, KeyRing, LegacyKeys, MeshModel,
    NodeIdentity, ProvisionedNode, ReplayProtectionTable,
};
use crate::types::{is_subscription_address, is_unicast, Key128, ModelId, UnicastAddress};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub version: u32,
    pub network_id: Uuid,
    pub device_uuid: Uuid,
    pub name: String,
    pub device_key: String,
    pub unicast_address: u16,
    pub element_count: u8,
    pub ttl: u8,
    pub flags: u8,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub configured: bool,
    pub configuration_src: Option<u16>,
    #[serde(default)]
    pub received_sequence_number: u32,
    pub composition: Option<CompositionInfo>,
    #[serde(default)]
    pub network_keys: Vec<NetworkKeyRecord>,
    #[serde(default)]
    pub application_keys: Vec<ApplicationKeyRecord>,
    #[serde(default)]
    pub elements: Vec<ElementRecord>,
    #[serde(default)]
    pub replay: Vec<ReplayRecord>,
    #[serde(default)]
    pub legacy: LegacyKeys,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKeyRecord {
    pub index: u16,
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationKeyRecord {
    pub index: u16,
    pub bound_net_key_index: u16,
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub address: u16,
    pub location: u16,
    pub models: Vec<ModelRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: ModelId,
    pub bound_app_key: Option<u16>,
    #[serde(default)]
    pub subscriptions: Vec<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub src: u16,
    pub seq_auth: u32,
}

impl NodeSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Rebuilds the node, recomputes derived keys and runs pending schema upgrades.
    ///
    /// Any malformed field fails the whole record; nothing is defaulted.
    pub fn restore(self) -> Result<ProvisionedNode, NodeError> {
        if self.version < SCHEMA_V1 || self.version > CURRENT_SCHEMA {
            return Err(NodeError::Malformed(format!(
                "unsupported snapshot schema version {}",
                self.version
            )));
        }

        let identity = NodeIdentity::new(
            self.device_uuid,
            Key128::from_hex(&self.device_key)?,
            UnicastAddress::new(self.unicast_address)?,
            self.element_count,
            self.ttl,
            self.timestamp,
        )?;
        let configuration_src = self
            .configuration_src
            .map(UnicastAddress::new)
            .transpose()?;
        if self.received_sequence_number > MAX_SEQ_AUTH {
            return Err(NodeError::Malformed(format!(
                "received sequence number {:#x} exceeds 24 bits",
                self.received_sequence_number
            )));
        }

        let mut node = ProvisionedNode {
            network_id: self.network_id,
            identity,
            name: self.name,
            flags: self.flags,
            configured: self.configured,
            configuration_src,
            received_sequence_number: self.received_sequence_number,
            composition: self.composition,
            keys: restore_keys(&self.network_keys, &self.application_keys)?,
            elements: restore_elements(&self.elements)?,
            replay: restore_replay(&self.replay)?,
            legacy: self.legacy,
        };

        let report = migration::upgrade(&mut node, self.version)?;
        if !report.is_noop() {
            tracing::info!("Upgraded snapshot for {} from v{}", node.key(), self.version);
        }

        check_bindings(&node)?;
        Ok(node)
    }
}

fn restore_keys(
    network_keys: &[NetworkKeyRecord],
    application_keys: &[ApplicationKeyRecord],
) -> Result<KeyRing, NodeError> {
    let mut keys = KeyRing::new();

    for record in network_keys {
        if keys.network_key(record.index).is_some() {
            return Err(NodeError::Malformed(format!(
                "duplicate network key index {}",
                record.index
            )));
        }
        keys.add_network_key(record.index, Key128::from_hex(&record.key)?)?;
    }

    for record in application_keys {
        if keys.contains_application_key(record.index) {
            return Err(NodeError::Malformed(format!(
                "duplicate application key index {}",
                record.index
            )));
        }
        if keys.network_key(record.bound_net_key_index).is_none() {
            return Err(NodeError::Malformed(format!(
                "application key {} is bound to missing network key {}",
                record.index, record.bound_net_key_index
            )));
        }
        keys.insert_application_key(ApplicationKey {
            index: record.index,
            bound_net_key_index: record.bound_net_key_index,
            key: Key128::from_hex(&record.key)?,
        })?;
    }

    Ok(keys)
}

fn restore_elements(records: &[ElementRecord]) -> Result<ElementRegistry, NodeError> {
    let mut seen = HashSet::new();
    let mut elements = Vec::with_capacity(records.len());

    for record in records {
        if !seen.insert(record.address) {
            return Err(NodeError::Malformed(format!(
                "duplicate element address {:#06x}",
                record.address
            )));
        }

        let mut models = BTreeMap::new();
        for model in &record.models {
            if let Some(address) = model
                .subscriptions
                .iter()
                .find(|a| !is_subscription_address(**a))
            {
                return Err(NodeError::Malformed(format!(
                    "model {} on element {:#06x} subscribes to {:#06x}",
                    model.id, record.address, address
                )));
            }
            let restored = MeshModel {
                id: model.id,
                bound_app_key: model.bound_app_key,
                subscriptions: model.subscriptions.iter().copied().collect::<BTreeSet<_>>(),
            };
            if models.insert(model.id, restored).is_some() {
                return Err(NodeError::Malformed(format!(
                    "duplicate model {} on element {:#06x}",
                    model.id, record.address
                )));
            }
        }

        elements.push(Element {
            address: UnicastAddress::new(record.address)?,
            location: record.location,
            models,
        });
    }

    let mut registry = ElementRegistry::new();
    registry.apply_composition_data(elements);
    Ok(registry)
}

fn restore_replay(records: &[ReplayRecord]) -> Result<ReplayProtectionTable, NodeError> {
    let table = ReplayProtectionTable::new();
    for record in records {
        if !is_unicast(record.src) || record.seq_auth > MAX_SEQ_AUTH {
            return Err(NodeError::Malformed(format!(
                "invalid replay record {:#06x} → {:#x}",
                record.src, record.seq_auth
            )));
        }
        if table.last_accepted(record.src).is_some() {
            return Err(NodeError::Malformed(format!(
                "duplicate replay record for {:#06x}",
                record.src
            )));
        }
        table.record_unconditional(record.src, record.seq_auth);
    }
    Ok(table)
}

fn check_bindings(node: &ProvisionedNode) -> Result<(), NodeError> {
    for element in node.ordered_elements() {
        for model in element.models.values() {
            if let Some(index) = model.bound_app_key {
                if !node.keys().contains_application_key(index) {
                    return Err(NodeError::Malformed(format!(
                        "model {} on {} is bound to missing application key {}",
                        model.id, element.address, index
                    )));
                }
            }
        }
    }
    Ok(())
}

impl ProvisionedNode {
    /// Full snapshot of every persisted entity at the current schema version.
    pub fn snapshot(&self) -> NodeSnapshot {
        let identity = self.identity();

        NodeSnapshot {
            version: CURRENT_SCHEMA,
            network_id: self.network_id,
            device_uuid: identity.device_uuid(),
            name: self.name.clone(),
            device_key: identity.device_key().to_hex(),
            unicast_address: identity.unicast_address().value(),
            element_count: identity.element_count(),
            ttl: identity.ttl(),
            flags: self.flags,
            timestamp: identity.provisioned_at(),
            configured: self.configured,
            configuration_src: self.configuration_src.map(UnicastAddress::value),
            received_sequence_number: self.received_sequence_number,
            composition: self.composition,
            network_keys: self
                .keys
                .network_keys()
                .iter()
                .map(|k| NetworkKeyRecord {
                    index: k.index,
                    key: k.key.to_hex(),
                })
                .collect(),
            application_keys: self
                .keys
                .application_keys()
                .map(|k| ApplicationKeyRecord {
                    index: k.index,
                    bound_net_key_index: k.bound_net_key_index,
                    key: k.key.to_hex(),
                })
                .collect(),
            elements: self
                .ordered_elements()
                .into_iter()
                .map(|e| ElementRecord {
                    address: e.address.value(),
                    location: e.location,
                    models: e
                        .models
                        .values()
                        .map(|m| ModelRecord {
                            id: m.id,
                            bound_app_key: m.bound_app_key,
                            subscriptions: m.subscriptions.iter().copied().collect(),
                        })
                        .collect(),
                })
                .collect(),
            replay: self
                .replay
                .records()
                .into_iter()
                .map(|(src, seq_auth)| ReplayRecord { src, seq_auth })
                .collect(),
            legacy: self.legacy.clone(),
        }
    }

    pub fn restore(snapshot: NodeSnapshot) -> Result<Self, NodeError> {
        snapshot.restore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{composition, provisioning_result};

    fn sample_node() -> ProvisionedNode {
        let mut node =
            ProvisionedNode::new(Uuid::from_bytes([7u8; 16]), provisioning_result(0x0010, 3)).unwrap();
        node.add_network_key(1, Key128::from_bytes([0x44; 16])).unwrap();
        node.add_application_key(0, Key128::from_bytes([0x55; 16])).unwrap();
        node.apply_composition_data(&composition(3)).unwrap();
        node.bind_application_key(0x0011, ModelId::Sig(0x1000), 0).unwrap();
        node.add_subscription(0x0012, ModelId::Sig(0x1000), 0xC001).unwrap();
        node.replay().accept_if_newer(0x0001, 40);
        node.replay().accept_if_newer(0x0020, 7);
        node.set_configured(true);
        node.set_received_sequence_number(0x0123).unwrap();
        node
    }

    #[test]
    fn test_json_round_trip() {
        let node = sample_node();
        let json = node.snapshot().to_json().unwrap();
        let restored = NodeSnapshot::from_json(&json).unwrap().restore().unwrap();
        assert_eq!(restored, node);
    }

    #[test]
    fn test_bincode_round_trip() {
        let node = sample_node();
        let bytes = node.snapshot().to_bytes().unwrap();
        let restored = ProvisionedNode::restore(NodeSnapshot::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(restored, node);
        assert_eq!(restored.transport_keys_for(1), node.transport_keys_for(1));
    }

    #[test]
    fn test_element_order_not_trusted() {
        let node = sample_node();
        let mut snapshot = node.snapshot();
        snapshot.elements.reverse();

        let restored = snapshot.restore().unwrap();
        let addresses: Vec<u16> = restored
            .ordered_elements()
            .iter()
            .map(|e| e.address.value())
            .collect();
        assert_eq!(addresses, vec![0x0010, 0x0011, 0x0012]);
    }

    #[test]
    fn test_short_key_is_malformed() {
        let mut snapshot = sample_node().snapshot();
        snapshot.network_keys[0].key = "00112233".to_string();
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));
    }

    #[test]
    fn test_bad_records_are_malformed() {
        let base = sample_node().snapshot();

        let mut snapshot = base.clone();
        snapshot.elements[0].address = 0xC000;
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));

        let mut snapshot = base.clone();
        snapshot.elements[1].address = snapshot.elements[0].address;
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));

        let mut snapshot = base.clone();
        snapshot.application_keys.clear();
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));

        let mut snapshot = base.clone();
        snapshot.replay.push(ReplayRecord {
            src: 0x0002,
            seq_auth: MAX_SEQ_AUTH + 1,
        });
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));

        let mut snapshot = base.clone();
        snapshot.application_keys[0].bound_net_key_index = 0x0999;
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));

        let mut snapshot = base.clone();
        snapshot.elements[2].models[1].subscriptions.push(0x0005);
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));

        let mut snapshot = base.clone();
        snapshot.replay.push(ReplayRecord {
            src: 0x0001,
            seq_auth: 3,
        });
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));

        let mut snapshot = base.clone();
        snapshot.received_sequence_number = MAX_SEQ_AUTH + 1;
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));

        let mut snapshot = base;
        snapshot.version = CURRENT_SCHEMA + 1;
        assert!(matches!(snapshot.restore(), Err(NodeError::Malformed(_))));
    }

    #[test]
    fn test_ignored_replay_source_keeps_node_restorable() {
        let node = sample_node();
        node.replay().record_unconditional(0xC000, 5);

        let restored = node.snapshot().restore().unwrap();
        assert_eq!(restored.replay().last_accepted(0xC000), None);
        assert_eq!(restored, node);
    }
}
