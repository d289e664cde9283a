//! Provisioned node aggregate.
//!
//! A [`ProvisionedNode`] is created once when a device completes provisioning
//! and then mutated by a single configuration session: composition data
//! fills the element registry, key-add responses fill the key ring, and
//! model-app status messages bind or unbind application keys. The replay
//! table is the only part meant to be touched concurrently and works through
//! `&self`.

pub mod elements;
pub mod identity;
pub mod keyring;
pub mod migration;
pub mod replay;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::replay::MAX_SEQ_AUTH;
use crate::crypto::DerivedKeyMaterial;
use crate::error::{Missing, NodeError};
use crate::types::{is_subscription_address, Features, Key128, ModelId, UnicastAddress};

pub use elements::{Element, ElementRegistry, MeshModel};
pub use identity::NodeIdentity;
pub use keyring::{ApplicationKey, KeyRing, KeyUpdate, NetworkKey};
pub use migration::{LegacyKeys, LegacyMigrator, MigrationReport};
pub use replay::ReplayProtectionTable;

/// Identifies a node across networks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub network_id: Uuid,
    pub device_uuid: Uuid,
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network_id, self.device_uuid)
    }
}

/// Everything the provisioning handshake hands over.
#[derive(Clone, Debug)]
pub struct ProvisioningResult {
    pub device_uuid: Uuid,
    pub node_name: String,
    pub network_key: Key128,
    pub net_key_index: u16,
    pub device_key: Key128,
    pub unicast_address: u16,
    pub element_count: u8,
    pub ttl: u8,
    /// Key-refresh / IV-update flags
    pub flags: u8,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Address of the provisioner that will configure the node
    pub configuration_src: Option<u16>,
}

/// Page 0 of a composition-data status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositionData {
    pub company_identifier: u16,
    pub product_identifier: u16,
    pub version_identifier: u16,
    pub crpl: u16,
    pub features: u16,
    pub elements: Vec<ElementComposition>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementComposition {
    pub location: u16,
    pub models: Vec<ModelId>,
}

/// Node-level facts kept from the last composition data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionInfo {
    pub company_identifier: u16,
    pub product_identifier: u16,
    pub version_identifier: u16,
    /// Replay protection list size the device supports
    pub crpl: u16,
    pub features: Features,
}

/// A model-app bind/unbind status from the configuration client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelAppStatus {
    pub success: bool,
    pub element_address: u16,
    pub model: ModelId,
    pub app_key_index: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelAppOp {
    Bind,
    Unbind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedNode {
    pub(crate) network_id: Uuid,
    pub(crate) identity: NodeIdentity,
    pub(crate) name: String,
    pub(crate) flags: u8,
    pub(crate) configured: bool,
    pub(crate) configuration_src: Option<UnicastAddress>,
    /// Last sequence number received from this node
    pub(crate) received_sequence_number: u32,
    pub(crate) composition: Option<CompositionInfo>,
    pub(crate) keys: KeyRing,
    pub(crate) elements: ElementRegistry,
    pub(crate) replay: ReplayProtectionTable,
    /// Deprecated single-key fields read from old records
    pub(crate) legacy: LegacyKeys,
}

impl ProvisionedNode {
    /// Captures a freshly provisioned device and derives its initial transport keys.
    pub fn new(network_id: Uuid, result: ProvisioningResult) -> Result<Self, NodeError> {
        let identity = NodeIdentity::new(
            result.device_uuid,
            result.device_key,
            UnicastAddress::new(result.unicast_address)?,
            result.element_count,
            result.ttl,
            result.timestamp,
        )?;
        let configuration_src = result
            .configuration_src
            .map(UnicastAddress::new)
            .transpose()?;

        let mut keys = KeyRing::new();
        keys.add_network_key(result.net_key_index, result.network_key)?;

        tracing::info!(
            "✅ Provisioned node {} at {} ({} element(s))",
            result.device_uuid,
            identity.unicast_address(),
            identity.element_count()
        );

        Ok(Self {
            network_id,
            identity,
            name: result.node_name,
            flags: result.flags,
            configured: false,
            configuration_src,
            received_sequence_number: 0,
            composition: None,
            keys,
            elements: ElementRegistry::new(),
            replay: ReplayProtectionTable::new(),
            legacy: LegacyKeys::default(),
        })
    }

    pub fn key(&self) -> NodeKey {
        NodeKey {
            network_id: self.network_id,
            device_uuid: self.identity.device_uuid(),
        }
    }

    pub fn network_id(&self) -> Uuid {
        self.network_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn unicast_address(&self) -> UnicastAddress {
        self.identity.unicast_address()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn set_configured(&mut self, configured: bool) {
        self.configured = configured;
    }

    pub fn configuration_src(&self) -> Option<UnicastAddress> {
        self.configuration_src
    }

    pub fn received_sequence_number(&self) -> u32 {
        self.received_sequence_number
    }

    /// Sequence numbers are 24-bit; anything wider is malformed.
    pub fn set_received_sequence_number(&mut self, seq: u32) -> Result<(), NodeError> {
        if seq > MAX_SEQ_AUTH {
            return Err(NodeError::Malformed(format!(
                "sequence number {:#x} exceeds 24 bits",
                seq
            )));
        }
        self.received_sequence_number = seq;
        Ok(())
    }

    pub fn composition(&self) -> Option<&CompositionInfo> {
        self.composition.as_ref()
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn replay(&self) -> &ReplayProtectionTable {
        &self.replay
    }

    pub fn legacy(&self) -> &LegacyKeys {
        &self.legacy
    }

    // ===== Keys =====

    pub fn add_network_key(&mut self, index: u16, key: Key128) -> Result<KeyUpdate, NodeError> {
        self.keys.add_network_key(index, key)
    }

    pub fn remove_network_key(&mut self, index: u16) -> Result<NetworkKey, NodeError> {
        self.keys.remove_network_key(index)
    }

    pub fn add_application_key(&mut self, index: u16, key: Key128) -> Result<KeyUpdate, NodeError> {
        self.keys.add_application_key(index, key)
    }

    /// Removes an application key and clears every model binding that used it.
    pub fn remove_application_key(&mut self, index: u16) -> Result<ApplicationKey, NodeError> {
        let removed = self
            .keys
            .remove_application_key(index)
            .ok_or(NodeError::NotFound(Missing::ApplicationKey(index)))?;
        let cleared = self.elements.clear_bindings_to(index);
        if cleared > 0 {
            tracing::debug!("Cleared {} binding(s) to application key {}", cleared, index);
        }
        Ok(removed)
    }

    /// Transport material for the primary network key.
    pub fn transport_keys(&self) -> Option<&DerivedKeyMaterial> {
        self.keys
            .primary_network_key()
            .and_then(|k| self.keys.transport_keys(k.index))
    }

    /// Node identity key for the primary network key.
    pub fn identity_key(&self) -> Option<&Key128> {
        self.keys
            .primary_network_key()
            .and_then(|k| self.keys.identity_key(k.index))
    }

    pub fn transport_keys_for(&self, net_key_index: u16) -> Option<&DerivedKeyMaterial> {
        self.keys.transport_keys(net_key_index)
    }

    // ===== Elements =====

    /// Records composition info and merges the reported elements at base + offset.
    pub fn apply_composition_data(&mut self, data: &CompositionData) -> Result<(), NodeError> {
        let base = self.identity.unicast_address();
        if data.elements.len() > usize::from(self.identity.element_count()) {
            tracing::warn!(
                "⚠️ Node {} reports {} elements but was provisioned with {}",
                self.identity.device_uuid(),
                data.elements.len(),
                self.identity.element_count()
            );
        }

        let elements = data
            .elements
            .iter()
            .enumerate()
            .map(|(offset, composition)| {
                let offset = u16::try_from(offset).map_err(|_| {
                    NodeError::Malformed(format!("element offset {} out of range", offset))
                })?;
                Ok(Element::new(
                    base.offset(offset)?,
                    composition.location,
                    composition.models.iter().copied(),
                ))
            })
            .collect::<Result<Vec<_>, NodeError>>()?;

        self.composition = Some(CompositionInfo {
            company_identifier: data.company_identifier,
            product_identifier: data.product_identifier,
            version_identifier: data.version_identifier,
            crpl: data.crpl,
            features: Features::from_bits(data.features),
        });
        self.elements.apply_composition_data(elements);

        tracing::info!(
            "📦 Composition data applied to {} ({} element(s))",
            self.identity.device_uuid(),
            self.elements.len()
        );
        Ok(())
    }

    pub fn ordered_elements(&self) -> Vec<&Element> {
        self.elements.ordered_elements()
    }

    pub fn element(&self, address: u16) -> Option<&Element> {
        self.elements.lookup(address)
    }

    // ===== Bindings =====

    pub fn bind_application_key(
        &mut self,
        element_address: u16,
        model: ModelId,
        app_key_index: u16,
    ) -> Result<(), NodeError> {
        if self.elements.is_empty() {
            return Err(NodeError::InvalidState(
                "composition data has not been applied".to_string(),
            ));
        }
        if !self.keys.contains_application_key(app_key_index) {
            return Err(NodeError::NotFound(Missing::ApplicationKey(app_key_index)));
        }

        let mesh_model = self.elements.model_mut(element_address, model)?;
        if mesh_model.bound_app_key == Some(app_key_index) {
            return Ok(());
        }
        mesh_model.bound_app_key = Some(app_key_index);

        tracing::debug!(
            "🔗 Bound app key {} to model {} on {:#06x}",
            app_key_index,
            model,
            element_address
        );
        Ok(())
    }

    /// Clears the binding only if it still points at `app_key_index`; a stale
    /// confirmation for a different key is a no-op.
    pub fn unbind_application_key(
        &mut self,
        element_address: u16,
        model: ModelId,
        app_key_index: u16,
    ) -> Result<(), NodeError> {
        let mesh_model = self.elements.model_mut(element_address, model)?;
        if mesh_model.bound_app_key == Some(app_key_index) {
            mesh_model.bound_app_key = None;
            tracing::debug!(
                "Unbound app key {} from model {} on {:#06x}",
                app_key_index,
                model,
                element_address
            );
        }
        Ok(())
    }

    /// Applies a model-app status; unsuccessful statuses change nothing.
    pub fn apply_model_app_status(
        &mut self,
        status: &ModelAppStatus,
        op: ModelAppOp,
    ) -> Result<(), NodeError> {
        if !status.success {
            tracing::debug!("Ignoring unsuccessful {:?} status for {:?}", op, status);
            return Ok(());
        }
        match op {
            ModelAppOp::Bind => self.bind_application_key(
                status.element_address,
                status.model,
                status.app_key_index,
            ),
            ModelAppOp::Unbind => self.unbind_application_key(
                status.element_address,
                status.model,
                status.app_key_index,
            ),
        }
    }

    // ===== Subscriptions =====

    /// Returns true if the address was newly added.
    pub fn add_subscription(
        &mut self,
        element_address: u16,
        model: ModelId,
        address: u16,
    ) -> Result<bool, NodeError> {
        if !is_subscription_address(address) {
            return Err(NodeError::Malformed(format!(
                "{:#06x} is not a group or virtual address",
                address
            )));
        }
        let mesh_model = self.elements.model_mut(element_address, model)?;
        Ok(mesh_model.subscriptions.insert(address))
    }

    /// Returns true if the address was present.
    pub fn remove_subscription(
        &mut self,
        element_address: u16,
        model: ModelId,
        address: u16,
    ) -> Result<bool, NodeError> {
        let mesh_model = self.elements.model_mut(element_address, model)?;
        Ok(mesh_model.subscriptions.remove(&address))
    }
}
