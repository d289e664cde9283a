//! Network keys, application keys and the transport material and node
//! identity key derived from each network key.
//!
//! Derived material is cached per network-key index and recomputed inside
//! every call that changes a network key, so a caller can never observe a
//! network key without matching NID/encryption/privacy keys.

use std::collections::{BTreeMap, HashMap};

use crate::constants::keys::K2_MASTER_INPUT;
use crate::crypto::{self, DerivedKeyMaterial};
use crate::error::{Missing, NodeError};
use crate::types::{check_key_index, Key128};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkKey {
    pub index: u16,
    pub key: Key128,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationKey {
    pub index: u16,
    pub bound_net_key_index: u16,
    pub key: Key128,
}

/// Result of adding a key under an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyUpdate {
    Inserted,
    /// The index existed and its key material was overwritten (key update).
    Replaced,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRing {
    /// Insertion order is kept; the first key is the primary one.
    network_keys: Vec<NetworkKey>,
    application_keys: BTreeMap<u16, ApplicationKey>,
    transport: HashMap<u16, DerivedKeyMaterial>,
    identity: HashMap<u16, Key128>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_network_key(&mut self, index: u16, key: Key128) -> Result<KeyUpdate, NodeError> {
        let index = check_key_index(index)?;
        let material = crypto::derive_transport_keys(&key, &K2_MASTER_INPUT);
        let identity_key = crypto::identity_key(&key);

        let update = match self.network_keys.iter_mut().find(|k| k.index == index) {
            Some(existing) => {
                existing.key = key;
                KeyUpdate::Replaced
            }
            None => {
                self.network_keys.push(NetworkKey { index, key });
                KeyUpdate::Inserted
            }
        };
        self.transport.insert(index, material);
        self.identity.insert(index, identity_key);

        tracing::debug!("🔑 Network key {} {:?}", index, update);
        Ok(update)
    }

    /// Refused while an application key is still bound to this network key.
    pub fn remove_network_key(&mut self, index: u16) -> Result<NetworkKey, NodeError> {
        let position = self
            .network_keys
            .iter()
            .position(|k| k.index == index)
            .ok_or(NodeError::NotFound(Missing::NetworkKey(index)))?;

        if let Some(app_key) = self
            .application_keys
            .values()
            .find(|k| k.bound_net_key_index == index)
        {
            return Err(NodeError::InvalidState(format!(
                "application key {} is still bound to network key {}",
                app_key.index, index
            )));
        }

        self.transport.remove(&index);
        self.identity.remove(&index);
        Ok(self.network_keys.remove(position))
    }

    pub fn network_key(&self, index: u16) -> Option<&NetworkKey> {
        self.network_keys.iter().find(|k| k.index == index)
    }

    pub fn network_keys(&self) -> &[NetworkKey] {
        &self.network_keys
    }

    /// The first network key added; the one used for secured traffic by default.
    pub fn primary_network_key(&self) -> Option<&NetworkKey> {
        self.network_keys.first()
    }

    pub fn transport_keys(&self, index: u16) -> Option<&DerivedKeyMaterial> {
        self.transport.get(&index)
    }

    /// Node identity key (k1) for the network key at `index`.
    pub fn identity_key(&self, index: u16) -> Option<&Key128> {
        self.identity.get(&index)
    }

    /// 64-bit network ID for the network key at `index`.
    pub fn network_id(&self, index: u16) -> Option<[u8; 8]> {
        self.network_key(index).map(|k| crypto::k3(&k.key))
    }

    /// Adds an application key bound to the primary network key.
    pub fn add_application_key(&mut self, index: u16, key: Key128) -> Result<KeyUpdate, NodeError> {
        let bound_net_key_index = self
            .primary_network_key()
            .map(|k| k.index)
            .ok_or_else(|| {
                NodeError::InvalidState(format!(
                    "application key {} needs a network key to bind to",
                    index
                ))
            })?;
        self.insert_application_key(ApplicationKey {
            index,
            bound_net_key_index,
            key,
        })
    }

    pub fn insert_application_key(&mut self, app_key: ApplicationKey) -> Result<KeyUpdate, NodeError> {
        check_key_index(app_key.index)?;
        check_key_index(app_key.bound_net_key_index)?;
        if self.network_key(app_key.bound_net_key_index).is_none() {
            return Err(NodeError::NotFound(Missing::NetworkKey(
                app_key.bound_net_key_index,
            )));
        }

        let index = app_key.index;
        let update = match self.application_keys.insert(index, app_key) {
            Some(_) => KeyUpdate::Replaced,
            None => KeyUpdate::Inserted,
        };
        tracing::debug!("🔑 Application key {} {:?}", index, update);
        Ok(update)
    }

    pub(crate) fn remove_application_key(&mut self, index: u16) -> Option<ApplicationKey> {
        self.application_keys.remove(&index)
    }

    pub fn application_key(&self, index: u16) -> Option<&ApplicationKey> {
        self.application_keys.get(&index)
    }

    pub fn contains_application_key(&self, index: u16) -> bool {
        self.application_keys.contains_key(&index)
    }

    /// Application keys ordered by index.
    pub fn application_keys(&self) -> impl Iterator<Item = &ApplicationKey> + '_ {
        self.application_keys.values()
    }
}
