//! Upgrade path for node records written before keys were versioned.
//!
//! Old records carried one network key (with a padded 2-byte index) and a
//! map of application keys as hex strings. [`LegacyMigrator::migrate`] folds
//! those into the key ring. It only ever adds what is missing, so running it
//! again changes nothing.
//!
//! Old records also kept per-model bound keys and subscriptions in a
//! different shape. Those are not reconciled here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ProvisionedNode;
use crate::constants::keys::PADDED_KEY_INDEX_LENGTH;
use crate::constants::snapshot::{CURRENT_SCHEMA, SCHEMA_V1};
use crate::error::NodeError;
use crate::types::{check_key_index, Key128};

/// Deprecated key fields as they appeared in schema v1 records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyKeys {
    /// Hex-encoded network key
    #[serde(default)]
    pub network_key: Option<String>,
    /// Network key index with its 4 padding bits
    #[serde(default)]
    pub key_index: Option<Vec<u8>>,
    /// Application key index → hex-encoded key
    #[serde(default)]
    pub application_keys: BTreeMap<u16, String>,
}

impl LegacyKeys {
    pub fn is_empty(&self) -> bool {
        self.network_key.is_none() && self.key_index.is_none() && self.application_keys.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub network_keys: usize,
    pub application_keys: usize,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.network_keys == 0 && self.application_keys == 0
    }

    fn merge(&mut self, other: MigrationReport) {
        self.network_keys += other.network_keys;
        self.application_keys += other.application_keys;
    }
}

/// Strips the padding from a legacy 2-byte key index: `((b0 & 0x0F) << 8) | b1`.
pub fn remove_key_index_padding(padded: &[u8]) -> Result<u16, NodeError> {
    match padded {
        [high, low] => Ok((u16::from(high & 0x0F) << 8) | u16::from(*low)),
        _ => Err(NodeError::Malformed(format!(
            "padded key index must be {} bytes, got {}",
            PADDED_KEY_INDEX_LENGTH,
            padded.len()
        ))),
    }
}

pub struct LegacyMigrator;

impl LegacyMigrator {
    /// Moves legacy key fields into the key ring. Idempotent.
    ///
    /// Everything is decoded before the ring is touched, so undecodable legacy
    /// key material fails the whole node record and leaves the ring as it was.
    pub fn migrate(node: &mut ProvisionedNode) -> Result<MigrationReport, NodeError> {
        let network_key = Self::pending_network_key(node)?;
        let application_keys = Self::pending_application_keys(node)?;

        if !application_keys.is_empty()
            && network_key.is_none()
            && node.keys.network_keys().is_empty()
        {
            return Err(NodeError::Malformed(
                "legacy application keys without a network key".to_string(),
            ));
        }

        let report = MigrationReport {
            network_keys: usize::from(network_key.is_some()),
            application_keys: application_keys.len(),
        };
        if let Some((index, key)) = network_key {
            node.keys.add_network_key(index, key)?;
        }
        for (index, key) in application_keys {
            node.keys.add_application_key(index, key)?;
        }

        if !report.is_noop() {
            tracing::warn!(
                "🔧 Migrated legacy keys for {}: {} network, {} application",
                node.key(),
                report.network_keys,
                report.application_keys
            );
        }
        Ok(report)
    }

    fn pending_network_key(node: &ProvisionedNode) -> Result<Option<(u16, Key128)>, NodeError> {
        let Some(hex_key) = node.legacy.network_key.as_deref() else {
            return Ok(None);
        };
        if !node.keys.network_keys().is_empty() {
            return Ok(None);
        }

        let key = Key128::from_hex(hex_key)?;
        let index = match node.legacy.key_index.as_deref() {
            Some(padded) => remove_key_index_padding(padded)?,
            None => 0,
        };
        Ok(Some((index, key)))
    }

    fn pending_application_keys(node: &ProvisionedNode) -> Result<Vec<(u16, Key128)>, NodeError> {
        node.legacy
            .application_keys
            .iter()
            .filter(|(index, hex_key)| {
                !hex_key.is_empty() && !node.keys.contains_application_key(**index)
            })
            .map(|(index, hex_key)| Ok((check_key_index(*index)?, Key128::from_hex(hex_key)?)))
            .collect()
    }
}

/// Brings a node restored from a `from_version` record up to the current schema.
pub fn upgrade(node: &mut ProvisionedNode, from_version: u32) -> Result<MigrationReport, NodeError> {
    if from_version < SCHEMA_V1 || from_version > CURRENT_SCHEMA {
        return Err(NodeError::Malformed(format!(
            "unsupported snapshot schema version {}",
            from_version
        )));
    }

    let mut report = MigrationReport::default();
    for version in from_version..CURRENT_SCHEMA {
        let step = match version {
            SCHEMA_V1 => LegacyMigrator::migrate(node)?,
            _ => MigrationReport::default(),
        };
        report.merge(step);
    }
    Ok(report)
}
