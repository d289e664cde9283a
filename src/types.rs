use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{address, keys};
use crate::error::NodeError;

/// 128-bit key material (network, application, device or derived key).
///
/// Wiped on drop and compared in constant time. `Debug` never prints the bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key128([u8; keys::KEY_LENGTH]);

impl Key128 {
    pub fn from_bytes(bytes: [u8; keys::KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Accepts exactly 16 bytes; anything else is malformed key material.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeError> {
        let array: [u8; keys::KEY_LENGTH] = bytes.try_into().map_err(|_| {
            NodeError::Malformed(format!(
                "key must be {} bytes, got {}",
                keys::KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, NodeError> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| NodeError::Malformed(format!("invalid key hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Fresh random key, used when provisioning from the CLI.
    pub fn random() -> Self {
        Self(rand::random::<[u8; keys::KEY_LENGTH]>())
    }

    pub fn as_bytes(&self) -> &[u8; keys::KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialEq for Key128 {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Key128 {}

impl std::fmt::Debug for Key128 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key128(..)")
    }
}

/// A 16-bit address in the unicast range 0x0001..=0x7FFF.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct UnicastAddress(u16);

impl UnicastAddress {
    pub fn new(value: u16) -> Result<Self, NodeError> {
        if is_unicast(value) {
            Ok(Self(value))
        } else {
            Err(NodeError::Malformed(format!(
                "address {:#06x} is outside the unicast range",
                value
            )))
        }
    }

    pub fn value(self) -> u16 {
        self.0
    }

    /// Address of the element `offset` positions after this one.
    pub fn offset(self, offset: u16) -> Result<Self, NodeError> {
        let value = self.0.checked_add(offset).ok_or_else(|| {
            NodeError::Malformed(format!("address {:#06x} + {} overflows", self.0, offset))
        })?;
        Self::new(value)
    }
}

impl TryFrom<u16> for UnicastAddress {
    type Error = NodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UnicastAddress> for u16 {
    fn from(address: UnicastAddress) -> u16 {
        address.0
    }
}

impl std::fmt::Display for UnicastAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

pub fn is_unicast(value: u16) -> bool {
    (address::UNICAST_MIN..=address::UNICAST_MAX).contains(&value)
}

/// Group and virtual addresses; the only ones a model can subscribe to.
pub fn is_subscription_address(value: u16) -> bool {
    value != address::UNASSIGNED && !is_unicast(value)
}

/// Model identifier: a 16-bit SIG model or a vendor model scoped by company.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelId {
    Sig(u16),
    Vendor { company: u16, model: u16 },
}

impl ModelId {
    pub fn is_vendor(&self) -> bool {
        matches!(self, ModelId::Vendor { .. })
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelId::Sig(id) => write!(f, "{:#06x}", id),
            ModelId::Vendor { company, model } => write!(f, "{:#06x}:{:#06x}", company, model),
        }
    }
}

/// Feature support reported in composition data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub relay: bool,
    pub proxy: bool,
    pub friend: bool,
    pub low_power: bool,
}

impl Features {
    pub fn from_bits(bits: u16) -> Self {
        Self {
            relay: bits & 0x0001 != 0,
            proxy: bits & 0x0002 != 0,
            friend: bits & 0x0004 != 0,
            low_power: bits & 0x0008 != 0,
        }
    }

    pub fn bits(&self) -> u16 {
        (self.relay as u16)
            | (self.proxy as u16) << 1
            | (self.friend as u16) << 2
            | (self.low_power as u16) << 3
    }
}

pub(crate) fn check_key_index(index: u16) -> Result<u16, NodeError> {
    if index > keys::MAX_KEY_INDEX {
        return Err(NodeError::Malformed(format!(
            "key index {:#x} exceeds 12 bits",
            index
        )));
    }
    Ok(index)
}
