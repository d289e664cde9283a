use thiserror::Error;

use crate::types::ModelId;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the node model itself.
///
/// `NotFound` and `Replay` are recoverable: drop the offending operation or
/// message and carry on. `Malformed` while restoring a record means the node
/// cannot be trusted for secured traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("{0} not found")]
    NotFound(Missing),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Replayed seq-auth {seq_auth:#08x} from {src:#06x} (last accepted {last:#08x})")]
    Replay { src: u16, seq_auth: u32, last: u32 },

    #[error("Malformed: {0}")]
    Malformed(String),
}

impl NodeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, NodeError::NotFound(_) | NodeError::Replay { .. })
    }
}

/// The reference that failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    NetworkKey(u16),
    ApplicationKey(u16),
    Element(u16),
    Model { element: u16, model: ModelId },
}

impl std::fmt::Display for Missing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Missing::NetworkKey(index) => write!(f, "Network key index {}", index),
            Missing::ApplicationKey(index) => write!(f, "Application key index {}", index),
            Missing::Element(address) => write!(f, "Element {:#06x}", address),
            Missing::Model { element, model } => {
                write!(f, "Model {} on element {:#06x}", model, element)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("Database operation failed: {0}")]
    DatabaseOp(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt node record {key}: {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: NodeError,
    },
}
