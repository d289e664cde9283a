//! In-memory model of a provisioned mesh node: device identity, key ring with
//! derived transport keys, element registry, replay protection and the
//! legacy-record upgrade path, plus snapshot persistence.

pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod mesh_network;
pub mod node;
pub mod snapshot;
pub mod storage;
pub mod types;

pub use error::{Missing, NodeError, StorageError};
pub use mesh_network::MeshNetwork;
pub use node::{NodeKey, ProvisionedNode};
pub use snapshot::NodeSnapshot;
pub use types::{Key128, ModelId, UnicastAddress};
