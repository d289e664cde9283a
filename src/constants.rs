//! Protocol constants for provisioned mesh nodes
//!
//! Centralizes address ranges, key sizes and derivation inputs so the
//! node model and the snapshot codec agree on them.

/// Addressing
pub mod address {
    pub const UNASSIGNED: u16 = 0x0000;

    /// Lowest valid unicast address (0x0000 is the unassigned address)
    pub const UNICAST_MIN: u16 = 0x0001;

    /// Highest valid unicast address; 0x8000.. are virtual/group addresses
    pub const UNICAST_MAX: u16 = 0x7FFF;
}

/// Key material
pub mod keys {
    /// Every mesh key (network, application, device, derived) is 128 bits
    pub const KEY_LENGTH: usize = 16;

    /// Key indices are 12-bit values on the wire
    pub const MAX_KEY_INDEX: u16 = 0x0FFF;

    /// Length of the padded key index kept by legacy node records
    pub const PADDED_KEY_INDEX_LENGTH: usize = 2;

    /// `P` input for k2 when deriving master (non-friendship) credentials
    pub const K2_MASTER_INPUT: [u8; 1] = [0x00];

    /// NID is the low 7 bits of the first k2 block
    pub const NID_MASK: u8 = 0x7F;
}

/// Replay protection
pub mod replay {
    /// Seq-auth values are 24-bit counters
    pub const MAX_SEQ_AUTH: u32 = 0x00FF_FFFF;
}

/// Node defaults
pub mod node {
    /// Default TTL used when the provisioner did not supply one
    pub const DEFAULT_TTL: u8 = 5;

    /// Maximum TTL value allowed for a message
    pub const MAX_TTL: u8 = 0x7F;
}

/// Snapshot schema
pub mod snapshot {
    /// v1: single network key + hex app-key map (legacy layout)
    pub const SCHEMA_V1: u32 = 1;

    /// v2: versioned key collections
    pub const SCHEMA_V2: u32 = 2;

    pub const CURRENT_SCHEMA: u32 = SCHEMA_V2;
}
