//! Per-source replay protection.
//!
//! Inbound messages are checked from concurrent processing paths, so the
//! table is shared by reference and each compare-and-update runs under the
//! map's per-key entry lock.

use std::collections::BTreeMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::constants::replay::MAX_SEQ_AUTH;
use crate::error::NodeError;
use crate::types::is_unicast;

/// Source address → highest accepted seq-auth. Absence means the source is unseen.
#[derive(Clone, Debug, Default)]
pub struct ReplayProtectionTable {
    records: DashMap<u16, u32>,
}

impl ReplayProtectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `seq_auth` and returns true only if it is strictly greater than
    /// the last accepted value for `src`.
    pub fn accept_if_newer(&self, src: u16, seq_auth: u32) -> bool {
        self.verify(src, seq_auth).is_ok()
    }

    /// Like [`accept_if_newer`](Self::accept_if_newer), but says why a value was rejected.
    pub fn verify(&self, src: u16, seq_auth: u32) -> Result<(), NodeError> {
        if !is_unicast(src) {
            return Err(NodeError::Malformed(format!(
                "replay source {:#06x} is not a unicast address",
                src
            )));
        }
        if seq_auth > MAX_SEQ_AUTH {
            return Err(NodeError::Malformed(format!(
                "seq-auth {:#x} exceeds 24 bits",
                seq_auth
            )));
        }

        match self.records.entry(src) {
            Entry::Occupied(mut entry) => {
                let last = *entry.get();
                if seq_auth > last {
                    entry.insert(seq_auth);
                    Ok(())
                } else {
                    tracing::debug!(
                        "🔁 Rejected seq-auth {:#08x} from {:#06x} (last {:#08x})",
                        seq_auth,
                        src,
                        last
                    );
                    Err(NodeError::Replay {
                        src,
                        seq_auth,
                        last,
                    })
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(seq_auth);
                Ok(())
            }
        }
    }

    /// Overwrites the counter for `src` without comparing. Used when the local
    /// node originates traffic and establishes its own counter.
    pub fn record_unconditional(&self, src: u16, seq_auth: u32) {
        if !is_unicast(src) {
            tracing::warn!("Ignoring seq-auth for non-unicast source {:#06x}", src);
            return;
        }
        if seq_auth > MAX_SEQ_AUTH {
            tracing::warn!("Ignoring out-of-range seq-auth {:#x} for {:#06x}", seq_auth, src);
            return;
        }
        self.records.insert(src, seq_auth);
    }

    pub fn last_accepted(&self, src: u16) -> Option<u32> {
        self.records.get(&src).map(|r| *r.value())
    }

    pub fn forget(&self, src: u16) -> Option<u32> {
        self.records.remove(&src).map(|(_, seq_auth)| seq_auth)
    }

    /// Copy of every record, ordered by source address.
    pub fn records(&self) -> BTreeMap<u16, u32> {
        self.records
            .iter()
            .map(|r| (*r.key(), *r.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PartialEq for ReplayProtectionTable {
    fn eq(&self, other: &Self) -> bool {
        self.records() == other.records()
    }
}

impl Eq for ReplayProtectionTable {}
