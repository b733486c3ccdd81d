//! Effective cursor
//!
//! Position in the effective total order: synced events first (by global
//! sequence), pending events after (by local commit sequence).

use serde::{Deserialize, Serialize};

/// Cursor into the effective total order.
///
/// Ordering: `(global_sequence, pending_commit_sequence)` lexicographically.
/// Every mapped event sorts before every pending event, so consuming a
/// mapped event resets the pending component to zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveCursor {
    pub global_sequence: i64,
    pub pending_commit_sequence: i64,
}

impl EffectiveCursor {
    pub const ZERO: EffectiveCursor = EffectiveCursor {
        global_sequence: 0,
        pending_commit_sequence: 0,
    };

    pub fn new(global_sequence: i64, pending_commit_sequence: i64) -> Self {
        Self {
            global_sequence,
            pending_commit_sequence,
        }
    }

    /// Advance past one event.
    ///
    /// `global_sequence` is the event's mapping if it has one; pending
    /// events advance the pending component instead.
    pub fn advance(self, global_sequence: Option<i64>, commit_sequence: i64) -> Self {
        match global_sequence {
            Some(g) => Self {
                global_sequence: g,
                pending_commit_sequence: 0,
            },
            None => Self {
                global_sequence: self.global_sequence,
                pending_commit_sequence: commit_sequence,
            },
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Stable single-column text form used by the snapshots table.
    pub fn encode(&self) -> String {
        format!("gs{}pc{}", self.global_sequence, self.pending_commit_sequence)
    }

    pub fn decode(text: &str) -> Option<Self> {
        let rest = text.strip_prefix("gs")?;
        let (global, pending) = rest.split_once("pc")?;
        Some(Self {
            global_sequence: global.parse().ok()?,
            pending_commit_sequence: pending.parse().ok()?,
        })
    }
}
