//! Sharing-state bookkeeping types.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Descriptors whose sharing state changed, split by direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AffectDhIds {
    pub sharing_dh_ids: Vec<String>,
    pub no_sharing_dh_ids: Vec<String>,
}

impl AffectDhIds {
    pub fn is_empty(&self) -> bool {
        self.sharing_dh_ids.is_empty() && self.no_sharing_dh_ids.is_empty()
    }

    /// Fold another change set into this one.
    pub fn merge(&mut self, other: AffectDhIds) {
        self.sharing_dh_ids.extend(other.sharing_dh_ids);
        self.no_sharing_dh_ids.extend(other.no_sharing_dh_ids);
    }
}

/// Where a device's events currently go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum DhIdState {
    /// Consumed by the local system.
    #[default]
    ThroughIn,
    /// Redirected to the paired peer.
    ThroughOut,
}

impl std::fmt::Display for DhIdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThroughIn => write!(f, "ThroughIn"),
            Self::ThroughOut => write!(f, "ThroughOut"),
        }
    }
}
