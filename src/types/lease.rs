//! Leadership projections

use serde::{Deserialize, Serialize};

/// Read-only view of the leadership oracle for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseState {
    pub is_leader: bool,
    pub leader_id: Option<String>,
}

impl LeaseState {
    /// Fail-safe role used before the oracle has answered
    pub fn unknown() -> Self {
        Self {
            is_leader: false,
            leader_id: None,
        }
    }

    pub fn leader(id: impl Into<String>) -> Self {
        Self {
            is_leader: true,
            leader_id: Some(id.into()),
        }
    }

    pub fn follower(leader_id: impl Into<String>) -> Self {
        Self {
            is_leader: false,
            leader_id: Some(leader_id.into()),
        }
    }

    /// True once some client is known to hold the lease
    pub fn is_determined(&self) -> bool {
        self.leader_id.is_some()
    }
}

impl Default for LeaseState {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Who holds the lease and until when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderInfo {
    pub leader_id: String,
    pub expires_at_millis: i64,
}
