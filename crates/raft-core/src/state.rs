//! # state
//!
//! why: keep durable, volatile and leader-only state apart so each has its own lifecycle
//! relations: composed into RaftNode; PersistentState is what the peer hands to storage
//! what: PersistentState (+ codec), VolatileState, LeaderState, NodeStatus

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreResult;
use crate::log::RaftLog;
use crate::message::NodeId;
use crate::node::NodeState;

/// State that survives a restart; written before replying to any RPC that changed it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
}

impl PersistentState {
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a stored blob; an empty blob is a fresh peer
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Reset on restart; both indices only move forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolatileState {
    pub commit_index: u64,
    pub last_applied: u64,
}

/// Replication progress kept only while leading, rebuilt on every election win
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderState {
    pub next_index: HashMap<NodeId, u64>,
    pub match_index: HashMap<NodeId, u64>,
}

impl LeaderState {
    pub fn new<'a>(peers: impl IntoIterator<Item = &'a NodeId>, last_log_index: u64) -> Self {
        let mut state = Self::default();
        for &peer in peers {
            state.next_index.insert(peer, last_log_index + 1);
            state.match_index.insert(peer, 0);
        }
        state
    }
}

/// Point-in-time view of a node, for callers and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_decodes_to_fresh_state() {
        let state = PersistentState::decode(&[]).unwrap();
        assert_eq!(state, PersistentState::default());
    }

    #[test]
    fn garbage_blob_is_a_codec_error() {
        assert!(PersistentState::decode(b"not json").is_err());
    }

    #[test]
    fn leader_state_starts_past_the_log() {
        let state = LeaderState::new(&[2, 3], 7);
        assert_eq!(state.next_index[&2], 8);
        assert_eq!(state.match_index[&3], 0);
    }
}
