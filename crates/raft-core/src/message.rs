//! # message
//!
//! why: define all raft rpc message types and the messages handed to the application
//! relations: produced and consumed by node.rs, carried by the peer transport
//! what: RequestVote, AppendEntries, InstallSnapshot args/replies, ApplyMsg

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// Identifier of a peer in the cluster
pub type NodeId = u64;

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// The voter's (possibly updated) term
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Response to AppendEntries
///
/// On a consistency failure the follower reports where its log diverges so
/// the leader can skip back a whole term at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Term of the follower's conflicting entry at prev_log_index, if it has one
    pub conflict_term: Option<u64>,
    /// First index the leader should try next
    pub conflict_index: Option<u64>,
}

impl AppendEntriesReply {
    pub(crate) fn reject(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_term: None,
            conflict_index: None,
        }
    }

    pub(crate) fn accept(term: u64) -> Self {
        Self {
            term,
            success: true,
            conflict_term: None,
            conflict_index: None,
        }
    }
}

/// Ship a snapshot to a follower that is behind the leader's compacted prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

/// Response to InstallSnapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// What the leader should send to one follower next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    Append(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
}

/// Delivery from the consensus layer to the application state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyMsg {
    /// A newly committed command
    Command { index: u64, term: u64, command: Vec<u8> },
    /// A snapshot the application should switch to
    Snapshot { data: Vec<u8>, term: u64, index: u64 },
}

impl ApplyMsg {
    /// Log index this message brings the application up to
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}
