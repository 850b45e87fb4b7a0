//! # raft-core
//!
//! why: implement the core raft consensus algorithm as a pure, portable state machine
//! relations: driven by raft-peer (timers, transport, locking), persisted through raft-storage
//! what: node state machine, election and vote rules, log replication, commit, snapshots

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod replication;
pub mod snapshot;
pub mod state;

pub use config::RaftConfig;
pub use error::{CoreError, CoreResult};
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    NodeId, Replication, RequestVoteArgs, RequestVoteReply,
};
pub use node::{NodeState, Persist, RaftNode};
pub use state::{LeaderState, NodeStatus, PersistentState, VolatileState};
