//! # raft-peer
//!
//! why: run a raft-core node as a live member of a cluster
//! relations: drives raft-core's RaftNode, persists through raft-storage, talks through a RaftTransport
//! what: Raft handle, background election/replication/apply tasks, transport trait, in-process network

mod apply;
mod election;
pub mod error;
pub mod network;
mod peer;
mod replication;
pub mod transport;

pub use error::{PeerError, PeerResult};
pub use network::LocalNetwork;
pub use peer::Raft;
pub use transport::RaftTransport;

pub use raft_core::{ApplyMsg, NodeId, NodeState, NodeStatus, RaftConfig};
