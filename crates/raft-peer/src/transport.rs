//! # transport
//!
//! why: the peer only needs "send this rpc, maybe get a reply"; the wire is someone else's problem
//! relations: implemented by network.rs (in-process) or any real rpc stack; called from election.rs and replication.rs
//! what: RaftTransport trait

use async_trait::async_trait;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, NodeId,
    RequestVoteArgs, RequestVoteReply,
};

/// Outbound rpc surface of one peer.
///
/// `None` means no reply arrived (lost request, lost reply, dead or
/// unreachable target). It never means the request was rejected; rejections
/// come back as replies.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(&self, to: NodeId, args: RequestVoteArgs) -> Option<RequestVoteReply>;

    async fn append_entries(&self, to: NodeId, args: AppendEntriesArgs) -> Option<AppendEntriesReply>;

    async fn install_snapshot(&self, to: NodeId, args: InstallSnapshotArgs) -> Option<InstallSnapshotReply>;
}
