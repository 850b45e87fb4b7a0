//! # network
//!
//! why: exercise peers against a network that loses, delays and partitions traffic
//! relations: implements RaftTransport (transport.rs) by calling the target's Raft handlers directly
//! what: LocalNetwork registry, per-sender Endpoint transport

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, NodeId,
    RequestVoteArgs, RequestVoteReply,
};

use crate::error::PeerResult;
use crate::peer::Raft;
use crate::transport::RaftTransport;

/// percentage of requests (and, separately, replies) lost when unreliable
const DROP_PERCENT: u32 = 10;
/// upper bound on the extra delivery delay when unreliable
const MAX_DELAY_MS: u64 = 27;
/// how long a call to an unreachable peer takes to fail
const UNREACHABLE_MS: u64 = 100;

#[derive(Default)]
struct Registry {
    peers: HashMap<NodeId, Raft>,
    connected: HashSet<NodeId>,
}

#[derive(Default)]
struct Inner {
    registry: Mutex<Registry>,
    unreliable: AtomicBool,
    rpc_count: AtomicU64,
}

/// In-process network between peers.
///
/// A peer is reachable when it is registered and connected. Disconnecting a
/// peer cuts it off in both directions; requests and replies crossing a cut
/// are lost.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Inner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route traffic for `id` to `raft` and connect it
    pub fn register(&self, id: NodeId, raft: Raft) {
        let mut registry = self.inner.registry.lock();
        registry.peers.insert(id, raft);
        registry.connected.insert(id);
    }

    pub fn unregister(&self, id: NodeId) {
        let mut registry = self.inner.registry.lock();
        registry.peers.remove(&id);
        registry.connected.remove(&id);
    }

    pub fn connect(&self, id: NodeId) {
        self.inner.registry.lock().connected.insert(id);
    }

    pub fn disconnect(&self, id: NodeId) {
        self.inner.registry.lock().connected.remove(&id);
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.inner.registry.lock().connected.contains(&id)
    }

    pub fn set_reliable(&self, reliable: bool) {
        self.inner.unreliable.store(!reliable, Ordering::SeqCst);
    }

    /// Total rpcs attempted so far
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::SeqCst)
    }

    /// Transport used by peer `from` to reach everyone else
    pub fn transport(&self, from: NodeId) -> Arc<dyn RaftTransport> {
        Arc::new(Endpoint {
            from,
            network: self.clone(),
        })
    }

    fn route(&self, from: NodeId, to: NodeId) -> Option<Raft> {
        let registry = self.inner.registry.lock();
        if !registry.connected.contains(&from) || !registry.connected.contains(&to) {
            return None;
        }
        registry.peers.get(&to).cloned()
    }

    fn unreliable(&self) -> bool {
        self.inner.unreliable.load(Ordering::SeqCst)
    }
}

fn lost() -> bool {
    rand::thread_rng().gen_range(0..100) < DROP_PERCENT
}

struct Endpoint {
    from: NodeId,
    network: LocalNetwork,
}

impl Endpoint {
    async fn deliver<R, F>(&self, to: NodeId, rpc: &'static str, handler: F) -> Option<R>
    where
        F: FnOnce(&Raft) -> PeerResult<R> + Send,
        R: Send,
    {
        self.network.inner.rpc_count.fetch_add(1, Ordering::SeqCst);

        let Some(target) = self.network.route(self.from, to) else {
            let wait = rand::thread_rng().gen_range(0..UNREACHABLE_MS);
            sleep(Duration::from_millis(wait)).await;
            trace!(from = self.from, to, rpc, "unreachable");
            return None;
        };

        if self.network.unreliable() {
            let delay = rand::thread_rng().gen_range(0..MAX_DELAY_MS);
            sleep(Duration::from_millis(delay)).await;
            if lost() {
                trace!(from = self.from, to, rpc, "request dropped");
                return None;
            }
        }

        let reply = handler(&target).ok()?;

        // the reply crosses the network too
        if self.network.route(to, self.from).is_none() {
            return None;
        }
        if self.network.unreliable() && lost() {
            trace!(from = self.from, to, rpc, "reply dropped");
            return None;
        }
        Some(reply)
    }
}

#[async_trait]
impl RaftTransport for Endpoint {
    async fn request_vote(&self, to: NodeId, args: RequestVoteArgs) -> Option<RequestVoteReply> {
        self.deliver(to, "request_vote", move |raft| raft.handle_request_vote(&args))
            .await
    }

    async fn append_entries(&self, to: NodeId, args: AppendEntriesArgs) -> Option<AppendEntriesReply> {
        self.deliver(to, "append_entries", move |raft| raft.handle_append_entries(&args))
            .await
    }

    async fn install_snapshot(&self, to: NodeId, args: InstallSnapshotArgs) -> Option<InstallSnapshotReply> {
        self.deliver(to, "install_snapshot", move |raft| raft.handle_install_snapshot(&args))
            .await
    }
}
