//! # peer
//!
//! why: turn the pure RaftNode into a live peer with timers, storage and a network
//! relations: wraps raft-core's RaftNode and raft-storage's Storage; election.rs,
//!            replication.rs and apply.rs run the background tasks started here
//! what: Raft handle (local api + rpc handlers), Shared peer record, Core lock contents

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    NodeId, NodeStatus, Persist, RaftConfig, RaftNode, RequestVoteArgs, RequestVoteReply,
};
use raft_storage::Storage;

use crate::error::{PeerError, PeerResult};
use crate::transport::RaftTransport;
use crate::{apply, election};

/// Everything guarded by the peer lock
pub(crate) struct Core {
    pub(crate) node: RaftNode,
    storage: Box<dyn Storage>,
    pub(crate) election_deadline: Instant,
}

impl Core {
    /// Write whatever the node says is dirty; the flag is only cleared once
    /// storage accepted the write
    pub(crate) fn persist(&mut self) -> PeerResult<()> {
        let Some(what) = self.node.pending_persist() else {
            return Ok(());
        };
        let state = self.node.encode_state()?;
        let written = match what {
            Persist::State => self.storage.save_raft_state(&state),
            Persist::StateAndSnapshot => self
                .storage
                .save_state_and_snapshot(&state, self.node.snapshot_data()),
        };
        if let Err(e) = written {
            warn!(id = self.node.id, term = self.node.current_term(), error = %e, "persist failed");
            return Err(e.into());
        }
        self.node.persisted();
        Ok(())
    }

    pub(crate) fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.node.config.random_election_timeout();
    }
}

/// State shared by the handle and every background task
pub(crate) struct Shared {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) core: Mutex<Core>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    /// wakes the apply loop after commit_index moved or a snapshot arrived
    pub(crate) apply_notify: Notify,
    /// wakes the leader loop after `start`
    pub(crate) replicate_notify: Notify,
    dead: AtomicBool,
}

impl Shared {
    pub(crate) fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

/// Handle to one running raft peer.
///
/// Cheap to clone; every clone talks to the same peer. Dropping handles does
/// not stop the peer, `kill` does.
#[derive(Clone)]
pub struct Raft {
    shared: Arc<Shared>,
}

impl Raft {
    /// Start a peer.
    ///
    /// `peers` lists every member of the cluster, this one included. Persisted
    /// state is read before returning, so a restarted peer resumes with its
    /// term, vote, log and snapshot. Background tasks are spawned onto the
    /// current tokio runtime.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: Box<dyn Storage>,
        transport: Arc<dyn RaftTransport>,
        apply_tx: UnboundedSender<ApplyMsg>,
        config: RaftConfig,
    ) -> PeerResult<Self> {
        config.validate()?;
        let mut cluster = peers;
        if !cluster.contains(&id) {
            cluster.push(id);
        }
        cluster.sort_unstable();
        cluster.dedup();

        let state = storage.read_raft_state()?.unwrap_or_default();
        let snapshot = storage.read_snapshot()?.unwrap_or_default();
        let node = RaftNode::restore(id, cluster, config.clone(), &state, snapshot)?;
        let has_snapshot = node.persistent.log.snapshot_index() > 0;

        let mut core = Core {
            node,
            storage,
            election_deadline: Instant::now(),
        };
        core.reset_election_timer();

        let shared = Arc::new(Shared {
            id,
            config,
            core: Mutex::new(core),
            transport,
            apply_notify: Notify::new(),
            replicate_notify: Notify::new(),
            dead: AtomicBool::new(false),
        });
        if has_snapshot {
            shared.apply_notify.notify_one();
        }

        tokio::spawn(election::run_ticker(shared.clone()));
        tokio::spawn(apply::run_applier(shared.clone(), apply_tx));

        info!(id, "raft peer started");
        Ok(Self { shared })
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// Propose a command. Returns the index and term it will occupy if
    /// committed, or `None` if this peer is not the leader (or was killed).
    /// Returns before the command is replicated.
    pub fn start(&self, command: Vec<u8>) -> Option<(u64, u64)> {
        if self.killed() {
            return None;
        }
        let placed = {
            let mut core = self.shared.core.lock();
            let commit_before = core.node.commit_index();
            let placed = core.node.append_command(command)?;
            if core.persist().is_err() {
                // nobody saw the entry yet; forget it so it can never commit
                core.node.discard_command(placed.0, commit_before);
                return None;
            }
            placed
        };
        self.shared.replicate_notify.notify_one();
        self.shared.apply_notify.notify_one();
        Some(placed)
    }

    /// Current term and whether this peer believes it is the leader
    pub fn get_state(&self) -> (u64, bool) {
        let core = self.shared.core.lock();
        (core.node.current_term(), core.node.is_leader())
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.core.lock().node.status()
    }

    /// Size of the persisted raft state, for deciding when to snapshot
    pub fn raft_state_size(&self) -> usize {
        self.shared.core.lock().storage.raft_state_size()
    }

    /// The application captured its state through `index`; compact the log
    pub fn snapshot(&self, index: u64, data: Vec<u8>) -> PeerResult<()> {
        let mut core = self.shared.core.lock();
        if core.node.snapshot(index, data) {
            core.persist()?;
        }
        Ok(())
    }

    /// Ask to switch to a snapshot that arrived on the apply channel. True
    /// means the application should install it; false means newer entries
    /// were already delivered and the snapshot must be discarded. An error
    /// means the switch could not be made durable.
    pub fn cond_install_snapshot(
        &self,
        last_included_term: u64,
        last_included_index: u64,
        data: Vec<u8>,
    ) -> PeerResult<bool> {
        let mut core = self.shared.core.lock();
        let accepted = core
            .node
            .cond_install_snapshot(last_included_term, last_included_index, data);
        core.persist()?;
        Ok(accepted)
    }

    /// Stop the peer. Idempotent; background tasks exit at their next check.
    pub fn kill(&self) {
        if !self.shared.dead.swap(true, Ordering::SeqCst) {
            info!(id = self.shared.id, "raft peer killed");
        }
        self.shared.apply_notify.notify_waiters();
        self.shared.replicate_notify.notify_waiters();
    }

    pub fn killed(&self) -> bool {
        self.shared.killed()
    }

    // -- inbound rpc handlers --
    //
    // each one persists before returning; an Err must be treated by the
    // transport as "no reply"

    pub fn handle_request_vote(&self, args: &RequestVoteArgs) -> PeerResult<RequestVoteReply> {
        if self.killed() {
            return Err(PeerError::Killed);
        }
        let mut core = self.shared.core.lock();
        let (reply, reset) = core.node.handle_request_vote(args);
        core.persist()?;
        if reset {
            core.reset_election_timer();
        }
        Ok(reply)
    }

    pub fn handle_append_entries(&self, args: &AppendEntriesArgs) -> PeerResult<AppendEntriesReply> {
        if self.killed() {
            return Err(PeerError::Killed);
        }
        let mut core = self.shared.core.lock();
        let before = core.node.commit_index();
        let (reply, reset) = core.node.handle_append_entries(args);
        core.persist()?;
        if reset {
            core.reset_election_timer();
        }
        if core.node.commit_index() > before {
            self.shared.apply_notify.notify_one();
        }
        Ok(reply)
    }

    pub fn handle_install_snapshot(&self, args: &InstallSnapshotArgs) -> PeerResult<InstallSnapshotReply> {
        if self.killed() {
            return Err(PeerError::Killed);
        }
        let mut core = self.shared.core.lock();
        let before = core.node.persistent.log.snapshot_index();
        let (reply, reset) = core.node.handle_install_snapshot(args);
        core.persist()?;
        if reset {
            core.reset_election_timer();
        }
        if core.node.persistent.log.snapshot_index() > before {
            self.shared.apply_notify.notify_one();
        }
        Ok(reply)
    }
}
