//! # node
//!
//! why: define the raft node state machine and its role/term transitions
//! relations: uses state.rs for layered state, log.rs for entries, message.rs for rpc types;
//!            replication.rs and snapshot.rs extend RaftNode with the remaining handlers
//! what: NodeState enum, RaftNode struct, election and vote handling, Persist tracking

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RaftConfig;
use crate::error::CoreResult;
use crate::log::LogEntry;
use crate::message::{NodeId, RequestVoteArgs, RequestVoteReply};
use crate::state::{LeaderState, NodeStatus, PersistentState, VolatileState};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// What must reach stable storage before the node may answer anyone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Persist {
    /// term, vote or log changed
    State,
    /// the snapshot changed together with the log prefix
    StateAndSnapshot,
}

/// A single Raft node in the cluster.
///
/// This is a pure state machine: it never sleeps, never talks to the
/// network and never touches storage. Callers hold it under one lock, feed
/// it RPCs and replies, and write `encode_state()` (plus `snapshot_data()`)
/// to storage whenever `pending_persist()` says so.
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every node in the cluster, this one included
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current role (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// The leader this node last accepted entries from
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    /// Only present while leading
    pub leader: Option<LeaderState>,
    pub(crate) snapshot: Vec<u8>,
    pub(crate) snapshot_pending: bool,
    persist: Option<Persist>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader: None,
            snapshot: Vec::new(),
            snapshot_pending: false,
            persist: None,
        }
    }

    /// Rebuild a node from what storage handed back after a restart.
    ///
    /// Volatile indices restart at the snapshot boundary, and a stored
    /// snapshot is queued for delivery so the application can rebuild itself
    /// before any command is replayed.
    pub fn restore(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        state: &[u8],
        snapshot: Vec<u8>,
    ) -> CoreResult<Self> {
        let mut node = Self::with_config(id, cluster_nodes, config);
        node.persistent = PersistentState::decode(state)?;

        let boundary = node.persistent.log.snapshot_index();
        node.volatile = VolatileState {
            commit_index: boundary,
            last_applied: boundary,
        };
        node.snapshot_pending = boundary > 0;
        node.snapshot = snapshot;

        info!(
            id,
            term = node.persistent.current_term,
            last_log_index = node.last_log_index(),
            snapshot_index = boundary,
            "restored persisted state"
        );
        Ok(node)
    }

    // -- accessors --

    pub fn current_term(&self) -> u64 {
        self.persistent.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.persistent.voted_for
    }

    pub fn commit_index(&self) -> u64 {
        self.volatile.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.volatile.last_applied
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn last_log_index(&self) -> u64 {
        self.persistent.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.persistent.log.last_term()
    }

    /// Term at `index`; `None` if compacted away or past the end
    pub fn get_term_at(&self, index: u64) -> Option<u64> {
        self.persistent.log.term_at(index)
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.persistent.log.entry(index)
    }

    /// Every other node in the cluster
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let me = self.id;
        self.cluster_nodes.iter().copied().filter(move |&n| n != me)
    }

    /// Strict majority of the cluster, self included
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            state: self.state,
            term: self.current_term(),
            leader_id: self.leader_id,
            commit_index: self.commit_index(),
            last_applied: self.last_applied(),
            last_log_index: self.last_log_index(),
            snapshot_index: self.persistent.log.snapshot_index(),
        }
    }

    // -- persistence bookkeeping --

    pub(crate) fn mark_persist(&mut self, what: Persist) {
        self.persist = self.persist.max(Some(what));
    }

    /// What still has to be written before the next reply goes out
    pub fn pending_persist(&self) -> Option<Persist> {
        self.persist
    }

    /// Storage accepted the write requested by `pending_persist`
    pub fn persisted(&mut self) {
        self.persist = None;
    }

    pub fn encode_state(&self) -> CoreResult<Vec<u8>> {
        self.persistent.encode()
    }

    /// The latest snapshot bytes (empty if the log was never compacted)
    pub fn snapshot_data(&self) -> &[u8] {
        &self.snapshot
    }

    // -- role transitions --

    /// Step down; a newer term is adopted and the vote cleared
    pub fn become_follower(&mut self, term: u64) {
        if term > self.persistent.current_term {
            info!(
                id = self.id,
                old_term = self.persistent.current_term,
                term,
                "observed newer term, becoming follower"
            );
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
            self.leader_id = None;
            self.mark_persist(Persist::State);
        }
        self.state = NodeState::Follower;
        self.leader = None;
    }

    /// Start a new election: bump the term, vote for ourselves and return the
    /// request to fan out (captured while the caller still holds the lock)
    pub fn become_candidate(&mut self) -> RequestVoteArgs {
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.id);
        self.state = NodeState::Candidate;
        self.leader = None;
        self.leader_id = None;
        self.mark_persist(Persist::State);

        info!(id = self.id, term = self.current_term(), "starting election");

        RequestVoteArgs {
            term: self.current_term(),
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Take over as leader, resetting replication progress for every peer
    pub fn become_leader(&mut self) {
        let last = self.last_log_index();
        let peers: Vec<NodeId> = self.peers().collect();
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.leader = Some(LeaderState::new(&peers, last));

        info!(id = self.id, term = self.current_term(), last_log_index = last, "became leader");

        // a single-node cluster commits on its own
        self.advance_commit_index();
    }

    /// Resolve an election once enough votes were counted; false if the
    /// election in `term` is no longer ours to win
    pub fn win_election(&mut self, term: u64) -> bool {
        if self.state != NodeState::Candidate || self.current_term() != term {
            return false;
        }
        self.become_leader();
        true
    }

    /// Every vote came back without a majority
    pub fn lose_election(&mut self, term: u64) {
        if self.state == NodeState::Candidate && self.current_term() == term {
            debug!(id = self.id, term, "election lost");
            self.state = NodeState::Follower;
        }
    }

    // -- vote handling --

    /// Answer a RequestVote; the flag says whether the election timer should reset
    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        if args.term < self.current_term() {
            return (
                RequestVoteReply {
                    term: self.current_term(),
                    vote_granted: false,
                },
                false,
            );
        }
        if args.term > self.current_term() {
            self.become_follower(args.term);
        }

        let up_to_date =
            (args.last_log_term, args.last_log_index) >= (self.last_log_term(), self.last_log_index());
        let free = self
            .persistent
            .voted_for
            .map_or(true, |v| v == args.candidate_id);

        let granted = free && up_to_date;
        if granted {
            self.persistent.voted_for = Some(args.candidate_id);
            self.mark_persist(Persist::State);
        }
        debug!(
            id = self.id,
            term = self.current_term(),
            candidate = args.candidate_id,
            granted,
            "handled vote request"
        );

        (
            RequestVoteReply {
                term: self.current_term(),
                vote_granted: granted,
            },
            granted,
        )
    }

    /// Process a vote reply for the election started in `election_term`.
    ///
    /// Returns true only when the vote counts: granted, and this node is still
    /// a candidate in that term. A newer term in the reply makes us step down.
    pub fn handle_vote_reply(&mut self, election_term: u64, reply: &RequestVoteReply) -> bool {
        if reply.term > self.current_term() {
            self.become_follower(reply.term);
            return false;
        }
        reply.vote_granted
            && self.state == NodeState::Candidate
            && self.current_term() == election_term
    }

    // -- client commands --

    /// Append a command to the leader's log; `None` if not leader
    pub fn append_command(&mut self, command: Vec<u8>) -> Option<(u64, u64)> {
        if !self.is_leader() {
            return None;
        }
        let term = self.current_term();
        let index = self.persistent.log.append(term, command);
        self.mark_persist(Persist::State);
        self.advance_commit_index();
        Some((index, term))
    }

    /// Take back an `append_command` whose write never reached storage.
    /// Only valid before the entry was sent anywhere or applied.
    pub fn discard_command(&mut self, index: u64, commit_before: u64) {
        assert!(
            self.last_applied() <= commit_before,
            "discarding entry {} after it was applied",
            index
        );
        debug!(id = self.id, index, "discarding unpersisted entry");
        self.persistent.log.truncate_from(index);
        self.volatile.commit_index = commit_before;
    }
}
