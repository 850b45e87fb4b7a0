//! # snapshot
//!
//! why: bound log growth by replacing an applied prefix with application state
//! relations: extends RaftNode (node.rs); uses RaftLog::compact_to from log.rs
//! what: application-driven compaction, InstallSnapshot handling, CondInstallSnapshot

use tracing::{debug, info};

use crate::message::{InstallSnapshotArgs, InstallSnapshotReply, NodeId};
use crate::node::{NodeState, Persist, RaftNode};

impl RaftNode {
    /// The application has applied through `index` and captured it in `data`.
    ///
    /// Ignored (returns false) when `index` is already compacted or not yet
    /// applied.
    pub fn snapshot(&mut self, index: u64, data: Vec<u8>) -> bool {
        if index <= self.persistent.log.snapshot_index() || index > self.last_applied() {
            debug!(id = self.id, index, "ignoring snapshot request");
            return false;
        }
        let Some(term) = self.get_term_at(index) else {
            return false;
        };
        self.persistent.log.compact_to(index, term);
        self.snapshot = data;
        self.mark_persist(Persist::StateAndSnapshot);
        info!(id = self.id, index, term, retained = self.persistent.log.len(), "log compacted");
        true
    }

    /// Follower side of InstallSnapshot; the flag says whether to reset the election timer
    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs) -> (InstallSnapshotReply, bool) {
        if args.term < self.current_term() {
            return (InstallSnapshotReply { term: self.current_term() }, false);
        }
        self.become_follower(args.term);
        self.leader_id = Some(args.leader_id);
        let reply = InstallSnapshotReply { term: self.current_term() };

        if args.last_included_index <= self.commit_index() {
            debug!(
                id = self.id,
                index = args.last_included_index,
                commit_index = self.commit_index(),
                "stale snapshot ignored"
            );
            return (reply, true);
        }

        self.install_snapshot(args.last_included_term, args.last_included_index, args.data.clone());
        self.snapshot_pending = true;
        (reply, true)
    }

    /// Leader side of an InstallSnapshot reply; true if the commit index moved
    pub fn handle_install_snapshot_reply(
        &mut self,
        peer: NodeId,
        args: &InstallSnapshotArgs,
        reply: &InstallSnapshotReply,
    ) -> bool {
        if reply.term > self.current_term() {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Leader || self.current_term() != args.term {
            return false;
        }
        let Some(leader) = self.leader.as_mut() else {
            return false;
        };
        let matched = leader.match_index.entry(peer).or_insert(0);
        *matched = (*matched).max(args.last_included_index);
        let matched = *matched;
        let next = leader.next_index.entry(peer).or_insert(1);
        *next = (*next).max(matched + 1);
        self.advance_commit_index()
    }

    /// The application asks to switch to a snapshot it received on the apply
    /// channel. Allowed only if nothing newer was recorded since.
    pub fn cond_install_snapshot(&mut self, last_included_term: u64, last_included_index: u64, data: Vec<u8>) -> bool {
        let log = &self.persistent.log;
        if log.snapshot_index() == last_included_index && log.snapshot_term() == last_included_term {
            return true;
        }
        if last_included_index <= self.commit_index() {
            debug!(id = self.id, index = last_included_index, "refusing outdated snapshot");
            return false;
        }
        self.install_snapshot(last_included_term, last_included_index, data);
        true
    }

    fn install_snapshot(&mut self, term: u64, index: u64, data: Vec<u8>) {
        self.persistent.log.compact_to(index, term);
        self.snapshot = data;
        self.volatile.commit_index = self.volatile.commit_index.max(index);
        self.volatile.last_applied = self.volatile.last_applied.max(index);
        self.mark_persist(Persist::StateAndSnapshot);
        info!(
            id = self.id,
            index,
            term,
            retained = self.persistent.log.len(),
            "installed snapshot"
        );
    }
}
