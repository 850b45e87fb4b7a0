//! # replication
//!
//! why: keep follower logs consistent with the leader and decide what is committed
//! relations: extends RaftNode (node.rs); the peer's replication task drives it
//! what: AppendEntries build/handle/reply, commit advancement, apply batches

use tracing::{debug, trace};

use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, NodeId, Replication,
};
use crate::node::{NodeState, Persist, RaftNode};

impl RaftNode {
    /// Build the next message for `peer`: entries from its next_index, or the
    /// snapshot if that index has been compacted away. `None` if not leader.
    pub fn replication_request(&self, peer: NodeId) -> Option<Replication> {
        let leader = self.leader.as_ref()?;
        let next = *leader.next_index.get(&peer)?;
        let log = &self.persistent.log;

        if next <= log.snapshot_index() {
            return Some(Replication::Snapshot(InstallSnapshotArgs {
                term: self.current_term(),
                leader_id: self.id,
                last_included_index: log.snapshot_index(),
                last_included_term: log.snapshot_term(),
                data: self.snapshot.clone(),
            }));
        }

        let prev_log_index = next - 1;
        let prev_log_term = log.term_at(prev_log_index)?;
        Some(Replication::Append(AppendEntriesArgs {
            term: self.current_term(),
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: log.entries_from(next).to_vec(),
            leader_commit: self.commit_index(),
        }))
    }

    /// Follower side of AppendEntries; the flag says whether to reset the election timer
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term() {
            return (AppendEntriesReply::reject(self.current_term()), false);
        }
        self.become_follower(args.term);
        self.leader_id = Some(args.leader_id);
        let term = self.current_term();

        // anything the leader sends at or below our snapshot is already committed here
        let boundary = self.persistent.log.snapshot_index();
        let (prev_index, prev_term, entries) = if args.prev_log_index < boundary {
            let skip = (boundary - args.prev_log_index) as usize;
            if skip >= args.entries.len() {
                return (AppendEntriesReply::accept(term), true);
            }
            (boundary, self.persistent.log.snapshot_term(), &args.entries[skip..])
        } else {
            (args.prev_log_index, args.prev_log_term, &args.entries[..])
        };

        match self.persistent.log.term_at(prev_index) {
            None => {
                let reply = AppendEntriesReply {
                    conflict_index: Some(self.last_log_index() + 1),
                    ..AppendEntriesReply::reject(term)
                };
                trace!(id = self.id, prev_index, "log too short for append");
                return (reply, true);
            }
            Some(local) if local != prev_term => {
                let reply = AppendEntriesReply {
                    conflict_term: Some(local),
                    conflict_index: Some(self.persistent.log.first_index_of_term(local, prev_index)),
                    ..AppendEntriesReply::reject(term)
                };
                trace!(id = self.id, prev_index, local, prev_term, "log mismatch");
                return (reply, true);
            }
            Some(_) => {}
        }

        let mut changed = false;
        for entry in entries {
            match self.persistent.log.term_at(entry.index) {
                Some(local) if local == entry.term => continue,
                Some(_) => {
                    assert!(
                        entry.index > self.commit_index(),
                        "truncating committed entry {} (commit {})",
                        entry.index,
                        self.commit_index()
                    );
                    self.persistent.log.truncate_from(entry.index);
                    self.persistent.log.push(entry.clone());
                }
                None => self.persistent.log.push(entry.clone()),
            }
            changed = true;
        }
        if changed {
            self.mark_persist(Persist::State);
        }

        let last_new = prev_index + entries.len() as u64;
        let target = args.leader_commit.min(last_new);
        if target > self.commit_index() {
            self.set_commit_index(target);
        }

        (AppendEntriesReply::accept(term), true)
    }

    /// Leader side of an AppendEntries reply; true if the commit index moved
    pub fn handle_append_entries_reply(
        &mut self,
        peer: NodeId,
        args: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) -> bool {
        if reply.term > self.current_term() {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Leader || self.current_term() != args.term {
            return false;
        }
        let log = &self.persistent.log;
        let Some(leader) = self.leader.as_mut() else {
            return false;
        };
        let matched = leader.match_index.entry(peer).or_insert(0);
        let next = leader.next_index.entry(peer).or_insert(1);

        if reply.success {
            *matched = (*matched).max(args.prev_log_index + args.entries.len() as u64);
            *next = (*next).max(*matched + 1);
            return self.advance_commit_index();
        }

        // only the reply to our latest probe may move next_index
        if *next != args.prev_log_index + 1 {
            return false;
        }
        let hint = match (reply.conflict_term, reply.conflict_index) {
            (Some(t), index) => log
                .last_index_of_term(t)
                .map(|last| last + 1)
                .or(index)
                .unwrap_or(args.prev_log_index),
            (None, Some(index)) => index,
            (None, None) => args.prev_log_index,
        };
        *next = hint.min(args.prev_log_index).max(*matched + 1).max(1);
        debug!(id = self.id, peer, next = *next, "backing off next_index");
        false
    }

    /// Raise commit_index to the highest index stored on a majority whose
    /// entry is from the current term; true if it moved
    pub fn advance_commit_index(&mut self) -> bool {
        let Some(leader) = self.leader.as_ref() else {
            return false;
        };
        let mut matched: Vec<u64> = leader.match_index.values().copied().collect();
        matched.push(self.last_log_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let Some(&candidate) = matched.get(self.quorum_size() - 1) else {
            return false;
        };
        if candidate <= self.commit_index() || self.get_term_at(candidate) != Some(self.current_term()) {
            return false;
        }
        self.set_commit_index(candidate);
        true
    }

    pub(crate) fn set_commit_index(&mut self, index: u64) {
        assert!(
            index >= self.volatile.commit_index,
            "commit index regressed from {} to {}",
            self.volatile.commit_index,
            index
        );
        assert!(index <= self.last_log_index(), "commit index past end of log");
        debug!(id = self.id, term = self.current_term(), commit_index = index, "commit index advanced");
        self.volatile.commit_index = index;
    }

    /// Everything that became deliverable since the last call, in index
    /// order: a pending snapshot first, then committed commands
    pub fn take_apply_batch(&mut self) -> Vec<ApplyMsg> {
        let mut batch = Vec::new();
        if self.snapshot_pending {
            self.snapshot_pending = false;
            batch.push(ApplyMsg::Snapshot {
                data: self.snapshot.clone(),
                term: self.persistent.log.snapshot_term(),
                index: self.persistent.log.snapshot_index(),
            });
        }

        let commit = self.commit_index();
        let start = self.last_applied() + 1;
        batch.extend(
            self.persistent
                .log
                .entries_from(start)
                .iter()
                .take_while(|e| e.index <= commit)
                .map(|e| ApplyMsg::Command {
                    index: e.index,
                    term: e.term,
                    command: e.command.clone(),
                }),
        );
        self.volatile.last_applied = self.volatile.last_applied.max(commit);
        batch
    }
}
