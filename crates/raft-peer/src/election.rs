//! # election
//!
//! why: followers must notice a silent leader and replace it
//! relations: spawned by peer.rs; on a win hands over to replication.rs
//! what: ticker loop, concurrent vote fan-out with a lock-free tally

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use raft_core::RequestVoteArgs;

use crate::peer::Shared;
use crate::replication;

/// Wake at least once per heartbeat, start an election whenever the
/// deadline passed without hearing from a leader
pub(crate) async fn run_ticker(shared: Arc<Shared>) {
    let heartbeat = shared.config.heartbeat();

    while !shared.killed() {
        let (wake_at, election) = {
            let mut core = shared.core.lock();
            let now = Instant::now();
            if core.node.is_leader() {
                core.reset_election_timer();
                (now + heartbeat, None)
            } else if now >= core.election_deadline {
                let args = core.node.become_candidate();
                core.reset_election_timer();
                match core.persist() {
                    Ok(()) => (now + heartbeat, Some(args)),
                    Err(_) => {
                        // our own vote is not durable, so it cannot be counted
                        core.node.lose_election(args.term);
                        (now + heartbeat, None)
                    }
                }
            } else {
                (core.election_deadline.min(now + heartbeat), None)
            }
        };

        if let Some(args) = election {
            tokio::spawn(run_election(shared.clone(), args));
        }
        sleep_until(wake_at).await;
    }
    debug!(id = shared.id, "ticker stopped");
}

/// Ask every peer for its vote; win as soon as a majority answered yes,
/// otherwise fall back to follower once every reply is in
async fn run_election(shared: Arc<Shared>, args: RequestVoteArgs) {
    let term = args.term;
    let (peers, quorum) = {
        let core = shared.core.lock();
        (core.node.peers().collect::<Vec<_>>(), core.node.quorum_size())
    };

    // our own vote
    let votes = Arc::new(AtomicUsize::new(1));
    if quorum <= 1 {
        won(&shared, term);
        return;
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
    for peer in peers {
        let shared = shared.clone();
        let args = args.clone();
        let votes = votes.clone();
        let done_tx = done_tx.clone();

        tokio::spawn(async move {
            let reply = shared.transport.request_vote(peer, args).await;
            match reply {
                Some(reply) => {
                    let counted = {
                        let mut core = shared.core.lock();
                        let counted = core.node.handle_vote_reply(term, &reply);
                        // a term adopted from the reply must be durable before we go on
                        counted && core.persist().is_ok()
                    };
                    trace!(id = shared.id, term, peer, granted = reply.vote_granted, "vote reply");
                    if counted && votes.fetch_add(1, Ordering::SeqCst) + 1 >= quorum {
                        won(&shared, term);
                    }
                }
                None => trace!(id = shared.id, term, peer, "no vote reply"),
            }
            let _ = done_tx.send(());
        });
    }
    drop(done_tx);

    while done_rx.recv().await.is_some() {}

    let mut core = shared.core.lock();
    core.node.lose_election(term);
}

fn won(shared: &Arc<Shared>, term: u64) {
    // later votes for the same term land here too and are ignored
    let elected = shared.core.lock().node.win_election(term);
    if elected && !shared.killed() {
        info!(id = shared.id, term, "won election");
        tokio::spawn(replication::run_leader(shared.clone(), term));
    }
}
