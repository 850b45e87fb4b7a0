//! # replication
//!
//! why: a leader has to keep every follower's log in step and prove it is alive
//! relations: spawned by election.rs on a win; feeds replies back into RaftNode
//! what: per-term leader loop, one spawned rpc per peer per round

use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, trace};

use raft_core::{NodeId, Replication};

use crate::peer::Shared;

/// Replicate to every peer each heartbeat, and immediately after `start`.
/// Ends once this peer is no longer leader of `term`.
pub(crate) async fn run_leader(shared: Arc<Shared>, term: u64) {
    let heartbeat = shared.config.heartbeat();

    loop {
        if shared.killed() {
            break;
        }
        let round = {
            let core = shared.core.lock();
            if !core.node.is_leader() || core.node.current_term() != term {
                break;
            }
            core.node
                .peers()
                .filter_map(|peer| core.node.replication_request(peer).map(|req| (peer, req)))
                .collect::<Vec<_>>()
        };

        for (peer, request) in round {
            tokio::spawn(replicate_to(shared.clone(), peer, request));
        }

        tokio::select! {
            _ = sleep(heartbeat) => {}
            _ = shared.replicate_notify.notified() => {}
        }
    }
    debug!(id = shared.id, term, "leader loop stopped");
}

async fn replicate_to(shared: Arc<Shared>, peer: NodeId, request: Replication) {
    let advanced = match request {
        Replication::Append(args) => {
            let Some(reply) = shared.transport.append_entries(peer, args.clone()).await else {
                trace!(id = shared.id, peer, "append entries unanswered");
                return;
            };
            let mut core = shared.core.lock();
            let advanced = core.node.handle_append_entries_reply(peer, &args, &reply);
            if core.persist().is_err() {
                return;
            }
            advanced
        }
        Replication::Snapshot(args) => {
            debug!(id = shared.id, peer, index = args.last_included_index, "sending snapshot");
            let Some(reply) = shared.transport.install_snapshot(peer, args.clone()).await else {
                trace!(id = shared.id, peer, "install snapshot unanswered");
                return;
            };
            let mut core = shared.core.lock();
            let advanced = core.node.handle_install_snapshot_reply(peer, &args, &reply);
            if core.persist().is_err() {
                return;
            }
            advanced
        }
    };
    if advanced {
        shared.apply_notify.notify_one();
    }
}
