//! # apply
//!
//! why: committed entries must reach the application exactly once and in order
//! relations: spawned by peer.rs; woken by handlers and replication after commit moves
//! what: apply loop draining RaftNode::take_apply_batch into the ApplyMsg channel

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tracing::{debug, trace};

use raft_core::ApplyMsg;

use crate::peer::Shared;

pub(crate) async fn run_applier(shared: Arc<Shared>, apply_tx: UnboundedSender<ApplyMsg>) {
    let heartbeat = shared.config.heartbeat();

    while !shared.killed() {
        let batch = shared.core.lock().node.take_apply_batch();

        if batch.is_empty() {
            tokio::select! {
                _ = shared.apply_notify.notified() => {}
                _ = sleep(heartbeat) => {}
            }
            continue;
        }

        let through = batch.last().map(ApplyMsg::index).unwrap_or_default();
        trace!(id = shared.id, count = batch.len(), through, "delivering batch");
        for msg in batch {
            if apply_tx.send(msg).is_err() {
                debug!(id = shared.id, "apply channel closed, stopping apply loop");
                return;
            }
        }
    }
    debug!(id = shared.id, "apply loop stopped");
}
