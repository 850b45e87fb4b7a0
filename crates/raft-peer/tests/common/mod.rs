//! Cluster harness shared by the integration tests.
//!
//! Every peer gets an in-memory persister, a transport into one
//! `LocalNetwork`, and a collector task that checks what it applies against
//! every other peer.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

use raft_peer::{ApplyMsg, LocalNetwork, NodeId, Raft, RaftConfig};
use raft_storage::InMemoryStorage;

/// Upper bound tests allow for a new leader to show up
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn cmd(n: u64) -> Vec<u8> {
    n.to_string().into_bytes()
}

/// What the applied-message checker has seen from every peer
#[derive(Default)]
struct Applied {
    /// per peer: index -> command
    logs: HashMap<NodeId, HashMap<u64, Vec<u8>>>,
    errors: Vec<String>,
}

impl Applied {
    fn record(&mut self, id: NodeId, index: u64, command: Vec<u8>) {
        for (other, log) in &self.logs {
            if let Some(existing) = log.get(&index) {
                if *existing != command {
                    self.errors.push(format!(
                        "commit index={} peer={} {:?} != peer={} {:?}",
                        index,
                        id,
                        String::from_utf8_lossy(&command),
                        other,
                        String::from_utf8_lossy(existing)
                    ));
                }
            }
        }
        self.logs.entry(id).or_default().insert(index, command);
    }
}

fn encode_snapshot(log: &HashMap<u64, Vec<u8>>, index: u64) -> Option<Vec<u8>> {
    let commands = (1..=index)
        .map(|i| log.get(&i).cloned())
        .collect::<Option<Vec<_>>>()?;
    serde_json::to_vec(&commands).ok()
}

fn decode_snapshot(data: &[u8]) -> Option<Vec<Vec<u8>>> {
    serde_json::from_slice(data).ok()
}

pub struct TestCluster {
    pub n: usize,
    pub net: LocalNetwork,
    pub config: RaftConfig,
    rafts: HashMap<NodeId, Raft>,
    storages: HashMap<NodeId, InMemoryStorage>,
    collectors: HashMap<NodeId, JoinHandle<()>>,
    applied: Arc<Mutex<Applied>>,
    snapshot_interval: Option<u64>,
}

impl TestCluster {
    pub fn new(n: usize, reliable: bool) -> Self {
        Self::build(n, reliable, None)
    }

    /// Every peer's application snapshots after each `interval` applied commands
    pub fn with_snapshots(n: usize, reliable: bool, interval: u64) -> Self {
        Self::build(n, reliable, Some(interval))
    }

    fn build(n: usize, reliable: bool, snapshot_interval: Option<u64>) -> Self {
        init_tracing();
        let net = LocalNetwork::new();
        net.set_reliable(reliable);

        let mut cluster = Self {
            n,
            net,
            config: RaftConfig::default(),
            rafts: HashMap::new(),
            storages: HashMap::new(),
            collectors: HashMap::new(),
            applied: Arc::new(Mutex::new(Applied::default())),
            snapshot_interval,
        };
        for id in cluster.ids() {
            cluster.storages.insert(id, InMemoryStorage::new());
            cluster.start1(id);
        }
        cluster
    }

    pub fn ids(&self) -> Vec<NodeId> {
        (1..=self.n as NodeId).collect()
    }

    pub fn raft(&self, id: NodeId) -> &Raft {
        &self.rafts[&id]
    }

    pub fn storage(&self, id: NodeId) -> &InMemoryStorage {
        &self.storages[&id]
    }

    /// Start (or restart) a peer from whatever it last persisted
    pub fn start1(&mut self, id: NodeId) {
        self.crash1(id);

        let storage = self.storages.entry(id).or_default().clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let raft = Raft::new(
            id,
            self.ids(),
            Box::new(storage),
            self.net.transport(id),
            tx,
            self.config.clone(),
        )
        .expect("peer starts");

        let collector = tokio::spawn(collect(
            id,
            rx,
            raft.clone(),
            self.applied.clone(),
            self.snapshot_interval,
        ));
        self.net.register(id, raft.clone());
        self.rafts.insert(id, raft);
        self.collectors.insert(id, collector);
    }

    /// Kill a peer, keeping only what it had persisted
    pub fn crash1(&mut self, id: NodeId) {
        self.net.disconnect(id);
        self.net.unregister(id);
        if let Some(storage) = self.storages.get_mut(&id) {
            // the old instance may still write to its handle
            *storage = storage.snapshot_copy();
        }
        if let Some(raft) = self.rafts.remove(&id) {
            raft.kill();
        }
        if let Some(collector) = self.collectors.remove(&id) {
            collector.abort();
        }
    }

    /// Lose everything a crashed peer persisted; it restarts empty
    pub fn wipe_storage(&mut self, id: NodeId) {
        self.storages.insert(id, InMemoryStorage::new());
    }

    pub fn connect(&self, id: NodeId) {
        self.net.connect(id);
    }

    pub fn disconnect(&self, id: NodeId) {
        self.net.disconnect(id);
    }

    fn live_connected(&self) -> Vec<NodeId> {
        self.ids()
            .into_iter()
            .filter(|id| self.rafts.contains_key(id) && self.net.is_connected(*id))
            .collect()
    }

    pub fn check_errors(&self) {
        let applied = self.applied.lock();
        if let Some(err) = applied.errors.first() {
            panic!("apply error: {}", err);
        }
    }

    /// Exactly one leader among the connected peers; returns its id
    pub async fn check_one_leader(&self) -> NodeId {
        for _ in 0..10 {
            let pause = rand::random::<u64>() % 100 + 450;
            sleep(Duration::from_millis(pause)).await;

            let mut leaders: HashMap<u64, Vec<NodeId>> = HashMap::new();
            for id in self.live_connected() {
                let (term, is_leader) = self.raft(id).get_state();
                if is_leader {
                    leaders.entry(term).or_default().push(id);
                }
            }
            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "term {} has {} leaders: {:?}", term, ids.len(), ids);
            }
            if let Some(latest) = leaders.keys().max() {
                return leaders[latest][0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// Connected peer claiming leadership in the highest term, without waiting
    pub fn current_leader(&self) -> Option<NodeId> {
        self.live_connected()
            .into_iter()
            .filter_map(|id| {
                let (term, is_leader) = self.raft(id).get_state();
                is_leader.then_some((term, id))
            })
            .max()
            .map(|(_, id)| id)
    }

    /// All connected peers agree on the term
    pub fn check_terms(&self) -> u64 {
        let mut term = None;
        for id in self.live_connected() {
            let (t, _) = self.raft(id).get_state();
            match term {
                None => term = Some(t),
                Some(seen) => assert_eq!(seen, t, "peers disagree on term"),
            }
        }
        term.unwrap_or(0)
    }

    pub fn check_no_leader(&self) {
        for id in self.live_connected() {
            let (_, is_leader) = self.raft(id).get_state();
            assert!(!is_leader, "peer {} claims leadership while in the minority", id);
        }
    }

    /// How many peers applied `index`, and what they applied there
    pub fn n_committed(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        self.check_errors();
        let applied = self.applied.lock();
        let mut count = 0;
        let mut command: Option<Vec<u8>> = None;
        for id in self.ids() {
            if let Some(c) = applied.logs.get(&id).and_then(|log| log.get(&index)) {
                if let Some(prev) = &command {
                    assert_eq!(prev, c, "committed values do not match at index {}", index);
                }
                count += 1;
                command = Some(c.clone());
            }
        }
        (count, command)
    }

    /// Wait until at least `n` peers applied `index`; `None` if the term moved past `start_term`
    pub async fn wait(&self, index: u64, n: usize, start_term: Option<u64>) -> Option<Vec<u8>> {
        let mut pause = Duration::from_millis(10);
        for _ in 0..30 {
            let (count, _) = self.n_committed(index);
            if count >= n {
                break;
            }
            sleep(pause).await;
            if pause < Duration::from_secs(1) {
                pause *= 2;
            }
            if let Some(start_term) = start_term {
                if self.rafts.values().any(|r| r.get_state().0 > start_term) {
                    return None;
                }
            }
        }
        let (count, command) = self.n_committed(index);
        assert!(count >= n, "only {} decided for index {}; wanted {}", count, index, n);
        command
    }

    /// Drive `command` to agreement on at least `expected` peers and return its index.
    ///
    /// With `retry`, a proposal that got lost to a leader change is proposed
    /// again; without it the first failure panics.
    pub async fn one(&self, command: Vec<u8>, expected: usize, retry: bool) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        let ids = self.ids();
        let mut next = 0;

        while Instant::now() < deadline {
            let mut index = None;
            for _ in 0..ids.len() {
                let id = ids[next % ids.len()];
                next += 1;
                if !self.net.is_connected(id) {
                    continue;
                }
                if let Some(raft) = self.rafts.get(&id) {
                    if let Some((i, _)) = raft.start(command.clone()) {
                        index = Some(i);
                        break;
                    }
                }
            }

            if let Some(index) = index {
                let until = Instant::now() + Duration::from_secs(2);
                while Instant::now() < until {
                    let (count, applied) = self.n_committed(index);
                    if count > 0 && count >= expected && applied.as_deref() == Some(&command[..]) {
                        return index;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
                assert!(retry, "one({:?}) failed to reach agreement", String::from_utf8_lossy(&command));
            } else {
                sleep(Duration::from_millis(50)).await;
            }
        }
        panic!("one({:?}) failed to reach agreement", String::from_utf8_lossy(&command));
    }

    pub fn shutdown(&mut self) {
        for id in self.ids() {
            self.crash1(id);
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Application stand-in: checks ordering and agreement, and snapshots on
/// a fixed interval when asked to
async fn collect(
    id: NodeId,
    mut rx: mpsc::UnboundedReceiver<ApplyMsg>,
    raft: Raft,
    applied: Arc<Mutex<Applied>>,
    snapshot_interval: Option<u64>,
) {
    let mut last_applied = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            ApplyMsg::Command { index, command, .. } => {
                if index != last_applied + 1 {
                    applied.lock().errors.push(format!(
                        "peer {} applied index {} out of order (last {})",
                        id, index, last_applied
                    ));
                    continue;
                }
                last_applied = index;
                applied.lock().record(id, index, command);

                if let Some(interval) = snapshot_interval {
                    if index % interval == 0 {
                        let data = {
                            let applied = applied.lock();
                            applied.logs.get(&id).and_then(|log| encode_snapshot(log, index))
                        };
                        match data {
                            Some(data) => {
                                if let Err(e) = raft.snapshot(index, data) {
                                    applied
                                        .lock()
                                        .errors
                                        .push(format!("peer {} failed to snapshot at {}: {}", id, index, e));
                                }
                            }
                            None => applied
                                .lock()
                                .errors
                                .push(format!("peer {} is missing entries below {}", id, index)),
                        }
                    }
                }
            }
            ApplyMsg::Snapshot { data, term, index } => {
                match raft.cond_install_snapshot(term, index, data.clone()) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        applied
                            .lock()
                            .errors
                            .push(format!("peer {} could not install snapshot {}: {}", id, index, e));
                        continue;
                    }
                }
                let Some(commands) = decode_snapshot(&data) else {
                    applied.lock().errors.push(format!("peer {} got an unreadable snapshot", id));
                    continue;
                };
                let mut applied = applied.lock();
                for (i, command) in commands.into_iter().enumerate() {
                    applied.record(id, i as u64 + 1, command);
                }
                last_applied = index;
            }
        }
    }
}
