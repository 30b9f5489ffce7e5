//! Test harness for multi-node Raft cluster integration tests.
//!
//! Runs a cluster over the in-memory `LocalNetwork` with per-node
//! `MemoryStorage` that survives simulated crashes, and collects each
//! node's applied entries for assertions.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use raft_lite::{ApplyMsg, LocalNetwork, MemoryStorage, RaftConfig, RaftNode, Storage};

/// Opt-in test logging: RUST_LOG=raft_lite=debug cargo test -- --nocapture
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u64,
    pub raft: Arc<RaftNode>,
    pub applied: Arc<Mutex<Vec<ApplyMsg>>>,
    collector: JoinHandle<()>,
}

impl TestNode {
    pub async fn is_leader(&self) -> bool {
        self.raft.get_state().await.1
    }

    pub async fn current_term(&self) -> u64 {
        self.raft.get_state().await.0
    }

    pub async fn log_len(&self) -> usize {
        self.raft.state.read().await.log.len()
    }

    /// Commands applied so far, in delivery order.
    pub fn applied_commands(&self) -> Vec<Vec<u8>> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.command.clone())
            .collect()
    }

    pub fn applied_len(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.raft.shutdown();
        self.collector.abort();
    }
}

/// Test cluster managing multiple nodes over a shared in-memory network
pub struct TestCluster {
    pub nodes: HashMap<u64, TestNode>,
    pub net: Arc<LocalNetwork>,
    storages: HashMap<u64, Arc<MemoryStorage>>,
    peer_ids: Vec<u64>,
}

impl TestCluster {
    /// Create and start a cluster with n nodes, ids 1..=n
    pub async fn new(num_nodes: usize) -> Self {
        init_tracing();
        let net = LocalNetwork::new();
        let peer_ids: Vec<u64> = (1..=num_nodes as u64).collect();

        let mut cluster = Self {
            nodes: HashMap::new(),
            net,
            storages: HashMap::new(),
            peer_ids,
        };

        for id in cluster.peer_ids.clone() {
            let storage = Arc::new(MemoryStorage::new());
            cluster.storages.insert(id, storage.clone());
            cluster.start_node(id, storage).await;
        }

        cluster
    }

    async fn start_node(&mut self, node_id: u64, storage: Arc<MemoryStorage>) {
        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel();
        let applied = Arc::new(Mutex::new(Vec::new()));
        let applied_clone = applied.clone();
        let collector = tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                applied_clone.lock().unwrap().push(msg);
            }
        });

        let raft = RaftNode::spawn(
            node_id,
            self.peer_ids.clone(),
            RaftConfig::fast(),
            self.net.handle(node_id),
            storage as Arc<dyn Storage>,
            apply_tx,
        )
        .expect("node should start from persisted state");

        self.net.register(node_id, raft.clone()).await;
        self.nodes.insert(
            node_id,
            TestNode {
                node_id,
                raft,
                applied,
                collector,
            },
        );
    }

    pub fn get_node(&self, node_id: u64) -> &TestNode {
        self.nodes.get(&node_id).expect("unknown node id")
    }

    /// Wait for some node to become leader
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<u64> {
        let found = wait_for(
            || async { self.get_leader_id().await.is_some() },
            timeout,
            Duration::from_millis(20),
        )
        .await;
        if found {
            self.get_leader_id().await
        } else {
            None
        }
    }

    pub async fn get_leader_id(&self) -> Option<u64> {
        for node in self.nodes.values() {
            if node.is_leader().await {
                return Some(node.node_id);
            }
        }
        None
    }

    /// Wait for a leader among a specific group of nodes
    pub async fn wait_for_leader_in_group(&self, group: &[u64], timeout: Duration) -> Option<u64> {
        let found = wait_for(
            || async {
                for &id in group {
                    if let Some(node) = self.nodes.get(&id) {
                        if node.is_leader().await {
                            return true;
                        }
                    }
                }
                false
            },
            timeout,
            Duration::from_millis(20),
        )
        .await;
        if found {
            for &id in group {
                if let Some(node) = self.nodes.get(&id) {
                    if node.is_leader().await {
                        return Some(id);
                    }
                }
            }
        }
        None
    }

    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// `(node_id, term)` for every node currently claiming leadership
    pub async fn leaders_with_terms(&self) -> Vec<(u64, u64)> {
        let mut leaders = Vec::new();
        for node in self.nodes.values() {
            let (term, is_leader) = node.raft.get_state().await;
            if is_leader {
                leaders.push((node.node_id, term));
            }
        }
        leaders
    }

    /// Submit a command through the current leader
    pub async fn submit(&self, command: &[u8]) -> Result<(u64, u64), String> {
        let leader_id = self.get_leader_id().await.ok_or("no leader elected")?;
        self.submit_to(leader_id, command).await
    }

    /// Submit a command to a specific node (which must believe it leads)
    pub async fn submit_to(&self, node_id: u64, command: &[u8]) -> Result<(u64, u64), String> {
        let node = self.nodes.get(&node_id).ok_or("node not found")?;
        node.raft
            .submit(command.to_vec())
            .await
            .map_err(|e| e.to_string())
    }

    /// Crash a node: stop it and unplug it, keeping its storage
    pub async fn crash(&mut self, node_id: u64) {
        self.net.deregister(node_id).await;
        if let Some(node) = self.nodes.remove(&node_id) {
            node.raft.shutdown();
        }
    }

    /// Restart a crashed node from its surviving storage
    pub async fn restart(&mut self, node_id: u64) {
        let storage = self
            .storages
            .get(&node_id)
            .expect("no storage for node")
            .clone();
        self.start_node(node_id, storage).await;
    }

    pub async fn create_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &a in group_a {
            for &b in group_b {
                self.net.disconnect(a, b).await;
            }
        }
    }

    pub async fn heal_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &a in group_a {
            for &b in group_b {
                self.net.reconnect(a, b).await;
            }
        }
    }

    pub async fn isolate_node(&self, node_id: u64) {
        self.net.isolate(node_id).await;
    }

    pub async fn heal_node(&self, node_id: u64) {
        self.net.heal(node_id).await;
    }

    /// Wait until every listed node has applied at least `count` entries
    pub async fn wait_for_applied(&self, node_ids: &[u64], count: usize, timeout: Duration) -> bool {
        wait_for(
            || async {
                node_ids.iter().all(|id| {
                    self.nodes
                        .get(id)
                        .map(|n| n.applied_len() >= count)
                        .unwrap_or(false)
                })
            },
            timeout,
            Duration::from_millis(20),
        )
        .await
    }

    /// Every pair of applied sequences must agree on their common prefix
    /// (state machine safety), and indices must be gapless from 1.
    pub fn assert_applied_consistent(&self) {
        let mut sequences: Vec<(u64, Vec<ApplyMsg>)> = Vec::new();
        for node in self.nodes.values() {
            let applied = node.applied.lock().unwrap().clone();
            for (i, msg) in applied.iter().enumerate() {
                assert_eq!(
                    msg.index,
                    i as u64 + 1,
                    "node {} applied index {} at position {}",
                    node.node_id,
                    msg.index,
                    i
                );
            }
            sequences.push((node.node_id, applied));
        }
        for (id_a, a) in &sequences {
            for (id_b, b) in &sequences {
                let common = a.len().min(b.len());
                assert_eq!(
                    &a[..common],
                    &b[..common],
                    "nodes {} and {} applied diverging commands",
                    id_a,
                    id_b
                );
            }
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
