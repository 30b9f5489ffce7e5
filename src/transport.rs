//! The RPC seam between peers.
//!
//! The consensus core only needs "send request R to peer P, get a reply or a
//! failure"; errors, timeouts, and dropped messages are indistinguishable.
//! `LocalNetwork` is an in-memory implementation with fault injection, used
//! by the integration tests to stand in for a real wire transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{RaftError, Result};
use crate::raft::node::RaftNode;
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};

/// Point-to-point request/reply channel to the rest of the cluster.
///
/// Implementations provide no ordering or delivery guarantees across calls;
/// the core re-derives correctness from current state on every reply.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, target: u64, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// An in-memory cluster fabric routing RPCs directly to registered nodes.
///
/// Supports cutting and restoring links between pairs of nodes; a cut link
/// drops both requests and replies, so a message already "in flight" when
/// the partition forms is lost like a real dropped packet.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<u64, Arc<RaftNode>>>,
    cut: RwLock<HashSet<(u64, u64)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node to the fabric. Re-registering an id replaces the old
    /// node, which is how the tests model a restart.
    pub async fn register(&self, id: u64, node: Arc<RaftNode>) {
        self.nodes.write().await.insert(id, node);
    }

    /// Detach a node; RPCs to it fail as unreachable (simulated crash).
    pub async fn deregister(&self, id: u64) {
        self.nodes.write().await.remove(&id);
    }

    /// Cut the link between two nodes in both directions.
    pub async fn disconnect(&self, a: u64, b: u64) {
        let mut cut = self.cut.write().await;
        cut.insert((a, b));
        cut.insert((b, a));
    }

    /// Restore the link between two nodes.
    pub async fn reconnect(&self, a: u64, b: u64) {
        let mut cut = self.cut.write().await;
        cut.remove(&(a, b));
        cut.remove(&(b, a));
    }

    /// Cut every link touching `id`.
    pub async fn isolate(&self, id: u64) {
        let others: Vec<u64> = {
            let nodes = self.nodes.read().await;
            nodes.keys().copied().filter(|&n| n != id).collect()
        };
        for other in others {
            self.disconnect(id, other).await;
        }
    }

    /// Restore every link touching `id`.
    pub async fn heal(&self, id: u64) {
        let mut cut = self.cut.write().await;
        cut.retain(|&(a, b)| a != id && b != id);
    }

    /// A transport handle bound to the sending node's identity.
    pub fn handle(self: &Arc<Self>, src: u64) -> Arc<LocalPeer> {
        Arc::new(LocalPeer {
            src,
            net: Arc::clone(self),
        })
    }

    async fn route(&self, src: u64, dst: u64) -> Result<Arc<RaftNode>> {
        if self.cut.read().await.contains(&(src, dst)) {
            return Err(RaftError::Unreachable(dst, "partitioned".into()));
        }
        self.nodes
            .read()
            .await
            .get(&dst)
            .cloned()
            .ok_or_else(|| RaftError::Unreachable(dst, "down".into()))
    }

    async fn check_reply_path(&self, src: u64, dst: u64) -> Result<()> {
        if self.cut.read().await.contains(&(src, dst)) {
            return Err(RaftError::Unreachable(dst, "reply lost".into()));
        }
        Ok(())
    }
}

/// The sending side of a `LocalNetwork` link, one per node.
pub struct LocalPeer {
    src: u64,
    net: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalPeer {
    async fn request_vote(&self, target: u64, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.net.route(self.src, target).await?;
        let resp = node.handle_request_vote(req).await?;
        self.net.check_reply_path(self.src, target).await?;
        Ok(resp)
    }

    async fn append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.net.route(self.src, target).await?;
        let resp = node.handle_append_entries(req).await?;
        self.net.check_reply_path(self.src, target).await?;
        Ok(resp)
    }
}
