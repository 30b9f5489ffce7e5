//! The Raft peer: role state machine, election and replication drivers,
//! client submission, and the commit/apply pipeline.
//!
//! One control task runs the timer loop; every outbound RPC and inbound
//! handler invocation runs independently, all synchronizing on the single
//! `RwLock<RaftState>`. The lock is never held across a network call; reply
//! handlers reacquire it and discard the reply if the term or role has moved
//! on since the request was sent.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::raft::persist::{self, HardStateRef};
use crate::raft::rpc::{
    self, AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::storage::Storage;
use crate::transport::Transport;

/// A committed log entry handed to the application layer.
///
/// Delivered in strictly increasing index order, at most once per process
/// lifetime. After a restart delivery restarts from index 1; an application
/// that checkpoints its own progress must tolerate that replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub index: u64,
    pub command: Vec<u8>,
}

/// One Raft consensus peer.
pub struct RaftNode {
    pub id: u64,
    /// All cluster member ids, including this node, in cluster order.
    peers: Vec<u64>,
    config: RaftConfig,
    pub state: Arc<RwLock<RaftState>>,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    commit_tx: watch::Sender<u64>,
    last_heartbeat: RwLock<Instant>,
    /// Wakes the control loop on role transitions so timers are re-armed
    /// promptly instead of waiting out a stale sleep.
    timer_reset: tokio::sync::Notify,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Create a peer, restore any persisted state, and start its control
    /// loop and apply pipeline. Never blocks on network activity.
    pub fn spawn(
        id: u64,
        peers: Vec<u64>,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Result<Arc<Self>> {
        let mut state = RaftState::new();
        if let Some(blob) = storage.load()? {
            let hard = persist::decode(&blob)?;
            tracing::info!(
                node_id = id,
                term = hard.current_term,
                log_len = hard.log.len(),
                "restored persisted raft state"
            );
            state.current_term = hard.current_term;
            state.voted_for = hard.voted_for;
            state.log = hard.log;
        }

        let (commit_tx, _) = watch::channel(0u64);
        let node = Arc::new(Self {
            id,
            peers,
            config,
            state: Arc::new(RwLock::new(state)),
            transport,
            storage,
            apply_tx,
            commit_tx,
            last_heartbeat: RwLock::new(Instant::now()),
            timer_reset: tokio::sync::Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&node).run());
        tokio::spawn(Arc::clone(&node).apply_loop());
        Ok(node)
    }

    /// Current term and whether this node believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.read().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    /// Last known leader id, as a redirect hint for clients.
    pub async fn leader_id(&self) -> Option<u64> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    /// Watch channel carrying the highest committed index.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Stop the peer. Idempotent; background loops observe the token and
    /// exit, they are not forcibly aborted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start agreement on a new command.
    ///
    /// On the leader this appends the entry, persists it, kicks off
    /// replication, and returns the assigned `(index, term)` immediately;
    /// commitment is observed through the apply pipeline, not here.
    pub async fn submit(self: &Arc<Self>, command: Vec<u8>) -> Result<(u64, u64)> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Stopped);
        }
        let mut state = self.state.write().await;
        if state.role != RaftRole::Leader {
            return Err(RaftError::NotLeader(state.leader_id));
        }

        let (index, term) = {
            let entry = state.append_entry(command);
            (entry.index, entry.term)
        };
        self.persist(&state)?;
        // In a single-node cluster the majority is ourselves; otherwise this
        // is a no-op until replication replies arrive
        let committed = self.advance_commit_index(&mut state).then(|| state.commit_index);
        drop(state);
        if let Some(commit) = committed {
            self.commit_tx.send_replace(commit);
        }

        tracing::debug!(node_id = self.id, index, term, "appended client command");

        // Push the new entry out without waiting for the next heartbeat
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.broadcast_append_entries().await;
        });

        Ok((index, term))
    }

    /// Handle an incoming RequestVote RPC.
    pub async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Stopped);
        }
        let mut state = self.state.write().await;
        let (resp, needs_persist) = rpc::handle_request_vote(&mut state, &req);
        if needs_persist {
            // Durable before the reply leaves this node
            self.persist(&state)?;
        }
        drop(state);

        if resp.vote_granted {
            // Casting a vote suppresses our own election this round
            *self.last_heartbeat.write().await = Instant::now();
        }
        Ok(resp)
    }

    /// Handle an incoming AppendEntries RPC.
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Stopped);
        }
        let mut state = self.state.write().await;
        let commit_before = state.commit_index;
        let (resp, needs_persist) = rpc::handle_append_entries(&mut state, &req);
        if needs_persist {
            self.persist(&state)?;
        }
        let commit_after = state.commit_index;
        drop(state);

        // Any current-term message from the leader is a liveness signal,
        // even when the consistency check failed
        if resp.term == req.term {
            *self.last_heartbeat.write().await = Instant::now();
        }
        if commit_after > commit_before {
            self.commit_tx.send_replace(commit_after);
        }
        Ok(resp)
    }

    /// The control loop: election timeouts for followers and candidates,
    /// heartbeat ticks for leaders.
    async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let role = self.state.read().await.role;
            let election_timeout = random_election_timeout(
                self.config.election_timeout_min_ms,
                self.config.election_timeout_max_ms,
            );
            let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                // Role transition elsewhere: loop around and re-arm timers
                _ = self.timer_reset.notified() => {}

                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        self.start_election().await;
                    }
                }

                _ = tokio::time::sleep(heartbeat), if role == RaftRole::Leader => {
                    self.broadcast_append_entries().await;
                }
            }
        }
        tracing::debug!(node_id = self.id, "raft control loop stopped");
    }

    /// Become candidate and solicit votes from every peer concurrently.
    async fn start_election(self: &Arc<Self>) {
        let mut state = self.state.write().await;
        if state.role == RaftRole::Leader {
            return;
        }
        state.become_candidate(self.id);
        if self.persist(&state).is_err() {
            return;
        }
        // The self-vote alone wins a single-node cluster
        if state.votes_received as usize >= self.majority() {
            let others = self.other_peers();
            let term = state.current_term;
            state.become_leader(self.id, &others);
            tracing::info!(node_id = self.id, term, "won uncontested election");
            drop(state);
            self.timer_reset.notify_one();
            self.broadcast_append_entries().await;
            return;
        }
        let req = VoteRequest {
            term: state.current_term,
            candidate_id: self.id,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        };
        drop(state);

        tracing::info!(node_id = self.id, term = req.term, "starting election");

        for peer in self.other_peers() {
            let node = Arc::clone(self);
            let req = req.clone();
            tokio::spawn(async move {
                node.send_request_vote(peer, req).await;
            });
        }
    }

    async fn send_request_vote(self: &Arc<Self>, peer: u64, req: VoteRequest) {
        let sent_term = req.term;
        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let resp = match timeout(rpc_timeout, self.transport.request_vote(peer, req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                tracing::trace!(node_id = self.id, peer, error = %e, "vote request failed");
                return;
            }
            Err(_) => {
                tracing::trace!(node_id = self.id, peer, "vote request timed out");
                return;
            }
        };

        let mut state = self.state.write().await;
        // Replies for an abandoned candidacy are no-ops
        if state.role != RaftRole::Candidate || state.current_term != sent_term {
            return;
        }
        if resp.term > state.current_term {
            state.become_follower(resp.term);
            let _ = self.persist(&state);
            drop(state);
            *self.last_heartbeat.write().await = Instant::now();
            self.timer_reset.notify_one();
            return;
        }
        if !resp.vote_granted {
            return;
        }

        state.votes_received += 1;
        tracing::debug!(
            node_id = self.id,
            peer,
            votes = state.votes_received,
            "received vote"
        );
        if state.votes_received as usize >= self.majority() {
            let others = self.other_peers();
            state.become_leader(self.id, &others);
            tracing::info!(
                node_id = self.id,
                term = sent_term,
                votes = state.votes_received,
                "won election, becoming leader"
            );
            drop(state);
            self.timer_reset.notify_one();
            // Assert leadership right away instead of waiting a tick
            self.broadcast_append_entries().await;
        }
    }

    /// Send AppendEntries to every follower, carrying each one's pending
    /// suffix (empty for a pure heartbeat).
    async fn broadcast_append_entries(self: &Arc<Self>) {
        let state = self.state.read().await;
        if state.role != RaftRole::Leader {
            return;
        }
        let term = state.current_term;
        let leader_commit = state.commit_index;

        for peer in self.other_peers() {
            let next = state.next_index.get(&peer).copied().unwrap_or(1).max(1);
            let prev_log_index = next - 1;
            let prev_log_term = if prev_log_index == 0 {
                0
            } else {
                state
                    .get_entry(prev_log_index)
                    .map(|e| e.term)
                    .unwrap_or(0)
            };
            let req = AppendEntriesRequest {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries: state.entries_from(next),
                leader_commit,
            };
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.send_append_entries(peer, req).await;
            });
        }
    }

    async fn send_append_entries(self: &Arc<Self>, peer: u64, req: AppendEntriesRequest) {
        let sent_term = req.term;
        let prev_log_index = req.prev_log_index;
        let sent_entries = req.entries.len() as u64;
        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let resp = match timeout(rpc_timeout, self.transport.append_entries(peer, req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                tracing::trace!(node_id = self.id, peer, error = %e, "append entries failed");
                return;
            }
            Err(_) => {
                tracing::trace!(node_id = self.id, peer, "append entries timed out");
                return;
            }
        };

        let mut state = self.state.write().await;
        // Replies from a superseded leadership are no-ops
        if state.role != RaftRole::Leader || state.current_term != sent_term {
            return;
        }
        if resp.term > state.current_term {
            tracing::info!(
                node_id = self.id,
                old_term = sent_term,
                new_term = resp.term,
                "observed higher term, stepping down"
            );
            state.become_follower(resp.term);
            let _ = self.persist(&state);
            drop(state);
            *self.last_heartbeat.write().await = Instant::now();
            self.timer_reset.notify_one();
            return;
        }

        if resp.success {
            // Replication progress only ever moves forward; an old reply
            // arriving late must not regress it
            let matched = prev_log_index + sent_entries;
            let known = state.match_index.get(&peer).copied().unwrap_or(0);
            if matched > known {
                state.match_index.insert(peer, matched);
                state.next_index.insert(peer, matched + 1);
            }
            if self.advance_commit_index(&mut state) {
                let commit = state.commit_index;
                tracing::debug!(node_id = self.id, commit_index = commit, "advanced commit index");
                drop(state);
                self.commit_tx.send_replace(commit);
            }
        } else {
            // Log mismatch: back up next_index using the follower's hints
            // and let the next cycle retry
            let next = match (resp.conflict_term, resp.conflict_index) {
                (Some(conflict_term), Some(conflict_index)) => state
                    .last_index_of_term(conflict_term)
                    .map(|i| i + 1)
                    .unwrap_or(conflict_index),
                (None, Some(conflict_index)) => conflict_index,
                _ => prev_log_index,
            }
            .max(1);
            state.next_index.insert(peer, next);
            tracing::debug!(node_id = self.id, peer, next_index = next, "log mismatch, backing up");
        }
    }

    /// Commit the highest index replicated on a majority whose entry is in
    /// the leader's current term. Returns whether the index advanced.
    fn advance_commit_index(&self, state: &mut RaftState) -> bool {
        let mut matches: Vec<u64> = state.match_index.values().copied().collect();
        matches.push(state.last_log_index());
        matches.sort_unstable();
        let candidate = matches[matches.len() - self.majority()];

        if candidate > state.commit_index {
            if let Some(entry) = state.get_entry(candidate) {
                if entry.term == state.current_term {
                    state.commit_index = candidate;
                    return true;
                }
            }
        }
        false
    }

    /// Deliver committed entries to the apply sink, in order, exactly once.
    async fn apply_loop(self: Arc<Self>) {
        let mut commit_rx = self.commit_tx.subscribe();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let batch = {
                let mut state = self.state.write().await;
                let mut batch = Vec::new();
                while state.last_applied < state.commit_index {
                    state.last_applied += 1;
                    let applied = state.last_applied;
                    if let Some(entry) = state.get_entry(applied) {
                        batch.push(ApplyMsg {
                            index: entry.index,
                            command: entry.command.clone(),
                        });
                    }
                }
                batch
            };

            for msg in batch {
                if self.apply_tx.send(msg).is_err() {
                    // Application dropped its receiver; nothing left to do
                    return;
                }
            }
        }
    }

    /// Persist term, vote, and log. A failure here is fatal: the node must
    /// not keep making promises it cannot remember, so it halts.
    fn persist(&self, state: &RaftState) -> Result<()> {
        let blob = persist::encode(&HardStateRef {
            current_term: state.current_term,
            voted_for: state.voted_for,
            log: &state.log,
        })?;
        if let Err(e) = self.storage.save(&blob) {
            tracing::error!(node_id = self.id, error = %e, "failed to persist state, halting");
            self.shutdown.cancel();
            return Err(e.into());
        }
        Ok(())
    }

    fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn other_peers(&self) -> Vec<u64> {
        self.peers.iter().copied().filter(|&p| p != self.id).collect()
    }
}
