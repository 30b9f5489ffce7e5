use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the Raft log. Commands are opaque bytes; the
/// application layer gives them meaning when they are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// The complete mutable state of one Raft peer.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`)
/// - A candidate must receive a majority of votes to become leader
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its log. Enforced by:
/// - Leaders only append new entries via `append_entry()`
/// - Log truncation only occurs on followers during replication conflicts
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, the logs
/// are identical in all entries up through that index. Enforced by:
/// - The `AppendEntries` consistency check (prev_log_index, prev_log_term)
/// - Conflicting suffixes are truncated before appending
///
/// ## Leader Completeness
/// A committed entry is present in the log of every future leader.
/// Enforced by:
/// - Vote restriction: candidates must have up-to-date logs
///   (`is_log_up_to_date`)
/// - Leaders only commit entries from their current term
///
/// ## State Machine Safety
/// If a peer has applied an entry at a given index, no other peer will
/// ever apply a different entry at that index. Enforced by:
/// - Entries are only applied once committed (`last_applied <= commit_index`)
/// - Committed entries are never overwritten (Leader Completeness)
#[derive(Debug)]
pub struct RaftState {
    // Persistent state, written to stable storage before any reply that
    // depends on it
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    // Current role
    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<u64>,

    // Votes received in the current election (for candidates)
    pub votes_received: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
        }
    }

    /// Get the last log index (0 when the log is empty)
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    /// Get the last log term (0 when the log is empty)
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Get log entry at index (1-indexed)
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Get entries starting from index (inclusive)
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        if start_index == 0 {
            return self.log.clone();
        }
        let start = (start_index - 1) as usize;
        if start >= self.log.len() {
            return Vec::new();
        }
        self.log[start..].to_vec()
    }

    /// First index carrying the given term, used for conflict hints
    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.iter().find(|e| e.term == term).map(|e| e.index)
    }

    /// Last index carrying the given term, used by the leader to jump
    /// `next_index` backward on a conflict reply
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Append a new entry tagged with the current term (leader only)
    pub fn append_entry(&mut self, command: Vec<u8>) -> &LogEntry {
        let index = self.last_log_index() + 1;
        let entry = LogEntry {
            term: self.current_term,
            index,
            command,
        };
        self.log.push(entry);
        self.log.last().expect("log cannot be empty after push")
    }

    /// Discard every entry at `from_index` and beyond
    pub fn truncate_from(&mut self, from_index: u64) {
        if from_index <= 1 {
            self.log.clear();
        } else {
            let keep = (from_index - 1) as usize;
            if keep < self.log.len() {
                self.log.truncate(keep);
            }
        }
    }

    /// Check if a candidate's log is at least as up-to-date as ours.
    ///
    /// Three-way comparison: a strictly newer last term wins outright; an
    /// equal last term is decided by log length; an older last term loses.
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower. `voted_for` is only cleared when the term
    /// actually advances; a same-term step-down keeps the vote so a peer
    /// can never vote twice in one term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.votes_received = 0;
    }

    /// Transition to candidate: bump the term and vote for ourselves
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1;
        self.leader_id = None;
    }

    /// Transition to leader and reset the replication tables
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, next);
            self.match_index.insert(peer_id, 0);
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
