//! Wire messages and the pure RPC handlers.
//!
//! The handlers mutate `RaftState` only; they never touch the network,
//! timers, or storage. Each returns the reply together with a flag telling
//! the caller whether durable state (term, vote, log) changed and must be
//! persisted before the reply is sent.

use serde::{Deserialize, Serialize};

use crate::raft::state::{LogEntry, RaftRole, RaftState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On a consistency-check failure: the index the leader should retry
    /// from. When the follower is simply missing the entry this is one past
    /// its last index; on a term mismatch it is the first index of the
    /// conflicting term.
    pub conflict_index: Option<u64>,
    /// Term of the follower's conflicting entry, if there was one.
    pub conflict_term: Option<u64>,
}

/// Handle a RequestVote RPC.
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest) -> (VoteResponse, bool) {
    let mut needs_persist = false;

    // A higher term demotes us before the vote is even considered
    if req.term > state.current_term {
        state.become_follower(req.term);
        needs_persist = true;
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        needs_persist = true;
        true
    };

    tracing::debug!(
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote handled"
    );

    (
        VoteResponse {
            term: state.current_term,
            vote_granted,
        },
        needs_persist,
    )
}

/// Handle an AppendEntries RPC (heartbeat and replication).
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
) -> (AppendEntriesResponse, bool) {
    let mut needs_persist = false;

    if req.term > state.current_term {
        state.become_follower(req.term);
        needs_persist = true;
    }

    // Stale leader: tell it our term so it steps down
    if req.term < state.current_term {
        return (
            AppendEntriesResponse {
                term: state.current_term,
                success: false,
                conflict_index: None,
                conflict_term: None,
            },
            needs_persist,
        );
    }

    // Valid message from the current leader: a same-term candidate yields
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    // Consistency check against (prev_log_index, prev_log_term)
    if req.prev_log_index > 0 {
        match state.get_entry(req.prev_log_index) {
            None => {
                return (
                    AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                        conflict_index: Some(state.last_log_index() + 1),
                        conflict_term: None,
                    },
                    needs_persist,
                );
            }
            Some(entry) if entry.term != req.prev_log_term => {
                let conflict_term = entry.term;
                let conflict_index = state
                    .first_index_of_term(conflict_term)
                    .unwrap_or(req.prev_log_index);
                return (
                    AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                        conflict_index: Some(conflict_index),
                        conflict_term: Some(conflict_term),
                    },
                    needs_persist,
                );
            }
            Some(_) => {}
        }
    }

    // Reconcile: skip entries we already hold with matching terms, truncate
    // at the first conflict, append the rest. A duplicated or reordered
    // request must never truncate a longer log that still matches.
    for (i, entry) in req.entries.iter().enumerate() {
        let index = req.prev_log_index + 1 + i as u64;
        match state.get_entry(index) {
            Some(local) if local.term == entry.term => continue,
            _ => {
                state.truncate_from(index);
                state.log.extend(req.entries[i..].iter().cloned());
                needs_persist = true;
                tracing::debug!(
                    leader = req.leader_id,
                    from_index = index,
                    appended = req.entries.len() - i,
                    new_last_index = state.last_log_index(),
                    "appended entries"
                );
                break;
            }
        }
    }

    // Advance commit index, bounded by the last entry this request covered
    let last_new_index = req.prev_log_index + req.entries.len() as u64;
    let new_commit = req.leader_commit.min(last_new_index);
    if new_commit > state.commit_index {
        state.commit_index = new_commit;
    }

    (
        AppendEntriesResponse {
            term: state.current_term,
            success: true,
            conflict_index: None,
            conflict_term: None,
        },
        needs_persist,
    )
}
