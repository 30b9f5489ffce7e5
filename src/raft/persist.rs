//! Encoding of the durable part of a peer's state.
//!
//! The blob layout is a private contract between this peer's writes and its
//! own reads after restart; no cross-implementation compatibility is
//! intended.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::raft::state::LogEntry;

/// State that must survive a crash: everything a vote or append decision
/// depends on.
#[derive(Debug, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

/// Borrowed view used for encoding, so saving does not clone the log.
#[derive(Serialize)]
pub struct HardStateRef<'a> {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: &'a [LogEntry],
}

pub fn encode(state: &HardStateRef<'_>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(state)?)
}

pub fn decode(blob: &[u8]) -> Result<HardState> {
    Ok(serde_json::from_slice(blob)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_state_round_trips() {
        let log = vec![
            LogEntry {
                term: 1,
                index: 1,
                command: b"x".to_vec(),
            },
            LogEntry {
                term: 3,
                index: 2,
                command: Vec::new(),
            },
        ];
        let blob = encode(&HardStateRef {
            current_term: 3,
            voted_for: Some(2),
            log: &log,
        })
        .unwrap();

        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded.current_term, 3);
        assert_eq!(decoded.voted_for, Some(2));
        assert_eq!(decoded.log, log);
    }

    #[test]
    fn garbage_blob_is_an_error() {
        assert!(decode(b"not json").is_err());
    }
}
