/// Timing configuration for a Raft peer.
///
/// The election timeout window must be wide enough that concurrent
/// candidates rarely split the vote, and the heartbeat interval must be
/// well below the minimum timeout so followers observe a live leader.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout, in milliseconds.
    pub election_timeout_max_ms: u64,
    /// Fixed heartbeat interval for leaders, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Per-call timeout for outbound RPCs, in milliseconds.
    pub rpc_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
        }
    }
}

impl RaftConfig {
    /// Shortened timing used by the integration test harness.
    pub fn fast() -> Self {
        Self {
            election_timeout_min_ms: 50,
            election_timeout_max_ms: 100,
            heartbeat_interval_ms: 20,
            rpc_timeout_ms: 50,
        }
    }
}
