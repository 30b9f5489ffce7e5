pub mod config;
pub mod error;
pub mod raft;
pub mod storage;
pub mod transport;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use raft::node::{ApplyMsg, RaftNode};
pub use raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
pub use raft::state::{LogEntry, RaftRole};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use transport::{LocalNetwork, Transport};
