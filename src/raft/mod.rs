pub mod node;
pub mod persist;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::{ApplyMsg, RaftNode};
pub use state::{LogEntry, RaftRole, RaftState};
