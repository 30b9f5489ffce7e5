use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("peer {0} unreachable: {1}")]
    Unreachable(u64, String),

    #[error("node has been shut down")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, RaftError>;
