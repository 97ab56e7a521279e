//! Error types shared across the server crate.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid cluster configuration: {0}")]
    Config(String),

    #[error("peering node failed to start: {0}")]
    NodeInit(String),

    #[error("consensus runtime error: {0}")]
    Consensus(String),

    #[error("not the leader")]
    NotLeader,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("store is closed")]
    StoreClosed,

    #[error("store error: {0}")]
    Store(#[from] rocksdb::Error),

    #[error("log codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("collection registry error: {0}")]
    Collections(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Whether the error should abort startup rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Config(_) | ServerError::NodeInit(_))
    }
}
