//! Error types exposed by this crate.

use std::path::PathBuf;

use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// The Raft node is shutting down.
    #[error("raft stopped")]
    ShuttingDown,
    /// An error coming from the log facade.
    #[error("{0}")]
    Log(#[from] LogError),
    /// A protocol safety invariant was violated; the node must stop immediately.
    #[error("raft safety violation: {0}")]
    SafetyViolation(String),
}

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError {
    /// Some error which has taken place internally in Raft.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The write request must be forwarded to the cluster leader, if known.
    #[error("the node is not the leader, forward to {0:?}")]
    ForwardToLeader(Option<NodeId>),
}

/// The set of errors which may take place when requesting to propose a config change.
#[derive(Debug, thiserror::Error)]
pub enum ChangeConfigError {
    /// Some error which has taken place internally in Raft.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The node the config change proposal was sent to was not the leader of the cluster.
    #[error("this node is not the raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// The proposed config would leave the cluster in an inoperable state.
    ///
    /// This error will be returned if the proposal is for an empty cluster.
    #[error("the proposed config change would leave the cluster in an inoperable state")]
    InoperableConfig,
    /// The proposed change adds or removes more than one member at a time.
    ///
    /// Only single-server membership changes are permitted; joint consensus is not used.
    #[error("only single-server membership changes are permitted")]
    NotSingleStep,
}

/// An error which may arise while interacting with the log facade.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The WAL sink is unavailable; the write was not accepted.
    #[error("the write-ahead log is down")]
    WalDown,
    /// An I/O error from the underlying storage.
    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored value could not be decoded.
    #[error("log codec error: {0}")]
    Codec(String),
}

/// An error which may arise inside the WAL sink.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// The WAL sink is unavailable.
    #[error("the write-ahead log is down")]
    Down,
    /// An I/O error. These are fatal to the sink.
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    /// A record failed checksum validation during recovery. Fatal.
    #[error("wal corruption detected in {file:?} at offset {offset}")]
    Corrupt { file: PathBuf, offset: u64 },
    /// A record or entry could not be decoded.
    #[error("wal codec error: {0}")]
    Codec(String),
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The broadcast interval must be greater than zero.
    #[error("broadcast interval must be greater than 0")]
    InvalidBroadcastInterval,
    /// The await-condition timeout must not be shorter than the broadcast interval.
    #[error("await-condition timeout must not be shorter than the broadcast interval")]
    InvalidAwaitConditionTimeout,
    /// The max AppendEntries payload size must be greater than zero.
    #[error("max_append_entries must be greater than 0")]
    MaxAppendEntriesTooSmall,
}
