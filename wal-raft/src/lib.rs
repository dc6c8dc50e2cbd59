#![cfg_attr(feature = "docinclude", feature(external_doc))]
#![cfg_attr(feature = "docinclude", doc(include = "../README.md"))]

pub mod config;
pub mod core;
mod driver;
pub mod error;
pub mod log;
pub mod metrics;
pub(crate) mod quorum;
pub mod raft;
pub mod wal;

use std::fmt;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use async_trait;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::Effect;
pub use crate::core::NodeState;
pub use crate::core::Role;
pub use crate::error::ChangeConfigError;
pub use crate::error::ClientWriteError;
pub use crate::error::ConfigError;
pub use crate::error::LogError;
pub use crate::error::RaftError;
pub use crate::error::WalError;
pub use crate::log::LogStore;
pub use crate::metrics::NodeMetrics;
pub use crate::raft::Raft;

/// A Raft node's ID.
pub type NodeId = u64;

/// The term and position of a log entry.
///
/// The pair `(term: 0, index: 0)` denotes the position before the first
/// entry of the log.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

/// A trait defining application specific data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types throughout their application without having to serialize and
/// deserialize their data as it goes through Raft. Instead, applications can present their data
/// models as-is to Raft, Raft will present it to the application's `ApplyFn` when ready, and the
/// application may then deal with the data directly in the state machine without any of the
/// serialization overhead.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// The intention of this trait is that applications which are using this crate will be able to
/// use their own concrete data types for returning response data from the state machine as an
/// application specific response.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining the state of an application's user-supplied state machine.
///
/// The state must be cheaply cloneable: snapshots and release-cursor hints carry a full copy of
/// the state out of the consensus core. Applications with large state should use persistent data
/// structures or wrap the bulk of the state in `Arc`s.
pub trait MachineState: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> MachineState for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining the interface for sending messages to peer nodes.
///
/// Delivery is fire-and-forget: replies to requests travel as independent messages carrying the
/// sender's ID, which the transport feeds back into the target node via [`Raft::deliver`]. This
/// is what allows a follower to acknowledge an AppendEntries only once the corresponding WAL
/// batch has been fsynced.
#[async_trait::async_trait]
pub trait RaftNetwork<D, R, M>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
    M: MachineState,
{
    /// Send a message to the target node.
    ///
    /// Errors are treated as transient: the message is dropped and the protocol's retry
    /// machinery (heartbeats, reply reconciliation) recovers.
    async fn send(&self, target: NodeId, msg: raft::PeerMessage<D, R, M>) -> anyhow::Result<()>;
}

/// A trait for types which can produce a compact, single-line summary for tracing.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
