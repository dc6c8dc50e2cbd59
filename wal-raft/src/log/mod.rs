//! The per-node log facade and its data types.

mod wal_log;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

pub use wal_log::WalLog;

use crate::error::LogError;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::NodeId;

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// Metadata of a snapshot of the application state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Log entries upto which this snapshot includes, inclusive.
    pub last_log_id: LogId,
    /// The cluster membership at the covered log id.
    pub members: BTreeSet<NodeId>,
}

/// An event emitted by the log's durability layer.
///
/// For the WAL-backed facade these are produced by the sink after each fsynced batch; the
/// in-memory facade synthesizes them on append. The driver feeds each event into
/// [`LogStore::handle_event`] and dispatches the returned `Written` ranges through the node's
/// role handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    /// The records in `from..=to` for this writer were made durable by an fsync.
    Written { from: u64, to: u64, term: u64 },
    /// The sink observed an out-of-sequence append and dropped it; the writer must resend
    /// everything from `from` onward.
    ResendWrite { from: u64 },
}

/// A contiguous range of log indexes which became durable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WrittenRange {
    pub from: u64,
    pub to: u64,
    /// The term of the entry at `to`.
    pub term: u64,
}

/// A trait defining the log capability a Raft node consumes.
///
/// The facade hides where entries actually live: recently appended entries sit in an in-memory
/// cache, durable ones in the shared WAL's mem-tables, older ones in segment files written by
/// the external segment writer. Two implementations ship with this project: [`WalLog`] backed by
/// the shared WAL, and the purely in-memory `memlog::MemLog` used for testing.
///
/// Mutating operations take `&mut self`: a log belongs to exactly one node and is only ever
/// driven from that node's task.
#[async_trait]
pub trait LogStore<D, R, M>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
    M: MachineState,
{
    /// Append an entry at its `log_id.index`.
    ///
    /// The entry becomes readable immediately and durable asynchronously: a
    /// `LogEvent::Written` covering the index will arrive on the event channel after the next
    /// fsync. Fails with `LogError::WalDown` if the durability layer is unavailable.
    async fn append(&mut self, entry: Entry<D, R, M>) -> Result<(), LogError>;

    /// Append an entry which replaces the existing suffix of the log.
    ///
    /// All entries at and after `entry.log_id.index` are discarded before the write. Used when
    /// a follower's log diverges from the leader's.
    async fn truncate_append(&mut self, entry: Entry<D, R, M>) -> Result<(), LogError>;

    /// Fetch the entries in `from..=to`, stopping early at the first missing index.
    async fn take(&mut self, from: u64, to: u64) -> Result<Vec<Entry<D, R, M>>, LogError>;

    /// Try to fetch the entry at the given index.
    async fn fetch(&mut self, index: u64) -> Result<Option<Entry<D, R, M>>, LogError>;

    /// Fetch the term of the entry at the given index.
    ///
    /// Index 0 yields term 0; the snapshot boundary yields the snapshot's term even though the
    /// entry itself is gone.
    async fn fetch_term(&mut self, index: u64) -> Result<Option<u64>, LogError>;

    /// The id of the last entry appended to this log, durable or not.
    fn last_index_term(&self) -> LogId;

    /// The durable high-water mark: the id of the last entry covered by a `Written` event.
    fn last_written(&self) -> LogId;

    /// The index the next appended entry will receive.
    fn next_index(&self) -> u64;

    /// Replace the log with a snapshot of the state machine.
    ///
    /// All entries are discarded; the log restarts from `meta.last_log_id`. Used when a leader
    /// installs a snapshot on this node.
    async fn write_snapshot(&mut self, meta: SnapshotMeta, machine: &M) -> Result<(), LogError>;

    /// Read the current snapshot, if one exists.
    async fn read_snapshot(&self) -> Result<Option<(SnapshotMeta, M)>, LogError>;

    /// The log id covered by the current snapshot, or the zero id.
    fn snapshot_index_term(&self) -> LogId;

    /// Check whether the log contains the given `(index, term)` pair, in the log proper or at
    /// the snapshot boundary.
    async fn exists(&mut self, log_id: LogId) -> Result<bool, LogError>;

    /// Record a safe snapshot point: everything at and below `index` has been applied.
    ///
    /// The facade persists a snapshot at the cursor and may discard entries it covers. Actual
    /// segment compaction is the segment writer's business.
    async fn update_release_cursor(
        &mut self,
        index: u64,
        members: &BTreeSet<NodeId>,
        machine: &M,
    ) -> Result<(), LogError>;

    /// Process an event from the durability layer.
    ///
    /// Returns the ranges which became durable. A `ResendWrite` is absorbed internally by
    /// replaying the cached suffix and returns no ranges.
    fn handle_event(&mut self, event: LogEvent) -> Vec<WrittenRange>;

    /// Stage the node's hard state for persistence.
    async fn write_meta(&mut self, hs: &HardState) -> Result<(), LogError>;

    /// Read the persisted hard state.
    async fn read_meta(&self) -> Result<Option<HardState>, LogError>;

    /// Fsync any staged hard state.
    ///
    /// The term rule requires `current_term`/`voted_for` to be durable before the node acts on
    /// them, so this is a true synchronous barrier.
    async fn sync_meta(&mut self) -> Result<(), LogError>;

    /// Whether the durability layer is currently accepting writes.
    fn is_open(&self) -> bool;

    /// Close the log.
    async fn close(&mut self) -> Result<(), LogError>;
}
