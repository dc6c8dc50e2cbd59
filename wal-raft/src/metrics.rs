//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The use cases are endless. The
//! node's metrics are observed through a `watch` channel on the [`Raft`](crate::Raft) handle;
//! the `IncrMetrics` effect emitted by the core additionally updates a set of process-wide
//! counter tables which co-located nodes share.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::Role;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The role of the Raft node.
    pub role: Role,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to have been appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to have been applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The highest index known committed.
    pub commit_index: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
    /// The current members of the cluster.
    pub members: BTreeSet<NodeId>,
}

impl NodeMetrics {
    /// Create the initial metrics payload for a node which has not yet read its state.
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit_index: 0,
            current_leader: None,
            members,
        }
    }
}

/// The error returned when the `Wait` timeout is reached before the condition is satisfied.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A wait handle for observing the metrics of a Raft node until some condition is satisfied.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<NodeMetrics>,
}

impl Wait {
    /// Wait for the metrics to satisfy the given predicate, or until the timeout.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<NodeMetrics, WaitError>
    where T: Fn(&NodeMetrics) -> bool {
        let mut rx = self.rx.clone();
        let msg = msg.to_string();
        let msg_for_timeout = msg.clone();
        timeout(self.timeout, async move {
            loop {
                let latest = rx.borrow().clone();
                if func(&latest) {
                    tracing::debug!("wait condition satisfied: {}", msg);
                    return Ok(latest);
                }
                rx.changed().await.map_err(|_| WaitError::ShuttingDown)?;
            }
        })
        .await
        .map_err(|_| WaitError::Timeout(self.timeout, msg_for_timeout))?
    }

    /// Wait for `last_applied` to reach at least `want`.
    pub async fn applied(&self, want: u64, msg: impl ToString) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, msg).await
    }

    /// Wait for `last_log_index` to reach at least `want`.
    pub async fn log(&self, want: u64, msg: impl ToString) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.last_log_index >= want, msg).await
    }

    /// Wait for the node to assume the given role.
    pub async fn role(&self, want: Role, msg: impl ToString) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.role == want, msg).await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, want: NodeId, msg: impl ToString) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.current_leader == Some(want), msg).await
    }

    /// Wait for the node's cluster membership to become the given set.
    pub async fn members(&self, want: BTreeSet<NodeId>, msg: impl ToString) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.members == want, msg).await
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The counter table updated by the apply loop, position `MACHINE_APPLIED`.
pub const MACHINE_TABLE: &str = "machine";
/// The number of commands applied to the user state machine.
pub const MACHINE_APPLIED: usize = 0;

lazy_static! {
    static ref COUNTERS: RwLock<HashMap<String, Vec<AtomicU64>>> = RwLock::new(HashMap::new());
}

/// Apply a set of `(position, delta)` increments to the named process-wide counter table.
pub fn incr(table: &str, deltas: &[(usize, u64)]) {
    {
        let counters = COUNTERS.read();
        if let Some(row) = counters.get(table) {
            if deltas.iter().all(|(pos, _)| *pos < row.len()) {
                for (pos, delta) in deltas {
                    row[*pos].fetch_add(*delta, Ordering::Relaxed);
                }
                return;
            }
        }
    }
    let mut counters = COUNTERS.write();
    let row = counters.entry(table.to_string()).or_insert_with(Vec::new);
    let needed = deltas.iter().map(|(pos, _)| pos + 1).max().unwrap_or(0);
    while row.len() < needed {
        row.push(AtomicU64::new(0));
    }
    for (pos, delta) in deltas {
        row[*pos].fetch_add(*delta, Ordering::Relaxed);
    }
}

/// Read a single counter from the named table, or 0 if it has never been written.
pub fn counter(table: &str, pos: usize) -> u64 {
    let counters = COUNTERS.read();
    counters.get(table).and_then(|row| row.get(pos)).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The number of batch samples retained by the WAL metrics ring.
pub const WAL_RING_SIZE: usize = 64;

/// A fixed-size ring of recent WAL batch sizes, advanced once per completed batch.
#[derive(Clone, Debug)]
pub struct WalMetrics {
    ring: [u64; WAL_RING_SIZE],
    at: usize,
    /// Total number of completed batches (equivalently, fsyncs) since startup.
    pub batches: u64,
    /// The sink's current adaptive batch-size cap.
    pub max_batch_size: usize,
}

impl WalMetrics {
    pub(crate) fn new(max_batch_size: usize) -> Self {
        Self {
            ring: [0; WAL_RING_SIZE],
            at: 0,
            batches: 0,
            max_batch_size,
        }
    }

    /// Record a completed batch of the given size.
    pub(crate) fn record_batch(&mut self, size: u64, max_batch_size: usize) {
        self.ring[self.at] = size;
        self.at = (self.at + 1) % WAL_RING_SIZE;
        self.batches += 1;
        self.max_batch_size = max_batch_size;
    }

    /// The most recent batch sizes, newest last.
    pub fn recent_batches(&self) -> Vec<u64> {
        let n = (self.batches as usize).min(WAL_RING_SIZE);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let idx = (self.at + WAL_RING_SIZE - n + i) % WAL_RING_SIZE;
            out.push(self.ring[idx]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_grow_on_demand() {
        incr("test-table", &[(2, 5)]);
        incr("test-table", &[(0, 1), (2, 5)]);
        assert_eq!(counter("test-table", 0), 1);
        assert_eq!(counter("test-table", 1), 0);
        assert_eq!(counter("test-table", 2), 10);
        assert_eq!(counter("missing", 0), 0);
    }

    #[test]
    fn wal_ring_wraps() {
        let mut m = WalMetrics::new(16);
        for i in 0..(WAL_RING_SIZE as u64 + 3) {
            m.record_batch(i, 16);
        }
        let recent = m.recent_batches();
        assert_eq!(recent.len(), WAL_RING_SIZE);
        assert_eq!(*recent.last().unwrap(), WAL_RING_SIZE as u64 + 2);
        assert_eq!(m.batches, WAL_RING_SIZE as u64 + 3);
    }
}
