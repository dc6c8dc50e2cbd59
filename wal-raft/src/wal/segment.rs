//! The contract between the WAL and the external segment writer.
//!
//! The segment writer is a collaborator outside this crate: it turns closed mem-tables into
//! on-disk segment files and eventually deletes the WAL files they came from. The consensus
//! core only speaks to it through the notices the sink emits and through the read capability
//! the log facade consumes.

use std::path::PathBuf;

use super::WriterId;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::MachineState;

/// A notice to the segment writer that a set of mem-tables was closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentNotice {
    /// The WAL file the closed tables were built from. Empty after recovery, which closes the
    /// tables of every replayed file at once.
    pub filename: Option<PathBuf>,
    /// The writers whose tables were closed. The tables themselves are resolved through the
    /// shared [`MemTables`](super::MemTables) registry.
    pub writers: Vec<WriterId>,
}

/// Read access to flushed segment files.
///
/// Consulted by the log facade for entries which have left the mem-tables. An implementation
/// which has flushed nothing may always return `None`.
pub trait SegmentReader<D, R, M>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
    M: MachineState,
{
    fn entry(&self, writer: &WriterId, index: u64) -> Option<Entry<D, R, M>>;
}

/// A `SegmentReader` for deployments which retain everything in mem-tables and snapshots.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSegments;

impl<D, R, M> SegmentReader<D, R, M> for NoSegments
where
    D: AppData,
    R: AppDataResponse,
    M: MachineState,
{
    fn entry(&self, _writer: &WriterId, _index: u64) -> Option<Entry<D, R, M>> {
        None
    }
}
