//! Process-wide in-memory tables of recently written log entries.
//!
//! The WAL sink is the only writer: it inserts every accepted record into the *open* table of
//! the record's writer, and promotes all open tables to *closed* at file rollover. Readers (the
//! per-node log facades and the segment writer) resolve entries through [`MemTables::entry`],
//! preferring open tables over closed ones and newer closed tables over older ones.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use super::WriterId;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::MachineState;

/// The entries of a single writer within one WAL file.
#[derive(Clone, Debug, Default)]
pub struct MemTable<D: AppData, R: AppDataResponse, M: MachineState> {
    entries: BTreeMap<u64, Entry<D, R, M>>,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MemTable<D, R, M> {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Insert an entry, discarding any entries at and after its index.
    ///
    /// Raft log semantics: a write at index `i` invalidates everything the writer previously
    /// stored at `i` and beyond, whether or not the record was flagged as truncating.
    pub fn insert(&mut self, entry: Entry<D, R, M>) {
        self.entries.split_off(&entry.log_id.index);
        self.entries.insert(entry.log_id.index, entry);
    }

    pub fn get(&self, index: u64) -> Option<&Entry<D, R, M>> {
        self.entries.get(&index)
    }

    pub fn first_index(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Entry<D, R, M>)> {
        self.entries.iter()
    }
}

/// An open table which was promoted at rollover, tagged for ordering among the closed tables
/// of the same writer.
#[derive(Clone, Debug)]
pub struct ClosedTable<D: AppData, R: AppDataResponse, M: MachineState> {
    pub seq: u64,
    pub table: Arc<MemTable<D, R, M>>,
}

/// The process-wide open and closed mem-table registries.
///
/// Shared between the WAL sink, every co-located node's log facade, and the segment writer.
/// Rollover swaps all open tables into the closed index under both write locks, so a reader
/// never observes a mix of stale and fresh rows for one writer.
pub struct MemTables<D: AppData, R: AppDataResponse, M: MachineState> {
    open: RwLock<HashMap<WriterId, MemTable<D, R, M>>>,
    closed: RwLock<HashMap<WriterId, Vec<ClosedTable<D, R, M>>>>,
    next_seq: AtomicU64,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> Default for MemTables<D, R, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MemTables<D, R, M> {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Insert an accepted record into the writer's open table.
    pub(crate) fn insert_open(&self, writer: &WriterId, entry: Entry<D, R, M>) {
        let mut open = self.open.write();
        open.entry(writer.clone()).or_insert_with(MemTable::new).insert(entry);
    }

    /// Resolve the entry at `index` for the given writer.
    pub fn entry(&self, writer: &WriterId, index: u64) -> Option<Entry<D, R, M>> {
        {
            let open = self.open.read();
            if let Some(entry) = open.get(writer).and_then(|t| t.get(index)) {
                return Some(entry.clone());
            }
        }
        let closed = self.closed.read();
        let tables = closed.get(writer)?;
        tables.iter().rev().find_map(|c| c.table.get(index).cloned())
    }

    /// Reconstruct the full entry map of a writer from its closed and open tables.
    ///
    /// Tables are replayed oldest first; a table whose first index rewinds below the
    /// accumulated tail truncates it, the same way its first record did when written.
    pub fn writer_entries(&self, writer: &WriterId) -> BTreeMap<u64, Entry<D, R, M>> {
        let mut out: BTreeMap<u64, Entry<D, R, M>> = BTreeMap::new();
        let mut replay = |table: &MemTable<D, R, M>| {
            if let Some(first) = table.first_index() {
                out.split_off(&first);
                for (idx, entry) in table.iter() {
                    out.insert(*idx, entry.clone());
                }
            }
        };
        {
            let closed = self.closed.read();
            if let Some(tables) = closed.get(writer) {
                let mut tables: Vec<_> = tables.iter().collect();
                tables.sort_by_key(|c| c.seq);
                for c in tables {
                    replay(&c.table);
                }
            }
        }
        let open = self.open.read();
        if let Some(table) = open.get(writer) {
            replay(table);
        }
        out
    }

    /// Promote every open table to closed, returning the affected writers. Called by the sink
    /// at rollover.
    pub(crate) fn roll_over_open(&self) -> Vec<WriterId> {
        let mut open = self.open.write();
        let mut closed = self.closed.write();
        let mut writers = Vec::with_capacity(open.len());
        for (writer, table) in open.drain() {
            if table.is_empty() {
                continue;
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            closed.entry(writer.clone()).or_insert_with(Vec::new).push(ClosedTable {
                seq,
                table: Arc::new(table),
            });
            writers.push(writer);
        }
        writers
    }

    /// Atomically replace the registries with the tables recovered from disk. Called once by
    /// the sink before it opens a fresh WAL file.
    pub(crate) fn install_recovered(&self, recovered: HashMap<WriterId, MemTable<D, R, M>>) -> Vec<WriterId> {
        let mut open = self.open.write();
        let mut closed = self.closed.write();
        open.clear();
        closed.clear();
        let mut writers = Vec::with_capacity(recovered.len());
        for (writer, table) in recovered {
            if table.is_empty() {
                continue;
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            closed.entry(writer.clone()).or_insert_with(Vec::new).push(ClosedTable {
                seq,
                table: Arc::new(table),
            });
            writers.push(writer);
        }
        writers
    }

    /// Drop closed tables of the writer which are fully covered by `index`.
    ///
    /// Invoked from the release-cursor path: entries at and below the cursor are covered by a
    /// snapshot and need not be resolvable from the tables any longer.
    pub fn release(&self, writer: &WriterId, index: u64) {
        let mut closed = self.closed.write();
        if let Some(tables) = closed.get_mut(writer) {
            tables.retain(|c| c.table.last_index().map(|last| last > index).unwrap_or(false));
            if tables.is_empty() {
                closed.remove(writer);
            }
        }
    }

    /// The number of closed tables currently held for the writer.
    pub fn closed_count(&self, writer: &WriterId) -> usize {
        self.closed.read().get(writer).map(|t| t.len()).unwrap_or(0)
    }

    /// Whether the writer currently has a non-empty open table.
    pub fn has_open(&self, writer: &WriterId) -> bool {
        self.open.read().get(writer).map(|t| !t.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Command;
    use crate::LogId;

    type TestTables = MemTables<String, String, String>;

    fn entry(index: u64, term: u64) -> Entry<String, String, String> {
        Entry {
            log_id: LogId::new(term, index),
            command: Command::User {
                from: None,
                data: format!("cmd-{}", index),
                mode: crate::raft::ReplyMode::AwaitConsensus,
            },
        }
    }

    #[test]
    fn insert_truncates_the_tail() {
        let mut table: MemTable<String, String, String> = MemTable::new();
        for i in 1..=5 {
            table.insert(entry(i, 1));
        }
        table.insert(entry(3, 2));
        assert_eq!(table.last_index(), Some(3));
        assert_eq!(table.get(3).unwrap().log_id.term, 2);
        assert!(table.get(4).is_none());
    }

    #[test]
    fn lookup_prefers_open_over_closed() {
        let tables = TestTables::new();
        let w = WriterId::from("w1");
        tables.insert_open(&w, entry(1, 1));
        tables.roll_over_open();
        assert_eq!(tables.closed_count(&w), 1);

        tables.insert_open(&w, entry(1, 2));
        let got = tables.entry(&w, 1).unwrap();
        assert_eq!(got.log_id.term, 2);
    }

    #[test]
    fn closed_tables_resolve_after_rollover() {
        let tables = TestTables::new();
        let w = WriterId::from("w1");
        for i in 1..=3 {
            tables.insert_open(&w, entry(i, 1));
        }
        tables.roll_over_open();
        assert!(!tables.has_open(&w));
        for i in 1..=3 {
            assert!(tables.entry(&w, i).is_some(), "index {} must stay resolvable", i);
        }
    }

    #[test]
    fn writer_entries_respects_rewinds_across_tables() {
        let tables = TestTables::new();
        let w = WriterId::from("w1");
        for i in 1..=4 {
            tables.insert_open(&w, entry(i, 1));
        }
        tables.roll_over_open();
        // The writer truncated back to index 3 in the next file.
        tables.insert_open(&w, entry(3, 2));
        tables.insert_open(&w, entry(4, 2));

        let merged = tables.writer_entries(&w);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[&2].log_id.term, 1);
        assert_eq!(merged[&3].log_id.term, 2);
        assert_eq!(merged[&4].log_id.term, 2);
    }

    #[test]
    fn release_drops_covered_tables() {
        let tables = TestTables::new();
        let w = WriterId::from("w1");
        tables.insert_open(&w, entry(1, 1));
        tables.insert_open(&w, entry(2, 1));
        tables.roll_over_open();
        tables.insert_open(&w, entry(3, 1));
        tables.roll_over_open();
        assert_eq!(tables.closed_count(&w), 2);

        tables.release(&w, 2);
        assert_eq!(tables.closed_count(&w), 1);
        assert!(tables.entry(&w, 3).is_some());
    }
}
