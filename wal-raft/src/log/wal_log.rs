//! The WAL-backed implementation of the log facade.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::HardState;
use super::LogEvent;
use super::LogStore;
use super::SnapshotMeta;
use super::WrittenRange;
use crate::error::LogError;
use crate::raft::Entry;
use crate::wal::MemTables;
use crate::wal::SegmentReader;
use crate::wal::Wal;
use crate::wal::WalWriter;
use crate::wal::WriterId;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::NodeId;

const META_FILE: &str = "meta.json";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// A per-node log facade backed by the shared WAL, the process-wide mem-tables, and the
/// segment files maintained by the external segment writer.
///
/// The facade additionally keeps its own cache of every entry from the snapshot boundary
/// forward. The cache gives the node read-your-writes visibility ahead of the sink, and is the
/// source for replaying the suffix when the sink requests a resend.
pub struct WalLog<D: AppData, R: AppDataResponse, M: MachineState> {
    writer: WalWriter<D, R, M>,
    writer_id: WriterId,
    tables: Arc<MemTables<D, R, M>>,
    segments: Arc<dyn SegmentReader<D, R, M>>,
    dir: PathBuf,

    cache: BTreeMap<u64, Entry<D, R, M>>,
    last_appended: LogId,
    last_written: LogId,
    snapshot: Option<SnapshotMeta>,
    release_cursor: u64,
    hard_state: Option<HardState>,
    meta_dirty: bool,
    /// Set when a snapshot rewound the log; the next append must be a truncating write so the
    /// sink's sequence tracking resets along with us.
    force_truncate: bool,
    open: bool,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> WalLog<D, R, M> {
    /// Open the log facade for one node.
    ///
    /// `dir` holds this node's metadata and snapshot files; entries recovered by the WAL from
    /// previous runs are preloaded into the cache. Returns the facade along with the event
    /// channel carrying the sink's notices for this writer.
    #[tracing::instrument(level = "debug", skip(wal, segments), fields(writer=%writer_id))]
    pub async fn open(
        wal: &Wal<D, R, M>,
        writer_id: WriterId,
        dir: impl Into<PathBuf> + std::fmt::Debug,
        segments: Arc<dyn SegmentReader<D, R, M>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LogEvent>), LogError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let hard_state = read_json::<HardState>(&dir.join(META_FILE)).await?;
        let snapshot = read_snapshot_file::<M>(&dir.join(SNAPSHOT_FILE)).await?.map(|(meta, _)| meta);
        let snapshot_id = snapshot.as_ref().map(|s| s.last_log_id).unwrap_or_default();

        let (writer, events) = wal.writer(writer_id.clone());
        let tables = wal.tables().clone();

        let mut cache = tables.writer_entries(&writer_id);
        cache = cache.split_off(&(snapshot_id.index + 1));
        let last_appended = cache
            .values()
            .next_back()
            .map(|e| e.log_id)
            .unwrap_or(snapshot_id)
            .max(snapshot_id);

        tracing::debug!(
            cached = cache.len(),
            last = %last_appended,
            "opened wal-backed log"
        );

        Ok((
            Self {
                writer,
                writer_id,
                tables,
                segments,
                dir,
                cache,
                last_appended,
                // Everything recovered from the WAL was durable by definition.
                last_written: last_appended,
                snapshot,
                release_cursor: snapshot_id.index,
                hard_state,
                meta_dirty: false,
                force_truncate: false,
                open: true,
            },
            events,
        ))
    }

    fn snapshot_id(&self) -> LogId {
        self.snapshot.as_ref().map(|s| s.last_log_id).unwrap_or_default()
    }

    /// The index at or below which the log may be compacted.
    pub fn release_cursor(&self) -> u64 {
        self.release_cursor
    }

    fn resolve(&self, index: u64) -> Option<Entry<D, R, M>> {
        if let Some(entry) = self.cache.get(&index) {
            return Some(entry.clone());
        }
        if let Some(entry) = self.tables.entry(&self.writer_id, index) {
            return Some(entry);
        }
        self.segments.entry(&self.writer_id, index)
    }

    async fn persist_snapshot(&self, meta: &SnapshotMeta, machine: &M) -> Result<(), LogError> {
        let bytes = bincode::serde::encode_to_vec(&(meta.clone(), machine.clone()), bincode::config::standard())
            .map_err(|err| LogError::Codec(err.to_string()))?;
        write_file_sync(&self.dir.join(SNAPSHOT_FILE), &bytes).await
    }
}

#[async_trait]
impl<D: AppData, R: AppDataResponse, M: MachineState> LogStore<D, R, M> for WalLog<D, R, M> {
    async fn append(&mut self, entry: Entry<D, R, M>) -> Result<(), LogError> {
        if !self.open {
            return Err(LogError::WalDown);
        }
        let log_id = entry.log_id;
        let truncating = self.force_truncate || log_id.index <= self.last_appended.index;
        let res = if truncating {
            self.writer.truncate_write(entry.clone())
        } else {
            self.writer.append(entry.clone())
        };
        res.map_err(|_| LogError::WalDown)?;
        self.force_truncate = false;

        self.cache.split_off(&log_id.index);
        self.cache.insert(log_id.index, entry);
        self.last_appended = log_id;
        if self.last_written.index >= log_id.index {
            // The durable suffix was just overwritten; acknowledgements for it are stale.
            self.last_written = LogId::new(
                self.cache
                    .get(&(log_id.index.saturating_sub(1)))
                    .map(|e| e.log_id.term)
                    .unwrap_or(self.snapshot_id().term),
                log_id.index.saturating_sub(1).max(self.snapshot_id().index),
            );
        }
        Ok(())
    }

    async fn truncate_append(&mut self, entry: Entry<D, R, M>) -> Result<(), LogError> {
        self.force_truncate = true;
        self.append(entry).await
    }

    async fn take(&mut self, from: u64, to: u64) -> Result<Vec<Entry<D, R, M>>, LogError> {
        let mut out = Vec::new();
        for index in from..=to.min(self.last_appended.index) {
            match self.resolve(index) {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        Ok(out)
    }

    async fn fetch(&mut self, index: u64) -> Result<Option<Entry<D, R, M>>, LogError> {
        Ok(self.resolve(index))
    }

    async fn fetch_term(&mut self, index: u64) -> Result<Option<u64>, LogError> {
        if index == 0 {
            return Ok(Some(0));
        }
        let snap = self.snapshot_id();
        if index == snap.index {
            return Ok(Some(snap.term));
        }
        Ok(self.resolve(index).map(|e| e.log_id.term))
    }

    fn last_index_term(&self) -> LogId {
        self.last_appended
    }

    fn last_written(&self) -> LogId {
        self.last_written
    }

    fn next_index(&self) -> u64 {
        self.last_appended.index + 1
    }

    async fn write_snapshot(&mut self, meta: SnapshotMeta, machine: &M) -> Result<(), LogError> {
        self.persist_snapshot(&meta, machine).await?;
        self.cache.clear();
        self.last_appended = meta.last_log_id;
        self.last_written = meta.last_log_id;
        self.release_cursor = meta.last_log_id.index;
        self.snapshot = Some(meta);
        self.force_truncate = true;
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<(SnapshotMeta, M)>, LogError> {
        read_snapshot_file::<M>(&self.dir.join(SNAPSHOT_FILE)).await
    }

    fn snapshot_index_term(&self) -> LogId {
        self.snapshot_id()
    }

    async fn exists(&mut self, log_id: LogId) -> Result<bool, LogError> {
        Ok(self.fetch_term(log_id.index).await? == Some(log_id.term))
    }

    async fn update_release_cursor(
        &mut self,
        index: u64,
        members: &BTreeSet<NodeId>,
        machine: &M,
    ) -> Result<(), LogError> {
        if index <= self.snapshot_id().index {
            return Ok(());
        }
        let term = match self.fetch_term(index).await? {
            Some(term) => term,
            None => return Ok(()),
        };
        let meta = SnapshotMeta {
            last_log_id: LogId::new(term, index),
            members: members.clone(),
        };
        self.persist_snapshot(&meta, machine).await?;
        self.snapshot = Some(meta);
        self.release_cursor = index;
        self.cache = self.cache.split_off(&(index + 1));
        self.tables.release(&self.writer_id, index);
        tracing::debug!(index, "advanced release cursor");
        Ok(())
    }

    fn handle_event(&mut self, event: LogEvent) -> Vec<WrittenRange> {
        match event {
            LogEvent::Written { from, to, term } => {
                match self.cache.get(&to) {
                    Some(entry) if entry.log_id.term == term => {
                        if to > self.last_written.index {
                            self.last_written = LogId::new(term, to);
                        }
                        vec![WrittenRange { from, to, term }]
                    }
                    _ => {
                        // An acknowledgement for records we have since overwritten or
                        // compacted away.
                        tracing::trace!(from, to, term, "ignoring stale written ack");
                        vec![]
                    }
                }
            }
            LogEvent::ResendWrite { from } => {
                let mut first = true;
                for entry in self.cache.range(from..).map(|(_, e)| e.clone()).collect::<Vec<_>>() {
                    let res = if first {
                        self.writer.truncate_write(entry)
                    } else {
                        self.writer.append(entry)
                    };
                    first = false;
                    if res.is_err() {
                        tracing::error!("wal went down while resending suffix");
                        break;
                    }
                }
                vec![]
            }
        }
    }

    async fn write_meta(&mut self, hs: &HardState) -> Result<(), LogError> {
        self.hard_state = Some(hs.clone());
        self.meta_dirty = true;
        Ok(())
    }

    async fn read_meta(&self) -> Result<Option<HardState>, LogError> {
        if self.hard_state.is_some() {
            return Ok(self.hard_state.clone());
        }
        read_json::<HardState>(&self.dir.join(META_FILE)).await
    }

    async fn sync_meta(&mut self) -> Result<(), LogError> {
        if !self.meta_dirty {
            return Ok(());
        }
        let hs = self.hard_state.clone().unwrap_or_default();
        let bytes = serde_json::to_vec_pretty(&hs).map_err(|err| LogError::Codec(err.to_string()))?;
        write_file_sync(&self.dir.join(META_FILE), &bytes).await?;
        self.meta_dirty = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && self.writer.is_open()
    }

    async fn close(&mut self) -> Result<(), LogError> {
        self.sync_meta().await?;
        self.open = false;
        Ok(())
    }
}

/// Write a file durably: temp file, fsync, rename over the target.
async fn write_file_sync(path: &Path, bytes: &[u8]) -> Result<(), LogError> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, LogError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|err| LogError::Codec(err.to_string()))?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn read_snapshot_file<M: MachineState>(path: &Path) -> Result<Option<(SnapshotMeta, M)>, LogError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let ((meta, machine), _) =
                bincode::serde::decode_from_slice::<(SnapshotMeta, M), _>(&bytes, bincode::config::standard())
                    .map_err(|err| LogError::Codec(err.to_string()))?;
            Ok(Some((meta, machine)))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Command;
    use crate::raft::ReplyMode;
    use crate::wal::NoSegments;
    use crate::wal::WalConfig;

    type TestLog = WalLog<String, String, String>;
    type TestWal = Wal<String, String, String>;

    fn entry(index: u64, term: u64) -> Entry<String, String, String> {
        Entry {
            log_id: LogId::new(term, index),
            command: Command::User {
                from: None,
                data: format!("cmd-{}", index),
                mode: ReplyMode::AwaitConsensus,
            },
        }
    }

    async fn open_all(dir: &Path) -> (TestWal, TestLog, mpsc::UnboundedReceiver<LogEvent>) {
        let (seg_tx, _seg_rx) = mpsc::unbounded_channel();
        let tables = Arc::new(MemTables::new());
        let wal = TestWal::open(WalConfig::new(dir.join("wal")), tables, seg_tx).await.unwrap();
        let (log, events) =
            TestLog::open(&wal, WriterId::from("node-1"), dir.join("node-1"), Arc::new(NoSegments)).await.unwrap();
        (wal, log, events)
    }

    #[tokio::test]
    async fn append_is_readable_before_and_after_durability() {
        let dir = tempfile::tempdir().unwrap();
        let (_wal, mut log, mut events) = open_all(dir.path()).await;

        log.append(entry(1, 1)).await.unwrap();
        log.append(entry(2, 1)).await.unwrap();
        assert_eq!(log.last_index_term(), LogId::new(1, 2));
        assert_eq!(log.last_written(), LogId::default());
        assert_eq!(log.next_index(), 3);

        // Read-your-writes through the cache.
        let got = log.take(1, 2).await.unwrap();
        assert_eq!(got.len(), 2);

        let ev = events.recv().await.unwrap();
        let ranges = log.handle_event(ev);
        assert_eq!(ranges, vec![WrittenRange { from: 1, to: 2, term: 1 }]);
        assert_eq!(log.last_written(), LogId::new(1, 2));
    }

    #[tokio::test]
    async fn stale_written_acks_are_ignored_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let (_wal, mut log, mut events) = open_all(dir.path()).await;

        log.append(entry(1, 1)).await.unwrap();
        log.append(entry(2, 1)).await.unwrap();
        // Overwrite index 2 before the first ack is processed.
        log.truncate_append(entry(2, 3)).await.unwrap();

        let mut ranges = Vec::new();
        while ranges.is_empty() {
            let ev = events.recv().await.unwrap();
            ranges = log.handle_event(ev);
        }
        assert_eq!(ranges, vec![WrittenRange { from: 1, to: 2, term: 3 }]);
        assert_eq!(log.last_written(), LogId::new(3, 2));
        assert_eq!(log.fetch_term(2).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn meta_round_trips_through_fsync() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_wal, mut log, _events) = open_all(dir.path()).await;
            log.write_meta(&HardState {
                current_term: 4,
                voted_for: Some(2),
            })
            .await
            .unwrap();
            log.sync_meta().await.unwrap();
        }
        let (_wal, log, _events) = open_all(dir.path()).await;
        let hs = log.read_meta().await.unwrap().unwrap();
        assert_eq!(hs.current_term, 4);
        assert_eq!(hs.voted_for, Some(2));
    }

    #[tokio::test]
    async fn release_cursor_persists_a_snapshot_and_prunes_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (_wal, mut log, mut events) = open_all(dir.path()).await;

        for i in 1..=4 {
            log.append(entry(i, 1)).await.unwrap();
        }
        let ev = events.recv().await.unwrap();
        log.handle_event(ev);

        let members: BTreeSet<NodeId> = vec![1, 2, 3].into_iter().collect();
        log.update_release_cursor(3, &members, &"machine-state".to_string()).await.unwrap();
        assert_eq!(log.snapshot_index_term(), LogId::new(1, 3));

        let (meta, machine) = log.read_snapshot().await.unwrap().unwrap();
        assert_eq!(meta.last_log_id, LogId::new(1, 3));
        assert_eq!(meta.members, members);
        assert_eq!(machine, "machine-state");

        // The boundary still resolves a term; entries above the cursor are intact.
        assert_eq!(log.fetch_term(3).await.unwrap(), Some(1));
        assert_eq!(log.fetch(4).await.unwrap().unwrap().log_id, LogId::new(1, 4));
    }

    #[tokio::test]
    async fn installed_snapshot_resets_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let (_wal, mut log, mut events) = open_all(dir.path()).await;

        for i in 1..=3 {
            log.append(entry(i, 1)).await.unwrap();
        }
        let ev = events.recv().await.unwrap();
        log.handle_event(ev);

        let members: BTreeSet<NodeId> = vec![1, 2].into_iter().collect();
        log.write_snapshot(
            SnapshotMeta {
                last_log_id: LogId::new(2, 10),
                members,
            },
            &"snap".to_string(),
        )
        .await
        .unwrap();

        assert_eq!(log.last_index_term(), LogId::new(2, 10));
        assert_eq!(log.last_written(), LogId::new(2, 10));
        assert_eq!(log.next_index(), 11);
        assert_eq!(log.fetch_term(10).await.unwrap(), Some(2));

        // Appending after the rewind re-sequences the WAL via a truncating write and the new
        // entry becomes durable.
        log.append(entry(11, 2)).await.unwrap();
        let mut ranges = Vec::new();
        while ranges.is_empty() {
            let ev = events.recv().await.unwrap();
            ranges = log.handle_event(ev);
        }
        assert_eq!(ranges, vec![WrittenRange { from: 11, to: 11, term: 2 }]);
    }

    #[tokio::test]
    async fn resend_request_replays_the_cached_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let (_wal, mut log, mut events) = open_all(dir.path()).await;

        for i in 1..=3 {
            log.append(entry(i, 1)).await.unwrap();
        }
        let ev = events.recv().await.unwrap();
        log.handle_event(ev);
        assert_eq!(log.last_written(), LogId::new(1, 3));

        // The sink asks for everything from index 2 again; the cache replays it, truncating
        // first so the sink's sequence tracking resets.
        let ranges = log.handle_event(LogEvent::ResendWrite { from: 2 });
        assert!(ranges.is_empty());
        let ev = events.recv().await.unwrap();
        let ranges = log.handle_event(ev);
        assert_eq!(ranges, vec![WrittenRange { from: 2, to: 3, term: 1 }]);
    }

    #[tokio::test]
    async fn reopen_preloads_recovered_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (wal, mut log, mut events) = open_all(dir.path()).await;
            for i in 1..=5 {
                log.append(entry(i, 2)).await.unwrap();
            }
            let ev = events.recv().await.unwrap();
            log.handle_event(ev);
            wal.close().await.unwrap();
        }

        let (_wal, mut log, _events) = open_all(dir.path()).await;
        assert_eq!(log.last_index_term(), LogId::new(2, 5));
        assert_eq!(log.last_written(), LogId::new(2, 5));
        let got = log.take(1, 5).await.unwrap();
        assert_eq!(got.len(), 5);
    }
}
