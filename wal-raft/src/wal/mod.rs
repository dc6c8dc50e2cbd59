//! The shared write-ahead log.
//!
//! One sink task per process serializes the appends of every co-located Raft node into a single
//! on-disk file, fsync-batched for throughput. Accepted records are simultaneously inserted
//! into the writer's open mem-table so that readers can resolve recent entries before the
//! segment writer has flushed anything.
//!
//! The sink loops in two phases: *wait*, blocking for one request, and *batched*, draining
//! further requests without blocking. A batch completes when the mailbox drains or the batch
//! reaches `max_batch_size` records, whichever comes first: one fsync, then one `Written`
//! notification per contributing writer. `max_batch_size` adapts — it doubles when a batch
//! fills to the cap and halves when the mailbox drains early — trading latency for throughput
//! under load.

pub mod mem_table;
pub mod record;
pub mod segment;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing_futures::Instrument;

pub use mem_table::MemTable;
pub use mem_table::MemTables;
pub use segment::NoSegments;
pub use segment::SegmentNotice;
pub use segment::SegmentReader;

use crate::error::WalError;
use crate::log::LogEvent;
use crate::metrics::WalMetrics;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::MachineState;

/// The floor of the adaptive batch size.
pub const MIN_MAX_BATCH: usize = 16;
/// The cap of the adaptive batch size.
pub const MAX_MAX_BATCH: usize = 2048;

const WAL_EXT: &str = "wal";

/// The identity of a producer of WAL records, typically one per co-located node.
///
/// Serialized into the writer-introduction record of each file the writer touches; within a
/// file, records refer to the writer through a cached 14-bit reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriterId(Arc<str>);

impl WriterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok().map(|s| Self(Arc::from(s)))
    }
}

impl From<&str> for WriterId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for WriterId {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime configuration of the WAL sink.
#[derive(Clone, Debug)]
pub struct WalConfig {
    /// The directory holding the WAL files.
    pub dir: PathBuf,
    /// The file size beyond which the sink rolls over to a new file.
    pub max_wal_size_bytes: u64,
    /// Whether to compute per-record checksums. Recovery validates whatever was written.
    pub compute_checksums: bool,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_wal_size_bytes: 128 * 1024 * 1024,
            compute_checksums: true,
        }
    }
}

enum WalRequest<D: AppData, R: AppDataResponse, M: MachineState> {
    Register {
        writer: WriterId,
        tx: mpsc::UnboundedSender<LogEvent>,
    },
    Append {
        writer: WriterId,
        entry: Entry<D, R, M>,
        truncate: bool,
    },
    ForceRollOver,
    Close {
        tx: oneshot::Sender<()>,
    },
}

/// A handle to the process-wide WAL sink.
pub struct Wal<D: AppData, R: AppDataResponse, M: MachineState> {
    tx: mpsc::UnboundedSender<WalRequest<D, R, M>>,
    tables: Arc<MemTables<D, R, M>>,
    metrics: Arc<Mutex<WalMetrics>>,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> Clone for Wal<D, R, M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            tables: self.tables.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState> Wal<D, R, M> {
    /// Recover any existing WAL files in `config.dir` and spawn the sink task.
    ///
    /// Replayed tables are installed into the closed mem-table index, the segment writer is
    /// notified of them, and a fresh WAL file is opened for new writes. A checksum mismatch in
    /// any file aborts the open: recovery tolerates a duplicated segment, never a corrupted
    /// one.
    #[tracing::instrument(level = "debug", skip(config, tables, segment_tx), fields(dir=%config.dir.display()))]
    pub async fn open(
        config: WalConfig,
        tables: Arc<MemTables<D, R, M>>,
        segment_tx: mpsc::UnboundedSender<SegmentNotice>,
    ) -> Result<Self, WalError> {
        tokio::fs::create_dir_all(&config.dir).await?;
        let files = list_wal_files(&config.dir).await?;
        let next_seq = files.last().and_then(|p| parse_file_seq(p)).map(|s| s + 1).unwrap_or(0);

        let recovered = recover_files(&files).await?;
        let writers = tables.install_recovered(recovered);
        if !writers.is_empty() {
            tracing::info!(files = files.len(), writers = writers.len(), "recovered wal tables");
            let _ = segment_tx.send(SegmentNotice { filename: None, writers });
        }

        let file_path = wal_file_path(&config.dir, next_seq);
        let file = open_wal_file(&file_path).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(Mutex::new(WalMetrics::new(MIN_MAX_BATCH)));
        let sink = WalSink {
            config,
            rx,
            tables: tables.clone(),
            segment_tx,
            metrics: metrics.clone(),
            file: BufWriter::new(file),
            file_path,
            file_seq: next_seq,
            file_size: 0,
            writer_refs: HashMap::new(),
            next_ref: 0,
            writers: HashMap::new(),
            max_batch_size: MIN_MAX_BATCH,
            batch: HashMap::new(),
            batch_records: 0,
        };
        tokio::spawn(
            async move {
                if let Err(err) = sink.run().await {
                    tracing::error!(error=%err, "wal sink failed, going down");
                }
            }
            .instrument(tracing::debug_span!("wal-sink")),
        );

        Ok(Self { tx, tables, metrics })
    }

    /// Register a writer, returning its append handle and the channel its `Written` and
    /// `ResendWrite` notices arrive on.
    pub fn writer(&self, id: WriterId) -> (WalWriter<D, R, M>, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(WalRequest::Register {
            writer: id.clone(),
            tx,
        });
        (
            WalWriter {
                id,
                tx: self.tx.clone(),
            },
            rx,
        )
    }

    /// The shared mem-table registries backing this WAL.
    pub fn tables(&self) -> &Arc<MemTables<D, R, M>> {
        &self.tables
    }

    /// A snapshot of the sink's batch metrics ring.
    pub fn metrics(&self) -> WalMetrics {
        self.metrics.lock().clone()
    }

    /// Whether the sink is still accepting requests.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Close the current file and open a new one. Testing aid.
    pub fn force_roll_over(&self) -> Result<(), WalError> {
        self.tx.send(WalRequest::ForceRollOver).map_err(|_| WalError::Down)
    }

    /// Flush and fsync outstanding records, then stop the sink.
    pub async fn close(&self) -> Result<(), WalError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(WalRequest::Close { tx }).map_err(|_| WalError::Down)?;
        rx.await.map_err(|_| WalError::Down)
    }
}

/// A single writer's handle onto the WAL sink.
pub struct WalWriter<D: AppData, R: AppDataResponse, M: MachineState> {
    id: WriterId,
    tx: mpsc::UnboundedSender<WalRequest<D, R, M>>,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> Clone for WalWriter<D, R, M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState> WalWriter<D, R, M> {
    pub fn id(&self) -> &WriterId {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Enqueue an append. The ack arrives asynchronously as a `Written` notice covering the
    /// index after the next successful fsync.
    pub fn append(&self, entry: Entry<D, R, M>) -> Result<(), WalError> {
        self.send(entry, false)
    }

    /// Enqueue a truncating append: all of this writer's records at and after the entry's
    /// index are superseded by it.
    pub fn truncate_write(&self, entry: Entry<D, R, M>) -> Result<(), WalError> {
        self.send(entry, true)
    }

    fn send(&self, entry: Entry<D, R, M>, truncate: bool) -> Result<(), WalError> {
        self.tx
            .send(WalRequest::Append {
                writer: self.id.clone(),
                entry,
                truncate,
            })
            .map_err(|_| WalError::Down)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct WriterState {
    tx: Option<mpsc::UnboundedSender<LogEvent>>,
    last_index: Option<u64>,
    out_of_seq: bool,
}

#[derive(Clone, Copy)]
struct BatchRange {
    from: u64,
    to: u64,
    term: u64,
}

struct WalSink<D: AppData, R: AppDataResponse, M: MachineState> {
    config: WalConfig,
    rx: mpsc::UnboundedReceiver<WalRequest<D, R, M>>,
    tables: Arc<MemTables<D, R, M>>,
    segment_tx: mpsc::UnboundedSender<SegmentNotice>,
    metrics: Arc<Mutex<WalMetrics>>,

    file: BufWriter<File>,
    file_path: PathBuf,
    file_seq: u64,
    file_size: u64,

    /// Writer references cached for the current file, reset at rollover.
    writer_refs: HashMap<WriterId, u16>,
    next_ref: u16,

    writers: HashMap<WriterId, WriterState>,

    max_batch_size: usize,
    batch: HashMap<WriterId, BatchRange>,
    batch_records: usize,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> WalSink<D, R, M> {
    async fn run(mut self) -> Result<(), WalError> {
        loop {
            // Phase one: wait.
            let first = match self.rx.recv().await {
                Some(req) => req,
                None => return self.shutdown(None).await,
            };
            if let WalRequest::Close { tx } = first {
                return self.shutdown(Some(tx)).await;
            }
            self.handle_request(first).await?;

            // Phase two: batched. Drain without blocking until the mailbox empties or the
            // batch reaches the cap.
            let mut closing = None;
            let drained = loop {
                if self.batch_records >= self.max_batch_size {
                    break false;
                }
                match self.rx.recv().now_or_never() {
                    Some(Some(WalRequest::Close { tx })) => {
                        closing = Some(tx);
                        break true;
                    }
                    Some(Some(req)) => self.handle_request(req).await?,
                    Some(None) => break true,
                    None => break true,
                }
            };

            self.complete_batch(drained).await?;
            if let Some(tx) = closing {
                return self.shutdown(Some(tx)).await;
            }
        }
    }

    async fn shutdown(mut self, ack: Option<oneshot::Sender<()>>) -> Result<(), WalError> {
        self.complete_batch(true).await?;
        self.file.flush().await?;
        self.file.get_ref().sync_data().await?;
        if let Some(tx) = ack {
            let _ = tx.send(());
        }
        tracing::debug!("wal sink stopped");
        Ok(())
    }

    async fn handle_request(&mut self, req: WalRequest<D, R, M>) -> Result<(), WalError> {
        match req {
            WalRequest::Register { writer, tx } => {
                self.writers.entry(writer).or_default().tx = Some(tx);
                Ok(())
            }
            WalRequest::Append { writer, entry, truncate } => self.handle_append(writer, entry, truncate).await,
            WalRequest::ForceRollOver => {
                self.complete_batch(true).await?;
                self.roll_over().await
            }
            // Close is intercepted by the run loop.
            WalRequest::Close { tx } => {
                let _ = tx.send(());
                Ok(())
            }
        }
    }

    async fn handle_append(&mut self, writer: WriterId, entry: Entry<D, R, M>, truncate: bool) -> Result<(), WalError> {
        let index = entry.log_id.index;
        let term = entry.log_id.term;

        // Out-of-sequence policy. A truncating write always resets the writer to in-sequence.
        let state = self.writers.entry(writer.clone()).or_default();
        if !truncate {
            match state.last_index {
                None => {}
                Some(last) if index <= last + 1 => {}
                Some(last) => {
                    if state.out_of_seq {
                        tracing::trace!(%writer, index, "dropping append from out-of-sequence writer");
                    } else {
                        tracing::warn!(%writer, index, expected = last + 1, "out-of-sequence append, requesting resend");
                        state.out_of_seq = true;
                        if let Some(tx) = &state.tx {
                            let _ = tx.send(LogEvent::ResendWrite { from: last + 1 });
                        }
                    }
                    return Ok(());
                }
            }
        }
        state.out_of_seq = false;
        state.last_index = Some(index);

        let entry_bytes = bincode::serde::encode_to_vec(&entry, bincode::config::standard())
            .map_err(|err| WalError::Codec(err.to_string()))?;

        // Roll over before the record when writing it would exceed the file cap, or when the
        // current file has no writer references left to hand out.
        let needs_intro = !self.writer_refs.contains_key(&writer);
        let record_len = record::encoded_len(if needs_intro { Some(&writer) } else { None }, entry_bytes.len()) as u64;
        let out_of_refs = needs_intro && self.next_ref > record::MAX_WRITER_REF;
        if out_of_refs || (self.file_size > 0 && self.file_size + record_len > self.config.max_wal_size_bytes) {
            self.complete_batch(true).await?;
            self.roll_over().await?;
        }

        let needs_intro = !self.writer_refs.contains_key(&writer);
        let writer_ref = match self.writer_refs.get(&writer) {
            Some(r) => *r,
            None => {
                let r = self.next_ref;
                self.next_ref += 1;
                self.writer_refs.insert(writer.clone(), r);
                r
            }
        };

        let mut buf = Vec::with_capacity(record_len as usize);
        record::encode(
            &mut buf,
            writer_ref,
            if needs_intro { Some(&writer) } else { None },
            truncate,
            index,
            term,
            &entry_bytes,
            self.config.compute_checksums,
        );
        // File-write errors are fatal: the sink goes down and writers observe `WalDown`.
        self.file.write_all(&buf).await?;
        self.file_size += buf.len() as u64;

        self.tables.insert_open(&writer, entry);

        let range = self.batch.entry(writer).or_insert(BatchRange { from: index, to: index, term });
        range.from = range.from.min(index);
        if truncate || index >= range.to {
            range.to = index;
            range.term = term;
        }
        self.batch_records += 1;
        Ok(())
    }

    /// Complete the in-flight batch: one fsync, then one `Written` notice per contributing
    /// writer, then adapt `max_batch_size`.
    async fn complete_batch(&mut self, drained_before_cap: bool) -> Result<(), WalError> {
        if self.batch_records == 0 {
            return Ok(());
        }
        self.file.flush().await?;
        self.file.get_ref().sync_data().await?;

        for (writer, range) in self.batch.drain() {
            if let Some(tx) = self.writers.get(&writer).and_then(|s| s.tx.as_ref()) {
                let _ = tx.send(LogEvent::Written {
                    from: range.from,
                    to: range.to,
                    term: range.term,
                });
            }
        }

        if drained_before_cap {
            self.max_batch_size = (self.max_batch_size / 2).max(MIN_MAX_BATCH);
        } else {
            self.max_batch_size = (self.max_batch_size * 2).min(MAX_MAX_BATCH);
        }
        self.metrics.lock().record_batch(self.batch_records as u64, self.max_batch_size);
        self.batch_records = 0;
        Ok(())
    }

    /// Close the current file, promote all open mem-tables to closed, notify the segment
    /// writer, and open the next file. New files start with no cached writer references.
    async fn roll_over(&mut self) -> Result<(), WalError> {
        self.file.flush().await?;
        self.file.get_ref().sync_data().await?;

        let writers = self.tables.roll_over_open();
        let _ = self.segment_tx.send(SegmentNotice {
            filename: Some(self.file_path.clone()),
            writers,
        });

        self.writer_refs.clear();
        self.next_ref = 0;
        self.file_seq += 1;
        self.file_path = wal_file_path(&self.config.dir, self.file_seq);
        self.file = BufWriter::new(open_wal_file(&self.file_path).await?);
        self.file_size = 0;
        tracing::debug!(file=%self.file_path.display(), "rolled over to new wal file");
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

fn wal_file_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{:08}.{}", seq, WAL_EXT))
}

fn parse_file_seq(path: &Path) -> Option<u64> {
    path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok())
}

async fn open_wal_file(path: &Path) -> Result<File, WalError> {
    Ok(OpenOptions::new().create(true).write(true).truncate(false).open(path).await?)
}

async fn list_wal_files(dir: &Path) -> Result<Vec<PathBuf>, WalError> {
    let mut files = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(ent) = rd.next_entry().await? {
        let path = ent.path();
        if path.extension().and_then(|e| e.to_str()) == Some(WAL_EXT) {
            files.push(path);
        }
    }
    // Names are zero-padded monotonic sequence numbers, so lexicographic order is replay order.
    files.sort();
    Ok(files)
}

/// Replay WAL files into a fresh mem-table index, validating checksums. Fatal on corruption.
async fn recover_files<D: AppData, R: AppDataResponse, M: MachineState>(
    files: &[PathBuf],
) -> Result<HashMap<WriterId, MemTable<D, R, M>>, WalError> {
    let mut tables: HashMap<WriterId, MemTable<D, R, M>> = HashMap::new();
    for path in files {
        let buf = tokio::fs::read(path).await?;
        let mut refs = HashMap::new();
        let mut at = 0usize;
        loop {
            match record::decode(&buf, at, &mut refs) {
                Ok(Some((rec, next))) => {
                    let (entry, _): (Entry<D, R, M>, usize) =
                        bincode::serde::decode_from_slice(rec.entry, bincode::config::standard()).map_err(|_| {
                            WalError::Corrupt {
                                file: path.clone(),
                                offset: at as u64,
                            }
                        })?;
                    tables.entry(rec.writer).or_insert_with(MemTable::new).insert(entry);
                    at = next;
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(WalError::Corrupt {
                        file: path.clone(),
                        offset: at as u64,
                    })
                }
            }
        }
        tracing::debug!(file=%path.display(), bytes = buf.len(), "replayed wal file");
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Command;
    use crate::raft::ReplyMode;
    use crate::LogId;

    type TestWal = Wal<String, String, String>;
    type TestTables = MemTables<String, String, String>;

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

    async fn open_wal(dir: &Path) -> (TestWal, mpsc::UnboundedReceiver<SegmentNotice>) {
        let (seg_tx, seg_rx) = mpsc::unbounded_channel();
        let tables = Arc::new(TestTables::new());
        let wal = TestWal::open(WalConfig::new(dir), tables, seg_tx).await.unwrap();
        (wal, seg_rx)
    }

    #[tokio::test]
    async fn one_fsync_acks_every_writer_in_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _seg) = open_wal(dir.path()).await;

        // All four appends are enqueued before the sink task first runs (current-thread
        // runtime), so they land in a single batch.
        let mut writers = Vec::new();
        for i in 0..4u64 {
            let (w, rx) = wal.writer(WriterId::from(format!("node-{}", i)));
            w.append(entry(1, 7)).unwrap();
            writers.push((w, rx));
        }

        for (_, rx) in writers.iter_mut() {
            match rx.recv().await.unwrap() {
                LogEvent::Written { from, to, term } => {
                    assert_eq!((from, to, term), (1, 1, 7));
                }
                other => panic!("expected Written, got {:?}", other),
            }
        }
        let metrics = wal.metrics();
        assert_eq!(metrics.batches, 1);
        assert_eq!(metrics.recent_batches(), vec![4]);
    }

    #[tokio::test]
    async fn batch_size_doubles_at_the_cap_and_halves_on_drain() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _seg) = open_wal(dir.path()).await;
        let (w, mut rx) = wal.writer(WriterId::from("node-0"));

        for i in 1..=40u64 {
            w.append(entry(i, 1)).unwrap();
        }

        // First batch fills to the cap of 16 and doubles the cap; the second drains the
        // remaining 24 and halves it back.
        match rx.recv().await.unwrap() {
            LogEvent::Written { from, to, .. } => assert_eq!((from, to), (1, 16)),
            other => panic!("unexpected event {:?}", other),
        }
        match rx.recv().await.unwrap() {
            LogEvent::Written { from, to, .. } => assert_eq!((from, to), (17, 40)),
            other => panic!("unexpected event {:?}", other),
        }
        let metrics = wal.metrics();
        assert_eq!(metrics.recent_batches(), vec![16, 24]);
        assert_eq!(metrics.max_batch_size, MIN_MAX_BATCH);
    }

    #[tokio::test]
    async fn out_of_sequence_appends_request_a_resend() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _seg) = open_wal(dir.path()).await;
        let (w, mut rx) = wal.writer(WriterId::from("node-0"));

        w.append(entry(1, 1)).unwrap();
        match rx.recv().await.unwrap() {
            LogEvent::Written { to, .. } => assert_eq!(to, 1),
            other => panic!("unexpected event {:?}", other),
        }

        // A gap: index 5 after index 1.
        w.append(entry(5, 1)).unwrap();
        assert_eq!(rx.recv().await.unwrap(), LogEvent::ResendWrite { from: 2 });

        // Still out of sequence: dropped silently.
        w.append(entry(6, 1)).unwrap();

        // A truncating write resets the writer to in-sequence.
        w.truncate_write(entry(2, 1)).unwrap();
        w.append(entry(3, 1)).unwrap();
        match rx.recv().await.unwrap() {
            LogEvent::Written { from, to, .. } => {
                assert_eq!(from, 2);
                assert_eq!(to, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(wal.tables().entry(&WriterId::from("node-0"), 6).is_none());
    }

    #[tokio::test]
    async fn rollover_promotes_open_tables_and_keeps_them_readable() {
        let dir = tempfile::tempdir().unwrap();
        let (seg_tx, mut seg_rx) = mpsc::unbounded_channel();
        let tables = Arc::new(TestTables::new());
        let mut config = WalConfig::new(dir.path());
        config.max_wal_size_bytes = 256;
        let wal = TestWal::open(config, tables.clone(), seg_tx).await.unwrap();

        let id = WriterId::from("node-0");
        let (w, mut rx) = wal.writer(id.clone());
        for i in 1..=12u64 {
            w.append(entry(i, 2)).unwrap();
        }
        // Wait for everything to become durable.
        let mut durable = 0;
        while durable < 12 {
            match rx.recv().await.unwrap() {
                LogEvent::Written { to, .. } => durable = to,
                other => panic!("unexpected event {:?}", other),
            }
        }

        let notice = seg_rx.recv().await.unwrap();
        assert!(notice.filename.is_some());
        assert_eq!(notice.writers, vec![id.clone()]);

        // Every index is still resolvable, through closed tables where necessary.
        for i in 1..=12u64 {
            assert!(tables.entry(&id, i).is_some(), "index {} lost at rollover", i);
        }
        assert!(tables.closed_count(&id) >= 1);

        // More than one physical file exists now.
        let files = list_wal_files(dir.path()).await.unwrap();
        assert!(files.len() >= 2, "expected a rollover, found {:?}", files);
    }

    #[tokio::test]
    async fn force_roll_over_opens_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, mut seg_rx) = open_wal(dir.path()).await;
        let id = WriterId::from("node-0");
        let (w, mut rx) = wal.writer(id.clone());

        w.append(entry(1, 1)).unwrap();
        rx.recv().await.unwrap();
        wal.force_roll_over().unwrap();
        w.append(entry(2, 1)).unwrap();
        rx.recv().await.unwrap();

        let notice = seg_rx.recv().await.unwrap();
        assert_eq!(notice.writers, vec![id]);
        let files = list_wal_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn recovery_rebuilds_the_tables() {
        let dir = tempfile::tempdir().unwrap();
        let id = WriterId::from("node-0");
        let other = WriterId::from("node-1");

        {
            let (wal, _seg) = open_wal(dir.path()).await;
            let (w, mut rx) = wal.writer(id.clone());
            let (w2, mut rx2) = wal.writer(other.clone());
            for i in 1..=5u64 {
                w.append(entry(i, 3)).unwrap();
            }
            w2.append(entry(1, 3)).unwrap();
            // Overwrite the tail before the crash.
            w.truncate_write(entry(4, 4)).unwrap();
            loop {
                if let LogEvent::Written { to, term, .. } = rx.recv().await.unwrap() {
                    if to == 4 && term == 4 {
                        break;
                    }
                }
            }
            rx2.recv().await.unwrap();
            wal.close().await.unwrap();
        }

        // Restart from the same directory with fresh registries.
        let (seg_tx, mut seg_rx) = mpsc::unbounded_channel();
        let tables = Arc::new(TestTables::new());
        let _wal = TestWal::open(WalConfig::new(dir.path()), tables.clone(), seg_tx).await.unwrap();

        let notice = seg_rx.recv().await.unwrap();
        assert_eq!(notice.filename, None);
        assert_eq!(notice.writers.len(), 2);

        let entries = tables.writer_entries(&id);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[&3].log_id.term, 3);
        assert_eq!(entries[&4].log_id.term, 4);
        assert_eq!(tables.writer_entries(&other).len(), 1);
    }

    #[tokio::test]
    async fn recovery_fails_on_corruption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (wal, _seg) = open_wal(dir.path()).await;
            let (w, mut rx) = wal.writer(WriterId::from("node-0"));
            w.append(entry(1, 1)).unwrap();
            rx.recv().await.unwrap();
            wal.close().await.unwrap();
        }

        let files = list_wal_files(dir.path()).await.unwrap();
        let mut bytes = std::fs::read(&files[0]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&files[0], &bytes).unwrap();

        let (seg_tx, _seg_rx) = mpsc::unbounded_channel();
        let tables = Arc::new(TestTables::new());
        let res = TestWal::open(WalConfig::new(dir.path()), tables, seg_tx).await;
        assert!(matches!(res, Err(WalError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn appends_after_close_report_wal_down() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _seg) = open_wal(dir.path()).await;
        let (w, _rx) = wal.writer(WriterId::from("node-0"));
        wal.close().await.unwrap();
        assert!(matches!(w.append(entry(1, 1)), Err(WalError::Down)));
        assert!(!wal.is_open());
    }
}
