//! An in-memory implementation of the `wal-raft::LogStore` trait, plus a small client
//! request/response model and state machine used by the consensus test suite.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use wal_raft::core::Applied;
use wal_raft::core::ApplyFn;
use wal_raft::error::LogError;
use wal_raft::log::HardState;
use wal_raft::log::LogEvent;
use wal_raft::log::LogStore;
use wal_raft::log::SnapshotMeta;
use wal_raft::log::WrittenRange;
use wal_raft::raft::Entry;
use wal_raft::AppData;
use wal_raft::AppDataResponse;
use wal_raft::LogId;
use wal_raft::MachineState;
use wal_raft::NodeId;

/// The application data request type for the test client.
///
/// Conceptually, this represents an update to a client's status info, returning the previously
/// recorded status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client.
    pub status: String,
}

/// The application data response type for `ClientRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse(pub Option<String>);

/// The state machine driven by `ClientRequest`s.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMachine {
    pub last_applied_log: u64,
    /// A mapping of client IDs to their state info.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
}

/// The apply function for [`ClientMachine`], deduplicating on `(client, serial)`.
pub fn client_apply_fn() -> ApplyFn<ClientRequest, ClientResponse, ClientMachine> {
    ApplyFn::WithIndex(Arc::new(|index, req: &ClientRequest, mut machine: ClientMachine| {
        machine.last_applied_log = index;
        if let Some((serial, response)) = machine.client_serial_responses.get(&req.client) {
            if *serial == req.serial {
                let response = response.clone();
                return Applied::with_reply(machine, ClientResponse(response));
            }
        }
        let previous = machine.client_status.insert(req.client.clone(), req.status.clone());
        machine.client_serial_responses.insert(req.client.clone(), (req.serial, previous.clone()));
        Applied::with_reply(machine, ClientResponse(previous))
    }))
}

/// An in-memory log facade.
///
/// Appends are durable the instant they land: a synthetic `Written` event is emitted onto the
/// event channel for each one, exercising the same acknowledgement path the WAL-backed facade
/// uses. The `set_wal_up` hook lets tests simulate the sink going down.
pub struct MemLog<D: AppData, R: AppDataResponse, M: MachineState> {
    log: BTreeMap<u64, Entry<D, R, M>>,
    last_appended: LogId,
    last_written: LogId,
    hard_state: Option<HardState>,
    snapshot: Option<(SnapshotMeta, M)>,
    release_cursor: u64,
    events: mpsc::UnboundedSender<LogEvent>,
    wal_up: bool,
    open: bool,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MemLog<D, R, M> {
    /// Create a new in-memory log along with its event channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                log: BTreeMap::new(),
                last_appended: LogId::default(),
                last_written: LogId::default(),
                hard_state: None,
                snapshot: None,
                release_cursor: 0,
                events,
                wal_up: true,
                open: true,
            },
            rx,
        )
    }

    /// Simulate the WAL sink going down (or coming back).
    pub fn set_wal_up(&mut self, up: bool) {
        tracing::debug!(up, "memlog wal availability toggled");
        self.wal_up = up;
    }

    /// The number of entries currently held.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Direct entry access for assertions.
    pub fn entry(&self, index: u64) -> Option<&Entry<D, R, M>> {
        self.log.get(&index)
    }

    /// The index at or below which the log may be compacted.
    pub fn release_cursor(&self) -> u64 {
        self.release_cursor
    }

    fn snapshot_id(&self) -> LogId {
        self.snapshot.as_ref().map(|(meta, _)| meta.last_log_id).unwrap_or_default()
    }
}

#[async_trait]
impl<D: AppData, R: AppDataResponse, M: MachineState> LogStore<D, R, M> for MemLog<D, R, M> {
    async fn append(&mut self, entry: Entry<D, R, M>) -> Result<(), LogError> {
        if !self.wal_up || !self.open {
            return Err(LogError::WalDown);
        }
        let log_id = entry.log_id;
        self.log.split_off(&log_id.index);
        if log_id.index <= self.last_written.index {
            // The durable suffix was just overwritten; acknowledgements for it are stale.
            let prev = log_id.index.saturating_sub(1).max(self.snapshot_id().index);
            let term = self
                .log
                .get(&prev)
                .map(|e| e.log_id.term)
                .unwrap_or_else(|| self.snapshot_id().term);
            self.last_written = LogId::new(term, prev);
        }
        self.log.insert(log_id.index, entry);
        self.last_appended = log_id;
        let _ = self.events.send(LogEvent::Written {
            from: log_id.index,
            to: log_id.index,
            term: log_id.term,
        });
        Ok(())
    }

    async fn truncate_append(&mut self, entry: Entry<D, R, M>) -> Result<(), LogError> {
        self.append(entry).await
    }

    async fn take(&mut self, from: u64, to: u64) -> Result<Vec<Entry<D, R, M>>, LogError> {
        let mut out = Vec::new();
        for index in from..=to.min(self.last_appended.index) {
            match self.log.get(&index) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
        }
        Ok(out)
    }

    async fn fetch(&mut self, index: u64) -> Result<Option<Entry<D, R, M>>, LogError> {
        Ok(self.log.get(&index).cloned())
    }

    async fn fetch_term(&mut self, index: u64) -> Result<Option<u64>, LogError> {
        if index == 0 {
            return Ok(Some(0));
        }
        let snap = self.snapshot_id();
        if index == snap.index {
            return Ok(Some(snap.term));
        }
        Ok(self.log.get(&index).map(|e| e.log_id.term))
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
        self.log.clear();
        self.last_appended = meta.last_log_id;
        self.last_written = meta.last_log_id;
        self.release_cursor = meta.last_log_id.index;
        self.snapshot = Some((meta, machine.clone()));
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<(SnapshotMeta, M)>, LogError> {
        Ok(self.snapshot.clone())
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
        self.snapshot = Some((
            SnapshotMeta {
                last_log_id: LogId::new(term, index),
                members: members.clone(),
            },
            machine.clone(),
        ));
        self.release_cursor = index;
        self.log = self.log.split_off(&(index + 1));
        Ok(())
    }

    fn handle_event(&mut self, event: LogEvent) -> Vec<WrittenRange> {
        match event {
            LogEvent::Written { from, to, term } => match self.log.get(&to) {
                Some(entry) if entry.log_id.term == term => {
                    if to > self.last_written.index {
                        self.last_written = LogId::new(term, to);
                    }
                    vec![WrittenRange { from, to, term }]
                }
                _ => Vec::new(),
            },
            LogEvent::ResendWrite { .. } => Vec::new(),
        }
    }

    async fn write_meta(&mut self, hs: &HardState) -> Result<(), LogError> {
        self.hard_state = Some(hs.clone());
        Ok(())
    }

    async fn read_meta(&self) -> Result<Option<HardState>, LogError> {
        Ok(self.hard_state.clone())
    }

    async fn sync_meta(&mut self) -> Result<(), LogError> {
        // In-memory state is as durable as it gets.
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.wal_up && self.open
    }

    async fn close(&mut self) -> Result<(), LogError> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wal_raft::raft::Command;
    use wal_raft::raft::ReplyMode;

    type TestLog = MemLog<ClientRequest, ClientResponse, ClientMachine>;

    fn entry(index: u64, term: u64) -> Entry<ClientRequest, ClientResponse, ClientMachine> {
        Entry {
            log_id: LogId::new(term, index),
            command: Command::User {
                from: None,
                data: ClientRequest {
                    client: "c1".into(),
                    serial: index,
                    status: format!("status-{}", index),
                },
                mode: ReplyMode::AwaitConsensus,
            },
        }
    }

    #[tokio::test]
    async fn append_emits_synthetic_written_events() {
        let (mut log, mut events) = TestLog::new();
        log.append(entry(1, 1)).await.unwrap();
        let ev = events.recv().await.unwrap();
        assert_eq!(ev, LogEvent::Written { from: 1, to: 1, term: 1 });
        let ranges = log.handle_event(ev);
        assert_eq!(ranges.len(), 1);
        assert_eq!(log.last_written(), LogId::new(1, 1));
    }

    #[tokio::test]
    async fn wal_down_hook_rejects_appends() {
        let (mut log, _events) = TestLog::new();
        log.set_wal_up(false);
        assert!(matches!(log.append(entry(1, 1)).await, Err(LogError::WalDown)));
        assert!(!log.is_open());
        log.set_wal_up(true);
        assert!(log.append(entry(1, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn truncating_append_discards_the_tail() {
        let (mut log, _events) = TestLog::new();
        for i in 1..=4 {
            log.append(entry(i, 1)).await.unwrap();
        }
        log.truncate_append(entry(3, 2)).await.unwrap();
        assert_eq!(log.last_index_term(), LogId::new(2, 3));
        assert!(log.fetch(4).await.unwrap().is_none());
    }

    #[test]
    fn client_machine_deduplicates_serials() {
        let apply = client_apply_fn();
        let req = ClientRequest {
            client: "c1".into(),
            serial: 1,
            status: "first".into(),
        };
        let out = apply.call(1, &req, ClientMachine::default());
        assert_eq!(out.reply, Some(ClientResponse(None)));

        // The same serial again returns the recorded response without reapplying.
        let out2 = apply.call(2, &req, out.machine.clone());
        assert_eq!(out2.reply, Some(ClientResponse(None)));
        assert_eq!(out2.machine.client_status.get("c1"), Some(&"first".to_string()));
    }
}
