//! Public Raft interface and data types.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::ApplyFn;
use crate::core::CommandRejected;
use crate::driver::NodeDriver;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::LogEvent;
use crate::log::LogStore;
use crate::log::SnapshotMeta;
use crate::log::WrittenRange;
use crate::metrics::NodeMetrics;
use crate::metrics::Wait;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;

struct RaftInner<D: AppData, R: AppDataResponse, M: MachineState, N: RaftNetwork<D, R, M>, L: LogStore<D, R, M>> {
    tx_api: mpsc::UnboundedSender<ApiMsg<D, R, M>>,
    rx_metrics: watch::Receiver<NodeMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_l: std::marker::PhantomData<L>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Applications building on top of Raft will
/// use this to spawn a Raft task, deliver messages arriving from peers, and submit client
/// commands.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft
/// node is shutting down (potentially for data safety reasons due to a storage error), and the
/// `shutdown` method should be called on this type to await the shutdown of the node. If the
/// parent application needs to shutdown the Raft node for any reason, calling `shutdown` will do
/// the trick.
pub struct Raft<D: AppData, R: AppDataResponse, M: MachineState, N: RaftNetwork<D, R, M>, L: LogStore<D, R, M>> {
    inner: Arc<RaftInner<D, R, M, N, L>>,
}

impl<D: AppData, R: AppDataResponse, M: MachineState, N: RaftNetwork<D, R, M>, L: LogStore<D, R, M>>
    Raft<D, R, M, N, L>
{
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable, and should be
    /// persisted in a well known location, probably alongside the Raft log and the application's
    /// state machine.
    ///
    /// ### `config`
    /// The runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for sending
    /// messages to peer nodes within the cluster.
    ///
    /// ### `log` & `log_events`
    /// An implementation of the `LogStore` trait along with the receiving side of its event
    /// channel, over which `Written` acknowledgements and resend requests arrive. For the
    /// WAL-backed facade both come from [`WalLog::open`](crate::log::WalLog::open).
    ///
    /// ### `machine` & `apply`
    /// The initial state of the application's state machine and the function used to apply
    /// committed commands to it.
    ///
    /// ### `initial_members`
    /// The cluster this node believes in on first boot. Ignored as soon as the log or a
    /// snapshot carries a membership; every founding member must be started with the same set.
    #[tracing::instrument(level="trace", skip(config, network, log, log_events, machine, apply), fields(cluster=%config.cluster_name))]
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        log: L,
        log_events: mpsc::UnboundedReceiver<LogEvent>,
        machine: M,
        apply: ApplyFn<D, R, M>,
        initial_members: BTreeSet<NodeId>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(NodeMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = NodeDriver::spawn(
            id,
            config,
            network,
            log,
            log_events,
            machine,
            apply,
            initial_members,
            tx_api.clone(),
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_l: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Deliver a message arriving from a peer node to this Raft node.
    ///
    /// The transport owns framing and addressing; this method is the single entry point for
    /// everything a peer sends, requests and replies alike.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub fn deliver(&self, msg: PeerMessage<D, R, M>) -> RaftResult<()> {
        self.inner.tx_api.send(ApiMsg::Event(NodeMsg::from(msg))).map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a mutating client request to Raft to update the state of the system (§5.1).
    ///
    /// The command will be appended to the log, committed to the cluster, and then applied to
    /// the application state machine. The result of applying the request to the state machine
    /// will be returned as the response from this method.
    ///
    /// If the node is not currently the leader, `ClientWriteError::ForwardToLeader` is returned
    /// carrying the current leader if known.
    #[tracing::instrument(level = "debug", skip(self, data))]
    pub async fn client_write(&self, data: D) -> Result<ClientWriteResponse<R>, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Write {
                data,
                mode: ReplyMode::AwaitConsensus,
                tx: Some(tx),
                notify: None,
            })
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        let res = rx.await.map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))??;
        match res {
            ClientResponse::Applied { log_id, data } => Ok(ClientWriteResponse { log_id, data }),
            ClientResponse::Appended { log_id } => Ok(ClientWriteResponse { log_id, data: None }),
        }
    }

    /// Submit a client request which is acknowledged as soon as it has been appended to the
    /// leader's log, without waiting for consensus.
    ///
    /// The returned `LogId` identifies the appended entry. The entry may still be lost if
    /// leadership changes before it commits.
    #[tracing::instrument(level = "debug", skip(self, data))]
    pub async fn client_append(&self, data: D) -> Result<LogId, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Write {
                data,
                mode: ReplyMode::AfterLogAppend,
                tx: Some(tx),
                notify: None,
            })
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        let res = rx.await.map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))??;
        Ok(res.log_id())
    }

    /// Submit a client request whose consensus outcome is delivered as a notification on the
    /// returned channel rather than as a reply.
    #[tracing::instrument(level = "debug", skip(self, data))]
    pub fn client_write_notify(
        &self,
        data: D,
    ) -> Result<mpsc::UnboundedReceiver<Result<ClientResponse<R>, ClientWriteError>>, RaftError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .tx_api
            .send(ApiMsg::Write {
                data,
                mode: ReplyMode::NotifyOnConsensus,
                tx: None,
                notify: Some(tx),
            })
            .map_err(|_| RaftError::ShuttingDown)?;
        Ok(rx)
    }

    /// Submit a consistent read of the application state machine.
    ///
    /// The query travels through the replicated log like any other command, so by the time it is
    /// applied every write committed before it has been applied too — a simple quorum read.
    #[tracing::instrument(level = "debug", skip(self, query))]
    pub async fn client_query(&self, query: QueryFn<M, R>) -> Result<Option<R>, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Query { query, tx })
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;
        let res = rx.await.map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))??;
        match res {
            ClientResponse::Applied { data, .. } => Ok(data),
            ClientResponse::Appended { .. } => Ok(None),
        }
    }

    /// Propose a cluster membership change (§6).
    ///
    /// Only single-server additions and removals are permitted. If the leader's initial noop for
    /// its term has not yet committed, or another membership change is still in flight, the
    /// proposal is queued and appended once the gate opens.
    ///
    /// If this Raft node is not the cluster leader, then the proposed configuration change will
    /// be rejected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(&self, members: BTreeSet<NodeId>) -> Result<LogId, ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::ChangeMembership { members, tx })
            .map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ChangeConfigError::RaftError(RaftError::ShuttingDown))?
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<NodeMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use wal_raft::Role;
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).applied(3, "log-3").await?;
    ///
    /// // wait for the node to become a follower:
    /// r.wait(None).role(Role::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState, N: RaftNetwork<D, R, M>, L: LogStore<D, R, M>> Clone
    for Raft<D, R, M, N, L>
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientResponseTx<R> = oneshot::Sender<Result<ClientResponse<R>, ClientWriteError>>;
pub(crate) type NotifyTx<R> = mpsc::UnboundedSender<Result<ClientResponse<R>, ClientWriteError>>;
pub(crate) type ChangeMembershipTx = oneshot::Sender<Result<LogId, ChangeConfigError>>;

/// A message coming from the Raft API.
pub(crate) enum ApiMsg<D: AppData, R: AppDataResponse, M: MachineState> {
    Event(NodeMsg<D, R, M>),
    Write {
        data: D,
        mode: ReplyMode,
        tx: Option<ClientResponseTx<R>>,
        notify: Option<NotifyTx<R>>,
    },
    Query {
        query: QueryFn<M, R>,
        tx: ClientResponseTx<R>,
    },
    ChangeMembership {
        members: BTreeSet<NodeId>,
        tx: ChangeMembershipTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A message sent between cluster peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData, R: AppDataResponse, M: MachineState")]
pub enum PeerMessage<D: AppData, R: AppDataResponse, M: MachineState> {
    AppendEntries(AppendEntriesRequest<D, R, M>),
    AppendEntriesResult { from: NodeId, reply: AppendEntriesReply },
    RequestVote(VoteRequest),
    RequestVoteResult { from: NodeId, reply: VoteReply },
    InstallSnapshot(InstallSnapshotRequest<M>),
    InstallSnapshotResult { from: NodeId, reply: InstallSnapshotReply },
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MessageSummary for PeerMessage<D, R, M> {
    fn summary(&self) -> String {
        match self {
            Self::AppendEntries(req) => format!("AppendEntries({})", req.summary()),
            Self::AppendEntriesResult { from, reply } => {
                format!(
                    "AppendEntriesResult(from={}, term={}, success={}, last={})",
                    from, reply.term, reply.success, reply.last_log_id
                )
            }
            Self::RequestVote(req) => format!("RequestVote({:?})", req),
            Self::RequestVoteResult { from, reply } => {
                format!("RequestVoteResult(from={}, term={}, granted={})", from, reply.term, reply.vote_granted)
            }
            Self::InstallSnapshot(req) => {
                format!("InstallSnapshot(term={}, leader={}, meta={:?})", req.term, req.leader_id, req.meta)
            }
            Self::InstallSnapshotResult { from, reply } => {
                format!("InstallSnapshotResult(from={}, last_index={})", from, reply.last_index)
            }
        }
    }
}

/// A message dispatched through a node's role handlers.
///
/// Peer messages, client commands, log acknowledgements and timer events all funnel through
/// this one type: the node state machine is a function from `(message, state)` to
/// `(role, state, effects)`.
#[derive(Debug)]
pub enum NodeMsg<D: AppData, R: AppDataResponse, M: MachineState> {
    AppendEntries(AppendEntriesRequest<D, R, M>),
    AppendEntriesResult { from: NodeId, reply: AppendEntriesReply },
    RequestVote(VoteRequest),
    RequestVoteResult { from: NodeId, reply: VoteReply },
    InstallSnapshot(InstallSnapshotRequest<M>),
    InstallSnapshotResult { from: NodeId, reply: InstallSnapshotReply },
    /// A client command to be appended to the log.
    Command(Command<D, R, M>),
    /// A durability acknowledgement from the log facade.
    Written(WrittenRange),
    /// The election timer fired.
    ElectionTimeout,
    /// The await-condition timer fired.
    AwaitConditionTimeout,
    /// The leader's heartbeat timer fired.
    Tick,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> NodeMsg<D, R, M> {
    /// The peer term carried by this message, if any.
    ///
    /// Used by the universal term rule: any message carrying a term greater than the node's own
    /// forces a revert to follower before the message is dispatched.
    pub fn term(&self) -> Option<u64> {
        match self {
            Self::AppendEntries(req) => Some(req.term),
            Self::AppendEntriesResult { reply, .. } => Some(reply.term),
            Self::RequestVote(req) => Some(req.term),
            Self::RequestVoteResult { reply, .. } => Some(reply.term),
            Self::InstallSnapshot(req) => Some(req.term),
            Self::InstallSnapshotResult { reply, .. } => Some(reply.term),
            _ => None,
        }
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState> From<PeerMessage<D, R, M>> for NodeMsg<D, R, M> {
    fn from(msg: PeerMessage<D, R, M>) -> Self {
        match msg {
            PeerMessage::AppendEntries(req) => Self::AppendEntries(req),
            PeerMessage::AppendEntriesResult { from, reply } => Self::AppendEntriesResult { from, reply },
            PeerMessage::RequestVote(req) => Self::RequestVote(req),
            PeerMessage::RequestVoteResult { from, reply } => Self::RequestVoteResult { from, reply },
            PeerMessage::InstallSnapshot(req) => Self::InstallSnapshot(req),
            PeerMessage::InstallSnapshotResult { from, reply } => Self::InstallSnapshotResult { from, reply },
        }
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MessageSummary for NodeMsg<D, R, M> {
    fn summary(&self) -> String {
        match self {
            Self::AppendEntries(req) => format!("AppendEntries({})", req.summary()),
            Self::AppendEntriesResult { from, reply } => {
                format!("AppendEntriesResult(from={}, success={})", from, reply.success)
            }
            Self::RequestVote(req) => format!("RequestVote({:?})", req),
            Self::RequestVoteResult { from, reply } => {
                format!("RequestVoteResult(from={}, granted={})", from, reply.vote_granted)
            }
            Self::InstallSnapshot(req) => format!("InstallSnapshot(term={}, leader={})", req.term, req.leader_id),
            Self::InstallSnapshotResult { from, reply } => {
                format!("InstallSnapshotResult(from={}, last_index={})", from, reply.last_index)
            }
            Self::Command(cmd) => format!("Command({})", cmd.summary()),
            Self::Written(range) => format!("Written({}..{}@{})", range.from, range.to, range.term),
            Self::ElectionTimeout => "ElectionTimeout".to_string(),
            Self::AwaitConditionTimeout => "AwaitConditionTimeout".to_string(),
            Self::Tick => "Tick".to_string(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData, R: AppDataResponse, M: MachineState")]
pub struct AppendEntriesRequest<D: AppData, R: AppDataResponse, M: MachineState> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,
    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    pub entries: Vec<Entry<D, R, M>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MessageSummary for AppendEntriesRequest<D, R, M> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The reply to an `AppendEntriesRequest`, sent asynchronously once the entries are durable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if the follower contained an entry matching `prev_log_id`.
    pub success: bool,
    /// The next index the responding node expects to receive.
    pub next_index: u64,
    /// On success, the durable high-water mark of the responding node's log. On failure, the id
    /// of the responding node's entry nearest the mismatch, used by the leader to reconcile
    /// `next_index` without a long decrement walk.
    pub last_log_id: LogId,
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The id of the candidate's last log entry (§5.4).
    pub last_log_id: LogId,
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: NodeId, last_log_id: LogId) -> Self {
        Self {
            term,
            candidate_id,
            last_log_id,
        }
    }
}

/// The reply to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteReply {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// An RPC sent by the Raft leader to install a snapshot on a node too far behind to catch up
/// through the log (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "M: MachineState")]
pub struct InstallSnapshotRequest<M: MachineState> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// Metadata of the snapshot: covered log id and cluster membership.
    pub meta: SnapshotMeta,
    /// The snapshotted state machine.
    pub machine: M,
}

/// The reply to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
    /// The last log index covered by the installed snapshot, or 0 if the request was rejected
    /// as stale.
    pub last_index: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// How a client command is acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyMode {
    /// Reply with the entry's `(index, term)` as soon as it is appended to the leader's log.
    AfterLogAppend,
    /// Reply once the entry has been committed and applied to the state machine.
    AwaitConsensus,
    /// Do not reply; fire a notification once the entry has been applied.
    NotifyOnConsensus,
}

/// The origin of a client command, used to route replies and notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplyTo {
    /// The node which accepted the command from the client.
    pub node: NodeId,
    /// An opaque token correlating the reply with the caller on that node.
    pub token: u64,
}

/// A function applied to the state machine by a consistent query command.
pub type QueryFn<M, R> = Arc<dyn Fn(&M) -> R + Send + Sync + 'static>;

/// A command carried by a log entry.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "D: AppData, R: AppDataResponse, M: MachineState")]
pub enum Command<D: AppData, R: AppDataResponse, M: MachineState> {
    /// An opaque application command.
    User {
        from: Option<ReplyTo>,
        data: D,
        mode: ReplyMode,
    },
    /// A consistent read of the state machine.
    ///
    /// The query function only exists on the node which accepted it; it is not serialized, so
    /// replicas and recovered logs apply the entry as a no-op.
    Query {
        from: Option<ReplyTo>,
        #[serde(skip)]
        query: Option<QueryFn<M, R>>,
        mode: ReplyMode,
    },
    /// A cluster membership change.
    ClusterChange {
        from: Option<ReplyTo>,
        members: BTreeSet<NodeId>,
        mode: ReplyMode,
    },
    /// An empty command committed by a new cluster leader.
    Noop,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> Command<D, R, M> {
    /// The caller and reply mode of this command, if it has any.
    pub fn origin(&self) -> (Option<ReplyTo>, Option<ReplyMode>) {
        match self {
            Self::User { from, mode, .. }
            | Self::Query { from, mode, .. }
            | Self::ClusterChange { from, mode, .. } => (*from, Some(*mode)),
            Self::Noop => (None, None),
        }
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState> fmt::Debug for Command<D, R, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User { from, data, mode } => {
                f.debug_struct("User").field("from", from).field("data", data).field("mode", mode).finish()
            }
            Self::Query { from, query, mode } => f
                .debug_struct("Query")
                .field("from", from)
                .field("query", &query.as_ref().map(|_| "<fn>"))
                .field("mode", mode)
                .finish(),
            Self::ClusterChange { from, members, mode } => f
                .debug_struct("ClusterChange")
                .field("from", from)
                .field("members", members)
                .field("mode", mode)
                .finish(),
            Self::Noop => write!(f, "Noop"),
        }
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MessageSummary for Command<D, R, M> {
    fn summary(&self) -> String {
        match self {
            Self::User { .. } => "user".to_string(),
            Self::Query { .. } => "query".to_string(),
            Self::ClusterChange { members, .. } => format!("cluster-change: {:?}", members),
            Self::Noop => "noop".to_string(),
        }
    }
}

/// A Raft log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData, R: AppDataResponse, M: MachineState")]
pub struct Entry<D: AppData, R: AppDataResponse, M: MachineState> {
    pub log_id: LogId,
    /// This entry's command.
    pub command: Command<D, R, M>,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MessageSummary for Entry<D, R, M> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.command.summary())
    }
}

impl<D: AppData, R: AppDataResponse, M: MachineState> MessageSummary for &[Entry<D, R, M>] {
    fn summary(&self) -> String {
        self.iter().map(|x| x.summary()).collect::<Vec<_>>().join(",")
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The successful response to a client command.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "R: AppDataResponse")]
pub enum ClientResponse<R: AppDataResponse> {
    /// The command was appended to the leader's log.
    Appended { log_id: LogId },
    /// The command was committed and applied to the state machine.
    Applied { log_id: LogId, data: Option<R> },
}

impl<R: AppDataResponse> ClientResponse<R> {
    /// The id of the log entry this response refers to.
    pub fn log_id(&self) -> LogId {
        match self {
            Self::Appended { log_id } => *log_id,
            Self::Applied { log_id, .. } => *log_id,
        }
    }
}

/// The response to a `client_write` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "R: AppDataResponse")]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The id of the log entry holding the processed client request.
    pub log_id: LogId,
    /// Application specific response data, if the command produced any.
    pub data: Option<R>,
}

/// A value routed back to a caller or a notification target.
pub(crate) type ReplyResult<R> = Result<ClientResponse<R>, CommandRejected>;
