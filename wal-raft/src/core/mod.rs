//! The core logic of a Raft node.
//!
//! The node state machine is deliberately free of I/O beyond its log facade: every handler is
//! a function from `(message, state)` to `(role, state, effects)`, with the effects interpreted
//! by the driver. This keeps the protocol rules testable without timers, sockets or disks.

mod admin;
mod append_entries;
mod await_condition;
mod client;
mod install_snapshot;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

pub use await_condition::Condition;

use crate::config::Config;
use crate::error::RaftResult;
use crate::log::HardState;
use crate::log::LogStore;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::Command;
use crate::raft::Entry;
use crate::raft::InstallSnapshotReply;
use crate::raft::NodeMsg;
use crate::raft::PeerMessage;
use crate::raft::ReplyResult;
use crate::raft::ReplyTo;
use crate::raft::VoteRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::MessageSummary;
use crate::NodeId;

/// All possible roles of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node has suspended normal processing until a predicate on incoming messages
    /// returns true.
    AwaitCondition,
    /// The node has finished: it committed a cluster change excluding itself, or the host
    /// shut it down.
    Stop,
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    pub fn is_await_condition(&self) -> bool {
        matches!(self, Self::AwaitCondition)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

/// Replication state the leader maintains per cluster member.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerState {
    /// The highest log index known to be replicated on the peer.
    pub match_index: u64,
    /// The next log index to send to the peer.
    pub next_index: u64,
}

/// Why a client command was not accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandRejected {
    /// The node is not the leader; the command should be retried against `leader` if known.
    NotLeader { leader: Option<NodeId> },
    /// The proposed membership change would leave the cluster empty.
    InoperableConfig,
    /// The proposed membership change adds or removes more than one member.
    NotSingleStep,
}

/// An instruction to the driver, emitted by a role handler.
#[derive(Debug)]
pub enum Effect<D: AppData, R: AppDataResponse, M: MachineState> {
    /// Route a reply to the caller identified by `to`.
    Reply { to: ReplyTo, value: ReplyResult<R> },
    /// Fire a notification for a `notify_on_consensus` command.
    Notify { to: ReplyTo, value: ReplyResult<R> },
    /// Dispatch AppendEntries RPCs to peers. `urgent` requests immediate transmission ahead
    /// of the regular heartbeat cadence.
    SendRpcs {
        urgent: bool,
        rpcs: Vec<(NodeId, AppendEntriesRequest<D, R, M>)>,
    },
    /// Dispatch RequestVote RPCs to peers.
    SendVoteRequests(Vec<(NodeId, VoteRequest)>),
    /// Send a single protocol message to a peer.
    SendMsg {
        target: NodeId,
        msg: PeerMessage<D, R, M>,
    },
    /// Start watching the caller behind an in-flight `await_consensus` command.
    Monitor(ReplyTo),
    /// Stop watching a caller.
    Demonitor(ReplyTo),
    /// Re-enter the state machine with a synthetic message.
    NextEvent(Box<NodeMsg<D, R, M>>),
    /// Increment positions of a process-wide counter table.
    IncrMetrics {
        table: &'static str,
        deltas: Vec<(usize, u64)>,
    },
    /// Everything at and below `index` is applied; the log may snapshot the machine here and
    /// compact beneath it.
    ReleaseCursor { index: u64, machine: M },
}

/// The result of applying one command to the user state machine.
pub struct Applied<D: AppData, R: AppDataResponse, M: MachineState> {
    /// The successor state.
    pub machine: M,
    /// The value returned to the caller, if the command produces one.
    pub reply: Option<R>,
    /// Effects the machine wants carried out alongside the reply.
    pub side_effects: Vec<Effect<D, R, M>>,
}

impl<D: AppData, R: AppDataResponse, M: MachineState> Applied<D, R, M> {
    pub fn new(machine: M) -> Self {
        Self {
            machine,
            reply: None,
            side_effects: Vec::new(),
        }
    }

    pub fn with_reply(machine: M, reply: R) -> Self {
        Self {
            machine,
            reply: Some(reply),
            side_effects: Vec::new(),
        }
    }
}

/// The user-supplied apply function.
///
/// Both arities from the wild are accepted and normalised to the 3-ary form at call time.
#[derive(Clone)]
pub enum ApplyFn<D: AppData, R: AppDataResponse, M: MachineState> {
    /// `(command, state) -> applied`
    Plain(Arc<dyn Fn(&D, M) -> Applied<D, R, M> + Send + Sync>),
    /// `(index, command, state) -> applied`
    WithIndex(Arc<dyn Fn(u64, &D, M) -> Applied<D, R, M> + Send + Sync>),
}

impl<D: AppData, R: AppDataResponse, M: MachineState> ApplyFn<D, R, M> {
    pub fn call(&self, index: u64, data: &D, machine: M) -> Applied<D, R, M> {
        match self {
            Self::Plain(f) => f(data, machine),
            Self::WithIndex(f) => f(index, data, machine),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of a single Raft node.
///
/// The persistent subset — `current_term` and `voted_for` — lives in the log facade's metadata
/// file and is fsynced through [`persist_meta`](Self::persist_meta) before the node acts on a
/// new term or vote.
pub struct NodeState<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) role: Role,

    /// The cluster membership, including this node unless it is being removed.
    pub(crate) cluster: BTreeMap<NodeId, PeerState>,
    pub(crate) leader_id: Option<NodeId>,

    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,

    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,

    pub(crate) log: L,

    /// The id of the latest committed-or-pending cluster change entry.
    pub(crate) cluster_index_term: LogId,
    /// False from appending a cluster change (or winning an election) until the gate-opening
    /// entry applies.
    pub(crate) cluster_change_permitted: bool,
    pub(crate) pending_cluster_changes: VecDeque<Command<D, R, M>>,
    /// Rollback point for a follower whose cluster-change entry gets overwritten.
    pub(crate) previous_cluster: Option<(LogId, BTreeMap<NodeId, PeerState>)>,

    /// Nodes which granted this candidate their vote in the current term, self included.
    pub(crate) votes: HashSet<NodeId>,

    pub(crate) machine: M,
    pub(crate) initial_machine: M,
    pub(crate) apply_fn: ApplyFn<D, R, M>,

    pub(crate) condition: Option<Condition>,
}

impl<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> NodeState<D, R, M, L> {
    /// Initialise a node from its log.
    ///
    /// Reads the persisted metadata, installs the snapshot (if any) into the commit/apply
    /// indexes and the machine state, derives the cluster from the snapshot, and finally
    /// overwrites it with the latest cluster-change entry found by scanning forward from the
    /// commit index. `initial_members` seeds the cluster of a pristine node; it is ignored as
    /// soon as a snapshot or a cluster-change entry exists.
    #[tracing::instrument(level = "debug", skip(config, log, machine, apply_fn, initial_members))]
    pub async fn init(
        id: NodeId,
        config: Arc<Config>,
        mut log: L,
        machine: M,
        apply_fn: ApplyFn<D, R, M>,
        initial_members: BTreeSet<NodeId>,
    ) -> RaftResult<Self> {
        let hs = log.read_meta().await?.unwrap_or_default();

        let (machine, mut members, snapshot_id) = match log.read_snapshot().await? {
            Some((meta, m)) => (m, meta.members, meta.last_log_id),
            None => {
                let mut members = initial_members;
                members.insert(id);
                (machine, members, LogId::default())
            }
        };
        let mut cluster_index_term = snapshot_id;

        // The latest cluster change in the log wins over the snapshot's config.
        for index in (snapshot_id.index + 1)..=log.last_index_term().index {
            if let Some(entry) = log.fetch(index).await? {
                if let Command::ClusterChange { members: m, .. } = &entry.command {
                    members = m.clone();
                    cluster_index_term = entry.log_id;
                }
            }
        }

        let cluster = members.into_iter().map(|nid| (nid, PeerState::default())).collect();

        tracing::debug!(
            id,
            term = hs.current_term,
            last_log = %log.last_index_term(),
            commit = snapshot_id.index,
            "initialized node state"
        );

        Ok(Self {
            id,
            config,
            role: Role::Follower,
            cluster,
            leader_id: None,
            current_term: hs.current_term,
            voted_for: hs.voted_for,
            commit_index: snapshot_id.index,
            last_applied: snapshot_id.index,
            log,
            cluster_index_term,
            cluster_change_permitted: false,
            pending_cluster_changes: VecDeque::new(),
            previous_cluster: None,
            votes: HashSet::new(),
            initial_machine: machine.clone(),
            machine,
            apply_fn,
            condition: None,
        })
    }

    /// Dispatch one message through the role handlers.
    ///
    /// The universal term rule runs first: a message carrying a term above our own updates and
    /// persists the term, clears the vote, and reverts the node to follower before the message
    /// itself is handled.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(id=self.id, role=?self.role, msg=%msg.summary()))]
    pub async fn handle(&mut self, msg: NodeMsg<D, R, M>) -> RaftResult<Vec<Effect<D, R, M>>> {
        if let Some(term) = msg.term() {
            if term > self.current_term {
                tracing::debug!(id = self.id, term, old_term = self.current_term, "observed higher term");
                self.current_term = term;
                self.voted_for = None;
                self.persist_meta().await?;
                if self.role != Role::Follower {
                    self.become_follower();
                }
            }
        }

        match self.role {
            Role::Follower => self.handle_as_follower(msg).await,
            Role::Candidate => self.handle_as_candidate(msg).await,
            Role::Leader => self.handle_as_leader(msg).await,
            Role::AwaitCondition => self.handle_as_await(msg).await,
            Role::Stop => Ok(Vec::new()),
        }
    }

    async fn handle_as_follower(&mut self, msg: NodeMsg<D, R, M>) -> RaftResult<Vec<Effect<D, R, M>>> {
        match msg {
            NodeMsg::AppendEntries(req) => self.handle_append_entries(req).await,
            NodeMsg::RequestVote(req) => self.handle_vote_request(req).await,
            NodeMsg::InstallSnapshot(req) => self.handle_install_snapshot(req).await,
            NodeMsg::Written(range) => self.handle_follower_written(range).await,
            NodeMsg::ElectionTimeout => self.become_candidate().await,
            NodeMsg::Command(cmd) => Ok(self.reject_command(cmd)),
            NodeMsg::AppendEntriesResult { from, .. }
            | NodeMsg::RequestVoteResult { from, .. }
            | NodeMsg::InstallSnapshotResult { from, .. } => {
                tracing::trace!(id = self.id, from, "follower ignoring stale reply");
                Ok(Vec::new())
            }
            NodeMsg::AwaitConditionTimeout | NodeMsg::Tick => Ok(Vec::new()),
        }
    }

    async fn handle_as_candidate(&mut self, msg: NodeMsg<D, R, M>) -> RaftResult<Vec<Effect<D, R, M>>> {
        match msg {
            // An AppendEntries at our own term means a leader exists for it: concede.
            NodeMsg::AppendEntries(req) => {
                if req.term == self.current_term {
                    self.become_follower();
                }
                self.handle_append_entries(req).await
            }
            NodeMsg::InstallSnapshot(req) => {
                if req.term == self.current_term {
                    self.become_follower();
                }
                self.handle_install_snapshot(req).await
            }
            NodeMsg::RequestVote(req) => self.handle_vote_request(req).await,
            NodeMsg::RequestVoteResult { from, reply } => self.handle_vote_result(from, reply).await,
            NodeMsg::Written(range) => self.handle_follower_written(range).await,
            NodeMsg::ElectionTimeout => self.become_candidate().await,
            NodeMsg::Command(cmd) => Ok(self.reject_command(cmd)),
            NodeMsg::AppendEntriesResult { .. } | NodeMsg::InstallSnapshotResult { .. } => Ok(Vec::new()),
            NodeMsg::AwaitConditionTimeout | NodeMsg::Tick => Ok(Vec::new()),
        }
    }

    async fn handle_as_leader(&mut self, msg: NodeMsg<D, R, M>) -> RaftResult<Vec<Effect<D, R, M>>> {
        match msg {
            NodeMsg::AppendEntriesResult { from, reply } => self.handle_append_entries_reply(from, reply).await,
            NodeMsg::InstallSnapshotResult { from, reply } => self.handle_install_snapshot_reply(from, reply).await,
            NodeMsg::Command(cmd) => self.handle_command(cmd).await,
            NodeMsg::Written(_) => self.handle_leader_written().await,
            NodeMsg::Tick => self.pipeline_append_entries(false).await,
            NodeMsg::RequestVote(req) => self.handle_vote_request(req).await,
            NodeMsg::AppendEntries(req) => self.handle_append_entries_as_leader(req).await,
            NodeMsg::InstallSnapshot(req) => {
                if req.term == self.current_term {
                    tracing::error!(
                        id = self.id,
                        from = req.leader_id,
                        "leader received InstallSnapshot at its own term"
                    );
                    return Ok(Vec::new());
                }
                // Stale leader from an older term; answer with ours so it steps down.
                Ok(vec![Effect::SendMsg {
                    target: req.leader_id,
                    msg: PeerMessage::InstallSnapshotResult {
                        from: self.id,
                        reply: InstallSnapshotReply {
                            term: self.current_term,
                            last_index: 0,
                        },
                    },
                }])
            }
            NodeMsg::RequestVoteResult { .. } => Ok(Vec::new()),
            NodeMsg::ElectionTimeout | NodeMsg::AwaitConditionTimeout => Ok(Vec::new()),
        }
    }

    /// Revert to follower, clearing role-specific state. Term and vote handling belong to the
    /// callers.
    pub(crate) fn become_follower(&mut self) {
        tracing::debug!(id = self.id, term = self.current_term, "becoming follower");
        self.role = Role::Follower;
        self.votes.clear();
        self.condition = None;
        self.leader_id = None;
    }

    /// Start a new election: advance the term, vote for self, persist, and solicit the peers.
    pub(crate) async fn become_candidate(&mut self) -> RaftResult<Vec<Effect<D, R, M>>> {
        self.role = Role::Candidate;
        self.condition = None;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.persist_meta().await?;
        tracing::info!(id = self.id, term = self.current_term, "campaigning for leadership");

        if self.votes.len() >= self.vote_majority() {
            // A single-node cluster elects itself without a round trip.
            return self.become_leader().await;
        }

        let last_log_id = self.log.last_index_term();
        let requests = self
            .peers()
            .into_iter()
            .map(|peer| (peer, VoteRequest::new(self.current_term, self.id, last_log_id)))
            .collect();
        Ok(vec![Effect::SendVoteRequests(requests)])
    }

    /// Become leader: reinitialise every peer's replication state and commit a noop to anchor
    /// the new term (§8).
    pub(crate) async fn become_leader(&mut self) -> RaftResult<Vec<Effect<D, R, M>>> {
        tracing::info!(id = self.id, term = self.current_term, "becoming leader");
        self.role = Role::Leader;
        self.votes.clear();
        self.leader_id = None;
        self.condition = None;
        self.cluster_change_permitted = false;
        let next_index = self.log.next_index();
        for peer in self.cluster.values_mut() {
            peer.match_index = 0;
            peer.next_index = next_index;
        }
        Ok(vec![Effect::NextEvent(Box::new(NodeMsg::Command(Command::Noop)))])
    }

    /// Persist `current_term` and `voted_for` with a metadata fsync.
    pub(crate) async fn persist_meta(&mut self) -> RaftResult<()> {
        self.log
            .write_meta(&HardState {
                current_term: self.current_term,
                voted_for: self.voted_for,
            })
            .await?;
        self.log.sync_meta().await?;
        Ok(())
    }

    pub(crate) fn peers(&self) -> Vec<NodeId> {
        self.cluster.keys().copied().filter(|nid| *nid != self.id).collect()
    }

    /// The number of votes required to win an election in the current cluster.
    pub(crate) fn vote_majority(&self) -> usize {
        quorum::majority_of(self.cluster.len().max(1))
    }

    pub(crate) fn entry_at(&self, index: u64, term: u64, command: Command<D, R, M>) -> Entry<D, R, M> {
        Entry {
            log_id: LogId::new(term, index),
            command,
        }
    }

    // Accessors, mainly for the driver, metrics, and tests.

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// The leader this node currently believes in: itself when leading, the observed leader
    /// otherwise.
    pub fn current_leader(&self) -> Option<NodeId> {
        if self.role.is_leader() {
            Some(self.id)
        } else {
            self.leader_id
        }
    }

    pub fn members(&self) -> BTreeSet<NodeId> {
        self.cluster.keys().copied().collect()
    }

    pub fn cluster_change_permitted(&self) -> bool {
        self.cluster_change_permitted
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// The machine state the node was constructed with, before any command applied.
    pub fn initial_machine(&self) -> &M {
        &self.initial_machine
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    pub fn peer_state(&self, id: NodeId) -> Option<PeerState> {
        self.cluster.get(&id).copied()
    }
}
