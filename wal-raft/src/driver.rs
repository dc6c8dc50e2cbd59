//! The driver adapter: owns a node's state machine, arms its timers, interprets its effects.
//!
//! The core never performs I/O beyond its log facade; everything else it asks for through
//! effects, which this task translates into timer arming, peer dispatch through the
//! `RaftNetwork`, replies to callers, monitors, and metrics. Messages are dispatched one at a
//! time; no handler suspends mid-message except on the log facade's own suspension points.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::ApplyFn;
use crate::core::CommandRejected;
use crate::core::Effect;
use crate::core::NodeState;
use crate::core::Role;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::RaftResult;
use crate::log::LogEvent;
use crate::log::LogStore;
use crate::metrics;
use crate::metrics::NodeMetrics;
use crate::raft::ApiMsg;
use crate::raft::ChangeMembershipTx;
use crate::raft::ClientResponse;
use crate::raft::ClientResponseTx;
use crate::raft::Command;
use crate::raft::NodeMsg;
use crate::raft::NotifyTx;
use crate::raft::PeerMessage;
use crate::raft::ReplyMode;
use crate::raft::ReplyResult;
use crate::raft::ReplyTo;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;

enum Pending<R: AppDataResponse> {
    Client(ClientResponseTx<R>),
    Config(ChangeMembershipTx),
}

pub(crate) struct NodeDriver<D, R, M, N, L>
where
    D: AppData,
    R: AppDataResponse,
    M: MachineState,
    N: RaftNetwork<D, R, M>,
    L: LogStore<D, R, M>,
{
    node: NodeState<D, R, M, L>,
    network: Arc<N>,

    tx_api: mpsc::UnboundedSender<ApiMsg<D, R, M>>,
    rx_api: mpsc::UnboundedReceiver<ApiMsg<D, R, M>>,
    log_events: mpsc::UnboundedReceiver<LogEvent>,
    tx_metrics: watch::Sender<NodeMetrics>,
    rx_shutdown: oneshot::Receiver<()>,

    pending: HashMap<u64, Pending<R>>,
    notifies: HashMap<u64, NotifyTx<R>>,
    monitored: HashSet<u64>,
    next_token: u64,

    election_deadline: Option<Instant>,
    await_deadline: Option<Instant>,
    heartbeat: Interval,
    last_metrics: NodeMetrics,
}

impl<D, R, M, N, L> NodeDriver<D, R, M, N, L>
where
    D: AppData,
    R: AppDataResponse,
    M: MachineState,
    N: RaftNetwork<D, R, M>,
    L: LogStore<D, R, M>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        log: L,
        log_events: mpsc::UnboundedReceiver<LogEvent>,
        machine: M,
        apply: ApplyFn<D, R, M>,
        initial_members: std::collections::BTreeSet<NodeId>,
        tx_api: mpsc::UnboundedSender<ApiMsg<D, R, M>>,
        rx_api: mpsc::UnboundedReceiver<ApiMsg<D, R, M>>,
        tx_metrics: watch::Sender<NodeMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let span = tracing::debug_span!("node", id);
        tokio::spawn(
            async move {
                let mut heartbeat = tokio::time::interval(Duration::from_millis(config.broadcast_interval));
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let node = NodeState::init(id, config, log, machine, apply, initial_members).await?;
                let this = NodeDriver {
                    node,
                    network,
                    tx_api,
                    rx_api,
                    log_events,
                    tx_metrics,
                    rx_shutdown,
                    pending: HashMap::new(),
                    notifies: HashMap::new(),
                    monitored: HashSet::new(),
                    next_token: 0,
                    election_deadline: None,
                    await_deadline: None,
                    heartbeat,
                    last_metrics: NodeMetrics::new_initial(id),
                };
                this.main().await
            }
            .instrument(span),
        )
    }

    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!(id = self.node.id(), "raft node is initializing");
        self.report_metrics();

        loop {
            let role = self.node.role();
            if role.is_stop() {
                tracing::info!(id = self.node.id(), "node has stopped");
                let _ = self.node.log.close().await;
                return Ok(());
            }

            let election_armed = matches!(role, Role::Follower | Role::Candidate);
            if election_armed && self.election_deadline.is_none() {
                self.rearm_election();
            }
            let await_armed = role.is_await_condition();
            if await_armed && self.await_deadline.is_none() {
                self.await_deadline =
                    Some(Instant::now() + Duration::from_millis(self.node.config.await_condition_timeout));
            }
            let far = Instant::now() + Duration::from_secs(3600);
            let election_deadline = self.election_deadline.unwrap_or(far);
            let await_deadline = self.await_deadline.unwrap_or(far);

            tokio::select! {
                // Messages take priority over timers so a queued heartbeat defuses a
                // concurrently expired election timer.
                biased;

                Ok(_) = &mut self.rx_shutdown => {
                    tracing::info!(id = self.node.id(), "shutdown requested");
                    let _ = self.node.log.close().await;
                    return Ok(());
                }
                Some(api) = self.rx_api.recv() => {
                    self.handle_api(api).await?;
                }
                Some(event) = self.log_events.recv() => {
                    for range in self.node.log.handle_event(event) {
                        self.dispatch(NodeMsg::Written(range)).await?;
                    }
                }
                _ = sleep_until(election_deadline), if election_armed => {
                    self.election_deadline = None;
                    self.dispatch(NodeMsg::ElectionTimeout).await?;
                }
                _ = sleep_until(await_deadline), if await_armed => {
                    self.await_deadline = None;
                    self.dispatch(NodeMsg::AwaitConditionTimeout).await?;
                }
                _ = self.heartbeat.tick(), if role.is_leader() => {
                    self.dispatch(NodeMsg::Tick).await?;
                }
            }
        }
    }

    async fn handle_api(&mut self, msg: ApiMsg<D, R, M>) -> RaftResult<()> {
        match msg {
            ApiMsg::Event(event) => self.dispatch(event).await,
            ApiMsg::Write { data, mode, tx, notify } => {
                let from = self.register_caller(tx, notify);
                self.dispatch(NodeMsg::Command(Command::User { from, data, mode })).await
            }
            ApiMsg::Query { query, tx } => {
                let from = self.register_caller(Some(tx), None);
                self.dispatch(NodeMsg::Command(Command::Query {
                    from,
                    query: Some(query),
                    mode: ReplyMode::AwaitConsensus,
                }))
                .await
            }
            ApiMsg::ChangeMembership { members, tx } => {
                let token = self.next_token;
                self.next_token += 1;
                self.pending.insert(token, Pending::Config(tx));
                let from = Some(ReplyTo {
                    node: self.node.id(),
                    token,
                });
                self.dispatch(NodeMsg::Command(Command::ClusterChange {
                    from,
                    members,
                    mode: ReplyMode::AwaitConsensus,
                }))
                .await
            }
        }
    }

    fn register_caller(&mut self, tx: Option<ClientResponseTx<R>>, notify: Option<NotifyTx<R>>) -> Option<ReplyTo> {
        let token = self.next_token;
        self.next_token += 1;
        if let Some(tx) = tx {
            self.pending.insert(token, Pending::Client(tx));
        }
        if let Some(notify) = notify {
            self.notifies.insert(token, notify);
        }
        Some(ReplyTo {
            node: self.node.id(),
            token,
        })
    }

    async fn dispatch(&mut self, msg: NodeMsg<D, R, M>) -> RaftResult<()> {
        let heartbeat_like = matches!(&msg, NodeMsg::AppendEntries(_) | NodeMsg::InstallSnapshot(_));
        let prev_role = self.node.role();

        let effects = match self.node.handle(msg).await {
            Ok(effects) => effects,
            Err(err) => {
                tracing::error!(id = self.node.id(), error=%err, "fatal error in node state machine, shutting down");
                return Err(err);
            }
        };
        self.process_effects(effects).await?;

        let role = self.node.role();
        if role != prev_role {
            // Deadlines are role-specific; re-arm lazily on the next loop pass.
            self.election_deadline = None;
            self.await_deadline = None;
            if role.is_leader() {
                self.heartbeat.reset();
            }
            if prev_role.is_leader() && !role.is_leader() {
                // Entries awaiting consensus may be superseded by the new leader; unblock
                // their callers rather than leaving them hanging.
                self.fail_pending_callers();
            }
        } else if heartbeat_like && role.is_follower() {
            self.rearm_election();
        }
        self.report_metrics();
        Ok(())
    }

    fn fail_pending_callers(&mut self) {
        let leader = self.node.current_leader();
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Client(tx) => {
                    let _ = tx.send(Err(ClientWriteError::ForwardToLeader(leader)));
                }
                Pending::Config(tx) => {
                    let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader)));
                }
            }
        }
        for (_, tx) in self.notifies.drain() {
            let _ = tx.send(Err(ClientWriteError::ForwardToLeader(leader)));
        }
        self.monitored.clear();
    }

    async fn process_effects(&mut self, effects: Vec<Effect<D, R, M>>) -> RaftResult<()> {
        for effect in effects {
            match effect {
                Effect::Reply { to, value } => self.deliver_reply(to, value),
                Effect::Notify { to, value } => self.deliver_notify(to, value),
                Effect::SendRpcs { urgent, rpcs } => {
                    for (target, rpc) in rpcs {
                        self.send(target, PeerMessage::AppendEntries(rpc), urgent);
                    }
                }
                Effect::SendVoteRequests(requests) => {
                    for (target, req) in requests {
                        self.send(target, PeerMessage::RequestVote(req), true);
                    }
                }
                Effect::SendMsg { target, msg } => {
                    // Granting a vote resets the election timer just as a heartbeat does.
                    if let PeerMessage::RequestVoteResult { reply, .. } = &msg {
                        if reply.vote_granted && self.node.role().is_follower() {
                            self.rearm_election();
                        }
                    }
                    self.send(target, msg, true);
                }
                Effect::Monitor(to) => {
                    self.monitored.insert(to.token);
                }
                Effect::Demonitor(to) => {
                    self.monitored.remove(&to.token);
                }
                Effect::NextEvent(msg) => {
                    let _ = self.tx_api.send(ApiMsg::Event(*msg));
                }
                Effect::IncrMetrics { table, deltas } => metrics::incr(table, &deltas),
                Effect::ReleaseCursor { index, machine } => {
                    let members = self.node.members();
                    self.node.log.update_release_cursor(index, &members, &machine).await?;
                }
            }
        }
        Ok(())
    }

    fn deliver_reply(&mut self, to: ReplyTo, value: ReplyResult<R>) {
        if to.node != self.node.id() {
            tracing::trace!(id = self.node.id(), ?to, "reply for a caller on another node, dropping");
            return;
        }
        match self.pending.remove(&to.token) {
            Some(Pending::Client(tx)) => {
                let _ = tx.send(map_client_reply(value));
            }
            Some(Pending::Config(tx)) => {
                let _ = tx.send(map_config_reply(value));
            }
            None => tracing::trace!(id = self.node.id(), token = to.token, "no pending caller for reply"),
        }
    }

    fn deliver_notify(&mut self, to: ReplyTo, value: ReplyResult<R>) {
        if to.node != self.node.id() {
            return;
        }
        if let Some(tx) = self.notifies.remove(&to.token) {
            let _ = tx.send(map_client_reply(value));
        }
    }

    fn send(&self, target: NodeId, msg: PeerMessage<D, R, M>, urgent: bool) {
        let network = self.network.clone();
        let id = self.node.id();
        tokio::spawn(
            async move {
                tracing::trace!(id, target, urgent, msg = %msg.summary(), "sending");
                if let Err(err) = network.send(target, msg).await {
                    tracing::warn!(id, target, error=%err, "error sending message to peer");
                }
            }
            .instrument(tracing::debug_span!("send")),
        );
    }

    fn rearm_election(&mut self) {
        let millis = match self.node.role() {
            Role::Candidate => self.node.config.new_candidate_election_timeout(),
            _ => self.node.config.new_follower_election_timeout(),
        };
        self.election_deadline = Some(Instant::now() + Duration::from_millis(millis));
    }

    fn report_metrics(&mut self) {
        let current = NodeMetrics {
            id: self.node.id(),
            role: self.node.role(),
            current_term: self.node.current_term(),
            last_log_index: self.node.log.last_index_term().index,
            last_applied: self.node.last_applied(),
            commit_index: self.node.commit_index(),
            current_leader: self.node.current_leader(),
            members: self.node.members(),
        };
        if current != self.last_metrics {
            self.last_metrics = current.clone();
            if let Err(err) = self.tx_metrics.send(current) {
                tracing::error!(id = self.node.id(), error=%err, "error reporting metrics");
            }
        }
    }
}

fn map_client_reply<R: AppDataResponse>(value: ReplyResult<R>) -> Result<ClientResponse<R>, ClientWriteError> {
    match value {
        Ok(resp) => Ok(resp),
        Err(CommandRejected::NotLeader { leader }) => Err(ClientWriteError::ForwardToLeader(leader)),
        Err(rejected) => {
            tracing::warn!(?rejected, "unexpected rejection for a client command");
            Err(ClientWriteError::ForwardToLeader(None))
        }
    }
}

fn map_config_reply<R: AppDataResponse>(value: ReplyResult<R>) -> Result<LogId, ChangeConfigError> {
    match value {
        Ok(resp) => Ok(resp.log_id()),
        Err(CommandRejected::NotLeader { leader }) => Err(ChangeConfigError::NodeNotLeader(leader)),
        Err(CommandRejected::InoperableConfig) => Err(ChangeConfigError::InoperableConfig),
        Err(CommandRejected::NotSingleStep) => Err(ChangeConfigError::NotSingleStep),
    }
}
