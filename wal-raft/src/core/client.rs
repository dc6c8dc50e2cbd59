//! Client command handling and the apply loop.

use super::CommandRejected;
use super::Condition;
use super::Effect;
use super::NodeState;
use super::Role;
use crate::config::SnapshotPolicy;
use crate::error::LogError;
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::metrics;
use crate::raft::ClientResponse;
use crate::raft::Command;
use crate::raft::NodeMsg;
use crate::raft::ReplyMode;
use crate::raft::ReplyTo;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::MessageSummary;

impl<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> NodeState<D, R, M, L> {
    /// Handle a client command as leader.
    #[tracing::instrument(level = "debug", skip(self, cmd), fields(id=self.id, cmd=%cmd.summary()))]
    pub(super) async fn handle_command(&mut self, cmd: Command<D, R, M>) -> RaftResult<Vec<Effect<D, R, M>>> {
        if let Command::ClusterChange { .. } = &cmd {
            return self.handle_cluster_change_command(cmd).await;
        }
        self.append_command(cmd).await
    }

    /// Append a command to the log at `(next_index, current_term)`, acknowledge per its reply
    /// mode, and pipeline it to the peers.
    pub(super) async fn append_command(&mut self, cmd: Command<D, R, M>) -> RaftResult<Vec<Effect<D, R, M>>> {
        let log_id = LogId::new(self.current_term, self.log.next_index());
        let (from, mode) = cmd.origin();
        let entry = self.entry_at(log_id.index, log_id.term, cmd);

        match self.log.append(entry).await {
            Ok(()) => {}
            Err(LogError::WalDown) => {
                tracing::warn!(id = self.id, "wal down during leader append, awaiting recovery");
                self.condition = Some(Condition::WalDown);
                self.role = Role::AwaitCondition;
                // The command was not accepted; tell the caller to retry elsewhere.
                return Ok(self.reply_with_rejection(from, mode, CommandRejected::NotLeader { leader: None }));
            }
            Err(err) => return Err(err.into()),
        }

        let mut effects = Vec::new();
        if let Some(to) = from.filter(|to| to.node == self.id) {
            match mode {
                Some(ReplyMode::AfterLogAppend) => effects.push(Effect::Reply {
                    to,
                    value: Ok(ClientResponse::Appended { log_id }),
                }),
                Some(ReplyMode::AwaitConsensus) => effects.push(Effect::Monitor(to)),
                _ => {}
            }
        }
        effects.extend(self.pipeline_append_entries(true).await?);
        // A single-node cluster commits through its own Written event; nothing else needed.
        Ok(effects)
    }

    /// Reject a command on a node which is not the leader.
    pub(super) fn reject_command(&self, cmd: Command<D, R, M>) -> Vec<Effect<D, R, M>> {
        let (from, mode) = cmd.origin();
        self.reply_with_rejection(
            from,
            mode,
            CommandRejected::NotLeader {
                leader: self.current_leader(),
            },
        )
    }

    pub(super) fn reply_with_rejection(
        &self,
        from: Option<ReplyTo>,
        mode: Option<ReplyMode>,
        rejected: CommandRejected,
    ) -> Vec<Effect<D, R, M>> {
        let to = match from.filter(|to| to.node == self.id) {
            Some(to) => to,
            None => return Vec::new(),
        };
        match mode {
            Some(ReplyMode::NotifyOnConsensus) => vec![Effect::Notify { to, value: Err(rejected) }],
            _ => vec![Effect::Reply { to, value: Err(rejected) }],
        }
    }

    /// Apply committed entries through `target`, in batches.
    ///
    /// Dispatches each command by tag: user commands run the apply function, queries read the
    /// machine, cluster changes and current-term noops open the membership-change gate. The
    /// caller guarantees `target <= commit_index`.
    #[tracing::instrument(level = "trace", skip(self), fields(id=self.id, target))]
    pub(super) async fn apply_to(&mut self, target: u64) -> RaftResult<Vec<Effect<D, R, M>>> {
        let mut effects = Vec::new();
        let mut applied: u64 = 0;

        while self.last_applied < target {
            let to = target.min(self.last_applied + self.config.max_append_entries);
            let entries = self.log.take(self.last_applied + 1, to).await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                let log_id = entry.log_id;
                match entry.command {
                    Command::User { from, data, mode } => {
                        let out = self.apply_fn.call(log_id.index, &data, self.machine.clone());
                        self.machine = out.machine;
                        effects.extend(out.side_effects);
                        self.push_applied_reply(&mut effects, from, mode, log_id, out.reply);
                    }
                    Command::Query { from, query, mode } => {
                        // The query function only exists where the command originated.
                        let data = query.map(|q| q(&self.machine));
                        self.push_applied_reply(&mut effects, from, mode, log_id, data);
                    }
                    Command::ClusterChange { from, mode, .. } => {
                        self.cluster_change_permitted = true;
                        self.push_applied_reply(&mut effects, from, mode, log_id, None);
                        self.inject_pending_cluster_change(&mut effects);
                    }
                    Command::Noop => {
                        if log_id.term == self.current_term {
                            self.cluster_change_permitted = true;
                            self.inject_pending_cluster_change(&mut effects);
                        }
                    }
                }
                self.last_applied = log_id.index;
                applied += 1;
            }
        }

        if applied > 0 {
            effects.push(Effect::IncrMetrics {
                table: metrics::MACHINE_TABLE,
                deltas: vec![(metrics::MACHINE_APPLIED, applied)],
            });
            let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
            if self.last_applied >= self.log.snapshot_index_term().index + *threshold {
                effects.push(Effect::ReleaseCursor {
                    index: self.last_applied,
                    machine: self.machine.clone(),
                });
            }
        }
        Ok(effects)
    }

    fn inject_pending_cluster_change(&mut self, effects: &mut Vec<Effect<D, R, M>>) {
        if !self.role.is_leader() {
            return;
        }
        if let Some(next) = self.pending_cluster_changes.pop_front() {
            tracing::debug!(id = self.id, "injecting deferred cluster change");
            effects.push(Effect::NextEvent(Box::new(NodeMsg::Command(next))));
        }
    }

    fn push_applied_reply(
        &self,
        effects: &mut Vec<Effect<D, R, M>>,
        from: Option<ReplyTo>,
        mode: ReplyMode,
        log_id: LogId,
        data: Option<R>,
    ) {
        let to = match from.filter(|to| to.node == self.id) {
            Some(to) => to,
            None => return,
        };
        let value = Ok(ClientResponse::Applied { log_id, data });
        match mode {
            ReplyMode::AwaitConsensus => {
                effects.push(Effect::Reply { to, value });
                effects.push(Effect::Demonitor(to));
            }
            ReplyMode::NotifyOnConsensus => effects.push(Effect::Notify { to, value }),
            // Acknowledged back at append time.
            ReplyMode::AfterLogAppend => {}
        }
    }
}
