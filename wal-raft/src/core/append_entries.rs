//! AppendEntries handling on the receiving side.

use super::Condition;
use super::Effect;
use super::NodeState;
use super::Role;
use crate::error::LogError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::log::WrittenRange;
use crate::raft::AppendEntriesReply;
use crate::raft::AppendEntriesRequest;
use crate::raft::Command;
use crate::raft::PeerMessage;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::MessageSummary;
use crate::NodeId;

/// The outcome of verifying a leader's `prev_log_id` against the local log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum PrevCheck {
    /// The entry exists with the expected term (or is covered by the snapshot).
    EntryOk,
    /// The entry exists with a different term.
    TermMismatch(u64),
    /// The entry does not exist: the follower's log has a gap.
    Missing,
}

impl<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> NodeState<D, R, M, L> {
    /// Handle an AppendEntries request as a follower (§5.3).
    #[tracing::instrument(level = "debug", skip(self, req), fields(id=self.id, req=%req.summary()))]
    pub(super) async fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest<D, R, M>,
    ) -> RaftResult<Vec<Effect<D, R, M>>> {
        // Stale leader: reject with our term so it steps down.
        if req.term < self.current_term {
            return Ok(vec![self.append_entries_failure(req.leader_id, self.log.last_index_term())]);
        }
        self.leader_id = Some(req.leader_id);

        match self.check_prev(req.prev_log_id).await? {
            PrevCheck::TermMismatch(actual) => {
                tracing::debug!(
                    id = self.id,
                    prev = %req.prev_log_id,
                    actual,
                    "prev entry term mismatch, rejecting"
                );
                let conflict = LogId::new(actual, req.prev_log_id.index);
                Ok(vec![self.append_entries_failure(req.leader_id, conflict)])
            }
            PrevCheck::Missing => {
                tracing::debug!(id = self.id, prev = %req.prev_log_id, "log gap, awaiting catch-up");
                let last = self.log.last_index_term();
                self.condition = Some(Condition::CatchUp);
                self.role = Role::AwaitCondition;
                Ok(vec![self.append_entries_failure(req.leader_id, last)])
            }
            PrevCheck::EntryOk => self.accept_entries(req).await,
        }
    }

    async fn accept_entries(&mut self, req: AppendEntriesRequest<D, R, M>) -> RaftResult<Vec<Effect<D, R, M>>> {
        let leader = req.leader_id;
        let last_received = req.entries.last().map(|e| e.log_id.index).unwrap_or(req.prev_log_id.index);

        // Skip entries we already hold with the same `(index, term)` — entries at or below the
        // snapshot boundary are committed and count as held. Everything from the first
        // divergent entry on must be written, as the write truncates our tail.
        let snapshot = self.log.snapshot_index_term();
        let mut first_new = req.entries.len();
        for (i, entry) in req.entries.iter().enumerate() {
            if entry.log_id.index <= snapshot.index {
                continue;
            }
            if self.log.fetch_term(entry.log_id.index).await? != Some(entry.log_id.term) {
                first_new = i;
                break;
            }
        }
        let new_entries: Vec<_> = req.entries.into_iter().skip(first_new).collect();

        // Overwriting at or below a pending cluster-change entry undoes that change.
        if let Some(first) = new_entries.first() {
            if first.log_id.index <= self.cluster_index_term.index {
                self.revert_cluster();
            }
        }

        let wrote = !new_entries.is_empty();
        for (i, entry) in new_entries.into_iter().enumerate() {
            let overwrite = entry.log_id.index <= self.log.last_index_term().index;
            let cluster_change = match &entry.command {
                Command::ClusterChange { members, .. } => Some((members.clone(), entry.log_id)),
                _ => None,
            };
            let res = if i == 0 && overwrite {
                self.log.truncate_append(entry).await
            } else {
                self.log.append(entry).await
            };
            match res {
                Ok(()) => {
                    // Membership takes effect the moment the entry enters the log.
                    if let Some((members, log_id)) = cluster_change {
                        self.adopt_cluster(members, log_id);
                    }
                }
                Err(LogError::WalDown) => {
                    tracing::warn!(id = self.id, "wal down during append, awaiting recovery");
                    self.condition = Some(Condition::WalDown);
                    self.role = Role::AwaitCondition;
                    return Ok(Vec::new());
                }
                Err(err) => return Err(RaftError::Log(err)),
            }
        }

        let new_commit = req.leader_commit.min(last_received);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }

        if wrote {
            // The success reply is deferred to the Written handler: acknowledged means durable.
            return Ok(Vec::new());
        }
        let mut effects = self.apply_to(self.commit_index.min(self.log.last_written().index)).await?;
        effects.push(self.append_entries_success(leader));
        Ok(effects)
    }

    /// Handle a durability acknowledgement as a follower or candidate: advance the applied
    /// index and acknowledge the leader with the new durable high-water mark. The range itself
    /// is not needed; the log's durable index already reflects it.
    #[tracing::instrument(level = "trace", skip(self), fields(id=self.id))]
    pub(super) async fn handle_follower_written(&mut self, _range: WrittenRange) -> RaftResult<Vec<Effect<D, R, M>>> {
        let mut effects = self.apply_to(self.commit_index.min(self.log.last_written().index)).await?;
        if self.role.is_follower() {
            if let Some(leader) = self.leader_id {
                effects.push(self.append_entries_success(leader));
            }
        }
        Ok(effects)
    }

    /// A leader seeing AppendEntries at its own term is a protocol safety violation: two
    /// leaders were elected in one term.
    pub(super) async fn handle_append_entries_as_leader(
        &mut self,
        req: AppendEntriesRequest<D, R, M>,
    ) -> RaftResult<Vec<Effect<D, R, M>>> {
        if req.term == self.current_term {
            return Err(RaftError::SafetyViolation(format!(
                "two leaders in term {}: {} and {}",
                self.current_term, self.id, req.leader_id
            )));
        }
        // Stale leader from an older term.
        Ok(vec![self.append_entries_failure(req.leader_id, self.log.last_index_term())])
    }

    /// Verify a leader's `prev_log_id` against the log or the snapshot boundary.
    pub(super) async fn check_prev(&mut self, prev: LogId) -> RaftResult<PrevCheck> {
        if prev.index == 0 {
            return Ok(PrevCheck::EntryOk);
        }
        let snapshot = self.log.snapshot_index_term();
        if prev.index < snapshot.index || prev == snapshot {
            // Entries at or below the snapshot are committed; by leader completeness a
            // current leader agrees with them.
            return Ok(PrevCheck::EntryOk);
        }
        match self.log.fetch_term(prev.index).await? {
            Some(term) if term == prev.term => Ok(PrevCheck::EntryOk),
            Some(term) => Ok(PrevCheck::TermMismatch(term)),
            None => Ok(PrevCheck::Missing),
        }
    }

    pub(super) fn append_entries_success(&self, leader: NodeId) -> Effect<D, R, M> {
        let last_written = self.log.last_written();
        Effect::SendMsg {
            target: leader,
            msg: PeerMessage::AppendEntriesResult {
                from: self.id,
                reply: AppendEntriesReply {
                    term: self.current_term,
                    success: true,
                    next_index: last_written.index + 1,
                    last_log_id: last_written,
                },
            },
        }
    }

    pub(super) fn append_entries_failure(&self, leader: NodeId, conflict: LogId) -> Effect<D, R, M> {
        Effect::SendMsg {
            target: leader,
            msg: PeerMessage::AppendEntriesResult {
                from: self.id,
                reply: AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    next_index: conflict.index.saturating_add(1),
                    last_log_id: conflict,
                },
            },
        }
    }
}
