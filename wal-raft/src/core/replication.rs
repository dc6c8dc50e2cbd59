//! Leader-side replication: reply reconciliation, quorum commit, pipelining.

use super::Effect;
use super::NodeState;
use super::Role;
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::quorum;
use crate::raft::AppendEntriesReply;
use crate::raft::AppendEntriesRequest;
use crate::raft::InstallSnapshotReply;
use crate::raft::InstallSnapshotRequest;
use crate::raft::PeerMessage;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::NodeId;

/// What the leader should send a peer next.
enum Replicate<D: AppData, R: AppDataResponse, M: MachineState> {
    Rpc(AppendEntriesRequest<D, R, M>),
    Snapshot(PeerMessage<D, R, M>),
    Nothing,
}

impl<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> NodeState<D, R, M, L> {
    /// Handle a follower's AppendEntries reply.
    #[tracing::instrument(level = "debug", skip(self, reply), fields(id=self.id, from, success=reply.success))]
    pub(super) async fn handle_append_entries_reply(
        &mut self,
        from: NodeId,
        reply: AppendEntriesReply,
    ) -> RaftResult<Vec<Effect<D, R, M>>> {
        if reply.term < self.current_term {
            return Ok(Vec::new());
        }
        if !self.cluster.contains_key(&from) {
            tracing::warn!(id = self.id, from, "append entries reply from unknown peer, ignoring");
            return Ok(Vec::new());
        }

        if reply.success {
            let peer = self.cluster.get_mut(&from).expect("peer checked above");
            peer.match_index = peer.match_index.max(reply.last_log_id.index);
            peer.next_index = peer.next_index.max(reply.next_index);
            return self.evaluate_commit().await;
        }

        // Reconcile `next_index` from the conflict information.
        let conflict = reply.last_log_id;
        let matches_here = self.log.fetch_term(conflict.index).await? == Some(conflict.term);
        let peer = self.cluster.get_mut(&from).expect("peer checked above");
        if matches_here && conflict.index >= peer.match_index {
            // The follower's tail agrees with us up to `conflict`; jump straight there.
            peer.match_index = conflict.index;
            peer.next_index = reply.next_index.max(conflict.index + 1);
        } else if conflict.index < peer.match_index {
            // The follower reports less than we believed it had. Conservative reset; see the
            // design notes on possible demotion instead.
            tracing::warn!(id = self.id, from, reported = conflict.index, believed = peer.match_index, "peer regressed");
            peer.match_index = conflict.index;
            peer.next_index = conflict.index + 1;
        } else {
            peer.next_index = peer.next_index.saturating_sub(1).min(conflict.index).max(peer.match_index).max(1);
        }

        // Retry the peer immediately rather than waiting out a heartbeat interval.
        match self.build_replication(from).await? {
            Replicate::Rpc(rpc) => Ok(vec![Effect::SendRpcs {
                urgent: true,
                rpcs: vec![(from, rpc)],
            }]),
            Replicate::Snapshot(msg) => Ok(vec![Effect::SendMsg { target: from, msg }]),
            Replicate::Nothing => Ok(Vec::new()),
        }
    }

    /// Handle a follower's InstallSnapshot reply.
    #[tracing::instrument(level = "debug", skip(self, reply), fields(id=self.id, from))]
    pub(super) async fn handle_install_snapshot_reply(
        &mut self,
        from: NodeId,
        reply: InstallSnapshotReply,
    ) -> RaftResult<Vec<Effect<D, R, M>>> {
        if reply.term < self.current_term || reply.last_index == 0 {
            return Ok(Vec::new());
        }
        match self.cluster.get_mut(&from) {
            Some(peer) => {
                peer.match_index = peer.match_index.max(reply.last_index);
                peer.next_index = peer.next_index.max(reply.last_index + 1);
                self.evaluate_commit().await
            }
            None => {
                tracing::warn!(id = self.id, from, "install snapshot reply from unknown peer, ignoring");
                Ok(Vec::new())
            }
        }
    }

    /// The leader's own log advanced durably: the self contribution to the quorum moved.
    pub(super) async fn handle_leader_written(&mut self) -> RaftResult<Vec<Effect<D, R, M>>> {
        self.evaluate_commit().await
    }

    /// Re-evaluate the commit index from the quorum of durable indexes (§5.3, §5.4.2).
    ///
    /// The candidate commit index is the majority-th largest of the peers' match indexes plus
    /// this node's own durable high-water mark. It only takes effect if the entry there is
    /// from the current term; earlier-term entries commit indirectly. The leader's own value
    /// participates even while the leader is being removed, so that the removal itself can
    /// commit.
    pub(super) async fn evaluate_commit(&mut self) -> RaftResult<Vec<Effect<D, R, M>>> {
        let mut values: Vec<u64> = self
            .cluster
            .iter()
            .filter(|(nid, _)| **nid != self.id)
            .map(|(_, peer)| peer.match_index)
            .collect();
        values.push(self.log.last_written().index);
        values.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = values[quorum::majority_of(values.len()) - 1];

        if candidate <= self.commit_index {
            return Ok(Vec::new());
        }
        if self.log.fetch_term(candidate).await? != Some(self.current_term) {
            tracing::trace!(id = self.id, candidate, "quorum index is from a prior term, not committing");
            return Ok(Vec::new());
        }

        tracing::debug!(id = self.id, from = self.commit_index, to = candidate, "advancing commit index");
        self.commit_index = candidate;
        let mut effects = self.apply_to(candidate).await?;
        // Propagate the new commit index without waiting for the next heartbeat.
        effects.extend(self.pipeline_append_entries(false).await?);

        if !self.cluster.contains_key(&self.id) && self.cluster_index_term.index <= self.commit_index {
            tracing::info!(id = self.id, "own removal committed, stopping");
            self.role = Role::Stop;
        }
        Ok(effects)
    }

    /// Build and dispatch AppendEntries to every peer, carrying whatever their `next_index`
    /// calls for. Doubles as the heartbeat.
    pub(super) async fn pipeline_append_entries(&mut self, urgent: bool) -> RaftResult<Vec<Effect<D, R, M>>> {
        let mut rpcs = Vec::new();
        let mut effects = Vec::new();
        for peer in self.peers() {
            match self.build_replication(peer).await? {
                Replicate::Rpc(rpc) => rpcs.push((peer, rpc)),
                Replicate::Snapshot(msg) => effects.push(Effect::SendMsg { target: peer, msg }),
                Replicate::Nothing => {}
            }
        }
        if !rpcs.is_empty() {
            effects.push(Effect::SendRpcs { urgent, rpcs });
        }
        Ok(effects)
    }

    /// Build the next payload for one peer: entries from its `next_index`, or a snapshot when
    /// the log below `next_index` is gone. Advances `next_index` optimistically; failure
    /// replies rewind it.
    async fn build_replication(&mut self, target: NodeId) -> RaftResult<Replicate<D, R, M>> {
        let peer = match self.cluster.get(&target) {
            Some(peer) => *peer,
            None => return Ok(Replicate::Nothing),
        };
        let snapshot = self.log.snapshot_index_term();

        if peer.next_index <= snapshot.index {
            return match self.log.read_snapshot().await? {
                Some((meta, machine)) => Ok(Replicate::Snapshot(PeerMessage::InstallSnapshot(
                    InstallSnapshotRequest {
                        term: self.current_term,
                        leader_id: self.id,
                        meta,
                        machine,
                    },
                ))),
                None => {
                    tracing::error!(id = self.id, target, "peer needs a snapshot but none exists");
                    Ok(Replicate::Nothing)
                }
            };
        }

        let prev_index = peer.next_index - 1;
        let prev_term = match self.log.fetch_term(prev_index).await? {
            Some(term) => term,
            None => {
                tracing::error!(id = self.id, target, prev_index, "prev entry missing from own log");
                return Ok(Replicate::Nothing);
            }
        };

        let last = self.log.last_index_term().index;
        let entries = if peer.next_index <= last {
            let to = last.min(peer.next_index + self.config.max_append_entries - 1);
            self.log.take(peer.next_index, to).await?
        } else {
            Vec::new()
        };
        if let Some(last_entry) = entries.last() {
            if let Some(peer) = self.cluster.get_mut(&target) {
                peer.next_index = last_entry.log_id.index + 1;
            }
        }

        Ok(Replicate::Rpc(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_id: LogId::new(prev_term, prev_index),
            entries,
            leader_commit: self.commit_index,
        }))
    }
}
