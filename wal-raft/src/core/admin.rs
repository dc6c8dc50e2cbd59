//! Cluster membership changes.
//!
//! A membership change takes effect on every node the moment it enters the log, not when it
//! commits: a new leader must replicate to the configuration it finds in its log. The prior
//! cluster is retained for rollback in case the entry is overwritten on a follower. Only
//! single-server additions and removals are permitted; `cluster_change_permitted` blocks a
//! second change until the gate-opening entry (the leader's initial-term noop, or the change
//! itself) applies.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use super::CommandRejected;
use super::Effect;
use super::NodeState;
use super::PeerState;
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::raft::Command;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MachineState;
use crate::NodeId;

impl<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> NodeState<D, R, M, L> {
    /// Handle a membership-change command as leader.
    #[tracing::instrument(level = "debug", skip(self, cmd), fields(id=self.id))]
    pub(super) async fn handle_cluster_change_command(
        &mut self,
        cmd: Command<D, R, M>,
    ) -> RaftResult<Vec<Effect<D, R, M>>> {
        let (from, mode, members) = match &cmd {
            Command::ClusterChange { from, members, mode } => (*from, Some(*mode), members.clone()),
            _ => return Ok(Vec::new()),
        };

        if let Err(rejected) = self.validate_cluster_change(&members) {
            return Ok(self.reply_with_rejection(from, mode, rejected));
        }

        if !self.cluster_change_permitted {
            tracing::debug!(id = self.id, "membership change deferred until the current gate opens");
            self.pending_cluster_changes.push_back(cmd);
            return Ok(Vec::new());
        }

        let log_id = LogId::new(self.current_term, self.log.next_index());
        self.adopt_cluster(members, log_id);
        self.append_command(cmd).await
    }

    /// Only single-server changes of a non-empty cluster are permitted.
    pub(super) fn validate_cluster_change(&self, members: &BTreeSet<NodeId>) -> Result<(), CommandRejected> {
        if members.is_empty() {
            return Err(CommandRejected::InoperableConfig);
        }
        let current = self.members();
        if current.symmetric_difference(members).count() > 1 {
            return Err(CommandRejected::NotSingleStep);
        }
        Ok(())
    }

    /// Switch to a new membership, stashing the old one for rollback. Existing peers keep
    /// their replication state; joining peers start from scratch.
    pub(super) fn adopt_cluster(&mut self, members: BTreeSet<NodeId>, log_id: LogId) {
        tracing::info!(id = self.id, ?members, %log_id, "adopting cluster configuration");
        self.previous_cluster = Some((self.cluster_index_term, self.cluster.clone()));
        let next_index = self.log.next_index();
        let mut cluster = BTreeMap::new();
        for nid in members {
            let peer = self.cluster.get(&nid).copied().unwrap_or(PeerState {
                match_index: 0,
                next_index,
            });
            cluster.insert(nid, peer);
        }
        self.cluster = cluster;
        self.cluster_index_term = log_id;
        self.cluster_change_permitted = false;
    }

    /// Roll back to the cluster in force before the latest change entry. Invoked on a
    /// follower when that entry is overwritten by a new leader.
    pub(super) fn revert_cluster(&mut self) {
        if let Some((log_id, cluster)) = self.previous_cluster.take() {
            tracing::info!(id = self.id, %log_id, "reverting overwritten cluster change");
            self.cluster = cluster;
            self.cluster_index_term = log_id;
        }
    }
}
