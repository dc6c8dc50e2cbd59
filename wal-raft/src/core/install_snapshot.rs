//! Snapshot installation on a follower (§7).

use std::collections::BTreeMap;

use super::Effect;
use super::NodeState;
use super::PeerState;
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::raft::InstallSnapshotReply;
use crate::raft::InstallSnapshotRequest;
use crate::raft::PeerMessage;
use crate::AppData;
use crate::AppDataResponse;
use crate::MachineState;

impl<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> NodeState<D, R, M, L> {
    /// Replace the log and state machine with the leader's snapshot.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id=self.id, leader=req.leader_id, covered=%req.meta.last_log_id))]
    pub(super) async fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<M>,
    ) -> RaftResult<Vec<Effect<D, R, M>>> {
        if req.term < self.current_term {
            return Ok(vec![Effect::SendMsg {
                target: req.leader_id,
                msg: PeerMessage::InstallSnapshotResult {
                    from: self.id,
                    reply: InstallSnapshotReply {
                        term: self.current_term,
                        last_index: 0,
                    },
                },
            }]);
        }
        self.leader_id = Some(req.leader_id);

        let meta = req.meta;
        let last = meta.last_log_id;
        self.log.write_snapshot(meta.clone(), &req.machine).await?;
        self.machine = req.machine;
        self.commit_index = last.index;
        self.last_applied = last.index;

        // The snapshot carries the authoritative membership at its boundary.
        self.cluster = meta.members.into_iter().map(|nid| (nid, PeerState::default())).collect::<BTreeMap<_, _>>();
        self.cluster_index_term = last;
        self.previous_cluster = None;

        tracing::info!(id = self.id, covered = %last, "installed snapshot");
        Ok(vec![Effect::SendMsg {
            target: req.leader_id,
            msg: PeerMessage::InstallSnapshotResult {
                from: self.id,
                reply: InstallSnapshotReply {
                    term: self.current_term,
                    last_index: last.index,
                },
            },
        }])
    }
}
