//! The await-condition role.
//!
//! A node suspends normal processing in two situations: its log has a gap the leader must
//! walk back to fill, or the WAL sink went down underneath it. While suspended, only the
//! condition predicate looks at incoming messages; a message that satisfies it is re-dispatched
//! through the follower handlers. RequestVote always falls back to follower so elections are
//! never starved, an election timeout still starts a campaign, and the await-condition timeout
//! reverts to follower unconditionally.

use super::append_entries::PrevCheck;
use super::Effect;
use super::NodeState;
use super::Role;
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::raft::NodeMsg;
use crate::AppData;
use crate::AppDataResponse;
use crate::MachineState;
use crate::MessageSummary;

/// The predicate a suspended node waits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    /// Waiting for an AppendEntries whose `prev` matches our log, or for a snapshot covering
    /// the gap.
    CatchUp,
    /// Waiting for the WAL sink to come back.
    WalDown,
}

impl<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> NodeState<D, R, M, L> {
    pub(super) async fn handle_as_await(&mut self, msg: NodeMsg<D, R, M>) -> RaftResult<Vec<Effect<D, R, M>>> {
        match &msg {
            NodeMsg::RequestVote(_) => {
                self.become_follower();
                return Ok(vec![Effect::NextEvent(Box::new(msg))]);
            }
            NodeMsg::ElectionTimeout => return self.become_candidate().await,
            NodeMsg::AwaitConditionTimeout => {
                tracing::debug!(id = self.id, "await-condition timed out, reverting to follower");
                self.become_follower();
                return Ok(Vec::new());
            }
            _ => {}
        }

        if self.condition_met(&msg).await? {
            tracing::debug!(id = self.id, msg = %msg.summary(), "await condition satisfied");
            self.become_follower();
            return Ok(vec![Effect::NextEvent(Box::new(msg))]);
        }
        tracing::trace!(id = self.id, msg = %msg.summary(), "message does not satisfy condition, dropping");
        Ok(Vec::new())
    }

    async fn condition_met(&mut self, msg: &NodeMsg<D, R, M>) -> RaftResult<bool> {
        match self.condition {
            Some(Condition::WalDown) => Ok(self.log.is_open()),
            Some(Condition::CatchUp) => match msg {
                NodeMsg::AppendEntries(req) => {
                    Ok(self.check_prev(req.prev_log_id).await? == PrevCheck::EntryOk)
                }
                NodeMsg::InstallSnapshot(_) => Ok(true),
                _ => Ok(false),
            },
            None => Ok(true),
        }
    }
}
