//! RequestVote handling, both sides.

use super::Effect;
use super::NodeState;
use crate::error::RaftResult;
use crate::log::LogStore;
use crate::raft::PeerMessage;
use crate::raft::VoteReply;
use crate::raft::VoteRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::MachineState;
use crate::NodeId;

impl<D: AppData, R: AppDataResponse, M: MachineState, L: LogStore<D, R, M>> NodeState<D, R, M, L> {
    /// Handle a RequestVote (§5.2, §5.4).
    ///
    /// By the time this runs the universal term rule has already absorbed any higher term, so
    /// `req.term <= current_term` holds.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id=self.id, candidate=req.candidate_id, term=req.term))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<Vec<Effect<D, R, M>>> {
        if req.term < self.current_term {
            tracing::debug!(id = self.id, "rejecting vote request from stale term");
            return Ok(vec![self.vote_reply(req.candidate_id, false)]);
        }

        // Leaders and candidates never grant a vote at their own term; a candidate has
        // already voted for itself.
        if self.role.is_leader() || self.role.is_candidate() {
            return Ok(vec![self.vote_reply(req.candidate_id, false)]);
        }

        // At most one vote per term (§5.4.1).
        if let Some(voted_for) = self.voted_for {
            if voted_for != req.candidate_id {
                tracing::debug!(id = self.id, voted_for, "already voted in this term");
                return Ok(vec![self.vote_reply(req.candidate_id, false)]);
            }
        }

        // Grant only if the candidate's log is at least as up-to-date as ours (§5.4.2).
        let last = self.log.last_index_term();
        let up_to_date = req.last_log_id.term > last.term
            || (req.last_log_id.term == last.term && req.last_log_id.index >= last.index);
        if !up_to_date {
            tracing::debug!(id = self.id, ours = %last, theirs = %req.last_log_id, "candidate log not up-to-date");
            return Ok(vec![self.vote_reply(req.candidate_id, false)]);
        }

        // Persist the vote before the grant leaves this node.
        self.voted_for = Some(req.candidate_id);
        self.persist_meta().await?;
        tracing::debug!(id = self.id, candidate = req.candidate_id, term = self.current_term, "vote granted");
        Ok(vec![self.vote_reply(req.candidate_id, true)])
    }

    /// Tally a vote as a candidate; a majority makes this node leader.
    #[tracing::instrument(level = "debug", skip(self, reply), fields(id=self.id, from, granted=reply.vote_granted))]
    pub(super) async fn handle_vote_result(&mut self, from: NodeId, reply: VoteReply) -> RaftResult<Vec<Effect<D, R, M>>> {
        if reply.term != self.current_term || !reply.vote_granted {
            return Ok(Vec::new());
        }
        if !self.cluster.contains_key(&from) {
            tracing::warn!(id = self.id, from, "vote from a node outside the cluster, ignoring");
            return Ok(Vec::new());
        }
        self.votes.insert(from);
        if self.votes.len() >= self.vote_majority() {
            return self.become_leader().await;
        }
        Ok(Vec::new())
    }

    fn vote_reply(&self, candidate: NodeId, vote_granted: bool) -> Effect<D, R, M> {
        Effect::SendMsg {
            target: candidate,
            msg: PeerMessage::RequestVoteResult {
                from: self.id,
                reply: VoteReply {
                    term: self.current_term,
                    vote_granted,
                },
            },
        }
    }
}
