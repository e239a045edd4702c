//! Vote request & response handling.

use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::ClusterNetwork;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::storage::RaftStorage;
use crate::MessageSummary;
use crate::NodeId;

impl<N: ClusterNetwork, S: RaftStorage> RaftCore<N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    ///
    /// Receiver implementation:
    /// 1. Reply false if `term` is less than receiver's current `term` (§5.1).
    /// 2. If receiver has not voted for another candidate this term, and
    ///    candidate's log is at least as up-to-date as receiver's log, grant
    ///    vote (§5.2, §5.4). The vote is persisted before the reply goes out.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        tracing::debug!({candidate=%msg.candidate_id, self.current_term, rpc_term=msg.term}, "start handle_vote_request");

        // If candidate's current term is less than this nodes current term, reject.
        if msg.term < self.current_term {
            tracing::debug!({candidate=%msg.candidate_id, self.current_term, rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // If the candidate's term is newer, update this node's term and step
        // down if we were leading or campaigning.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // Check if candidate's log is at least as up-to-date as this node's.
        // If candidate's log is not at least as up-to-date as this node, then reject.
        let client_is_uptodate = (msg.last_log_term > self.last_log_id.term)
            || ((msg.last_log_term == self.last_log_id.term) && (msg.last_log_index >= self.last_log_id.index));
        if !client_is_uptodate {
            tracing::debug!(
                {candidate=%msg.candidate_id},
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Candidate's log is up-to-date so handle voting conditions.
        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            None => {
                self.voted_for = Some(msg.candidate_id.clone());
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                tracing::debug!({candidate=%msg.candidate_id}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, N: ClusterNetwork, S: RaftStorage> CandidateState<'a, N, S> {
    /// Build a future of vote requests sent to all other cluster members.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_members = self.core.membership.clone();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));
        for member in all_members.into_iter().filter(|member| member != &self.core.id) {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id.clone(),
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(member.clone(), rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => {
                            tracing::warn!({error=%err, peer=%member}, "error while requesting vote from peer");
                        }
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer")),
            );
        }
        rx
    }
}
