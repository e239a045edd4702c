//! Leader-side handling of events coming from the replication streams.

use crate::core::LeaderState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::ClusterNetwork;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::storage::RaftStorage;
use crate::LogId;
use crate::NodeId;

impl<'a, N: ClusterNetwork, S: RaftStorage> LeaderState<'a, N, S> {
    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) {
        let res = match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => self.handle_update_match_index(target, matched).await,
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return;
            }
        };
        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// Handle events from a replication stream which updates the target node's match index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        match self.nodes.get_mut(&target) {
            Some(state) => state.matched = matched,
            None => {
                tracing::warn!(peer=%target, "received match index update for unknown replication stream");
                return Ok(());
            }
        }

        // Compute the highest index replicated on a majority, counting this
        // node's own log as one voter.
        let mut indexes: Vec<u64> = self.nodes.values().map(|state| state.matched.index).collect();
        indexes.push(self.core.last_log_id.index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let majority = quorum::majority_of(self.core.membership.len());
        let new_commit_index = indexes[majority - 1];

        if new_commit_index <= self.core.commit_index {
            return Ok(());
        }

        // A leader may only advance the commit index by counting replicas of
        // entries from its own term (§5.4.2); earlier-term entries commit
        // implicitly once a current-term entry does.
        let entry = self
            .core
            .storage
            .try_get_log_entry(new_commit_index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        let entry_term = match entry {
            Some(entry) => entry.log_id.term,
            None => return Ok(()),
        };
        if entry_term != self.core.current_term {
            tracing::debug!(
                index = new_commit_index,
                entry_term,
                current_term = self.core.current_term,
                "not committing entry of earlier term by replica counting"
            );
            return Ok(());
        }

        self.core.commit_index = new_commit_index;

        // Notify all replication streams of the new commit index, so that
        // heartbeats propagate it promptly.
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::UpdateCommitIndex {
                    commit_index: new_commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }

        // Apply and respond to all awaiting requests which are now committed.
        // Requests are buffered in index order, so the committed set is a prefix.
        while self
            .awaiting_committed
            .first()
            .map(|request| request.entry.log_id.index <= new_commit_index)
            .unwrap_or(false)
        {
            let request = self.awaiting_committed.remove(0);
            self.client_request_post_commit(request).await?;
        }
        self.core.report_metrics();
        Ok(())
    }

    /// Handle events from replication streams for when this node needs to revert to follower state.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn handle_revert_to_follower(&mut self, _target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }
}
