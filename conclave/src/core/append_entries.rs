//! AppendEntries RPC handling on the receiving side.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::ClusterNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::storage::RaftStorage;
use crate::MessageSummary;

impl<N: ClusterNetwork, S: RaftStorage> RaftCore<N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    ///
    /// Receiver implementation:
    /// 1. Reply false if `term` is less than node's current `term` (§5.1).
    /// 2. Reply false if log doesn’t contain an entry at `prev_log_index` whose term
    ///    matches `prev_log_term` (§5.3).
    /// 3. If an existing entry conflicts with a new one (same index but different terms), delete the
    ///    existing entry and all that follow it (§5.3).
    /// 4. Append any new entries not already in the log.
    /// 5. If `leader_commit` is greater than node's commit index, set nodes commit index to
    ///    `min(leader_commit, index of last new entry)`.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        // A valid AppendEntries resets the election timeout and (re)establishes the leader.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader.as_ref() != Some(&msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id.clone()));
            report_metrics = true;
        }

        // Transition to follower state if needed.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }

        // Check the consistency of the log: it must contain `prev_log_id` (§5.3).
        let has_prev = msg.prev_log_id.index == 0 || {
            match self
                .storage
                .try_get_log_entry(msg.prev_log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?
            {
                Some(entry) if entry.log_id.term == msg.prev_log_id.term => true,
                Some(_) => {
                    // Conflicting entry at prev index: drop it and its whole suffix,
                    // then point the leader at our new last log for backtracking.
                    self.storage
                        .delete_logs_from(msg.prev_log_id.index..)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    self.last_log_id =
                        self.storage.get_last_log_id().await.map_err(|err| self.map_fatal_storage_error(err))?;
                    false
                }
                None => false,
            }
        };
        if !has_prev {
            tracing::debug!(
                prev_log_id=%msg.prev_log_id,
                last_log_id=%self.last_log_id,
                "AppendEntries RPC prev log entry is missing or conflicting"
            );
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: Some(ConflictOpt {
                    log_id: self.last_log_id,
                }),
            });
        }

        // The log is consistent at prev_log_id; append new entries, skipping
        // duplicates and truncating any conflicting suffix.
        if !msg.entries.is_empty() {
            self.append_log_entries(&msg.entries).await?;
        }

        // If leader_commit is ahead, advance the local commit index and schedule applies.
        if msg.leader_commit > self.commit_index {
            self.commit_index = msg.leader_commit.min(self.last_log_id.index);
            self.replicate_to_state_machine_if_needed();
            report_metrics = true;
        }

        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Append the given entries to the log, handling the three cases of §5.3:
    /// entries already present are skipped, a conflicting entry truncates its
    /// suffix, and everything past the local log is appended.
    #[tracing::instrument(level = "trace", skip(self, entries), fields(entries=%entries.summary()))]
    async fn append_log_entries(&mut self, entries: &[Entry]) -> RaftResult<()> {
        let mut start = None;
        for (offset, entry) in entries.iter().enumerate() {
            match self
                .storage
                .try_get_log_entry(entry.log_id.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?
            {
                Some(existing) if existing.log_id.term == entry.log_id.term => continue,
                Some(existing) => {
                    tracing::debug!(
                        existing=%existing.log_id, new=%entry.log_id,
                        "found conflicting entry, truncating local suffix"
                    );
                    self.storage
                        .delete_logs_from(entry.log_id.index..)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    start = Some(offset);
                    break;
                }
                None => {
                    start = Some(offset);
                    break;
                }
            }
        }

        if let Some(offset) = start {
            let to_append: Vec<&Entry> = entries[offset..].iter().collect();
            self.storage.append_to_log(&to_append).await.map_err(|err| self.map_fatal_storage_error(err))?;
        }
        self.last_log_id = self.storage.get_last_log_id().await.map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(())
    }
}
