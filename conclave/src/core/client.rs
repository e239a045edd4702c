//! The leader-side client write path.

use std::sync::Arc;

use futures::stream::StreamExt;

use crate::core::LeaderState;
use crate::error::ClientWriteError;
use crate::error::RaftResult;
use crate::network::ClusterNetwork;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::replication::RaftEvent;
use crate::storage::RaftStorage;
use crate::Command;
use crate::CommandResponse;
use crate::LogId;

/// A wrapper around a client command which has been transformed into an Entry, along with its
/// response channel.
pub(super) struct ClientRequestEntry {
    /// The Arc'd entry of the client request.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry>,
    /// The response channel for the request; `None` for internal entries such
    /// as a new leader's blank payload.
    pub tx: Option<ClientWriteResponseTx>,
}

impl<'a, N: ClusterNetwork, S: RaftStorage> LeaderState<'a, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to power, per §8.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let entry = self.append_payload_to_log(EntryPayload::Blank).await?;
        self.core.last_log_id.term = self.core.current_term; // This only ever needs to be updated once per term.

        let cr_entry = ClientRequestEntry {
            entry: Arc::new(entry),
            tx: None,
        };
        self.replicate_client_request(cr_entry).await?;

        Ok(())
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, command, tx))]
    pub(super) async fn handle_client_write_request(&mut self, command: Command, tx: ClientWriteResponseTx) {
        let entry = match self.append_payload_to_log(EntryPayload::Normal(command)).await {
            Ok(entry) => ClientRequestEntry {
                entry: Arc::new(entry),
                tx: Some(tx),
            },
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        if let Err(err) = self.replicate_client_request(entry).await {
            tracing::error!(error=%err, "error while replicating client request");
        }
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> RaftResult<Entry> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id.index = entry.log_id.index;

        self.core.report_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry) -> RaftResult<()> {
        let entry_arc = req.entry.clone();

        if self.nodes.is_empty() {
            // There are no other cluster members, so the payload is committed at once.
            self.core.commit_index = entry_arc.log_id.index;
            self.core.report_metrics();
            self.client_request_post_commit(req).await?;
            return Ok(());
        }

        self.awaiting_committed.push(req);

        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
        Ok(())
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry) -> RaftResult<()> {
        let response = self.apply_entry_to_state_machine(&req.entry).await?;

        if let Some(tx) = req.tx {
            let res = tx.send(Ok(ClientWriteResponse {
                index: req.entry.log_id.index,
                response,
            }));
            if res.is_err() {
                tracing::debug!("client dropped the response channel before commit completed");
            }
        }
        Ok(())
    }

    /// Apply the given log entry to the state machine, applying any
    /// outstanding committed entries which precede it first.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Entry) -> RaftResult<CommandResponse> {
        // Before we can safely apply this entry to the state machine, we need to ensure there is
        // no pending task replicating earlier entries to the state machine. This is an edge case
        // which would only happen once very early in a new leader's term.
        while !self.core.replicate_to_sm_handle.is_empty() {
            match self.core.replicate_to_sm_handle.next().await {
                Some(Ok(replicate_to_sm_result)) => self.core.handle_replicate_to_sm_result(replicate_to_sm_result)?,
                _ => break,
            }
        }

        // Next, ensure that any outstanding applies up to, but not including, the index
        // of the given entry have taken place. This would only ever happen if a node had
        // unapplied logs from before becoming leader.
        let index = entry.log_id.index;
        let expected_next_index = self.core.last_applied.index + 1;
        if index > expected_next_index {
            let entries = self
                .core
                .storage
                .get_log_entries(expected_next_index..index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;

            let mut sm = self.core.fabric.lock().expect("state machine mutex poisoned");
            for outstanding in &entries {
                sm.apply(outstanding);
                self.core.last_applied = outstanding.log_id;
            }
        }

        // Apply this entry to the state machine and return its response.
        let response = {
            let mut sm = self.core.fabric.lock().expect("state machine mutex poisoned");
            sm.apply(entry)
        };
        self.core.last_applied = entry.log_id;
        self.core.report_metrics();
        Ok(response)
    }
}
