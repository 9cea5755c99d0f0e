use super::{with_timeout, Replica};
use crate::actor::WeakActorClient;
use crate::api::{CompactError, RaftEvent};
use crate::commitlog::{index_or_zero, Index, Log};
use crate::replica::cluster::{ClusterConfiguration, ReplicaId};
use crate::replica::election::SnapshotTransfer;
use crate::replica::local_state::PersistentLocalState;
use crate::replica::replica_api::{
    InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer, RpcError,
};
use crate::replica::write_ahead_log::RaftLogEntry;
use crate::snapshot::{ChunkOutcome, PendingSnapshot, Snapshot, SnapshotMeta};
use crate::transport::PeerClient;
use std::cmp;
use std::io;
use std::sync::Arc;
use tokio::time::Duration;

impl<L, S> Replica<L, S>
where
    L: Log<RaftLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    // ------- Leader side --------

    /// Streams our latest snapshot to a peer that needs entries we've compacted away. One chunk
    /// is in flight at a time.
    pub(super) fn send_snapshot_chunk(&mut self, peer_id: &ReplicaId) {
        let needs_load = match self
            .election_state
            .leader_state()
            .and_then(|tracker| tracker.peer_state(peer_id))
        {
            Some(peer_state) => peer_state.snapshot_transfer.is_none(),
            None => return,
        };
        if needs_load {
            let snapshot = match self.snapshot_store.latest() {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => {
                    slog::error!(self.logger, "{:?} needs compacted entries, but we have no snapshot", peer_id);
                    return;
                }
                Err(ioe) => {
                    self.fail(format!("Failed to load snapshot: {}", ioe));
                    return;
                }
            };
            slog::info!(self.logger, "Sending snapshot {:?} to {:?}", snapshot.meta.index, peer_id);
            if let Some(peer_state) = self
                .election_state
                .leader_state_mut()
                .and_then(|tracker| tracker.peer_state_mut(peer_id))
            {
                peer_state.snapshot_transfer.replace(SnapshotTransfer {
                    snapshot,
                    next_chunk: 0,
                    in_flight: false,
                });
            }
        }

        let peer_client = self.peer_client(peer_id);
        let term = self.current_term();
        let chunk_size = self.options.snapshot_chunk_size_bytes;
        let rpc_timeout = self.rpc_timeout();

        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.peer_state_mut(peer_id))
        {
            Some(peer_state) => peer_state,
            None => return,
        };
        let transfer = match peer_state.snapshot_transfer.as_mut() {
            Some(transfer) if !transfer.in_flight => transfer,
            _ => return,
        };
        let (chunk, is_last) = match transfer.snapshot.chunk(transfer.next_chunk, chunk_size) {
            Some(chunk) => chunk,
            None => {
                transfer.next_chunk = 0;
                return;
            }
        };
        transfer.in_flight = true;
        let input = InstallSnapshotInput {
            leader_term: term,
            leader_id: self.my_replica_id.clone(),
            meta: transfer.snapshot.meta.clone(),
            chunk_index: transfer.next_chunk,
            chunk,
            is_last,
        };
        peer_state.reset_heartbeat_timer();

        tokio::task::spawn(Self::call_peer_install_snapshot(
            self.logger.new(slog::o!("Peer" => peer_id.to_string())),
            peer_client,
            peer_id.clone(),
            input,
            rpc_timeout,
            self.actor_client.clone(),
        ));
    }

    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        peer_id: ReplicaId,
        input: InstallSnapshotInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
    ) {
        let term = input.leader_term;
        let snapshot_index = input.meta.index;
        let chunk_index = input.chunk_index;
        let is_last = input.is_last;

        let result = with_timeout(rpc_timeout, peer_client.install_snapshot(input)).await;
        slog::debug!(logger, "ClientWire - InstallSnapshot chunk {}: {:?}", chunk_index, result);

        callback
            .notify_install_snapshot_reply_from_peer(InstallSnapshotReplyFromPeer {
                peer_id,
                term,
                snapshot_index,
                chunk_index,
                is_last,
                result,
            })
            .await;
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let current_term = self.current_term();
        if reply.term != current_term {
            return;
        }
        if let Ok(output) = &reply.result {
            if output.term > current_term && self.step_down_if_term_increased(output.term) {
                return;
            }
        }

        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.peer_state_mut(&reply.peer_id))
        {
            Some(peer_state) => peer_state,
            None => return,
        };
        if reply.result.is_ok() {
            peer_state.record_contact();
        }
        let transfer = match peer_state.snapshot_transfer.as_mut() {
            Some(transfer) if transfer.snapshot.meta.index == reply.snapshot_index => transfer,
            _ => return,
        };
        transfer.in_flight = false;

        let installed = match reply.result {
            Err(e) => {
                // Resend on the next heartbeat.
                slog::debug!(self.logger, "InstallSnapshot to {:?} failed: {}", reply.peer_id, e);
                return;
            }
            Ok(output) if output.success => {
                transfer.next_chunk = reply.chunk_index + 1;
                reply.is_last
            }
            Ok(_) => {
                slog::info!(self.logger, "{:?} rejected snapshot chunk {}, restarting", reply.peer_id, reply.chunk_index);
                transfer.next_chunk = 0;
                false
            }
        };

        if installed {
            peer_state.on_snapshot_installed(reply.snapshot_index);
            slog::info!(self.logger, "{:?} installed snapshot {:?}", reply.peer_id, reply.snapshot_index);
            self.advance_commit_index();
            self.check_transfer_progress();
            self.check_promotion();
        }

        self.replicate_to_peer(&reply.peer_id);
    }

    // ------- Follower side --------

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, RpcError> {
        if self.election_state.is_inactive() {
            return Err(RpcError::Inactive);
        }

        match self.try_handle_install_snapshot(input) {
            Ok(output) => Ok(output),
            Err(ioe) => {
                let message = ioe.to_string();
                self.fail(format!("Failed to install snapshot: {}", ioe));
                Err(RpcError::ServerFault(message))
            }
        }
    }

    fn try_handle_install_snapshot(&mut self, input: InstallSnapshotInput) -> Result<InstallSnapshotOutput, io::Error> {
        if input.leader_term < self.current_term() {
            return Ok(self.install_snapshot_output(false));
        }
        self.follow_leader(input.leader_term, &input.leader_id)?;

        let meta = input.meta;
        if matches!(self.raft_log.snapshot_boundary(), Some((_, si)) if si >= meta.index) {
            self.pending_snapshot = None;
            return Ok(self.install_snapshot_output(true));
        }

        if input.chunk_index == 0 {
            self.pending_snapshot.replace(PendingSnapshot::new(
                meta.clone(),
                input.leader_term,
                input.leader_id.clone(),
            ));
        }
        let pending = match self.pending_snapshot.as_mut() {
            Some(pending) if pending.is_for(&meta) => pending,
            _ => return Ok(self.install_snapshot_output(false)),
        };
        match pending.accept_chunk(input.chunk_index, &input.chunk) {
            ChunkOutcome::Accepted => {}
            ChunkOutcome::Duplicate => return Ok(self.install_snapshot_output(true)),
            ChunkOutcome::OutOfOrder { expected } => {
                slog::debug!(
                    self.logger,
                    "Snapshot chunk {} out of order, expected {}",
                    input.chunk_index,
                    expected
                );
                return Ok(self.install_snapshot_output(false));
            }
            ChunkOutcome::Oversized => {
                self.pending_snapshot = None;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("snapshot {:?} chunk {} runs past its advertised size", meta.index, input.chunk_index),
                ));
            }
        }

        if input.is_last {
            if let Some(pending) = self.pending_snapshot.take() {
                self.install_snapshot(pending.finish()?)?;
            }
        }

        Ok(self.install_snapshot_output(true))
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), io::Error> {
        let meta = snapshot.meta.clone();
        self.snapshot_store.store(snapshot)?;

        let kept_suffix = self.raft_log.install_snapshot_boundary(meta.term, meta.index)?;
        if !kept_suffix {
            self.configurations.truncate_from(meta.index.plus(1));
        }
        self.configurations.reset_to_snapshot(
            meta.index,
            ClusterConfiguration::new(meta.configuration_version, meta.configuration.clone()),
        );

        slog::info!(self.logger, "Installed snapshot at ({:?}, {:?})", meta.term, meta.index);
        self.event_publisher.publish(RaftEvent::SnapshotInstalled(meta));
        self.refresh_role();
        Ok(())
    }

    /// A partial snapshot only completes if the leader that started it keeps leading us in the
    /// same term. Called after every role or leader change.
    pub(super) fn discard_stale_pending_snapshot(&mut self) {
        let stale = match &self.pending_snapshot {
            Some(pending) => !pending.is_from(self.current_term(), self.election_state.leader().as_ref()),
            None => false,
        };
        if stale {
            self.discard_pending_snapshot("its leader is gone");
        }
    }

    /// Plain replication already brought our log past the snapshot being streamed.
    pub(super) fn discard_pending_snapshot_covered_by(&mut self, latest_index: Option<Index>) {
        let covered = match (&self.pending_snapshot, latest_index) {
            (Some(pending), Some(latest)) => latest >= pending.index(),
            _ => false,
        };
        if covered {
            self.discard_pending_snapshot("the log caught up past it");
        }
    }

    fn discard_pending_snapshot(&mut self, reason: &str) {
        if let Some(pending) = self.pending_snapshot.take() {
            slog::info!(
                self.logger,
                "Dropping partial snapshot {:?}, {}. Election state: {:?}",
                pending.index(),
                reason,
                self.election_state
            );
        }
    }

    fn install_snapshot_output(&self, success: bool) -> InstallSnapshotOutput {
        InstallSnapshotOutput {
            term: self.current_term(),
            success,
        }
    }

    // ------- Compaction --------

    pub(crate) fn handle_compact(&mut self, up_to: Option<Index>) -> Result<SnapshotMeta, CompactError> {
        if self.election_state.is_inactive() {
            return Err(CompactError::Inactive);
        }

        if self.snapshot_transfer_in_progress() {
            return Err(CompactError::SnapshotTransferInProgress);
        }

        let applied = match self.raft_log.last_applied_index() {
            Some(applied) => applied,
            None => return Err(CompactError::NothingToCompact),
        };
        let target = match up_to {
            Some(up_to) => cmp::min(up_to, applied),
            None => applied,
        };
        if matches!(self.raft_log.snapshot_boundary(), Some((_, si)) if target <= si) {
            return Err(CompactError::NothingToCompact);
        }

        self.compact_to(target)
    }

    /// Compacts once enough entries have been applied past the last snapshot.
    pub(super) fn maybe_auto_compact(&mut self) {
        let threshold = match self.options.snapshot_entry_threshold {
            Some(threshold) => threshold,
            None => return,
        };
        let applied = match self.raft_log.last_applied_index() {
            Some(applied) => applied,
            None => return,
        };
        let snapshot_index = index_or_zero(self.raft_log.snapshot_boundary().map(|(_, index)| index));
        if applied.as_u64() - snapshot_index < threshold || self.snapshot_transfer_in_progress() {
            return;
        }

        match self.compact_to(applied) {
            Ok(meta) => slog::info!(self.logger, "Auto-compacted up to {:?}", meta.index),
            Err(e) => slog::warn!(self.logger, "Auto-compaction failed: {}", e),
        }
    }

    fn snapshot_transfer_in_progress(&self) -> bool {
        let sending = self
            .election_state
            .leader_state()
            .map(|tracker| tracker.any_snapshot_transfer())
            .unwrap_or(false);
        sending || self.pending_snapshot.is_some()
    }

    /// Snapshots everything up to `target` (which must be applied) and discards it from the log.
    fn compact_to(&mut self, target: Index) -> Result<SnapshotMeta, CompactError> {
        let term = match self.raft_log.term_at(target) {
            Ok(Some(term)) => term,
            Ok(None) => return Err(CompactError::NothingToCompact),
            Err(ioe) => {
                self.fail(format!("Failed to read entry {:?} for compaction: {}", target, ioe));
                return Err(CompactError::LocalIoError(ioe));
            }
        };
        let data = self
            .snapshot_source
            .snapshot_data(target, term)
            .map_err(CompactError::SnapshotSource)?;
        let (configuration, configuration_version) = match self.configurations.at(target) {
            Some(c) => (c.members().to_vec(), c.version()),
            None => (Vec::new(), None),
        };

        let snapshot = Snapshot::new(target, term, configuration, configuration_version, data);
        let meta = snapshot.meta.clone();
        if let Err(ioe) = self.store_and_compact(snapshot, target) {
            self.fail(format!("Failed to compact up to {:?}: {}", target, ioe));
            return Err(CompactError::LocalIoError(ioe));
        }
        self.configurations.compact_to(target);

        Ok(meta)
    }

    // Snapshot must be durable before the entries it covers go away.
    fn store_and_compact(&mut self, snapshot: Snapshot, target: Index) -> Result<(), io::Error> {
        self.snapshot_store.store(snapshot)?;
        self.raft_log.compact(target)
    }
}

#[cfg(test)]
mod tests {
    use crate::api::{
        CompactError, RaftEvent, RaftEventKind, RaftNode, RaftNodeConfig, RaftOptions, RaftRole, RaftTransport,
    };
    use crate::commitlog::Index;
    use crate::replica::{
        AppendEntriesInput, InstallSnapshotInput, RaftLogEntry, ReplicaId, RpcError, Term,
    };
    use crate::snapshot::SnapshotMeta;
    use crate::transport::{LocalNetwork, PeerClient, PeerConnector};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::time::{Duration, Instant};

    const HEARTBEAT: Duration = Duration::from_millis(50);
    // Far ahead of anything a fresh single node reaches on its own.
    const IMPOSTOR_TERM: u64 = 50;

    fn options() -> RaftOptions {
        RaftOptions {
            leader_heartbeat_duration: Some(HEARTBEAT),
            follower_min_timeout: Some(HEARTBEAT * 6),
            follower_max_timeout: Some(HEARTBEAT * 12),
            leader_append_entries_timeout: Some(HEARTBEAT * 3),
            ..RaftOptions::default()
        }
    }

    /// A single node that leads its own cluster, plus a client for sending it RPCs as "x", a
    /// leader it has never heard of.
    async fn lone_leader(network: &LocalNetwork) -> (RaftNode, Arc<dyn PeerClient>) {
        let node = crate::api::try_create_raft_node(RaftNodeConfig {
            my_replica_id: "a".to_string(),
            transport: RaftTransport::Local(network.clone()),
            info_logger: slog::Logger::root(slog::Discard, slog::o!()),
            options: options(),
        })
        .await
        .unwrap();
        node.bootstrap(&["a"]).await.unwrap();
        wait_for_role(&node, RaftRole::Leader).await;
        node.append(Bytes::from("before")).await.unwrap();

        let impostor = network.peer_client(&ReplicaId::new("x"), &ReplicaId::new("a"));
        (node, impostor)
    }

    async fn wait_for_role(node: &RaftNode, role: RaftRole) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while node.role() != role {
            assert!(Instant::now() < deadline, "Still {:?}, expected {:?}", node.role(), role);
            tokio::time::sleep(HEARTBEAT).await;
        }
    }

    fn snapshot_meta(index: u64, data: &[u8]) -> SnapshotMeta {
        SnapshotMeta {
            index: Index::new(index),
            term: Term::new(IMPOSTOR_TERM),
            timestamp_millis: 0,
            version: 1,
            size: data.len() as u64,
            checksum: crc32fast::hash(data),
            configuration: Vec::new(),
            configuration_version: None,
        }
    }

    fn chunk(meta: SnapshotMeta, chunk_index: u64, chunk: &'static [u8], is_last: bool) -> InstallSnapshotInput {
        InstallSnapshotInput {
            leader_term: Term::new(IMPOSTOR_TERM),
            leader_id: ReplicaId::new("x"),
            meta,
            chunk_index,
            chunk: Bytes::from_static(chunk),
            is_last,
        }
    }

    #[tokio::test]
    async fn abandoned_transfer_stops_blocking_compaction() {
        let network = LocalNetwork::new();
        let (node, impostor) = lone_leader(&network).await;

        // First half of a snapshot, and then "x" is never heard from again.
        let output = impostor
            .install_snapshot(chunk(snapshot_meta(100, b"abcd"), 0, b"ab", false))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(node.role(), RaftRole::Follower);

        let result = node.compact(None).await;
        assert!(matches!(result, Err(CompactError::SnapshotTransferInProgress)), "{:?}", result);

        // Nobody leads, so "a" wins a later term for itself. The partial snapshot goes with the
        // leader that was sending it.
        wait_for_role(&node, RaftRole::Leader).await;
        let entry_id = node.append(Bytes::from("after")).await.unwrap();
        assert!(entry_id.term() > IMPOSTOR_TERM);

        let meta = node.compact(None).await.unwrap();
        assert_eq!(meta.index.as_u64(), entry_id.index());
        assert_eq!(node.current_snapshot().await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn log_catching_up_past_transfer_drops_it() {
        let network = LocalNetwork::new();
        let (node, impostor) = lone_leader(&network).await;
        let status = node.status().await.unwrap();
        let last_index = status.last_log_index;
        let last_term = Term::new(status.last_log_term);

        let output = impostor
            .install_snapshot(chunk(snapshot_meta(last_index + 2, b"abcd"), 0, b"ab", false))
            .await
            .unwrap();
        assert!(output.success);

        // "x" switches to plain replication and sends everything the snapshot would have covered.
        let output = impostor
            .append_entries(AppendEntriesInput {
                leader_term: Term::new(IMPOSTOR_TERM),
                leader_id: ReplicaId::new("x"),
                leader_previous_log_entry: Some((last_term, Index::new(last_index))),
                leader_commit_index: Some(Index::new(last_index + 2)),
                new_entries: vec![
                    RaftLogEntry::application(Term::new(IMPOSTOR_TERM), Bytes::from("one")),
                    RaftLogEntry::application(Term::new(IMPOSTOR_TERM), Bytes::from("two")),
                ],
            })
            .await
            .unwrap();
        assert!(output.success);

        let meta = node.compact(None).await.unwrap();
        assert_eq!(meta.index.as_u64(), last_index + 2);
        assert_eq!(meta.term, Term::new(IMPOSTOR_TERM));
    }

    #[tokio::test]
    async fn corrupted_snapshot_chunk_makes_node_inactive() {
        let network = LocalNetwork::new();
        let (node, impostor) = lone_leader(&network).await;
        let mut failures = node.subscribe(RaftEventKind::Failure);

        // The chunk doesn't hash to what the metadata promises.
        let result = impostor
            .install_snapshot(chunk(snapshot_meta(100, b"abcd"), 0, b"abcX", true))
            .await;
        assert!(matches!(result, Err(RpcError::ServerFault(_))), "{:?}", result);

        match tokio::time::timeout(Duration::from_secs(5), failures.next_event()).await {
            Ok(Some(RaftEvent::Failure { reason })) => assert!(reason.contains("checksum"), "{}", reason),
            other => panic!("Expected a failure event, got {:?}", other),
        }
        assert_eq!(node.role(), RaftRole::Inactive);
        assert_eq!(node.current_snapshot().await.unwrap(), None);
    }
}
