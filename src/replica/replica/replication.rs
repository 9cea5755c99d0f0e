use super::{with_timeout, Replica};
use crate::actor::{Callback, WeakActorClient};
use crate::api::{AppendError, RaftEntryId, RaftRole};
use crate::commitlog::{Index, Log};
use crate::replica::cluster::{ClusterConfiguration, ReplicaId};
use crate::replica::election::quorum_match_index;
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::replica_api::{
    AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor,
    ConfigurationChangeOutput, LeaderTimerTick, RpcError,
};
use crate::replica::write_ahead_log::{EntryPayload, RaftLogEntry};
use crate::transport::PeerClient;
use bytes::Bytes;
use std::cmp;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

impl<L, S> Replica<L, S>
where
    L: Log<RaftLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    pub(crate) fn handle_append(&mut self, data: Bytes, callback: Callback<RaftEntryId, AppendError>) {
        if let Err(e) = self.check_can_admit_append() {
            callback.send(Err(e));
            return;
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.current_term();
        let index = match self.raft_log.append(RaftLogEntry::application(term, data)) {
            Ok(index) => index,
            Err(ioe) => {
                let reason = format!("Failed to append client entry: {}", ioe);
                callback.send(Err(AppendError::LocalIoError(ioe)));
                self.fail(reason);
                return;
            }
        };

        if let Some(tracker) = self.election_state.leader_state_mut() {
            tracker.commit_limiter.on_append(index, Instant::now());
            tracker.pending_appends.insert(index, callback);
        }

        // Don't wait for the next heartbeat.
        self.advance_commit_index();
        self.replicate_to_all_peers();
    }

    fn check_can_admit_append(&self) -> Result<(), AppendError> {
        let tracker = match self.election_state.leader_state() {
            Some(tracker) => tracker,
            None => {
                return Err(match (self.election_state.role(), self.election_state.leader()) {
                    (RaftRole::Inactive, _) => AppendError::Inactive,
                    (_, Some(leader)) => AppendError::NotLeader {
                        leader_hint: leader.into_inner(),
                    },
                    (_, None) => AppendError::NoLeader,
                })
            }
        };

        if tracker.pending_transfer.is_some() {
            return Err(AppendError::LeadershipTransferInProgress);
        }
        if !tracker.commit_limiter.try_acquire() {
            slog::debug!(
                self.logger,
                "Rejecting append, {} entries in flight with limit {:?}",
                tracker.commit_limiter.in_flight(),
                tracker.commit_limiter.limit()
            );
            return Err(AppendError::Overloaded);
        }

        Ok(())
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, RpcError> {
        if self.election_state.is_inactive() {
            return Err(RpcError::Inactive);
        }

        match self.try_handle_append_entries(input) {
            Ok(output) => Ok(output),
            Err(ioe) => {
                let message = ioe.to_string();
                self.fail(format!("Failed to handle AppendEntries: {}", ioe));
                Err(RpcError::ServerFault(message))
            }
        }
    }

    fn try_handle_append_entries(&mut self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, io::Error> {
        // 1. Reply false if term < currentTerm (§5.1)
        if input.leader_term < self.current_term() {
            return Ok(self.append_entries_output(false));
        }

        self.follow_leader(input.leader_term, &input.leader_id)?;

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            if !self.log_contains(leader_prev_entry_term, leader_prev_entry_index)? {
                slog::debug!(
                    self.logger,
                    "Missing previous entry ({:?}, {:?}), my latest: {:?}",
                    leader_prev_entry_term,
                    leader_prev_entry_index,
                    self.raft_log.latest_entry()
                );
                return Ok(self.append_entries_output(false));
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        let snapshot_index = self.raft_log.snapshot_boundary().map(|(_, index)| index);
        let mut membership_changed = false;
        for new_entry in input.new_entries {
            // Covered by our snapshot, so committed and matching.
            if matches!(snapshot_index, Some(si) if next_entry_index <= si) {
                next_entry_index = next_entry_index.plus(1);
                continue;
            }

            // 3. (if...)
            match self.raft_log.term_at(next_entry_index)? {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term => {
                    next_entry_index = next_entry_index.plus(1);
                    continue;
                }
                // 3. (delete)
                Some(_) => {
                    slog::info!(self.logger, "Truncating conflicting entries from {:?}", next_entry_index);
                    self.raft_log.truncate(next_entry_index)?;
                    self.configurations.truncate_from(next_entry_index);
                    membership_changed = true;
                }
                None => {}
            }

            // 4. (append)
            let configuration = match &new_entry.payload {
                EntryPayload::Configuration(members) => Some(members.clone()),
                _ => None,
            };
            let appended_index = self.raft_log.append(new_entry)?;
            if appended_index != next_entry_index {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "appended entry at {:?}, expected {:?}",
                        appended_index, next_entry_index
                    ),
                ));
            }
            // Configurations take effect as soon as they're in our log.
            if let Some(members) = configuration {
                self.configurations
                    .push(ClusterConfiguration::new(Some(appended_index), members));
                membership_changed = true;
            }

            next_entry_index = next_entry_index.plus(1);
        }

        if membership_changed {
            self.refresh_role();
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, next_entry_index.checked_minus(1))
        {
            self.raft_log
                .ratchet_fwd_commit_index(cmp::min(leader_commit_index, index_of_last_new_entry));
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_committed()?;
        self.discard_pending_snapshot_covered_by(self.raft_log.latest_index());

        Ok(self.append_entries_output(true))
    }

    fn append_entries_output(&self, success: bool) -> AppendEntriesOutput {
        AppendEntriesOutput {
            term: self.current_term(),
            success,
            last_log_index: self.raft_log.latest_index(),
        }
    }

    /// The sender is the leader for `term`. Adopt its term, follow it, and hold off elections.
    pub(super) fn follow_leader(&mut self, term: Term, leader_id: &ReplicaId) -> Result<(), io::Error> {
        let increased = self.local_state.store_term_if_increased(term)?;
        let role = self.election_state.role();
        if increased || role == RaftRole::Candidate || role == RaftRole::Leader {
            // > If AppendEntries RPC received from new leader: convert to follower
            self.become_follower_or_passive(Some(leader_id.clone()));
            slog::info!(
                self.logger,
                "Following {:?} in term {:?}. Election state: {:?}",
                leader_id,
                term,
                self.election_state
            );
        } else {
            self.election_state.set_leader(leader_id);
            self.discard_stale_pending_snapshot();
        }

        self.last_leader_contact.record();
        self.election_state.reset_timeout_if_follower();
        Ok(())
    }

    fn log_contains(&self, term: Term, index: Index) -> Result<bool, io::Error> {
        if matches!(self.raft_log.snapshot_boundary(), Some((_, si)) if index <= si) {
            return Ok(true);
        }

        Ok(self.raft_log.term_at(index)? == Some(term))
    }

    pub(super) fn apply_committed(&mut self) -> Result<(), io::Error> {
        if self.raft_log.apply_all_committed_entries()?.is_some() {
            self.maybe_auto_compact();
        }
        Ok(())
    }

    // ------- Leader side --------

    /// Everyone we replicate to: every member but us, Active or Passive.
    pub(super) fn replication_peer_ids(&self) -> HashSet<ReplicaId> {
        match self.configurations.latest() {
            Some(c) => c
                .members()
                .iter()
                .map(|m| m.id.clone())
                .filter(|id| *id != self.my_replica_id)
                .collect(),
            None => HashSet::new(),
        }
    }

    pub(super) fn replicate_to_all_peers(&mut self) {
        let peer_ids = match self.election_state.leader_state() {
            Some(tracker) => tracker.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.replicate_to_peer(&peer_id);
        }
    }

    /// Sends the peer whatever it needs next: a snapshot chunk if we've compacted past its next
    /// index, otherwise an AppendEntries batch (possibly empty, as a heartbeat).
    pub(super) fn replicate_to_peer(&mut self, peer_id: &ReplicaId) {
        let needs_snapshot = match self
            .election_state
            .leader_state()
            .and_then(|tracker| tracker.peer_state(peer_id))
        {
            Some(peer_state) => {
                let (next_index, _) = peer_state.next_and_previous_log_index();
                peer_state.snapshot_transfer.is_some() || next_index < self.raft_log.first_retained_index()
            }
            None => return,
        };

        if needs_snapshot {
            self.send_snapshot_chunk(peer_id);
        } else if let Err(ioe) = self.send_append_entries(peer_id) {
            self.fail(format!("Failed to read log for AppendEntries: {}", ioe));
        }
    }

    fn send_append_entries(&mut self, peer_id: &ReplicaId) -> Result<(), io::Error> {
        let peer_client = self.peer_client(peer_id);
        let term = self.current_term();
        let max_in_flight = self.options.max_in_flight_appends_per_peer;
        let max_batch = self.options.max_append_batch_entries;
        let rpc_timeout = self.rpc_timeout();

        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.peer_state_mut(peer_id))
        {
            Some(peer_state) => peer_state,
            None => return Ok(()),
        };
        if !peer_state.can_send_append(max_in_flight) {
            slog::debug!(self.logger, "Too many outstanding requests to peer {:?}", peer_id);
            return Ok(());
        }

        let (next_index, previous_index) = peer_state.next_and_previous_log_index();
        let previous_log_entry = match previous_index {
            None => None,
            Some(previous_index) => match self.raft_log.term_at(previous_index)? {
                Some(previous_term) => Some((previous_term, previous_index)),
                None => {
                    slog::error!(
                        self.logger,
                        "Entry {:?} before next index for {:?} is missing from the log",
                        previous_index,
                        peer_id
                    );
                    return Ok(());
                }
            },
        };
        let new_entries = self.raft_log.entries(next_index, max_batch)?;
        let num_log_entries = new_entries.len() as u64;

        let input = AppendEntriesInput {
            leader_term: term,
            leader_id: self.my_replica_id.clone(),
            leader_previous_log_entry: previous_log_entry,
            leader_commit_index: self.raft_log.commit_index(),
            new_entries,
        };
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: peer_id.clone(),
            term,
            previous_log_entry_index: previous_index,
            num_log_entries,
        };

        peer_state.on_append_sent(num_log_entries);
        peer_state.reset_heartbeat_timer();

        tokio::task::spawn(Self::call_peer_append_entries(
            self.logger.new(slog::o!("Peer" => peer_id.to_string())),
            peer_client,
            input,
            rpc_timeout,
            self.actor_client.clone(),
            descriptor,
        ));

        Ok(())
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        input: AppendEntriesInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        slog::debug!(
            logger,
            "ClientWire - AppendEntries prev={:?} entries={}",
            input.leader_previous_log_entry,
            input.new_entries.len()
        );
        let result = with_timeout(rpc_timeout, peer_client.append_entries(input)).await;
        slog::debug!(logger, "ClientWire - {:?}", result);

        callback
            .notify_append_entries_reply_from_peer(AppendEntriesReplyFromPeer { descriptor, result })
            .await;
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let descriptor = reply.descriptor;
        let logger = self
            .logger
            .new(slog::o!("Peer" => descriptor.peer_id.to_string()));

        let current_term = self.current_term();
        if current_term != descriptor.term {
            slog::debug!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                descriptor.term,
                current_term
            );
            return;
        }
        if let Ok(output) = &reply.result {
            if output.term > current_term && self.step_down_if_term_increased(output.term) {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                return;
            }
        }

        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.peer_state_mut(&descriptor.peer_id))
        {
            Some(peer_state) => peer_state,
            None => {
                slog::debug!(logger, "No longer replicating to peer");
                return;
            }
        };
        peer_state.on_append_completed();

        let replicated = match reply.result {
            Err(e) => {
                // Resend on the next heartbeat rather than hammering an unreachable peer.
                slog::debug!(logger, "AE failure: {}", e);
                peer_state.on_append_failed(descriptor.previous_log_entry_index);
                return;
            }
            Ok(output) => {
                peer_state.record_contact();
                if output.success {
                    peer_state.on_append_success(descriptor.previous_log_entry_index, descriptor.num_log_entries);
                    true
                } else {
                    slog::debug!(logger, "Peer is missing previous log entry. Its last: {:?}", output.last_log_index);
                    match descriptor.previous_log_entry_index {
                        Some(previous) => peer_state.on_append_rejected(previous, output.last_log_index),
                        None => slog::warn!(logger, "Peer rejected AE starting at the first entry"),
                    }
                    false
                }
            }
        };

        if replicated {
            self.advance_commit_index();
            self.check_transfer_progress();
            self.check_promotion();
        }

        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        let behind = match self
            .election_state
            .leader_state()
            .and_then(|tracker| tracker.peer_state(&descriptor.peer_id))
        {
            Some(peer_state) => {
                let (next_index, _) = peer_state.next_and_previous_log_index();
                matches!(self.raft_log.latest_index(), Some(latest) if latest >= next_index)
            }
            None => false,
        };
        if behind {
            self.replicate_to_peer(&descriptor.peer_id);
        }
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    pub(super) fn advance_commit_index(&mut self) {
        let tentative_new_commit_index = {
            let (tracker, configuration) = match (self.election_state.leader_state(), self.configurations.latest()) {
                (Some(tracker), Some(configuration)) => (tracker, configuration),
                _ => return,
            };
            let my_latest_index = self.raft_log.latest_index();
            let match_indexes = configuration
                .active_ids()
                .map(|id| {
                    if *id == self.my_replica_id {
                        my_latest_index
                    } else {
                        tracker.peer_state(id).and_then(|peer_state| peer_state.matched())
                    }
                })
                .collect();

            match quorum_match_index(match_indexes) {
                Some(index) => index,
                None => return,
            }
        };

        // See also:
        // > Figure 8: A time sequence showing why a leader cannot determine
        // > commitment using log entries from older terms.
        let term = self.current_term();
        match self
            .raft_log
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, term)
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(ioe) => {
                self.fail(format!(
                    "IO failure while confirming new commit index {:?}: {}",
                    tentative_new_commit_index, ioe
                ));
                return;
            }
        }

        if let Err(ioe) = self.apply_committed() {
            self.fail(format!("Failed to apply committed entries: {}", ioe));
            return;
        }
        self.on_commit_advanced();
    }

    fn on_commit_advanced(&mut self) {
        let commit_index = match self.raft_log.commit_index() {
            Some(commit_index) => commit_index,
            None => return,
        };
        let term = self.current_term();
        let tracker = match self.election_state.leader_state_mut() {
            Some(tracker) => tracker,
            None => return,
        };

        tracker.commit_limiter.on_commit(commit_index, Instant::now());

        let still_pending = tracker.pending_appends.split_off(&commit_index.plus(1));
        let committed = std::mem::replace(&mut tracker.pending_appends, still_pending);
        for (index, callback) in committed {
            // Everything appended while we lead carries our term.
            callback.send(Ok(RaftEntryId { term, index }));
        }

        if matches!(&tracker.pending_change, Some(change) if change.version <= commit_index) {
            if let Some(change) = tracker.pending_change.take() {
                slog::info!(self.logger, "Configuration {:?} committed", change.version);
                change.callback.send(Ok(ConfigurationChangeOutput {
                    configuration_version: Some(change.version),
                }));
            }
        }

        self.check_promotion();
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }
        if !self.election_state.is_leader() {
            return;
        }

        if !self.has_quorum_contact() {
            slog::warn!(
                self.logger,
                "Haven't heard from a quorum within {:?}. Stepping down.",
                self.options.leader_quorum_liveness_timeout
            );
            self.become_follower_or_passive(None);
            return;
        }

        self.check_leader_deadlines();
        self.replicate_to_peer(&tick.peer_id);
    }

    /// A leader cut off from a quorum can't commit anything, and its followers have likely moved
    /// on. Counts Active members (us included) heard from within the liveness window.
    fn has_quorum_contact(&self) -> bool {
        let (tracker, configuration) = match (self.election_state.leader_state(), self.configurations.latest()) {
            (Some(tracker), Some(configuration)) => (tracker, configuration),
            _ => return false,
        };
        let window = self.options.leader_quorum_liveness_timeout;

        let reachable = configuration
            .active_ids()
            .filter(|id| {
                **id == self.my_replica_id
                    || tracker
                        .peer_state(id)
                        .map(|peer_state| peer_state.heard_within(window))
                        .unwrap_or(false)
            })
            .count();

        reachable >= configuration.quorum_size()
    }
}
