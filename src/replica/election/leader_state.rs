use crate::actor::Callback;
use crate::api::{AppendError, MembershipError, RaftEntryId, TransferLeadershipError};
use crate::backpressure::CommitLimiter;
use crate::commitlog::Index;
use crate::replica::election::timers::{LastContact, LeaderTimerHandle};
use crate::replica::{ConfigurationChangeOutput, ReplicaId};
use crate::snapshot::Snapshot;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::time::{Duration, Instant};

/// Everything that only exists while we're leader for one term. Dropping it stops every peer's
/// heartbeat timer. Use `abandon()` so that clients waiting on this leadership hear about it.
pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,

    // Client appends waiting for their entry to commit, by index.
    pub(crate) pending_appends: BTreeMap<Index, Callback<RaftEntryId, AppendError>>,
    pub(crate) pending_change: Option<PendingChange>,
    pub(crate) pending_promotion: Option<PendingPromotion>,
    pub(crate) pending_transfer: Option<PendingTransfer>,
    pub(crate) commit_limiter: CommitLimiter,
    // Index of this term's Initialize entry. We don't accept membership changes until it commits.
    pub(crate) initialize_index: Option<Index>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>, commit_limiter: CommitLimiter) -> Self {
        LeaderStateTracker {
            peer_state,
            pending_appends: BTreeMap::new(),
            pending_change: None,
            pending_promotion: None,
            pending_transfer: None,
            commit_limiter,
            initialize_index: None,
        }
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(super) fn insert_peer(&mut self, peer_id: ReplicaId, peer_state: PeerState) {
        self.peer_state.insert(peer_id, peer_state);
    }

    pub(super) fn remove_peer(&mut self, peer_id: &ReplicaId) {
        self.peer_state.remove(peer_id);
    }

    pub(crate) fn any_snapshot_transfer(&self) -> bool {
        self.peer_state.values().any(|p| p.snapshot_transfer.is_some())
    }

    /// Leader is ready for membership changes once its Initialize entry is committed.
    pub(crate) fn is_ready(&self, commit_index: Option<Index>) -> bool {
        match (self.initialize_index, commit_index) {
            (Some(init), Some(ci)) => ci >= init,
            _ => false,
        }
    }

    /// Fails everything still waiting on this leadership.
    pub(crate) fn abandon(self) {
        for (_, callback) in self.pending_appends {
            callback.send(Err(AppendError::LeadershipLost));
        }
        if let Some(change) = self.pending_change {
            change.callback.send(Err(MembershipError::LeadershipLost));
        }
        if let Some(promotion) = self.pending_promotion {
            promotion.callback.send(Err(MembershipError::LeadershipLost));
        }
        if let Some(PendingTransfer {
            callback: Some(callback),
            handoff_sent,
            ..
        }) = self.pending_transfer
        {
            // Once handed off, losing leadership is usually the target winning its election.
            if handoff_sent {
                callback.send(Ok(()));
            } else {
                callback.send(Err(TransferLeadershipError::LeadershipLost));
            }
        }
    }
}

/// A configuration entry we appended, waiting for commit.
pub(crate) struct PendingChange {
    pub(crate) version: Index,
    pub(crate) callback: Callback<ConfigurationChangeOutput, MembershipError>,
}

/// A member that joined as Passive and gets promoted once its log catches up.
pub(crate) struct PendingPromotion {
    pub(crate) member: ReplicaId,
    pub(crate) deadline: Instant,
    pub(crate) callback: Callback<ConfigurationChangeOutput, MembershipError>,
}

pub(crate) struct PendingTransfer {
    pub(crate) target: ReplicaId,
    pub(crate) deadline: Instant,
    // Taken once the hand-off is acknowledged. We keep rejecting appends until the deadline.
    pub(crate) callback: Option<Callback<(), TransferLeadershipError>>,
    pub(crate) handoff_sent: bool,
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    leader_timer_handler: LeaderTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    // Moves forward optimistically as batches are sent, so several can be in flight.
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    in_flight_appends: usize,
    // Last time this peer answered any request from us. Starts out as when we began leading it,
    // so every peer gets a full liveness window.
    contact: LastContact,
    pub(crate) snapshot_transfer: Option<SnapshotTransfer>,
}

/// Chunked snapshot send to one peer. One chunk is in flight at a time.
pub(crate) struct SnapshotTransfer {
    pub(crate) snapshot: Snapshot,
    pub(crate) next_chunk: u64,
    pub(crate) in_flight: bool,
}

impl PeerState {
    pub(super) fn new(leader_timer_handler: LeaderTimerHandle, next: Index) -> Self {
        let mut contact = LastContact::never();
        contact.record();
        PeerState {
            leader_timer_handler,
            next,
            matched: None,
            in_flight_appends: 0,
            contact,
            snapshot_transfer: None,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn heard_within(&self, window: Duration) -> bool {
        self.contact.within(window)
    }

    pub(crate) fn record_contact(&mut self) {
        self.contact.record();
    }

    pub(crate) fn can_send_append(&self, max_in_flight: usize) -> bool {
        self.in_flight_appends < max_in_flight
    }

    pub(crate) fn on_append_sent(&mut self, num_entries: u64) {
        self.in_flight_appends += 1;
        self.next = self.next.plus(num_entries);
    }

    pub(crate) fn on_append_completed(&mut self) {
        self.in_flight_appends = self.in_flight_appends.saturating_sub(1);
    }

    /// Follower's log matches ours up to `previous + num_entries`. Acks may arrive out of order,
    /// so matched only ratchets forward.
    pub(crate) fn on_append_success(&mut self, previous: Option<Index>, num_entries: u64) {
        let acked = match (previous, num_entries) {
            (None, 0) => return,
            (None, n) => Index::new(n),
            (Some(prev), n) => prev.plus(n),
        };

        if !matches!(self.matched, Some(m) if m >= acked) {
            self.matched.replace(acked);
        }
        let floor = self.next_floor();
        if self.next < floor {
            self.next = floor;
        }
    }

    /// Follower's log doesn't contain our entry at `previous`. Back up to whichever is earlier:
    /// `previous` itself, or just past the follower's last entry.
    pub(crate) fn on_append_rejected(&mut self, previous: Index, follower_last: Option<Index>) {
        let past_follower_log = follower_last
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        let rewound = std::cmp::min(previous, past_follower_log);
        self.next = std::cmp::max(rewound, self.next_floor());
    }

    /// No information. Resend starting at the failed batch.
    pub(crate) fn on_append_failed(&mut self, previous: Option<Index>) {
        let batch_start = previous.map(|i| i.plus(1)).unwrap_or_else(Index::start_index);
        let rewound = std::cmp::min(self.next, batch_start);
        self.next = std::cmp::max(rewound, self.next_floor());
    }

    /// Snapshot installed on the peer. Replication resumes right after it.
    pub(crate) fn on_snapshot_installed(&mut self, snapshot_index: Index) {
        if !matches!(self.matched, Some(m) if m >= snapshot_index) {
            self.matched.replace(snapshot_index);
        }
        self.next = std::cmp::max(self.next, snapshot_index.plus(1));
        self.snapshot_transfer = None;
    }

    fn next_floor(&self) -> Index {
        self.matched
            .map(|m| m.plus(1))
            .unwrap_or_else(Index::start_index)
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.leader_timer_handler.reset_heartbeat_timer();
    }
}

/// Highest index replicated on a majority of `match_indexes`, one per Active member (the leader
/// contributes its own last index). `None` until a majority has anything.
pub(crate) fn quorum_match_index(mut match_indexes: Vec<Option<Index>>) -> Option<Index> {
    if match_indexes.is_empty() {
        return None;
    }
    // None sorts before Some, so index [len - quorum] is the highest value a quorum has reached.
    match_indexes.sort();
    let quorum = match_indexes.len() / 2 + 1;
    match_indexes[match_indexes.len() - quorum]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::Term;

    const LEADER: u64 = 10;

    fn run(expected: u64, peers: Vec<u64>) {
        // Leader always holds the latest entry.
        let mut matches: Vec<Option<Index>> = peers.into_iter().map(Index::from_u64).collect();
        matches.push(Some(Index::new(LEADER)));

        assert_eq!(
            quorum_match_index(matches.clone()),
            Index::from_u64(expected),
            "Matches: {:?}",
            matches
        );
    }

    #[test]
    fn quorum_match_index_single_node() {
        run(10, vec![]);
    }

    #[test]
    fn quorum_match_index_2_nodes() {
        run(0, vec![0]);
        run(9, vec![9]);
    }

    #[test]
    fn quorum_match_index_3_nodes() {
        run(0, vec![0, 0]);
        run(9, vec![0, 9]);
        run(8, vec![7, 8]);
        run(9, vec![9, 9]);
    }

    #[test]
    fn quorum_match_index_4_nodes() {
        run(0, vec![0, 0, 9]);
        run(8, vec![0, 8, 9]);
        run(8, vec![7, 8, 9]);
    }

    #[test]
    fn quorum_match_index_5_nodes() {
        run(0, vec![0, 0, 0, 9]);
        run(8, vec![0, 0, 8, 9]);
        run(8, vec![0, 7, 8, 9]);
    }

    #[test]
    fn quorum_match_index_6_nodes() {
        run(0, vec![0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 7, 8, 9]);
        run(7, vec![0, 6, 7, 8, 9]);
    }

    #[test]
    fn quorum_match_index_7_nodes() {
        run(0, vec![0, 0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 0, 7, 8, 9]);
        run(7, vec![0, 0, 6, 7, 8, 9]);
    }

    #[test]
    fn quorum_match_index_leader_not_counted() {
        // Leader demoted to Passive doesn't contribute its own index.
        assert_eq!(quorum_match_index(vec![]), None);
        assert_eq!(
            quorum_match_index(vec![Index::from_u64(4), Index::from_u64(6)]),
            Index::from_u64(4)
        );
    }

    fn new_peer_state(next: u64) -> (PeerState, ActorClient) {
        let (actor_client, _rx) = ActorClient::new(10);
        let timer = LeaderTimerHandle::spawn_timer_task(
            std::time::Duration::from_secs(60),
            actor_client.weak(),
            ReplicaId::new("peer"),
            Term::new(1),
        );
        (PeerState::new(timer, Index::new(next)), actor_client)
    }

    #[tokio::test]
    async fn pipelined_acks_ratchet_matched_forward() {
        let (mut peer, _client) = new_peer_state(11);

        // Two batches in flight: 11..=15 and 16..=20.
        peer.on_append_sent(5);
        peer.on_append_sent(5);
        assert!(!peer.can_send_append(2));
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(21));

        // Second batch acks first.
        peer.on_append_completed();
        peer.on_append_success(Some(Index::new(15)), 5);
        assert_eq!(peer.matched(), Some(Index::new(20)));

        // Late ack of the first batch doesn't regress anything.
        peer.on_append_completed();
        peer.on_append_success(Some(Index::new(10)), 5);
        assert_eq!(peer.matched(), Some(Index::new(20)));
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(21));
        assert!(peer.can_send_append(2));
    }

    #[tokio::test]
    async fn rejection_backtracks_to_follower_log() {
        let (mut peer, _client) = new_peer_state(101);

        // Follower only has 40 entries.
        peer.on_append_sent(0);
        peer.on_append_completed();
        peer.on_append_rejected(Index::new(100), Some(Index::new(40)));
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(41));

        // Follower has 40 entries but entry 40 conflicts.
        peer.on_append_rejected(Index::new(40), Some(Index::new(40)));
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(40));

        // Never rewinds past what's known to match.
        peer.on_append_success(Some(Index::new(30)), 0);
        peer.on_append_rejected(Index::new(39), None);
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(31));
    }

    #[tokio::test]
    async fn transport_failure_resends_batch() {
        let (mut peer, _client) = new_peer_state(11);
        peer.on_append_sent(5);
        peer.on_append_completed();
        peer.on_append_failed(Some(Index::new(10)));
        assert_eq!(peer.next_and_previous_log_index(), (Index::new(11), Some(Index::new(10))));

        peer.on_snapshot_installed(Index::new(50));
        assert_eq!(peer.matched(), Some(Index::new(50)));
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(51));
    }
}
