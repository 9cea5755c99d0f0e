use crate::actor::WeakActorClient;
use crate::api::{RaftEvent, RaftRole};
use crate::backpressure::CommitLimiter;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::{ElectionTimerHandle, LeaderTimerHandle};
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::event_bus::EventPublisher;
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
///
/// Every transition bumps the epoch. Election timers carry the epoch they were spawned in, so a
/// timeout that was already queued when we left that state is recognizably stale.
///
/// Transitions out of Leader hand back the LeaderStateTracker. The caller must `abandon()` it.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
    event_publisher: EventPublisher,
    term: Term,
    epoch: u64,
}

impl ElectionState {
    /// `new_inactive()` creates a new ElectionState instance that hasn't joined any cluster yet.
    pub(crate) fn new_inactive(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        event_publisher: EventPublisher,
        term: Term,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Inactive;
        let (notifier, listener) =
            state_change_listener::new(Self::current_state_impl(&initial_state, term, &config.my_replica_id));

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
            event_publisher,
            term,
            epoch: 0,
        };

        (election_state, listener)
    }

    #[must_use]
    pub(crate) fn transition_to_inactive(&mut self, term: Term) -> Option<LeaderStateTracker> {
        self.transition(State::Inactive, term)
    }

    #[must_use]
    pub(crate) fn transition_to_passive(&mut self, leader: Option<ReplicaId>, term: Term) -> Option<LeaderStateTracker> {
        self.transition(State::Passive(PassiveState { leader }), term)
    }

    #[must_use]
    pub(crate) fn transition_to_follower(&mut self, leader: Option<ReplicaId>, term: Term) -> Option<LeaderStateTracker> {
        let epoch = self.epoch + 1;
        let follower = FollowerState {
            leader,
            election_timer: self.spawn_election_timer(epoch),
            poll: None,
        };
        self.transition(State::Follower(follower), term)
    }

    #[must_use]
    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) -> Option<LeaderStateTracker> {
        let epoch = self.epoch + 1;
        let mut cs = CandidateState {
            received_votes_from: HashSet::with_capacity(3),
            _election_timer: self.spawn_election_timer(epoch),
        };

        // Vote for self
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.transition(State::Candidate(cs), term)
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: HashSet<ReplicaId>,
        next_index: Index,
        commit_limiter: CommitLimiter,
    ) {
        let mut peer_state = HashMap::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            let leader_timer_handle = self.spawn_leader_timer(peer_id.clone(), term);
            peer_state.insert(peer_id, PeerState::new(leader_timer_handle, next_index));
        }

        let leader = LeaderState {
            tracker: LeaderStateTracker::new(peer_state, commit_limiter),
        };
        // Only candidates become leader, so there's never an old tracker here.
        let _ = self.transition(State::Leader(leader), term);
    }

    fn transition(&mut self, new_state: State, term: Term) -> Option<LeaderStateTracker> {
        let old_role = self.role();
        let old_state = std::mem::replace(&mut self.state, new_state);
        self.epoch += 1;
        self.term = term;

        let new_role = self.role();
        if old_role != new_role {
            self.event_publisher.publish(RaftEvent::RoleChange {
                old: old_role,
                new: new_role,
                term: term.as_u64(),
            });
        }
        self.notify_new_state();

        match old_state {
            State::Leader(ls) => Some(ls.tracker),
            _ => None,
        }
    }

    fn spawn_election_timer(&self, epoch: u64) -> ElectionTimerHandle {
        ElectionTimerHandle::spawn_timer_task(
            self.config.follower_min_timeout,
            self.config.follower_max_timeout,
            self.actor_client.clone(),
            epoch,
        )
    }

    fn spawn_leader_timer(&self, peer_id: ReplicaId, term: Term) -> LeaderTimerHandle {
        LeaderTimerHandle::spawn_timer_task(
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            peer_id,
            term,
        )
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn role(&self) -> RaftRole {
        self.state.role()
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_inactive(&self) -> bool {
        matches!(self.state, State::Inactive)
    }

    /// Current leader as far as we know, including ourselves.
    pub(crate) fn leader(&self) -> Option<ReplicaId> {
        Self::leader_impl(&self.state, &self.config.my_replica_id)
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        Self::current_state_impl(&self.state, self.term, &self.config.my_replica_id)
    }

    fn current_state_impl(state: &State, term: Term, my_replica_id: &ReplicaId) -> ElectionStateSnapshot {
        ElectionStateSnapshot {
            role: state.role(),
            term,
            leader: Self::leader_impl(state, my_replica_id),
        }
    }

    fn leader_impl(state: &State, my_replica_id: &ReplicaId) -> Option<ReplicaId> {
        match state {
            State::Leader(_) => Some(my_replica_id.clone()),
            State::Follower(fs) => fs.leader.clone(),
            State::Passive(ps) => ps.leader.clone(),
            State::Candidate(_) | State::Inactive => None,
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier.notify_new_state(self.current_state());
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.election_timer.reset_timeout();
        }
    }

    /// Records who the leader is, for followers and passive members.
    pub(crate) fn set_leader(&mut self, leader: &ReplicaId) {
        let slot = match &mut self.state {
            State::Follower(fs) => &mut fs.leader,
            State::Passive(ps) => &mut ps.leader,
            _ => return,
        };

        if slot.as_ref() != Some(leader) {
            slot.replace(leader.clone());
            self.notify_new_state();
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    /// Starts a new poll round if follower, counting ourselves. Returns the round number.
    pub(crate) fn start_poll_round(&mut self, poll_term: Term) -> Option<u64> {
        if let State::Follower(fs) = &mut self.state {
            let round = fs.poll.as_ref().map(|p| p.round + 1).unwrap_or(1);
            let mut accepted_by = HashSet::with_capacity(3);
            accepted_by.insert(self.config.my_replica_id.clone());
            fs.poll.replace(PollRound {
                round,
                poll_term,
                accepted_by,
            });
            Some(round)
        } else {
            None
        }
    }

    /// Return number of acceptances in the current round, or None if the round is over.
    pub(crate) fn add_poll_acceptance(&mut self, round: u64, poll_term: Term, accepted_by: ReplicaId) -> Option<usize> {
        if let State::Follower(FollowerState { poll: Some(poll), .. }) = &mut self.state {
            if poll.round == round && poll.poll_term == poll_term {
                poll.accepted_by.insert(accepted_by);
                return Some(poll.accepted_by.len());
            }
        }
        None
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }

    /// Brings the leader's peer set in line with `peer_ids`. New peers start replicating at
    /// `next_index` and get an immediate heartbeat.
    pub(crate) fn sync_leader_peers(&mut self, peer_ids: HashSet<ReplicaId>, next_index: Index) {
        let term = self.term;
        let to_add: Vec<ReplicaId> = match self.leader_state() {
            Some(tracker) => peer_ids.difference(&tracker.peer_ids()).cloned().collect(),
            None => return,
        };
        let new_peers: Vec<(ReplicaId, LeaderTimerHandle)> = to_add
            .into_iter()
            .map(|peer_id| {
                let timer = self.spawn_leader_timer(peer_id.clone(), term);
                (peer_id, timer)
            })
            .collect();

        if let Some(tracker) = self.leader_state_mut() {
            for peer_id in tracker.peer_ids() {
                if !peer_ids.contains(&peer_id) {
                    tracker.remove_peer(&peer_id);
                }
            }
            for (peer_id, timer) in new_peers {
                tracker.insert_peer(peer_id, PeerState::new(timer, next_index));
            }
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Inactive => write!(f, "Inactive"),
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState { leader, .. }) => write!(f, "Follower(Leader={:?})", leader),
            State::Passive(PassiveState { leader }) => write!(f, "Passive(Leader={:?})", leader),
        }
    }
}

enum State {
    Inactive,
    Passive(PassiveState),
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl State {
    fn role(&self) -> RaftRole {
        match self {
            State::Inactive => RaftRole::Inactive,
            State::Passive(_) => RaftRole::Passive,
            State::Follower(_) => RaftRole::Follower,
            State::Candidate(_) => RaftRole::Candidate,
            State::Leader(_) => RaftRole::Leader,
        }
    }
}

struct LeaderState {
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    _election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<ReplicaId>,
    election_timer: ElectionTimerHandle,
    poll: Option<PollRound>,
}

// Passive members never time out. They wait for whoever leads to contact them.
struct PassiveState {
    leader: Option<ReplicaId>,
}

struct PollRound {
    round: u64,
    poll_term: Term,
    accepted_by: HashSet<ReplicaId>,
}

impl CandidateState {
    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::api::{RaftEventKind, RaftRole};
    use crate::replica::event_bus;

    fn config() -> ElectionConfig {
        ElectionConfig {
            my_replica_id: ReplicaId::new("me"),
            leader_heartbeat_duration: Duration::from_secs(60),
            follower_min_timeout: Duration::from_secs(60),
            follower_max_timeout: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn transitions_bump_epoch_and_publish_role_changes() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (publisher, dispatcher) = event_bus::new(slog::Logger::root(slog::Discard, slog::o!()));
        tokio::spawn(dispatcher.run());
        let mut roles = publisher.subscribe(Some(RaftEventKind::RoleChange));

        let (mut state, listener) =
            ElectionState::new_inactive(config(), actor_client.weak(), publisher, Term::new(0));
        assert_eq!(state.epoch(), 0);
        assert_eq!(listener.current().role, RaftRole::Inactive);

        assert!(state.transition_to_follower(None, Term::new(1)).is_none());
        assert!(state.transition_to_candidate_and_vote_for_self(Term::new(2)).is_none());
        assert_eq!(state.add_vote_if_candidate(ReplicaId::new("me")), Some(1));
        assert_eq!(state.add_vote_if_candidate(ReplicaId::new("b")), Some(2));

        state.transition_to_leader(
            Term::new(2),
            vec![ReplicaId::new("b")].into_iter().collect(),
            Index::new(1),
            CommitLimiter::disabled(),
        );
        assert_eq!(state.epoch(), 3);
        assert_eq!(state.leader(), Some(ReplicaId::new("me")));
        assert_eq!(
            listener.current(),
            ElectionStateSnapshot {
                role: RaftRole::Leader,
                term: Term::new(2),
                leader: Some(ReplicaId::new("me")),
            }
        );

        let tracker = state.transition_to_follower(Some(ReplicaId::new("b")), Term::new(3));
        assert!(tracker.is_some());
        assert_eq!(state.leader(), Some(ReplicaId::new("b")));

        let expected = vec![
            (RaftRole::Inactive, RaftRole::Follower, 1),
            (RaftRole::Follower, RaftRole::Candidate, 2),
            (RaftRole::Candidate, RaftRole::Leader, 2),
            (RaftRole::Leader, RaftRole::Follower, 3),
        ];
        for (old, new, term) in expected {
            assert_eq!(roles.recv().await, Some(RaftEvent::RoleChange { old, new, term }));
        }
    }

    #[tokio::test]
    async fn poll_rounds_ignore_stale_replies() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (publisher, _dispatcher) = event_bus::new(slog::Logger::root(slog::Discard, slog::o!()));
        let (mut state, _listener) =
            ElectionState::new_inactive(config(), actor_client.weak(), publisher, Term::new(4));

        // Not a follower yet.
        assert_eq!(state.start_poll_round(Term::new(5)), None);

        let _ = state.transition_to_follower(None, Term::new(4));
        assert_eq!(state.start_poll_round(Term::new(5)), Some(1));
        assert_eq!(state.start_poll_round(Term::new(5)), Some(2));

        assert_eq!(state.add_poll_acceptance(1, Term::new(5), ReplicaId::new("b")), None);
        assert_eq!(state.add_poll_acceptance(2, Term::new(4), ReplicaId::new("b")), None);
        assert_eq!(state.add_poll_acceptance(2, Term::new(5), ReplicaId::new("b")), Some(2));
        assert_eq!(state.add_poll_acceptance(2, Term::new(5), ReplicaId::new("b")), Some(2));
    }

    #[tokio::test]
    async fn sync_leader_peers_adds_and_removes() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (publisher, _dispatcher) = event_bus::new(slog::Logger::root(slog::Discard, slog::o!()));
        let (mut state, _listener) =
            ElectionState::new_inactive(config(), actor_client.weak(), publisher, Term::new(1));
        let ids = |names: &[&str]| names.iter().map(|n| ReplicaId::new(*n)).collect::<HashSet<_>>();

        let _ = state.transition_to_candidate_and_vote_for_self(Term::new(1));
        state.transition_to_leader(Term::new(1), ids(&["b", "c"]), Index::new(5), CommitLimiter::disabled());

        state.sync_leader_peers(ids(&["c", "d"]), Index::new(9));

        let tracker = state.leader_state().unwrap();
        assert_eq!(tracker.peer_ids(), ids(&["c", "d"]));
        assert_eq!(
            tracker.peer_state(&ReplicaId::new("c")).unwrap().next_and_previous_log_index().0,
            Index::new(5)
        );
        assert_eq!(
            tracker.peer_state(&ReplicaId::new("d")).unwrap().next_and_previous_log_index().0,
            Index::new(9)
        );
    }
}
