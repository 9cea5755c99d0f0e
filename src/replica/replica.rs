mod catch_up;
mod membership;
mod replication;
mod voting;

use crate::actor::WeakActorClient;
use crate::api::{
    RaftEntry, RaftEvent, RaftOptionsValidated, RaftRole, RaftStatus, ReadLogError, ReaderMode, StartError,
    StepDownError,
};
use crate::commitlog::{index_or_zero, Index, Log};
use crate::replica::cluster::{ClusterConfiguration, ConfigurationHistory, ReplicaId};
use crate::replica::election::{ElectionConfig, ElectionState, LastContact, LeaderStateTracker};
use crate::replica::event_bus::EventPublisher;
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::replica_api::{RpcError, StartMode};
use crate::replica::write_ahead_log::{RaftLog, RaftLogEntry};
use crate::replica::ElectionStateChangeListener;
use crate::snapshot::{PendingSnapshot, SnapshotMeta, SnapshotSource, SnapshotStore};
use crate::transport::{PeerClient, PeerConnector};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::time::Duration;

pub(crate) struct ReplicaConfig<L, S>
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    pub logger: slog::Logger,
    pub my_replica_id: ReplicaId,
    pub log: L,
    pub local_state: S,
    pub snapshot_store: Box<dyn SnapshotStore + Send>,
    pub snapshot_source: Box<dyn SnapshotSource + Send>,
    pub connector: Arc<dyn PeerConnector>,
    pub actor_client: WeakActorClient,
    pub event_publisher: EventPublisher,
    pub options: RaftOptionsValidated,
}

/// Replica is the raft role state machine for one node. It is owned by the node's actor, and
/// every method runs on the actor's event loop. Nothing here blocks: RPCs are spawned onto other
/// tasks, and their completions come back as events.
///
/// The methods are split by concern:
/// - voting: elections, polls and votes.
/// - replication: client appends, AppendEntries in both directions, and commit advancement.
/// - membership: configuration changes, promotion of caught up members, and leadership transfer.
/// - catch_up: snapshot transfer in both directions, and compaction.
pub(crate) struct Replica<L, S>
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    options: RaftOptionsValidated,

    local_state: S,
    raft_log: RaftLog<L>,
    configurations: ConfigurationHistory,
    election_state: ElectionState,

    snapshot_store: Box<dyn SnapshotStore + Send>,
    snapshot_source: Box<dyn SnapshotSource + Send>,
    // Snapshot a leader is streaming to us.
    pending_snapshot: Option<PendingSnapshot>,

    connector: Arc<dyn PeerConnector>,
    peer_clients: HashMap<ReplicaId, Arc<dyn PeerClient>>,
    actor_client: WeakActorClient,
    event_publisher: EventPublisher,

    started: bool,
    shut_down: bool,
    candidacy_suspended: bool,
    // Last time a current leader reached us. Polls are refused while this is recent.
    last_leader_contact: LastContact,
}

impl<L, S> Replica<L, S>
where
    L: Log<RaftLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    /// Recovers log metadata and membership from whatever the log and snapshot store already
    /// hold. The replica starts Inactive either way.
    pub(crate) fn new(config: ReplicaConfig<L, S>) -> Result<(Self, ElectionStateChangeListener), io::Error> {
        let logger = config.logger;
        let snapshot = config.snapshot_store.latest()?;
        let snapshot_boundary = snapshot.as_ref().map(|s| (s.meta.term, s.meta.index));

        let raft_log = RaftLog::new(
            logger.clone(),
            config.log,
            snapshot_boundary,
            config.event_publisher.clone(),
        )?;

        let mut configurations = ConfigurationHistory::default();
        if let Some(snapshot) = &snapshot {
            configurations.push(ClusterConfiguration::new(
                snapshot.meta.configuration_version,
                snapshot.meta.configuration.clone(),
            ));
        }
        for (index, members) in raft_log.configuration_entries()? {
            if !matches!(snapshot_boundary, Some((_, snapshot_index)) if snapshot_index >= index) {
                configurations.push(ClusterConfiguration::new(Some(index), members));
            }
        }
        if let Some(configuration) = configurations.latest() {
            slog::info!(logger, "Recovered configuration: {:?}", configuration);
        }

        let (election_state, listener) = ElectionState::new_inactive(
            ElectionConfig {
                my_replica_id: config.my_replica_id.clone(),
                leader_heartbeat_duration: config.options.leader_heartbeat_duration,
                follower_min_timeout: config.options.follower_min_timeout,
                follower_max_timeout: config.options.follower_max_timeout,
            },
            config.actor_client.clone(),
            config.event_publisher.clone(),
            config.local_state.current_term(),
        );

        let replica = Replica {
            logger,
            my_replica_id: config.my_replica_id,
            options: config.options,
            local_state: config.local_state,
            raft_log,
            configurations,
            election_state,
            snapshot_store: config.snapshot_store,
            snapshot_source: config.snapshot_source,
            pending_snapshot: None,
            connector: config.connector,
            peer_clients: HashMap::new(),
            actor_client: config.actor_client,
            event_publisher: config.event_publisher,
            started: false,
            shut_down: false,
            candidacy_suspended: false,
            last_leader_contact: LastContact::never(),
        };

        Ok((replica, listener))
    }

    pub(crate) fn handle_start(&mut self, mode: StartMode) -> Result<(), StartError> {
        if self.started || self.shut_down {
            return Err(StartError::AlreadyStarted);
        }

        if let StartMode::Bootstrap(member_ids) = mode {
            if !member_ids.contains(&self.my_replica_id) {
                return Err(StartError::MeNotInBootstrapMembers);
            }
            match self.configurations.latest() {
                Some(recovered) => slog::info!(
                    self.logger,
                    "Ignoring bootstrap members, already have configuration {:?}",
                    recovered
                ),
                None => self
                    .configurations
                    .push(ClusterConfiguration::bootstrap(member_ids)),
            }
        }

        self.started = true;
        self.become_follower_or_passive(None);
        slog::info!(self.logger, "Started. Election state: {:?}", self.election_state);

        // Nobody else can win an election for us.
        if self.election_state.role() == RaftRole::Follower && self.is_sole_active_member() {
            if let Err(ioe) = self.start_election() {
                let reason = format!("Failed to start election: {}", ioe);
                self.fail(reason);
                return Err(StartError::LocalIoError(ioe));
            }
        }

        Ok(())
    }

    pub(crate) fn suspend_candidacy(&mut self, step_down: bool) {
        self.candidacy_suspended = true;
        if step_down && self.election_state.is_leader() {
            slog::info!(self.logger, "Stepping down, candidacy suspended.");
            self.become_follower_or_passive(None);
        }
    }

    pub(crate) fn resume_candidacy(&mut self) {
        self.candidacy_suspended = false;
    }

    pub(crate) fn handle_step_down(&mut self) -> Result<(), StepDownError> {
        if !self.election_state.is_leader() {
            return Err(StepDownError::NotLeader);
        }

        slog::info!(self.logger, "Stepping down on request.");
        self.become_follower_or_passive(None);
        Ok(())
    }

    pub(crate) fn shutdown(&mut self) {
        slog::info!(self.logger, "Shutting down. Election state: {:?}", self.election_state);
        let term = self.local_state.current_term();
        let tracker = self.election_state.transition_to_inactive(term);
        Self::abandon_leadership(tracker);
        self.pending_snapshot = None;
        self.shut_down = true;
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub(crate) fn status(&self) -> RaftStatus {
        let configuration = self.configurations.latest();
        let leader_state = self.election_state.leader_state();

        RaftStatus {
            replica_id: self.my_replica_id.to_string(),
            role: self.election_state.role(),
            term: self.local_state.current_term().as_u64(),
            leader: self.election_state.leader().map(ReplicaId::into_inner),
            commit_index: index_or_zero(self.raft_log.commit_index()),
            last_applied_index: index_or_zero(self.raft_log.last_applied_index()),
            last_log_index: index_or_zero(self.raft_log.latest_index()),
            last_log_term: self
                .raft_log
                .latest_entry()
                .map(|(term, _)| term.as_u64())
                .unwrap_or(0),
            first_log_index: self.raft_log.first_retained_index().as_u64(),
            snapshot_index: index_or_zero(self.raft_log.snapshot_boundary().map(|(_, index)| index)),
            configuration: configuration
                .map(|c| c.members().iter().cloned().map(Into::into).collect())
                .unwrap_or_default(),
            configuration_version: index_or_zero(configuration.and_then(|c| c.version())),
            admission_limit: leader_state.and_then(|tracker| tracker.commit_limiter.limit()),
            in_flight_appends: leader_state
                .map(|tracker| tracker.pending_appends.len())
                .unwrap_or(0),
        }
    }

    pub(crate) fn read_log(&self, from: Index, mode: ReaderMode) -> Result<Vec<RaftEntry>, ReadLogError> {
        self.raft_log.reader(from, mode).map_err(ReadLogError::LocalIoError)
    }

    pub(crate) fn current_snapshot(&self) -> Result<Option<SnapshotMeta>, ReadLogError> {
        self.snapshot_store
            .latest()
            .map(|snapshot| snapshot.map(|s| s.meta))
            .map_err(ReadLogError::LocalIoError)
    }

    // ------- Role helpers shared by the impl files --------

    fn current_term(&self) -> Term {
        self.local_state.current_term()
    }

    fn is_active_member(&self) -> bool {
        self.configurations
            .latest()
            .map(|c| c.is_active(&self.my_replica_id))
            .unwrap_or(false)
    }

    fn is_sole_active_member(&self) -> bool {
        match self.configurations.latest() {
            Some(c) => c.num_active() == 1 && c.is_active(&self.my_replica_id),
            None => false,
        }
    }

    /// Leaves whatever role we're in for the one our membership allows: Follower if Active,
    /// otherwise Passive.
    fn become_follower_or_passive(&mut self, leader: Option<ReplicaId>) {
        let term = self.current_term();
        let tracker = if self.is_active_member() {
            self.election_state.transition_to_follower(leader, term)
        } else {
            self.election_state.transition_to_passive(leader, term)
        };
        Self::abandon_leadership(tracker);
        self.discard_stale_pending_snapshot();
    }

    /// Membership may have changed under us. Moves between Follower and Passive as needed, and
    /// steps down if we're leading without being Active.
    fn refresh_role(&mut self) {
        let active = self.is_active_member();
        let should_change = match self.election_state.role() {
            RaftRole::Inactive => false,
            RaftRole::Passive => active,
            RaftRole::Follower | RaftRole::Candidate | RaftRole::Leader => !active,
        };

        if should_change {
            let leader = if self.election_state.is_leader() {
                None
            } else {
                self.election_state.leader()
            };
            self.become_follower_or_passive(leader);
            slog::info!(
                self.logger,
                "Membership changed. Election state: {:?}",
                self.election_state
            );
        }
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    ///
    /// Returns true if the term increased, or if we failed trying to persist it. Either way
    /// the caller must not continue as if nothing happened.
    fn step_down_if_term_increased(&mut self, term: Term) -> bool {
        match self.local_state.store_term_if_increased(term) {
            Ok(true) => {
                self.become_follower_or_passive(None);
                slog::info!(
                    self.logger,
                    "Observed newer term {:?}. Election state: {:?}",
                    term,
                    self.election_state
                );
                true
            }
            Ok(false) => false,
            Err(ioe) => {
                self.fail(format!("Failed to persist term {:?}: {}", term, ioe));
                true
            }
        }
    }

    fn abandon_leadership(tracker: Option<LeaderStateTracker>) {
        if let Some(tracker) = tracker {
            tracker.abandon();
        }
    }

    /// Unrecoverable local failure. We stop participating rather than risk acting on a local
    /// state we can no longer trust.
    fn fail(&mut self, reason: String) {
        slog::error!(self.logger, "Local failure, going Inactive: {}", reason);
        let term = self.local_state.current_term();
        let tracker = self.election_state.transition_to_inactive(term);
        Self::abandon_leadership(tracker);
        self.pending_snapshot = None;
        self.event_publisher.publish(RaftEvent::Failure { reason });
    }

    fn peer_client(&mut self, peer_id: &ReplicaId) -> Arc<dyn PeerClient> {
        let connector = &self.connector;
        let my_replica_id = &self.my_replica_id;
        self.peer_clients
            .entry(peer_id.clone())
            .or_insert_with(|| connector.peer_client(my_replica_id, peer_id))
            .clone()
    }

    fn rpc_timeout(&self) -> Duration {
        self.options.leader_append_entries_timeout
    }
}

/// Bounds an outbound RPC. A timeout is just another way of learning nothing.
async fn with_timeout<O, F>(timeout: Duration, call: F) -> Result<O, RpcError>
where
    F: Future<Output = Result<O, RpcError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    }
}
