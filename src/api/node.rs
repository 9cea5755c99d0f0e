use crate::actor::ActorClient;
use crate::api::membership::ChangeSubmitter;
use crate::api::{
    AppendError, CompactError, MembershipChange, MembershipError, RaftElectionStateListener, RaftEntry, RaftEntryId,
    RaftEventKind, RaftEventListener, RaftNodeExited, RaftRole, RaftStatus, ReadLogError, ReaderMode, StartError,
    StepDownError, TransferLeadershipError,
};
use crate::commitlog::Index;
use crate::replica::{
    ConfigurationChange, ConfigurationChangeInput, ElectionStateChangeListener, EventPublisher, MemberType, ReplicaId,
    StartMode, TransferLeadershipInput,
};
use crate::server::ListenerStop;
use crate::snapshot::SnapshotMeta;
use bytes::Bytes;
use std::sync::Mutex;

/// RaftNode is the handle an application holds to one member of a raft cluster. All calls go
/// through the node's event loop, so the handle is cheap to share behind an `Arc`.
///
/// A new node is Inactive. Start it with exactly one of `bootstrap()`, `join()` or `listen()`.
pub struct RaftNode {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    actor_client: ActorClient,
    event_publisher: EventPublisher,
    election_state: ElectionStateChangeListener,
    change_submitter: ChangeSubmitter,
    rpc_listener: Mutex<Option<ListenerStop>>,
}

impl RaftNode {
    pub(crate) fn new(
        logger: slog::Logger,
        my_replica_id: ReplicaId,
        actor_client: ActorClient,
        event_publisher: EventPublisher,
        election_state: ElectionStateChangeListener,
        change_submitter: ChangeSubmitter,
        rpc_listener: Option<ListenerStop>,
    ) -> Self {
        RaftNode {
            logger,
            my_replica_id,
            actor_client,
            event_publisher,
            election_state,
            change_submitter,
            rpc_listener: Mutex::new(rpc_listener),
        }
    }

    pub fn replica_id(&self) -> &str {
        self.my_replica_id.as_str()
    }

    // ------- Lifecycle --------

    /// Starts a brand new cluster whose Active members are `members`, which must include this
    /// node. A node that recovered a configuration from its storage ignores `members`.
    pub async fn bootstrap<S: AsRef<str>>(&self, members: &[S]) -> Result<(), StartError> {
        let member_ids = members.iter().map(|id| ReplicaId::new(id.as_ref())).collect();
        self.actor_client.start(StartMode::Bootstrap(member_ids)).await
    }

    /// Joins an existing cluster as an Active member. Resolves once the cluster has committed
    /// this node as Active, which happens only after it has caught up as Passive.
    ///
    /// On `Timeout` the node may remain Passive. Calling `join()` again resumes from there.
    pub async fn join<S: AsRef<str>>(&self, existing_members: &[S]) -> Result<(), MembershipError> {
        self.start_joining().await?;
        let change = ConfigurationChange::Join {
            member: self.my_replica_id.clone(),
            member_type: MemberType::Active,
        };
        self.change_submitter
            .submit(change, to_replica_ids(existing_members))
            .await
            .map(|_| ())
    }

    /// Joins an existing cluster as a Passive member, which receives committed state but never
    /// votes or leads.
    pub async fn listen<S: AsRef<str>>(&self, existing_members: &[S]) -> Result<(), MembershipError> {
        self.start_joining().await?;
        let change = ConfigurationChange::Join {
            member: self.my_replica_id.clone(),
            member_type: MemberType::Passive,
        };
        self.change_submitter
            .submit(change, to_replica_ids(existing_members))
            .await
            .map(|_| ())
    }

    /// Removes this node from the cluster. This node won't run for leader again unless leaving
    /// fails.
    ///
    /// A leader can't replicate its own removal. It steps down and answers `NotLeader`, and the
    /// retry finds the next leader and commits the removal there. The change takes at least one
    /// election, so allow `membership_change_timeout` for it.
    pub async fn leave(&self) -> Result<(), MembershipError> {
        let status = self.actor_client.status().await?;
        let active = status.configuration.iter().filter(|m| m.active).count();
        let me_active = status
            .configuration
            .iter()
            .any(|m| m.active && m.replica_id == self.my_replica_id.as_str());
        if me_active && active == 1 {
            return Err(MembershipError::WouldRemoveLastActiveMember);
        }

        self.actor_client.suspend_candidacy(true).await?;
        let result = self
            .change_submitter
            .submit(
                ConfigurationChange::Leave(self.my_replica_id.clone()),
                members_of(&status),
            )
            .await;
        if result.is_err() {
            self.actor_client.resume_candidacy().await?;
        }

        result.map(|_| ())
    }

    /// Turns this Passive node into an Active one, once it has caught up.
    pub async fn promote(&self) -> Result<(), MembershipError> {
        let status = self.actor_client.status().await?;
        self.change_submitter
            .submit(
                ConfigurationChange::Promote(self.my_replica_id.clone()),
                members_of(&status),
            )
            .await
            .map(|_| ())
    }

    /// Turns this Active node into a Passive one.
    ///
    /// Like `leave()`, a leader hands the change to its successor: it steps down first, and the
    /// retry commits the demotion through whichever node wins the election.
    pub async fn demote(&self) -> Result<(), MembershipError> {
        let status = self.actor_client.status().await?;
        self.actor_client.suspend_candidacy(true).await?;
        let result = self
            .change_submitter
            .submit(
                ConfigurationChange::Demote(self.my_replica_id.clone()),
                members_of(&status),
            )
            .await;
        self.actor_client.resume_candidacy().await?;

        result.map(|_| ())
    }

    /// Gracefully stops the node: the replica goes Inactive, its event loop exits, and the RPC
    /// server (if any) stops listening. Pending appends fail.
    pub async fn shutdown(&self) -> Result<(), RaftNodeExited> {
        slog::info!(self.logger, "Shutting down node {}", self.my_replica_id);
        let result = self.actor_client.shutdown().await;
        let rpc_listener = self
            .rpc_listener
            .lock()
            .expect("RaftNode listener mutex poisoned")
            .take();
        if let Some(rpc_listener) = rpc_listener {
            rpc_listener.stop(&self.logger);
        }
        result
    }

    // ------- Leader operations --------

    /// Appends `data` to the replicated log. Only the leader accepts appends. Resolves once the
    /// entry has committed, never earlier.
    pub async fn append(&self, data: Bytes) -> Result<RaftEntryId, AppendError> {
        self.actor_client.append(data).await
    }

    /// A single attempt at a membership change against this node, which must be leader. Unlike
    /// `join()` and friends this doesn't retry, so callers see rejections like `ChangePending`.
    /// Returns the resulting configuration version.
    pub async fn submit_configuration_change(&self, change: MembershipChange) -> Result<u64, MembershipError> {
        let input = ConfigurationChangeInput {
            change: ConfigurationChange::from(change),
        };
        self.actor_client
            .configuration_change(input)
            .await
            .map(|output| output.configuration_version.map(|v| v.as_u64()).unwrap_or(0))
    }

    /// Hands leadership to `target_id` once it has caught up. New appends are rejected while the
    /// transfer is in progress.
    pub async fn transfer_leadership(&self, target_id: &str) -> Result<(), TransferLeadershipError> {
        let input = TransferLeadershipInput {
            target_id: ReplicaId::new(target_id),
            handoff: None,
        };
        self.actor_client.transfer_leadership(input).await
    }

    pub async fn step_down(&self) -> Result<(), StepDownError> {
        self.actor_client.step_down().await
    }

    /// While suspended this node never starts an election, and steps down first if `step_down`.
    pub async fn suspend_candidacy(&self, step_down: bool) -> Result<(), RaftNodeExited> {
        self.actor_client.suspend_candidacy(step_down).await
    }

    pub async fn resume_candidacy(&self) -> Result<(), RaftNodeExited> {
        self.actor_client.resume_candidacy().await
    }

    // ------- Local maintenance --------

    /// Snapshots the applied state up to `up_to_index` (or everything applied, if `None`) and
    /// drops the log prefix it covers.
    pub async fn compact(&self, up_to_index: Option<u64>) -> Result<SnapshotMeta, CompactError> {
        self.actor_client
            .compact(up_to_index.and_then(Index::from_u64))
            .await
    }

    // ------- Observation --------

    /// Subscribes to one kind of event. Every subscriber receives every matching event published
    /// after it subscribed.
    pub fn subscribe(&self, kind: RaftEventKind) -> RaftEventListener {
        RaftEventListener::new(self.event_publisher.subscribe(Some(kind)))
    }

    pub fn subscribe_all(&self) -> RaftEventListener {
        RaftEventListener::new(self.event_publisher.subscribe(None))
    }

    pub fn election_state_listener(&self) -> RaftElectionStateListener {
        RaftElectionStateListener::new(self.election_state.clone())
    }

    pub fn role(&self) -> RaftRole {
        self.election_state.current().role
    }

    pub async fn status(&self) -> Result<RaftStatus, RaftNodeExited> {
        self.actor_client.status().await
    }

    /// Log entries starting at `from_index`, or at the first retained entry if that's later.
    pub async fn read_log(&self, from_index: u64, mode: ReaderMode) -> Result<Vec<RaftEntry>, ReadLogError> {
        let from = Index::from_u64(from_index).unwrap_or_else(Index::start_index);
        self.actor_client.read_log(from, mode).await
    }

    pub async fn current_snapshot(&self) -> Result<Option<SnapshotMeta>, ReadLogError> {
        self.actor_client.current_snapshot().await
    }

    async fn start_joining(&self) -> Result<(), MembershipError> {
        match self.actor_client.start(StartMode::Join).await {
            Ok(()) => Ok(()),
            // Retrying a join that timed out. We may already be Passive.
            Err(StartError::AlreadyStarted) => Ok(()),
            Err(StartError::ReplicaExited) => Err(MembershipError::ReplicaExited),
            Err(e) => {
                slog::warn!(self.logger, "Failed to start for join: {}", e);
                Err(MembershipError::Inactive)
            }
        }
    }
}

fn to_replica_ids<S: AsRef<str>>(ids: &[S]) -> Vec<ReplicaId> {
    ids.iter().map(|id| ReplicaId::new(id.as_ref())).collect()
}

fn members_of(status: &RaftStatus) -> Vec<ReplicaId> {
    let mut members: Vec<ReplicaId> = status
        .configuration
        .iter()
        .map(|m| ReplicaId::new(m.replica_id.as_str()))
        .collect();
    // Ask the known leader first.
    if let Some(leader) = &status.leader {
        let leader = ReplicaId::new(leader.as_str());
        members.retain(|m| *m != leader);
        members.insert(0, leader);
    }
    members
}

// ------- Conversions --------

impl From<MembershipChange> for ConfigurationChange {
    fn from(change: MembershipChange) -> Self {
        match change {
            MembershipChange::JoinActive(id) => ConfigurationChange::Join {
                member: ReplicaId::new(id),
                member_type: MemberType::Active,
            },
            MembershipChange::JoinPassive(id) => ConfigurationChange::Join {
                member: ReplicaId::new(id),
                member_type: MemberType::Passive,
            },
            MembershipChange::Leave(id) => ConfigurationChange::Leave(ReplicaId::new(id)),
            MembershipChange::Promote(id) => ConfigurationChange::Promote(ReplicaId::new(id)),
            MembershipChange::Demote(id) => ConfigurationChange::Demote(ReplicaId::new(id)),
        }
    }
}
