use crate::actor::ActorExited;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    #[error("I'm not leader, {leader_hint} is")]
    NotLeader { leader_hint: String },

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    // Too many appends are waiting to commit. Retry later, or shed load.
    #[error("Too many uncommitted entries in flight")]
    Overloaded,

    #[error("Leadership is being transferred")]
    LeadershipTransferInProgress,

    // The entry may or may not end up committed by the next leader.
    #[error("Lost leadership before the entry committed")]
    LeadershipLost,

    #[error("Node isn't participating in a cluster")]
    Inactive,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    // Replica logic runs on a background task. This error is returned if the task has exited.
    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("I'm not leader, try {leader_hint:?}")]
    NotLeader { leader_hint: Option<String> },

    #[error("Another configuration change is still uncommitted")]
    ChangePending,

    // Leader hasn't committed an entry in its own term yet.
    #[error("Leader isn't ready to change membership yet")]
    LeaderNotReady,

    #[error("Member isn't part of the cluster")]
    UnknownMember,

    #[error("Change would leave the cluster without Active members")]
    WouldRemoveLastActiveMember,

    #[error("Lost leadership before the change committed")]
    LeadershipLost,

    // The member may still be Passive. Retrying a join resumes where it left off.
    #[error("Change didn't complete in time")]
    Timeout,

    #[error("Couldn't reach the cluster: {0}")]
    Unavailable(String),

    #[error("Node isn't participating in a cluster")]
    Inactive,

    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferLeadershipError {
    #[error("I'm not leader, try {leader_hint:?}")]
    NotLeader { leader_hint: Option<String> },

    #[error("Target isn't part of the cluster")]
    UnknownMember,

    #[error("Target isn't an Active member")]
    TargetNotActive,

    #[error("A transfer is already in progress")]
    TransferInProgress,

    #[error("Target didn't catch up in time")]
    Timeout,

    #[error("Lost leadership before the transfer completed")]
    LeadershipLost,

    #[error("Hand-off is from an old term")]
    StaleTerm,

    #[error("Target won't run for leader")]
    CandidacySuspended,

    #[error("Couldn't reach the target: {0}")]
    Unavailable(String),

    #[error("Node isn't participating in a cluster")]
    Inactive,

    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    #[error("Node isn't participating in a cluster")]
    Inactive,

    #[error("Nothing applied past the current snapshot")]
    NothingToCompact,

    // The snapshot being replaced is still being streamed to a peer.
    #[error("A snapshot transfer is in progress")]
    SnapshotTransferInProgress,

    #[error("Snapshot source failed to produce data")]
    SnapshotSource(io::Error),

    #[error("Failed to persist snapshot or compact log")]
    LocalIoError(io::Error),

    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Node was already started")]
    AlreadyStarted,

    #[error("Bootstrap members must include this node")]
    MeNotInBootstrapMembers,

    #[error("Failed to persist local state")]
    LocalIoError(io::Error),

    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum StepDownError {
    #[error("I'm not leader")]
    NotLeader,

    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadLogError {
    #[error("Failed to read log")]
    LocalIoError(io::Error),

    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
#[error("Replica task has exited")]
pub struct RaftNodeExited;

#[derive(Debug, thiserror::Error)]
pub enum RaftNodeCreationError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("Log initialization failure")]
    LogInitialization(io::Error),
    #[error("Snapshot store failure")]
    SnapshotStore(io::Error),
}

// ------- Conversions --------

impl From<ActorExited> for AppendError {
    fn from(_: ActorExited) -> Self {
        AppendError::ReplicaExited
    }
}

impl From<ActorExited> for MembershipError {
    fn from(_: ActorExited) -> Self {
        MembershipError::ReplicaExited
    }
}

impl From<RaftNodeExited> for MembershipError {
    fn from(_: RaftNodeExited) -> Self {
        MembershipError::ReplicaExited
    }
}

impl From<ActorExited> for TransferLeadershipError {
    fn from(_: ActorExited) -> Self {
        TransferLeadershipError::ReplicaExited
    }
}

impl From<ActorExited> for CompactError {
    fn from(_: ActorExited) -> Self {
        CompactError::ReplicaExited
    }
}

impl From<ActorExited> for StartError {
    fn from(_: ActorExited) -> Self {
        StartError::ReplicaExited
    }
}

impl From<ActorExited> for StepDownError {
    fn from(_: ActorExited) -> Self {
        StepDownError::ReplicaExited
    }
}

impl From<ActorExited> for ReadLogError {
    fn from(_: ActorExited) -> Self {
        ReadLogError::ReplicaExited
    }
}

impl From<ActorExited> for RaftNodeExited {
    fn from(_: ActorExited) -> Self {
        RaftNodeExited
    }
}
