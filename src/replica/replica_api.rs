use crate::commitlog::Index;
use crate::replica::cluster::{ConfigurationChange, ReplicaId};
use crate::replica::local_state::Term;
use crate::replica::write_ahead_log::RaftLogEntry;
use crate::snapshot::SnapshotMeta;
use bytes::Bytes;

#[derive(Clone, Debug)]
pub(crate) enum StartMode {
    /// Start a brand new cluster with these Active members.
    Bootstrap(Vec<ReplicaId>),
    /// Wait for a leader to replicate the configuration to us. Used by join and listen.
    Join,
}

/// Failure to get an answer from a peer. The protocol treats every variant as "no information".
#[derive(Debug, thiserror::Error)]
pub(crate) enum RpcError {
    #[error("Peer isn't participating in a cluster")]
    Inactive,
    #[error("Peer replica actor has exited")]
    ActorExited,
    #[error("Peer failed to handle request: {0}")]
    ServerFault(String),
    #[error("Peer unreachable: {0}")]
    Unreachable(String),
    #[error("Request timed out")]
    Timeout,
}

#[derive(Clone, Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Clone, Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) term: Term,
    pub(crate) vote_granted: bool,
}

/// Same shape as a vote request, for the term the candidate would campaign in. Answering never
/// changes the voter's state.
#[derive(Clone, Debug)]
pub(crate) struct PollInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Clone, Debug)]
pub(crate) struct PollOutput {
    pub(crate) term: Term,
    pub(crate) accepted: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<RaftLogEntry>,
}

#[derive(Clone, Debug)]
pub(crate) struct AppendEntriesOutput {
    pub(crate) term: Term,
    pub(crate) success: bool,
    // Our last index, so a leader can skip straight past what we're missing.
    pub(crate) last_log_index: Option<Index>,
}

#[derive(Clone, Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) meta: SnapshotMeta,
    pub(crate) chunk_index: u64,
    pub(crate) chunk: Bytes,
    pub(crate) is_last: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct InstallSnapshotOutput {
    pub(crate) term: Term,
    pub(crate) success: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct ConfigurationChangeInput {
    pub(crate) change: ConfigurationChange,
}

#[derive(Clone, Debug)]
pub(crate) struct ConfigurationChangeOutput {
    pub(crate) configuration_version: Option<Index>,
}

#[derive(Clone, Debug)]
pub(crate) struct TransferLeadershipInput {
    pub(crate) target_id: ReplicaId,
    // Set when the leader hands off to the target, after it has caught up.
    pub(crate) handoff: Option<LeadershipHandoff>,
}

#[derive(Clone, Debug)]
pub(crate) struct LeadershipHandoff {
    pub(crate) leader_id: ReplicaId,
    pub(crate) leader_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: Result<RequestVoteOutput, RpcError>,
}

#[derive(Debug)]
pub(crate) struct PollReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) round: u64,
    pub(crate) poll_term: Term,
    pub(crate) result: Result<PollOutput, RpcError>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<AppendEntriesOutput, RpcError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: u64,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) snapshot_index: Index,
    pub(crate) chunk_index: u64,
    pub(crate) is_last: bool,
    pub(crate) result: Result<InstallSnapshotOutput, RpcError>,
}

#[derive(Debug)]
pub(crate) struct TransferLeadershipReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: Result<(), crate::api::TransferLeadershipError>,
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// ElectionTimeoutTick fires when a follower or candidate hasn't heard from a leader in time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ElectionTimeoutTick {
    pub(crate) epoch: u64,
}

impl From<crate::actor::ActorExited> for RpcError {
    fn from(_: crate::actor::ActorExited) -> Self {
        RpcError::ActorExited
    }
}
