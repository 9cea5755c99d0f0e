use crate::commitlog::Index;
use crate::replica::{Member, MemberType, Term};
use bytes::Bytes;

// Opaque type for application to match committed entries with.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct RaftEntryId {
    pub(crate) term: Term,
    pub(crate) index: Index,
}

impl RaftEntryId {
    pub fn term(&self) -> u64 {
        self.term.as_u64()
    }

    pub fn index(&self) -> u64 {
        self.index.as_u64()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEntryPayload {
    Application(Bytes),
    /// Written once per leader term, before the leader serves any request. Readers skip it.
    Initialize,
    Configuration(Vec<RaftMember>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftEntry {
    pub entry_id: RaftEntryId,
    pub payload: RaftEntryPayload,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftMember {
    pub replica_id: String,
    pub active: bool,
}

impl From<Member> for RaftMember {
    fn from(member: Member) -> Self {
        RaftMember {
            active: member.member_type == MemberType::Active,
            replica_id: member.id.into_inner(),
        }
    }
}

/// Role of this node as observed locally.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum RaftRole {
    Inactive,
    Passive,
    Follower,
    Candidate,
    Leader,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReaderMode {
    /// Only entries at or below the commit index.
    Commits,
    /// Everything written locally, committed or not.
    All,
}

/// A single administrative membership change, for `submit_configuration_change`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MembershipChange {
    JoinActive(String),
    JoinPassive(String),
    Leave(String),
    Promote(String),
    Demote(String),
}

/// Current leader and role as seen by the local node. Intermediate values are clobbered; only the
/// latest is observable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftElectionState {
    pub role: RaftRole,
    pub term: u64,
    pub leader_replica_id: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftStatus {
    pub replica_id: String,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<String>,
    /// 0 means nothing committed yet. Same for the other indexes.
    pub commit_index: u64,
    pub last_applied_index: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub first_log_index: u64,
    pub snapshot_index: u64,
    pub configuration: Vec<RaftMember>,
    pub configuration_version: u64,
    /// Current admission limit while leader with backpressure enabled.
    pub admission_limit: Option<usize>,
    /// Appended but not yet committed client entries, while leader.
    pub in_flight_appends: usize,
}
