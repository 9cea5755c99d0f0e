//! Conversions between the protocol's RPC types and their protobuf messages. Term and index
//! pairs use 0 on the wire for "no entry".

use crate::api::{MembershipError, TransferLeadershipError};
use crate::commitlog::Index;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoChangeError, ProtoChangeKind, ProtoConfigurationChangeReq,
    ProtoConfigurationChangeResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoLogEntry, ProtoMember,
    ProtoPollReq, ProtoPollResult, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoTransferLeadershipReq,
    ProtoTransferLeadershipResult,
};
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, ConfigurationChange, ConfigurationChangeInput, ConfigurationChangeOutput,
    InstallSnapshotInput, InstallSnapshotOutput, LeadershipHandoff, Member, MemberType, PollInput, PollOutput,
    RaftLogEntry, ReplicaId, RequestVoteInput, RequestVoteOutput, RpcError, Term, TransferLeadershipInput,
};
use crate::snapshot::SnapshotMeta;
use bytes::Bytes;
use std::convert::TryFrom;
use tonic::{Code, Status};

// ------- RequestVote / Poll --------

impl TryFrom<ProtoRequestVoteReq> for RequestVoteInput {
    type Error = Status;

    fn try_from(rpc_request: ProtoRequestVoteReq) -> Result<Self, Self::Error> {
        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.candidate_id),
            candidate_last_log_entry: log_entry_metadata(
                rpc_request.last_log_entry_term,
                rpc_request.last_log_entry_index,
            )?,
        })
    }
}

impl From<RequestVoteInput> for ProtoRequestVoteReq {
    fn from(input: RequestVoteInput) -> Self {
        let (last_log_entry_term, last_log_entry_index) = proto_log_entry_metadata(input.candidate_last_log_entry);
        ProtoRequestVoteReq {
            candidate_id: input.candidate_id.into_inner(),
            term: input.candidate_term.as_u64(),
            last_log_entry_index,
            last_log_entry_term,
        }
    }
}

impl From<RequestVoteOutput> for ProtoRequestVoteResult {
    fn from(output: RequestVoteOutput) -> Self {
        ProtoRequestVoteResult {
            term: output.term.as_u64(),
            vote_granted: output.vote_granted,
        }
    }
}

impl From<ProtoRequestVoteResult> for RequestVoteOutput {
    fn from(rpc_result: ProtoRequestVoteResult) -> Self {
        RequestVoteOutput {
            term: Term::new(rpc_result.term),
            vote_granted: rpc_result.vote_granted,
        }
    }
}

impl TryFrom<ProtoPollReq> for PollInput {
    type Error = Status;

    fn try_from(rpc_request: ProtoPollReq) -> Result<Self, Self::Error> {
        Ok(PollInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.candidate_id),
            candidate_last_log_entry: log_entry_metadata(
                rpc_request.last_log_entry_term,
                rpc_request.last_log_entry_index,
            )?,
        })
    }
}

impl From<PollInput> for ProtoPollReq {
    fn from(input: PollInput) -> Self {
        let (last_log_entry_term, last_log_entry_index) = proto_log_entry_metadata(input.candidate_last_log_entry);
        ProtoPollReq {
            candidate_id: input.candidate_id.into_inner(),
            term: input.candidate_term.as_u64(),
            last_log_entry_index,
            last_log_entry_term,
        }
    }
}

impl From<PollOutput> for ProtoPollResult {
    fn from(output: PollOutput) -> Self {
        ProtoPollResult {
            term: output.term.as_u64(),
            accepted: output.accepted,
        }
    }
}

impl From<ProtoPollResult> for PollOutput {
    fn from(rpc_result: ProtoPollResult) -> Self {
        PollOutput {
            term: Term::new(rpc_result.term),
            accepted: rpc_result.accepted,
        }
    }
}

// ------- AppendEntries --------

impl TryFrom<ProtoAppendEntriesReq> for AppendEntriesInput {
    type Error = Status;

    fn try_from(rpc_request: ProtoAppendEntriesReq) -> Result<Self, Self::Error> {
        let leader_previous_log_entry = log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let mut new_entries = Vec::with_capacity(rpc_request.new_entries.len());
        for proto_entry in rpc_request.new_entries {
            let entry = RaftLogEntry::try_from(proto_entry.encoded)
                .map_err(|e| Status::invalid_argument(format!("Undecodable log entry: {}", e)))?;
            if entry.term.as_u64() != proto_entry.term {
                return Err(Status::invalid_argument("Log entry term doesn't match its encoding"));
            }
            new_entries.push(entry);
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.leader_id),
            leader_previous_log_entry,
            leader_commit_index: Index::from_u64(rpc_request.commit_index),
            new_entries,
        })
    }
}

impl From<AppendEntriesInput> for ProtoAppendEntriesReq {
    fn from(input: AppendEntriesInput) -> Self {
        let (previous_log_entry_term, previous_log_entry_index) =
            proto_log_entry_metadata(input.leader_previous_log_entry);
        ProtoAppendEntriesReq {
            leader_id: input.leader_id.into_inner(),
            term: input.leader_term.as_u64(),
            previous_log_entry_index,
            previous_log_entry_term,
            commit_index: proto_index(input.leader_commit_index),
            new_entries: input
                .new_entries
                .into_iter()
                .map(|entry| ProtoLogEntry {
                    term: entry.term.as_u64(),
                    encoded: entry.into(),
                })
                .collect(),
        }
    }
}

impl From<AppendEntriesOutput> for ProtoAppendEntriesResult {
    fn from(output: AppendEntriesOutput) -> Self {
        ProtoAppendEntriesResult {
            term: output.term.as_u64(),
            success: output.success,
            last_log_index: proto_index(output.last_log_index),
        }
    }
}

impl From<ProtoAppendEntriesResult> for AppendEntriesOutput {
    fn from(rpc_result: ProtoAppendEntriesResult) -> Self {
        AppendEntriesOutput {
            term: Term::new(rpc_result.term),
            success: rpc_result.success,
            last_log_index: Index::from_u64(rpc_result.last_log_index),
        }
    }
}

// ------- InstallSnapshot --------

impl TryFrom<ProtoInstallSnapshotReq> for InstallSnapshotInput {
    type Error = Status;

    fn try_from(rpc_request: ProtoInstallSnapshotReq) -> Result<Self, Self::Error> {
        let index = Index::from_u64(rpc_request.snapshot_index)
            .ok_or_else(|| Status::invalid_argument("Snapshot index must be non-zero"))?;

        Ok(InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.leader_id),
            meta: SnapshotMeta {
                index,
                term: Term::new(rpc_request.snapshot_term),
                timestamp_millis: rpc_request.snapshot_timestamp,
                version: rpc_request.snapshot_version,
                size: rpc_request.snapshot_size,
                checksum: rpc_request.snapshot_checksum,
                configuration: rpc_request.snapshot_members.into_iter().map(Member::from).collect(),
                configuration_version: Index::from_u64(rpc_request.configuration_version),
            },
            chunk_index: rpc_request.chunk_index,
            chunk: Bytes::from(rpc_request.chunk_data),
            is_last: rpc_request.is_last,
        })
    }
}

impl From<InstallSnapshotInput> for ProtoInstallSnapshotReq {
    fn from(input: InstallSnapshotInput) -> Self {
        let meta = input.meta;
        ProtoInstallSnapshotReq {
            leader_id: input.leader_id.into_inner(),
            term: input.leader_term.as_u64(),
            snapshot_index: meta.index.as_u64(),
            snapshot_term: meta.term.as_u64(),
            snapshot_timestamp: meta.timestamp_millis,
            snapshot_version: meta.version,
            snapshot_members: meta.configuration.into_iter().map(ProtoMember::from).collect(),
            configuration_version: proto_index(meta.configuration_version),
            chunk_index: input.chunk_index,
            chunk_data: input.chunk.to_vec(),
            is_last: input.is_last,
            snapshot_size: meta.size,
            snapshot_checksum: meta.checksum,
        }
    }
}

impl From<InstallSnapshotOutput> for ProtoInstallSnapshotResult {
    fn from(output: InstallSnapshotOutput) -> Self {
        ProtoInstallSnapshotResult {
            term: output.term.as_u64(),
            success: output.success,
        }
    }
}

impl From<ProtoInstallSnapshotResult> for InstallSnapshotOutput {
    fn from(rpc_result: ProtoInstallSnapshotResult) -> Self {
        InstallSnapshotOutput {
            term: Term::new(rpc_result.term),
            success: rpc_result.success,
        }
    }
}

impl From<ProtoMember> for Member {
    fn from(proto_member: ProtoMember) -> Self {
        let member_type = if proto_member.active {
            MemberType::Active
        } else {
            MemberType::Passive
        };
        Member::new(ReplicaId::new(proto_member.id), member_type)
    }
}

impl From<Member> for ProtoMember {
    fn from(member: Member) -> Self {
        ProtoMember {
            active: member.is_active(),
            id: member.id.into_inner(),
        }
    }
}

// ------- ConfigurationChange --------

impl TryFrom<ProtoConfigurationChangeReq> for ConfigurationChangeInput {
    type Error = Status;

    fn try_from(rpc_request: ProtoConfigurationChangeReq) -> Result<Self, Self::Error> {
        let member = ReplicaId::new(rpc_request.member_id);
        let change = match ProtoChangeKind::from_i32(rpc_request.kind) {
            Some(ProtoChangeKind::JoinActive) => ConfigurationChange::Join {
                member,
                member_type: MemberType::Active,
            },
            Some(ProtoChangeKind::JoinPassive) => ConfigurationChange::Join {
                member,
                member_type: MemberType::Passive,
            },
            Some(ProtoChangeKind::Leave) => ConfigurationChange::Leave(member),
            Some(ProtoChangeKind::Promote) => ConfigurationChange::Promote(member),
            Some(ProtoChangeKind::Demote) => ConfigurationChange::Demote(member),
            None => return Err(Status::invalid_argument("Unknown configuration change kind")),
        };

        Ok(ConfigurationChangeInput { change })
    }
}

impl From<ConfigurationChangeInput> for ProtoConfigurationChangeReq {
    fn from(input: ConfigurationChangeInput) -> Self {
        let (kind, member) = match input.change {
            ConfigurationChange::Join {
                member,
                member_type: MemberType::Active,
            } => (ProtoChangeKind::JoinActive, member),
            ConfigurationChange::Join {
                member,
                member_type: MemberType::Passive,
            } => (ProtoChangeKind::JoinPassive, member),
            ConfigurationChange::Leave(member) => (ProtoChangeKind::Leave, member),
            ConfigurationChange::Promote(member) => (ProtoChangeKind::Promote, member),
            ConfigurationChange::Demote(member) => (ProtoChangeKind::Demote, member),
        };

        ProtoConfigurationChangeReq {
            kind: kind as i32,
            member_id: member.into_inner(),
        }
    }
}

pub(crate) fn proto_configuration_change_result(
    result: Result<ConfigurationChangeOutput, MembershipError>,
) -> ProtoConfigurationChangeResult {
    let mut rpc_result = ProtoConfigurationChangeResult::default();
    match result {
        Ok(output) => {
            rpc_result.error = ProtoChangeError::NoError as i32;
            rpc_result.configuration_version = proto_index(output.configuration_version);
        }
        Err(e) => {
            let (error, leader_hint) = match &e {
                MembershipError::NotLeader { leader_hint } => (ProtoChangeError::NotLeader, leader_hint.clone()),
                MembershipError::ChangePending => (ProtoChangeError::ChangePending, None),
                MembershipError::LeaderNotReady => (ProtoChangeError::LeaderNotReady, None),
                MembershipError::UnknownMember => (ProtoChangeError::UnknownMember, None),
                MembershipError::WouldRemoveLastActiveMember => (ProtoChangeError::LastActiveMember, None),
                MembershipError::LeadershipLost => (ProtoChangeError::LeadershipLost, None),
                MembershipError::Timeout => (ProtoChangeError::Timeout, None),
                MembershipError::Inactive => (ProtoChangeError::Inactive, None),
                MembershipError::Unavailable(_) | MembershipError::ReplicaExited => {
                    (ProtoChangeError::Unavailable, None)
                }
            };
            rpc_result.error = error as i32;
            rpc_result.leader_hint = leader_hint.unwrap_or_default();
            rpc_result.message = e.to_string();
        }
    }

    rpc_result
}

pub(crate) fn configuration_change_result(
    rpc_result: ProtoConfigurationChangeResult,
) -> Result<ConfigurationChangeOutput, MembershipError> {
    let leader_hint = non_empty(rpc_result.leader_hint);
    match ProtoChangeError::from_i32(rpc_result.error) {
        Some(ProtoChangeError::NoError) => Ok(ConfigurationChangeOutput {
            configuration_version: Index::from_u64(rpc_result.configuration_version),
        }),
        Some(ProtoChangeError::NotLeader) => Err(MembershipError::NotLeader { leader_hint }),
        Some(ProtoChangeError::ChangePending) => Err(MembershipError::ChangePending),
        Some(ProtoChangeError::LeaderNotReady) => Err(MembershipError::LeaderNotReady),
        Some(ProtoChangeError::UnknownMember) => Err(MembershipError::UnknownMember),
        Some(ProtoChangeError::LastActiveMember) => Err(MembershipError::WouldRemoveLastActiveMember),
        Some(ProtoChangeError::LeadershipLost) => Err(MembershipError::LeadershipLost),
        Some(ProtoChangeError::Timeout) => Err(MembershipError::Timeout),
        Some(ProtoChangeError::Inactive) => Err(MembershipError::Inactive),
        _ => Err(MembershipError::Unavailable(rpc_result.message)),
    }
}

// ------- TransferLeadership --------

impl From<TransferLeadershipInput> for ProtoTransferLeadershipReq {
    fn from(input: TransferLeadershipInput) -> Self {
        let (leader_id, term) = match input.handoff {
            Some(handoff) => (handoff.leader_id.into_inner(), handoff.leader_term.as_u64()),
            None => (String::new(), 0),
        };
        ProtoTransferLeadershipReq {
            target_id: input.target_id.into_inner(),
            leader_id,
            term,
        }
    }
}

impl From<ProtoTransferLeadershipReq> for TransferLeadershipInput {
    fn from(rpc_request: ProtoTransferLeadershipReq) -> Self {
        let handoff = match non_empty(rpc_request.leader_id) {
            Some(leader_id) => Some(LeadershipHandoff {
                leader_id: ReplicaId::new(leader_id),
                leader_term: Term::new(rpc_request.term),
            }),
            None => None,
        };
        TransferLeadershipInput {
            target_id: ReplicaId::new(rpc_request.target_id),
            handoff,
        }
    }
}

pub(crate) fn proto_transfer_leadership_result(
    result: Result<(), TransferLeadershipError>,
) -> ProtoTransferLeadershipResult {
    let e = match result {
        Ok(()) => return ProtoTransferLeadershipResult::default(),
        Err(e) => e,
    };

    let (error, leader_hint) = match &e {
        TransferLeadershipError::NotLeader { leader_hint } => (ProtoChangeError::NotLeader, leader_hint.clone()),
        TransferLeadershipError::UnknownMember => (ProtoChangeError::UnknownMember, None),
        TransferLeadershipError::TargetNotActive => (ProtoChangeError::TargetNotActive, None),
        TransferLeadershipError::TransferInProgress => (ProtoChangeError::TransferInProgress, None),
        TransferLeadershipError::Timeout => (ProtoChangeError::Timeout, None),
        TransferLeadershipError::LeadershipLost => (ProtoChangeError::LeadershipLost, None),
        TransferLeadershipError::StaleTerm => (ProtoChangeError::StaleTerm, None),
        TransferLeadershipError::CandidacySuspended => (ProtoChangeError::CandidacySuspended, None),
        TransferLeadershipError::Inactive => (ProtoChangeError::Inactive, None),
        TransferLeadershipError::Unavailable(_) | TransferLeadershipError::ReplicaExited => {
            (ProtoChangeError::Unavailable, None)
        }
    };

    ProtoTransferLeadershipResult {
        error: error as i32,
        leader_hint: leader_hint.unwrap_or_default(),
        message: e.to_string(),
    }
}

pub(crate) fn transfer_leadership_result(
    rpc_result: ProtoTransferLeadershipResult,
) -> Result<(), TransferLeadershipError> {
    let leader_hint = non_empty(rpc_result.leader_hint);
    match ProtoChangeError::from_i32(rpc_result.error) {
        Some(ProtoChangeError::NoError) => Ok(()),
        Some(ProtoChangeError::NotLeader) => Err(TransferLeadershipError::NotLeader { leader_hint }),
        Some(ProtoChangeError::UnknownMember) => Err(TransferLeadershipError::UnknownMember),
        Some(ProtoChangeError::TargetNotActive) => Err(TransferLeadershipError::TargetNotActive),
        Some(ProtoChangeError::TransferInProgress) => Err(TransferLeadershipError::TransferInProgress),
        Some(ProtoChangeError::Timeout) => Err(TransferLeadershipError::Timeout),
        Some(ProtoChangeError::LeadershipLost) => Err(TransferLeadershipError::LeadershipLost),
        Some(ProtoChangeError::StaleTerm) => Err(TransferLeadershipError::StaleTerm),
        Some(ProtoChangeError::CandidacySuspended) => Err(TransferLeadershipError::CandidacySuspended),
        Some(ProtoChangeError::Inactive) => Err(TransferLeadershipError::Inactive),
        _ => Err(TransferLeadershipError::Unavailable(rpc_result.message)),
    }
}

// ------- Errors --------

/// Server side: the replica couldn't answer.
pub(crate) fn rpc_error_status(e: RpcError) -> Status {
    match e {
        RpcError::Inactive => Status::failed_precondition(e.to_string()),
        RpcError::ActorExited => Status::unavailable(e.to_string()),
        RpcError::ServerFault(_) | RpcError::Unreachable(_) | RpcError::Timeout => Status::internal(e.to_string()),
    }
}

/// Client side: every failure is just "no answer" to the protocol.
pub(crate) fn status_rpc_error(status: Status) -> RpcError {
    match status.code() {
        Code::FailedPrecondition => RpcError::Inactive,
        Code::Unavailable => RpcError::Unreachable(status.message().to_string()),
        Code::DeadlineExceeded => RpcError::Timeout,
        _ => RpcError::ServerFault(status.message().to_string()),
    }
}

// ------- Helpers --------

fn log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
    match (log_entry_term, log_entry_index) {
        (0, 0) => Ok(None),
        (0, _) => Err(Status::invalid_argument("LogEntryTerm 0 and LogEntryIndex non-0")),
        (_, 0) => Err(Status::invalid_argument("LogEntryIndex 0 and LogEntryTerm non-0")),
        (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
    }
}

fn proto_log_entry_metadata(entry: Option<(Term, Index)>) -> (u64, u64) {
    match entry {
        Some((term, index)) => (term.as_u64(), index.as_u64()),
        None => (0, 0),
    }
}

fn proto_index(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
