use crate::api::RaftEntryPayload;
use crate::commitlog;
use crate::replica::cluster::{Member, MemberType, ReplicaId};
use crate::replica::Term;
use bytes::{Buf, BufMut, Bytes};
use std::convert::TryFrom;
use std::io;

/// Byte representation:
///
/// ```text
/// |                                             1                       |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|Knd|       Term (8 bytes)          |   Data (variable size)  ... |
/// +---+---+-------------------------------+-------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Knd` - entry kind: 0 application, 1 initialize, 2 configuration
/// * `Term` - raft leadership term when this entry was created, little endian
/// * `Data` - app specific data payload, empty for initialize entries, and a member list for
///   configuration entries
///
/// A member list is a sequence of `| Type (1) | IdLen (4, LE) | Id (IdLen) |` records, where `Type`
/// is 0 for active and 1 for passive.
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftLogEntry {
    pub(crate) term: Term,
    pub(crate) payload: EntryPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EntryPayload {
    Application(Bytes),
    /// Written once at the start of each leader's term.
    Initialize,
    /// The full member list that takes effect at this entry's index.
    Configuration(Vec<Member>),
}

const RAFT_LOG_ENTRY_FORMAT_VERSION: u8 = 2;
const HEADER_LEN: usize = 1 + 1 + 8;

const KIND_APPLICATION: u8 = 0;
const KIND_INITIALIZE: u8 = 1;
const KIND_CONFIGURATION: u8 = 2;

impl RaftLogEntry {
    pub(crate) fn application(term: Term, data: Bytes) -> Self {
        RaftLogEntry {
            term,
            payload: EntryPayload::Application(data),
        }
    }

    pub(crate) fn initialize(term: Term) -> Self {
        RaftLogEntry {
            term,
            payload: EntryPayload::Initialize,
        }
    }

    pub(crate) fn configuration(term: Term, members: Vec<Member>) -> Self {
        RaftLogEntry {
            term,
            payload: EntryPayload::Configuration(members),
        }
    }
}

impl commitlog::Entry for RaftLogEntry {}

impl TryFrom<Vec<u8>> for RaftLogEntry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid_data("log entry shorter than header"));
        }

        let mut buf = &bytes[..];
        let version = buf.get_u8();
        if version != RAFT_LOG_ENTRY_FORMAT_VERSION {
            return Err(invalid_data("unknown log entry format version"));
        }
        let kind = buf.get_u8();
        let term = Term::new(buf.get_u64_le());

        let payload = match kind {
            KIND_APPLICATION => EntryPayload::Application(Bytes::copy_from_slice(buf)),
            KIND_INITIALIZE => EntryPayload::Initialize,
            KIND_CONFIGURATION => EntryPayload::Configuration(decode_members(buf)?),
            _ => return Err(invalid_data("unknown log entry kind")),
        };

        Ok(RaftLogEntry { term, payload })
    }
}

impl From<RaftLogEntry> for Vec<u8> {
    fn from(entry: RaftLogEntry) -> Self {
        let (kind, data_len) = match &entry.payload {
            EntryPayload::Application(data) => (KIND_APPLICATION, data.len()),
            EntryPayload::Initialize => (KIND_INITIALIZE, 0),
            EntryPayload::Configuration(members) => (KIND_CONFIGURATION, members.len() * 16),
        };

        let mut bytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + data_len);
        bytes.put_u8(RAFT_LOG_ENTRY_FORMAT_VERSION);
        bytes.put_u8(kind);
        bytes.put_u64_le(entry.term.as_u64());

        match entry.payload {
            EntryPayload::Application(data) => bytes.put_slice(&data),
            EntryPayload::Initialize => {}
            EntryPayload::Configuration(members) => encode_members(&members, &mut bytes),
        }

        bytes
    }
}

impl From<EntryPayload> for RaftEntryPayload {
    fn from(payload: EntryPayload) -> Self {
        match payload {
            EntryPayload::Application(data) => RaftEntryPayload::Application(data),
            EntryPayload::Initialize => RaftEntryPayload::Initialize,
            EntryPayload::Configuration(members) => {
                RaftEntryPayload::Configuration(members.into_iter().map(Into::into).collect())
            }
        }
    }
}

fn encode_members(members: &[Member], bytes: &mut Vec<u8>) {
    for member in members {
        bytes.put_u8(match member.member_type {
            MemberType::Active => 0,
            MemberType::Passive => 1,
        });
        let id = member.id.as_str().as_bytes();
        bytes.put_u32_le(id.len() as u32);
        bytes.put_slice(id);
    }
}

fn decode_members(mut buf: &[u8]) -> Result<Vec<Member>, io::Error> {
    let mut members = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 5 {
            return Err(invalid_data("truncated member record"));
        }
        let member_type = match buf.get_u8() {
            0 => MemberType::Active,
            1 => MemberType::Passive,
            _ => return Err(invalid_data("unknown member type")),
        };
        let id_len = buf.get_u32_le() as usize;
        if buf.remaining() < id_len {
            return Err(invalid_data("truncated member id"));
        }
        let id = String::from_utf8(buf[..id_len].to_vec()).map_err(|_| invalid_data("member id is not utf-8"))?;
        buf.advance(id_len);

        members.push(Member::new(ReplicaId::new(id), member_type));
    }

    Ok(members)
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
