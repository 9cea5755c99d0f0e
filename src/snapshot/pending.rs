use crate::commitlog::Index;
use crate::replica::{ReplicaId, Term};
use crate::snapshot::{Snapshot, SnapshotMeta};
use bytes::{Bytes, BytesMut};
use std::io;

/// PendingSnapshot assembles a snapshot a leader is streaming to us. Chunks must arrive in order.
/// Nothing is visible to the rest of the replica until `finish()` has checked the result against
/// the size and checksum the leader advertised.
///
/// A transfer belongs to the leader and term that started it. Once either changes, nobody is
/// going to send the rest.
pub(crate) struct PendingSnapshot {
    meta: SnapshotMeta,
    leader_term: Term,
    leader_id: ReplicaId,
    next_chunk: u64,
    data: BytesMut,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ChunkOutcome {
    Accepted,
    /// Already received. Safe to ack again.
    Duplicate,
    /// A gap. The leader must restart from chunk 0.
    OutOfOrder { expected: u64 },
    /// More bytes than the leader said the snapshot has.
    Oversized,
}

impl PendingSnapshot {
    pub(crate) fn new(meta: SnapshotMeta, leader_term: Term, leader_id: ReplicaId) -> Self {
        PendingSnapshot {
            meta,
            leader_term,
            leader_id,
            next_chunk: 0,
            data: BytesMut::new(),
        }
    }

    /// Same snapshot as the one described by `meta`.
    pub(crate) fn is_for(&self, meta: &SnapshotMeta) -> bool {
        self.meta.index == meta.index && self.meta.term == meta.term
    }

    /// Still being sent by the leader we follow in `term`.
    pub(crate) fn is_from(&self, term: Term, leader: Option<&ReplicaId>) -> bool {
        self.leader_term == term && leader == Some(&self.leader_id)
    }

    pub(crate) fn index(&self) -> Index {
        self.meta.index
    }

    pub(crate) fn accept_chunk(&mut self, chunk_index: u64, chunk: &Bytes) -> ChunkOutcome {
        if chunk_index < self.next_chunk {
            return ChunkOutcome::Duplicate;
        }
        if chunk_index > self.next_chunk {
            return ChunkOutcome::OutOfOrder {
                expected: self.next_chunk,
            };
        }
        if (self.data.len() + chunk.len()) as u64 > self.meta.size {
            return ChunkOutcome::Oversized;
        }

        self.data.extend_from_slice(chunk);
        self.next_chunk += 1;
        ChunkOutcome::Accepted
    }

    /// Fails with `InvalidData` if what arrived isn't what the leader snapshotted.
    pub(crate) fn finish(self) -> Result<Snapshot, io::Error> {
        if self.data.len() as u64 != self.meta.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "snapshot {:?} is {} bytes, expected {}",
                    self.meta.index,
                    self.data.len(),
                    self.meta.size
                ),
            ));
        }
        let checksum = crc32fast::hash(&self.data);
        if checksum != self.meta.checksum {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "snapshot {:?} checksum {:08x}, expected {:08x}",
                    self.meta.index, checksum, self.meta.checksum
                ),
            ));
        }

        Ok(Snapshot {
            meta: self.meta,
            data: self.data.freeze(),
        })
    }
}
