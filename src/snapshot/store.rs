use crate::commitlog::Index;
use crate::replica::{Member, Term};
use bytes::Bytes;
use std::io;

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotMeta {
    /// Index of the last entry the snapshot covers.
    pub index: Index,
    /// Term of the entry at `index`.
    pub term: Term,
    /// Milliseconds since the unix epoch, taken when the snapshot was created.
    pub timestamp_millis: i64,
    pub version: u32,
    /// Length of the snapshot data in bytes.
    pub size: u64,
    /// CRC32 of the snapshot data. A follower checks it before installing a transferred snapshot.
    pub checksum: u32,
    /// Membership in effect at `index`, and the index of the entry that introduced it.
    pub configuration: Vec<Member>,
    pub configuration_version: Option<Index>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Bytes,
}

impl Snapshot {
    pub(crate) fn new(
        index: Index,
        term: Term,
        configuration: Vec<Member>,
        configuration_version: Option<Index>,
        data: Bytes,
    ) -> Self {
        Snapshot {
            meta: SnapshotMeta {
                index,
                term,
                timestamp_millis: chrono::Utc::now().timestamp_millis(),
                version: SNAPSHOT_FORMAT_VERSION,
                size: data.len() as u64,
                checksum: crc32fast::hash(&data),
                configuration,
                configuration_version,
            },
            data,
        }
    }

    /// Number of chunks for a given chunk size. An empty snapshot still has one (empty) chunk.
    pub(crate) fn num_chunks(&self, chunk_size: usize) -> u64 {
        let full = self.data.len() / chunk_size;
        let partial = if self.data.len() % chunk_size == 0 { 0 } else { 1 };
        std::cmp::max(1, (full + partial) as u64)
    }

    /// Returns the chunk and whether it's the last one, or `None` if `chunk_index` is past the end.
    pub(crate) fn chunk(&self, chunk_index: u64, chunk_size: usize) -> Option<(Bytes, bool)> {
        let num_chunks = self.num_chunks(chunk_size);
        if chunk_index >= num_chunks {
            return None;
        }

        let start = chunk_index as usize * chunk_size;
        let end = std::cmp::min(start + chunk_size, self.data.len());
        Some((self.data.slice(start..end), chunk_index + 1 == num_chunks))
    }
}

/// SnapshotStore persists the latest snapshot. `store` must be atomic: a reader sees either the
/// previous snapshot or the new one, never a mix.
pub trait SnapshotStore {
    fn latest(&self) -> Result<Option<Snapshot>, io::Error>;

    fn store(&mut self, snapshot: Snapshot) -> Result<(), io::Error>;
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    latest: Option<Snapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        InMemorySnapshotStore { latest: None }
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn latest(&self) -> Result<Option<Snapshot>, io::Error> {
        Ok(self.latest.clone())
    }

    fn store(&mut self, snapshot: Snapshot) -> Result<(), io::Error> {
        if let Some(current) = &self.latest {
            if snapshot.meta.index < current.meta.index {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "snapshot at {:?} is older than stored snapshot at {:?}",
                        snapshot.meta.index, current.meta.index
                    ),
                ));
            }
        }

        self.latest.replace(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(index: u64, data: &'static [u8]) -> Snapshot {
        Snapshot::new(Index::new(index), Term::new(2), Vec::new(), None, Bytes::from_static(data))
    }

    #[test]
    fn chunking() {
        let s = snapshot(5, b"abcdefg");
        assert_eq!(s.num_chunks(3), 3);
        assert_eq!(s.chunk(0, 3), Some((Bytes::from_static(b"abc"), false)));
        assert_eq!(s.chunk(2, 3), Some((Bytes::from_static(b"g"), true)));
        assert_eq!(s.chunk(3, 3), None);

        assert_eq!(snapshot(5, b"abcdef").num_chunks(3), 2);

        let empty = snapshot(5, b"");
        assert_eq!(empty.num_chunks(3), 1);
        assert_eq!(empty.chunk(0, 3), Some((Bytes::new(), true)));
    }

    #[test]
    fn store_rejects_older_snapshots() {
        let mut store = InMemorySnapshotStore::new();
        assert_eq!(store.latest().unwrap(), None);

        store.store(snapshot(10, b"x")).unwrap();
        assert!(store.store(snapshot(4, b"y")).is_err());
        store.store(snapshot(12, b"z")).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.meta.index, Index::new(12));
        assert_eq!(latest.meta.version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(latest.meta.size, 1);
        assert_eq!(latest.meta.checksum, crc32fast::hash(b"z"));
        assert_eq!(latest.data, Bytes::from_static(b"z"));
    }
}
