use crate::commitlog::Index;
use crate::replica::Term;
use bytes::Bytes;
use std::io;

/// SnapshotSource hands the replica the application's serialized state as of a committed index.
/// It is called from the replica's event loop during compaction, so it should return quickly.
pub trait SnapshotSource {
    fn snapshot_data(&self, index: Index, term: Term) -> Result<Bytes, io::Error>;
}

/// Produces an empty payload. Useful when the application rebuilds its state some other way and
/// only needs the log to stay bounded.
#[derive(Copy, Clone, Debug, Default)]
pub struct EmptySnapshotSource;

impl SnapshotSource for EmptySnapshotSource {
    fn snapshot_data(&self, _index: Index, _term: Term) -> Result<Bytes, io::Error> {
        Ok(Bytes::new())
    }
}
