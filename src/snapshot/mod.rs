//! Snapshots replace a committed log prefix. The store holds the latest one, the source produces
//! the application's bytes for it, and pending assembles one arriving in chunks from a leader.

mod pending;
mod source;
mod store;

pub(crate) use pending::ChunkOutcome;
pub(crate) use pending::PendingSnapshot;
pub use source::EmptySnapshotSource;
pub use source::SnapshotSource;
pub use store::InMemorySnapshotStore;
pub use store::Snapshot;
pub use store::SnapshotMeta;
pub use store::SnapshotStore;
