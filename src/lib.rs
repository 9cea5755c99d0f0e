mod actor;
mod api;
mod backpressure;
mod commitlog;
mod replica;
mod server;
mod snapshot;
mod transport;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::try_create_raft_node;
pub use api::try_create_raft_node_with_storage;
pub use api::AppendError;
pub use api::BackpressureAlgorithm;
pub use api::BackpressureOptions;
pub use api::CompactError;
pub use api::MembershipChange;
pub use api::MembershipError;
pub use api::RaftElectionState;
pub use api::RaftElectionStateListener;
pub use api::RaftEntry;
pub use api::RaftEntryId;
pub use api::RaftEntryPayload;
pub use api::RaftEvent;
pub use api::RaftEventKind;
pub use api::RaftEventListener;
pub use api::RaftMember;
pub use api::RaftNode;
pub use api::RaftNodeConfig;
pub use api::RaftNodeCreationError;
pub use api::RaftNodeExited;
pub use api::RaftOptions;
pub use api::RaftRole;
pub use api::RaftStatus;
pub use api::RaftStorage;
pub use api::RaftTransport;
pub use api::ReadLogError;
pub use api::ReaderMode;
pub use api::StartError;
pub use api::StepDownError;
pub use api::TransferLeadershipError;
pub use commitlog::Entry;
pub use commitlog::InMemoryLog;
pub use commitlog::Index;
pub use commitlog::Log;
pub use replica::FileLocalState;
pub use replica::Member;
pub use replica::MemberType;
pub use replica::PersistentLocalState;
pub use replica::RaftLogEntry;
pub use replica::ReplicaId;
pub use replica::Term;
pub use replica::VolatileLocalState;
pub use snapshot::EmptySnapshotSource;
pub use snapshot::InMemorySnapshotStore;
pub use snapshot::Snapshot;
pub use snapshot::SnapshotMeta;
pub use snapshot::SnapshotSource;
pub use snapshot::SnapshotStore;
pub use transport::LocalNetwork;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
