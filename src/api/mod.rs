//! This mod is meant to hold most of the code for the library's client-facing API.
mod errors;
mod event_bus;
mod membership;
mod node;
mod options;
mod types;
mod wiring;

pub use errors::AppendError;
pub use errors::CompactError;
pub use errors::MembershipError;
pub use errors::RaftNodeCreationError;
pub use errors::RaftNodeExited;
pub use errors::ReadLogError;
pub use errors::StartError;
pub use errors::StepDownError;
pub use errors::TransferLeadershipError;
pub use event_bus::RaftElectionStateListener;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventKind;
pub use event_bus::RaftEventListener;
pub use node::RaftNode;
pub use options::BackpressureAlgorithm;
pub use options::BackpressureOptions;
pub use options::RaftOptions;
pub use types::MembershipChange;
pub use types::RaftElectionState;
pub use types::RaftEntry;
pub use types::RaftEntryId;
pub use types::RaftEntryPayload;
pub use types::RaftMember;
pub use types::RaftRole;
pub use types::RaftStatus;
pub use types::ReaderMode;
pub use wiring::try_create_raft_node;
pub use wiring::try_create_raft_node_with_storage;
pub use wiring::RaftNodeConfig;
pub use wiring::RaftStorage;
pub use wiring::RaftTransport;

// So Replica can read its tunables.
pub(crate) use options::RaftOptionsValidated;
