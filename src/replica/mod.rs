mod cluster;
mod election;
mod event_bus;
mod local_state;
mod replica;
mod replica_api;
mod write_ahead_log;

pub use cluster::Member;
pub use cluster::MemberType;
pub use cluster::ReplicaId;
pub use local_state::FileLocalState;
pub use local_state::PersistentLocalState;
pub use local_state::Term;
pub use local_state::VolatileLocalState;
pub use write_ahead_log::RaftLogEntry;

pub(crate) use cluster::ConfigurationChange;
pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use event_bus::new as new_event_bus;
pub(crate) use event_bus::EventPublisher;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica_api::AppendEntriesInput;
pub(crate) use replica_api::AppendEntriesOutput;
pub(crate) use replica_api::AppendEntriesReplyFromPeer;
pub(crate) use replica_api::ConfigurationChangeInput;
pub(crate) use replica_api::ConfigurationChangeOutput;
pub(crate) use replica_api::ElectionTimeoutTick;
pub(crate) use replica_api::InstallSnapshotInput;
pub(crate) use replica_api::InstallSnapshotOutput;
pub(crate) use replica_api::InstallSnapshotReplyFromPeer;
pub(crate) use replica_api::LeaderTimerTick;
pub(crate) use replica_api::LeadershipHandoff;
pub(crate) use replica_api::PollInput;
pub(crate) use replica_api::PollOutput;
pub(crate) use replica_api::PollReplyFromPeer;
pub(crate) use replica_api::RequestVoteInput;
pub(crate) use replica_api::RequestVoteOutput;
pub(crate) use replica_api::RequestVoteReplyFromPeer;
pub(crate) use replica_api::RpcError;
pub(crate) use replica_api::StartMode;
pub(crate) use replica_api::TransferLeadershipInput;
pub(crate) use replica_api::TransferLeadershipReplyFromPeer;
