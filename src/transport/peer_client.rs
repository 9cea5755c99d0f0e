use crate::api::{MembershipError, TransferLeadershipError};
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, ConfigurationChangeInput, ConfigurationChangeOutput,
    InstallSnapshotInput, InstallSnapshotOutput, PollInput, PollOutput, ReplicaId, RequestVoteInput,
    RequestVoteOutput, RpcError, TransferLeadershipInput,
};
use async_trait::async_trait;
use std::sync::Arc;

/// PeerClient sends one RPC to one peer. Implementations don't retry and don't enforce a
/// deadline; callers wrap every call in a timeout.
#[async_trait]
pub(crate) trait PeerClient: Send + Sync {
    async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError>;

    async fn poll(&self, input: PollInput) -> Result<PollOutput, RpcError>;

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RpcError>;

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<InstallSnapshotOutput, RpcError>;

    async fn configuration_change(
        &self,
        input: ConfigurationChangeInput,
    ) -> Result<ConfigurationChangeOutput, MembershipError>;

    async fn transfer_leadership(&self, input: TransferLeadershipInput) -> Result<(), TransferLeadershipError>;
}

/// PeerConnector hands out clients. `from` is the sending member, so an in-process network can
/// drop traffic across a partition in either direction.
pub(crate) trait PeerConnector: Send + Sync {
    fn peer_client(&self, from: &ReplicaId, to: &ReplicaId) -> Arc<dyn PeerClient>;
}
