use crate::api::{MembershipError, TransferLeadershipError};
use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoConfigurationChangeReq, ProtoInstallSnapshotReq, ProtoPollReq, ProtoRequestVoteReq,
    ProtoTransferLeadershipReq,
};
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, ConfigurationChangeInput, ConfigurationChangeOutput,
    InstallSnapshotInput, InstallSnapshotOutput, PollInput, PollOutput, ReplicaId, RequestVoteInput,
    RequestVoteOutput, RpcError, TransferLeadershipInput,
};
use crate::transport::wire;
use crate::transport::{PeerClient, PeerConnector};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

/// Connects to peers over gRPC, by address.
pub(crate) struct GrpcConnector {
    logger: slog::Logger,
    peer_addrs: HashMap<ReplicaId, SocketAddr>,
}

impl GrpcConnector {
    pub(crate) fn new(logger: slog::Logger, peer_addrs: HashMap<ReplicaId, SocketAddr>) -> Self {
        GrpcConnector { logger, peer_addrs }
    }
}

impl PeerConnector for GrpcConnector {
    fn peer_client(&self, _from: &ReplicaId, to: &ReplicaId) -> Arc<dyn PeerClient> {
        Arc::new(GrpcPeerClient {
            logger: self.logger.new(slog::o!("Peer" => to.to_string())),
            url: self.peer_addrs.get(to).map(|addr| format!("http://{}", addr)),
            connection: Mutex::new(None),
        })
    }
}

/// Connects on first use, and again after any transport failure.
struct GrpcPeerClient {
    logger: slog::Logger,
    url: Option<String>,
    connection: Mutex<Option<GrpcRaftClient<Channel>>>,
}

impl GrpcPeerClient {
    async fn client(&self) -> Result<GrpcRaftClient<Channel>, RpcError> {
        let mut connection = self.connection.lock().await;
        if let Some(client) = connection.as_ref() {
            return Ok(client.clone());
        }

        let url = self
            .url
            .clone()
            .ok_or_else(|| RpcError::Unreachable("No address for peer".to_string()))?;
        slog::debug!(self.logger, "Connecting to {} ...", url);
        let endpoint = Endpoint::from_shared(url).map_err(|e| RpcError::Unreachable(e.to_string()))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;

        let client = GrpcRaftClient::new(channel);
        connection.replace(client.clone());
        Ok(client)
    }

    async fn on_status(&self, status: tonic::Status) -> RpcError {
        let e = wire::status_rpc_error(status);
        if let RpcError::Unreachable(_) = e {
            self.connection.lock().await.take();
        }
        e
    }
}

#[async_trait]
impl PeerClient for GrpcPeerClient {
    async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError> {
        let mut client = self.client().await?;
        match client.request_vote(ProtoRequestVoteReq::from(input)).await {
            Ok(response) => Ok(response.into_inner().into()),
            Err(status) => Err(self.on_status(status).await),
        }
    }

    async fn poll(&self, input: PollInput) -> Result<PollOutput, RpcError> {
        let mut client = self.client().await?;
        match client.poll(ProtoPollReq::from(input)).await {
            Ok(response) => Ok(response.into_inner().into()),
            Err(status) => Err(self.on_status(status).await),
        }
    }

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RpcError> {
        let mut client = self.client().await?;
        match client.append_entries(ProtoAppendEntriesReq::from(input)).await {
            Ok(response) => Ok(response.into_inner().into()),
            Err(status) => Err(self.on_status(status).await),
        }
    }

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<InstallSnapshotOutput, RpcError> {
        let mut client = self.client().await?;
        match client.install_snapshot(ProtoInstallSnapshotReq::from(input)).await {
            Ok(response) => Ok(response.into_inner().into()),
            Err(status) => Err(self.on_status(status).await),
        }
    }

    async fn configuration_change(
        &self,
        input: ConfigurationChangeInput,
    ) -> Result<ConfigurationChangeOutput, MembershipError> {
        let mut client = self
            .client()
            .await
            .map_err(|e| MembershipError::Unavailable(e.to_string()))?;
        match client
            .configuration_change(ProtoConfigurationChangeReq::from(input))
            .await
        {
            Ok(response) => wire::configuration_change_result(response.into_inner()),
            Err(status) => Err(MembershipError::Unavailable(self.on_status(status).await.to_string())),
        }
    }

    async fn transfer_leadership(&self, input: TransferLeadershipInput) -> Result<(), TransferLeadershipError> {
        let mut client = self
            .client()
            .await
            .map_err(|e| TransferLeadershipError::Unavailable(e.to_string()))?;
        match client
            .transfer_leadership(ProtoTransferLeadershipReq::from(input))
            .await
        {
            Ok(response) => wire::transfer_leadership_result(response.into_inner()),
            Err(status) => Err(TransferLeadershipError::Unavailable(
                self.on_status(status).await.to_string(),
            )),
        }
    }
}
