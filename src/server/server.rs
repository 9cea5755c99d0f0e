use crate::actor::WeakActorClient;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoConfigurationChangeReq, ProtoConfigurationChangeResult,
    ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoPollReq, ProtoPollResult, ProtoRequestVoteReq,
    ProtoRequestVoteResult, ProtoTransferLeadershipReq, ProtoTransferLeadershipResult,
};
use crate::replica::{AppendEntriesInput, ConfigurationChangeInput, InstallSnapshotInput, PollInput, RequestVoteInput};
use crate::transport;
use std::convert::TryFrom;
use std::future::Future;
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface. Every request is handed to the
/// local replica's event loop.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    pub(crate) async fn run<F: Future<Output = ()>>(self, socket_addr: SocketAddr, stopped: F) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, stopped)
            .await;

        match result {
            Ok(()) => slog::info!(logger, "Server has exited."),
            Err(e) => slog::error!(logger, "Server exited with error: {}", e),
        }
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = RequestVoteInput::try_from(rpc_request)?;
        match self.local_replica.request_vote(app_input).await {
            Ok(app_output) => Ok(app_output.into()),
            Err(e) => Err(transport::rpc_error_status(e)),
        }
    }

    async fn handle_poll(&self, rpc_request: ProtoPollReq) -> Result<ProtoPollResult, Status> {
        let app_input = PollInput::try_from(rpc_request)?;
        match self.local_replica.poll(app_input).await {
            Ok(app_output) => Ok(app_output.into()),
            Err(e) => Err(transport::rpc_error_status(e)),
        }
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = AppendEntriesInput::try_from(rpc_request)?;
        match self.local_replica.append_entries(app_input).await {
            Ok(app_output) => Ok(app_output.into()),
            Err(e) => Err(transport::rpc_error_status(e)),
        }
    }

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let app_input = InstallSnapshotInput::try_from(rpc_request)?;
        match self.local_replica.install_snapshot(app_input).await {
            Ok(app_output) => Ok(app_output.into()),
            Err(e) => Err(transport::rpc_error_status(e)),
        }
    }

    async fn handle_configuration_change(
        &self,
        rpc_request: ProtoConfigurationChangeReq,
    ) -> Result<ProtoConfigurationChangeResult, Status> {
        let app_input = ConfigurationChangeInput::try_from(rpc_request)?;
        let app_result = self.local_replica.configuration_change(app_input).await;
        Ok(transport::proto_configuration_change_result(app_result))
    }

    async fn handle_transfer_leadership(
        &self,
        rpc_request: ProtoTransferLeadershipReq,
    ) -> Result<ProtoTransferLeadershipResult, Status> {
        let app_result = self.local_replica.transfer_leadership(rpc_request.into()).await;
        Ok(transport::proto_transfer_leadership_result(app_result))
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn poll(&self, rpc_request_wrapped: Request<ProtoPollReq>) -> Result<Response<ProtoPollResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_poll(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - AppendEntries term={} prev=({}, {}) entries={}",
            rpc_request.term,
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
            rpc_request.new_entries.len()
        );
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot index={} chunk={} last={}",
            rpc_request.snapshot_index,
            rpc_request.chunk_index,
            rpc_request.is_last
        );
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn configuration_change(
        &self,
        rpc_request_wrapped: Request<ProtoConfigurationChangeReq>,
    ) -> Result<Response<ProtoConfigurationChangeResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_configuration_change(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn transfer_leadership(
        &self,
        rpc_request_wrapped: Request<ProtoTransferLeadershipReq>,
    ) -> Result<Response<ProtoTransferLeadershipResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_transfer_leadership(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}
