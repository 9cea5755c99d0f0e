mod grpc;
mod local;
mod peer_client;
mod wire;

pub use local::LocalNetwork;

pub(crate) use grpc::GrpcConnector;
pub(crate) use peer_client::PeerClient;
pub(crate) use peer_client::PeerConnector;
pub(crate) use wire::proto_configuration_change_result;
pub(crate) use wire::proto_transfer_leadership_result;
pub(crate) use wire::rpc_error_status;
