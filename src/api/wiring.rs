use crate::actor::{ActorClient, ReplicaActor};
use crate::api::membership::ChangeSubmitter;
use crate::api::options::RaftOptionsValidated;
use crate::api::{RaftNode, RaftNodeCreationError, RaftOptions};
use crate::commitlog::{InMemoryLog, Log};
use crate::replica::{
    new_event_bus, PersistentLocalState, RaftLogEntry, Replica, ReplicaConfig, ReplicaId, VolatileLocalState,
};
use crate::server::RpcServer;
use crate::snapshot::{EmptySnapshotSource, InMemorySnapshotStore, SnapshotSource, SnapshotStore};
use crate::transport::{GrpcConnector, LocalNetwork, PeerConnector};
use crate::server;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct RaftNodeConfig {
    pub my_replica_id: String,
    pub transport: RaftTransport,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
}

/// How this node reaches its peers, and how they reach it.
pub enum RaftTransport {
    /// Nodes in the same process, sharing one network.
    Local(LocalNetwork),
    /// gRPC. `peers` maps replica id to address for every member this node may talk to.
    Grpc {
        listen_addr: SocketAddr,
        peers: HashMap<String, SocketAddr>,
    },
}

/// Everything the node persists. The node takes ownership and is the only writer.
pub struct RaftStorage<L, S>
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    pub log: L,
    pub local_state: S,
    pub snapshot_store: Box<dyn SnapshotStore + Send>,
    pub snapshot_source: Box<dyn SnapshotSource + Send>,
}

/// Creates a node with in-memory storage and an empty snapshot source.
pub async fn try_create_raft_node(config: RaftNodeConfig) -> Result<RaftNode, RaftNodeCreationError> {
    let log = InMemoryLog::create().map_err(RaftNodeCreationError::LogInitialization)?;
    let storage = RaftStorage {
        log,
        local_state: VolatileLocalState::new(ReplicaId::new(config.my_replica_id.clone())),
        snapshot_store: Box::new(InMemorySnapshotStore::new()),
        snapshot_source: Box::new(EmptySnapshotSource),
    };

    try_create_raft_node_with_storage(config, storage).await
}

/// Creates a node over existing storage. Whatever the storage already holds (term, vote, log,
/// snapshot) is recovered, so a node restarted on the same storage picks up where it left off.
pub async fn try_create_raft_node_with_storage<L, S>(
    config: RaftNodeConfig,
    storage: RaftStorage<L, S>,
) -> Result<RaftNode, RaftNodeCreationError>
where
    L: Log<RaftLogEntry> + Send + 'static,
    S: PersistentLocalState + Send + 'static,
{
    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftNodeCreationError::IllegalOptions(e.to_string()))?;

    let my_replica_id = ReplicaId::new(config.my_replica_id);
    let logger = config
        .info_logger
        .new(slog::o!("ReplicaId" => my_replica_id.to_string()));

    let (actor_client, actor_queue_rx) = ActorClient::new(10);

    let (event_publisher, event_dispatcher) = new_event_bus(logger.clone());
    tokio::spawn(event_dispatcher.run());

    let mut rpc_server_addr = None;
    let connector: Arc<dyn PeerConnector> = match config.transport {
        RaftTransport::Local(network) => {
            network.register(my_replica_id.clone(), actor_client.weak());
            Arc::new(network)
        }
        RaftTransport::Grpc { listen_addr, peers } => {
            rpc_server_addr.replace(listen_addr);
            let peer_addrs = peers
                .into_iter()
                .map(|(id, addr)| (ReplicaId::new(id), addr))
                .collect();
            Arc::new(GrpcConnector::new(logger.clone(), peer_addrs))
        }
    };

    let membership_change_timeout = options.membership_change_timeout;
    let retry_backoff = options.leader_heartbeat_duration;

    let (replica, election_state_change_listener) = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        my_replica_id: my_replica_id.clone(),
        log: storage.log,
        local_state: storage.local_state,
        snapshot_store: storage.snapshot_store,
        snapshot_source: storage.snapshot_source,
        connector: connector.clone(),
        actor_client: actor_client.weak(),
        event_publisher: event_publisher.clone(),
        options,
    })
    .map_err(RaftNodeCreationError::LogInitialization)?;

    let replica_actor = ReplicaActor::new(logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    let rpc_listener = rpc_server_addr.map(|addr| {
        let (stop, stopped) = server::listener_stop();
        let replica_raft_server = RpcServer::new(logger.clone(), actor_client.weak());
        tokio::spawn(replica_raft_server.run(addr, stopped));
        stop
    });

    let change_submitter = ChangeSubmitter::new(
        logger.clone(),
        my_replica_id.clone(),
        actor_client.clone(),
        connector,
        membership_change_timeout,
        retry_backoff,
    );

    Ok(RaftNode::new(
        logger,
        my_replica_id,
        actor_client,
        event_publisher,
        election_state_change_listener,
        change_submitter,
        rpc_listener,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RaftRole;
    use std::time::Duration;

    fn config(my_replica_id: &str, network: &LocalNetwork, options: RaftOptions) -> RaftNodeConfig {
        RaftNodeConfig {
            my_replica_id: my_replica_id.to_string(),
            transport: RaftTransport::Local(network.clone()),
            info_logger: slog::Logger::root(slog::Discard, slog::o!()),
            options,
        }
    }

    #[tokio::test]
    async fn rejects_illegal_options() {
        let options = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(800)),
            follower_min_timeout: Some(Duration::from_millis(500)),
            ..RaftOptions::default()
        };

        let result = try_create_raft_node(config("a", &LocalNetwork::new(), options)).await;
        assert!(matches!(result, Err(RaftNodeCreationError::IllegalOptions(_))));
    }

    #[tokio::test]
    async fn new_node_is_inactive_until_started() {
        let node = try_create_raft_node(config("a", &LocalNetwork::new(), RaftOptions::default()))
            .await
            .unwrap();

        assert_eq!(node.role(), RaftRole::Inactive);
        assert_eq!(node.status().await.unwrap().role, RaftRole::Inactive);
    }
}
