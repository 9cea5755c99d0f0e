use crate::actor::WeakActorClient;
use crate::api::{MembershipError, TransferLeadershipError};
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, ConfigurationChangeInput, ConfigurationChangeOutput,
    InstallSnapshotInput, InstallSnapshotOutput, PollInput, PollOutput, ReplicaId, RequestVoteInput,
    RequestVoteOutput, RpcError, TransferLeadershipInput,
};
use crate::transport::{PeerClient, PeerConnector};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// LocalNetwork delivers RPCs between nodes in the same process, straight into the target's
/// event loop. Any member can be cut off with `partition()`: an isolated member can neither send
/// nor receive until `heal()`. `set_latency()` delays every delivery by a fixed amount.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    replicas: HashMap<ReplicaId, WeakActorClient>,
    isolated: HashSet<ReplicaId>,
    latency: Duration,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, replica_id: &str) {
        let mut inner = self.inner.lock().expect("LocalNetwork mutex poisoned");
        inner.isolated.insert(ReplicaId::new(replica_id));
    }

    pub fn heal(&self, replica_id: &str) {
        let mut inner = self.inner.lock().expect("LocalNetwork mutex poisoned");
        inner.isolated.remove(&ReplicaId::new(replica_id));
    }

    pub fn heal_all(&self) {
        let mut inner = self.inner.lock().expect("LocalNetwork mutex poisoned");
        inner.isolated.clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        let mut inner = self.inner.lock().expect("LocalNetwork mutex poisoned");
        inner.latency = latency;
    }

    /// Later registrations under the same id replace earlier ones, so a restarted node takes
    /// over its predecessor's traffic.
    pub(crate) fn register(&self, replica_id: ReplicaId, actor_client: WeakActorClient) {
        let mut inner = self.inner.lock().expect("LocalNetwork mutex poisoned");
        inner.replicas.insert(replica_id, actor_client);
    }

    fn route(&self, from: &ReplicaId, to: &ReplicaId) -> Result<WeakActorClient, RpcError> {
        let inner = self.inner.lock().expect("LocalNetwork mutex poisoned");
        if inner.isolated.contains(from) || inner.isolated.contains(to) {
            return Err(RpcError::Unreachable(format!("{} is partitioned from {}", from, to)));
        }

        inner
            .replicas
            .get(to)
            .cloned()
            .ok_or_else(|| RpcError::Unreachable(format!("{} isn't on the network", to)))
    }

    fn latency(&self) -> Duration {
        self.inner.lock().expect("LocalNetwork mutex poisoned").latency
    }
}

impl PeerConnector for LocalNetwork {
    fn peer_client(&self, from: &ReplicaId, to: &ReplicaId) -> Arc<dyn PeerClient> {
        Arc::new(LocalPeerClient {
            network: self.clone(),
            from: from.clone(),
            to: to.clone(),
        })
    }
}

struct LocalPeerClient {
    network: LocalNetwork,
    from: ReplicaId,
    to: ReplicaId,
}

impl LocalPeerClient {
    async fn route(&self) -> Result<WeakActorClient, RpcError> {
        let latency = self.network.latency();
        if latency > Duration::from_secs(0) {
            tokio::time::sleep(latency).await;
        }
        // Partitions are checked on arrival.
        self.network.route(&self.from, &self.to)
    }
}

#[async_trait]
impl PeerClient for LocalPeerClient {
    async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError> {
        self.route().await?.request_vote(input).await
    }

    async fn poll(&self, input: PollInput) -> Result<PollOutput, RpcError> {
        self.route().await?.poll(input).await
    }

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RpcError> {
        self.route().await?.append_entries(input).await
    }

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<InstallSnapshotOutput, RpcError> {
        self.route().await?.install_snapshot(input).await
    }

    async fn configuration_change(
        &self,
        input: ConfigurationChangeInput,
    ) -> Result<ConfigurationChangeOutput, MembershipError> {
        let target = self
            .route()
            .await
            .map_err(|e| MembershipError::Unavailable(e.to_string()))?;
        target.configuration_change(input).await
    }

    async fn transfer_leadership(&self, input: TransferLeadershipInput) -> Result<(), TransferLeadershipError> {
        let target = self
            .route()
            .await
            .map_err(|e| TransferLeadershipError::Unavailable(e.to_string()))?;
        target.transfer_leadership(input).await
    }
}
