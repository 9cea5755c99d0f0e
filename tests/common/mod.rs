#![allow(dead_code)]

use bytes::Bytes;
use logstream_raft::{
    AppendError, InMemoryLog, InMemorySnapshotStore, LocalNetwork, RaftEntry, RaftEntryId, RaftEntryPayload, RaftNode,
    RaftNodeConfig, RaftOptions, RaftLogEntry, RaftRole, RaftStorage, RaftTransport, ReaderMode, ReplicaId, SnapshotSource,
    VolatileLocalState,
};
use slog::Drain;
use std::collections::BTreeMap;
use std::error::Error;
use tokio::time::{Duration, Instant};

pub const HEARTBEAT: Duration = Duration::from_millis(50);
pub const ELECTION_BOUND: Duration = Duration::from_secs(10);

pub fn test_options() -> RaftOptions {
    RaftOptions {
        leader_heartbeat_duration: Some(HEARTBEAT),
        follower_min_timeout: Some(HEARTBEAT * 6),
        follower_max_timeout: Some(HEARTBEAT * 12),
        leader_append_entries_timeout: Some(HEARTBEAT * 3),
        membership_change_timeout: Some(Duration::from_secs(10)),
        ..RaftOptions::default()
    }
}

pub fn repl_id(i: usize) -> String {
    format!("node-{}", i)
}

/// TestCluster is a set of nodes sharing one in-process network.
pub struct TestCluster {
    pub network: LocalNetwork,
    nodes: BTreeMap<String, RaftNode>,
    logger: slog::Logger,
}

impl TestCluster {
    pub fn new() -> Self {
        TestCluster {
            network: LocalNetwork::new(),
            nodes: BTreeMap::new(),
            logger: create_root_logger_for_stdout(),
        }
    }

    /// Creates `num_members` nodes and bootstraps them all as one cluster.
    pub async fn bootstrap(num_members: usize) -> Result<Self, Box<dyn Error>> {
        Self::bootstrap_with_options(num_members, test_options()).await
    }

    pub async fn bootstrap_with_options(num_members: usize, options: RaftOptions) -> Result<Self, Box<dyn Error>> {
        let mut cluster = TestCluster::new();
        let members: Vec<String> = (1..=num_members).map(repl_id).collect();
        for id in &members {
            cluster.create_node_with_options(id, options.clone()).await?;
        }
        for id in &members {
            cluster.node(id).bootstrap(&members).await?;
        }
        Ok(cluster)
    }

    /// Like `bootstrap_with_options`, but every node snapshots whatever `source` hands out.
    pub async fn bootstrap_with_snapshot_source<F>(
        num_members: usize,
        options: RaftOptions,
        source: F,
    ) -> Result<Self, Box<dyn Error>>
    where
        F: Fn() -> Box<dyn SnapshotSource + Send>,
    {
        let mut cluster = TestCluster::new();
        let members: Vec<String> = (1..=num_members).map(repl_id).collect();
        for id in &members {
            let node = logstream_raft::try_create_raft_node_with_storage(
                cluster.config(id, options.clone()),
                RaftStorage {
                    log: InMemoryLog::<RaftLogEntry>::create()?,
                    local_state: VolatileLocalState::new(ReplicaId::new(id.as_str())),
                    snapshot_store: Box::new(InMemorySnapshotStore::new()),
                    snapshot_source: source(),
                },
            )
            .await?;
            cluster.nodes.insert(id.clone(), node);
        }
        for id in &members {
            cluster.node(id).bootstrap(&members).await?;
        }
        Ok(cluster)
    }

    fn config(&self, id: &str, options: RaftOptions) -> RaftNodeConfig {
        RaftNodeConfig {
            my_replica_id: id.to_string(),
            transport: RaftTransport::Local(self.network.clone()),
            info_logger: self.logger.clone(),
            options,
        }
    }

    /// Creates a node that hasn't been started.
    pub async fn create_node(&mut self, id: &str) -> Result<&RaftNode, Box<dyn Error>> {
        self.create_node_with_options(id, test_options()).await
    }

    pub async fn create_node_with_options(
        &mut self,
        id: &str,
        options: RaftOptions,
    ) -> Result<&RaftNode, Box<dyn Error>> {
        let node = logstream_raft::try_create_raft_node(self.config(id, options)).await?;
        self.nodes.insert(id.to_string(), node);
        Ok(self.node(id))
    }

    pub fn node(&self, id: &str) -> &RaftNode {
        self.nodes
            .get(id)
            .unwrap_or_else(|| panic!("No node {} in cluster", id))
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Shuts a node down and forgets it.
    pub async fn kill(&mut self, id: &str) -> Result<(), Box<dyn Error>> {
        if let Some(node) = self.nodes.remove(id) {
            node.shutdown().await?;
        }
        Ok(())
    }

    /// Waits until one of `among` is leader in the highest term any of them has seen.
    pub async fn wait_for_leader(&self, among: &[String], timeout: Duration) -> Result<String, Box<dyn Error>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut max_term = 0;
            let mut leader = None;
            for id in among {
                let status = self.node(id).status().await?;
                max_term = max_term.max(status.term);
                if status.role == RaftRole::Leader {
                    leader = Some((id.clone(), status.term));
                }
            }

            if let Some((id, term)) = leader {
                if term == max_term {
                    return Ok(id);
                }
            }
            if Instant::now() >= deadline {
                return Err(format!("No leader among {:?} within {:?}", among, timeout).into());
            }
            tokio::time::sleep(HEARTBEAT).await;
        }
    }

    pub async fn wait_for_any_leader(&self) -> Result<String, Box<dyn Error>> {
        self.wait_for_leader(&self.ids(), ELECTION_BOUND).await
    }

    /// Appends through `leader`, backing off while the leader reports overload.
    pub async fn append(&self, leader: &str, data: Bytes) -> Result<RaftEntryId, AppendError> {
        loop {
            match self.node(leader).append(data.clone()).await {
                Err(AppendError::Overloaded) => tokio::time::sleep(Duration::from_millis(5)).await,
                result => return result,
            }
        }
    }

    /// Appends `count` entries named `{prefix}-{i}` and returns the id of the last one.
    pub async fn append_many(&self, leader: &str, prefix: &str, count: usize) -> Result<RaftEntryId, Box<dyn Error>> {
        let mut last = None;
        for i in 0..count {
            let id = self.append(leader, Bytes::from(format!("{}-{}", prefix, i))).await?;
            last = Some(id);
        }
        last.ok_or_else(|| "Nothing appended".into())
    }

    pub async fn wait_for_commit(&self, id: &str, index: u64, timeout: Duration) -> Result<(), Box<dyn Error>> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.node(id).status().await?;
            if status.commit_index >= index {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "{} only committed up to {} of {} within {:?}",
                    id, status.commit_index, index, timeout
                )
                .into());
            }
            tokio::time::sleep(HEARTBEAT).await;
        }
    }

    pub async fn wait_for_role(&self, id: &str, role: RaftRole, timeout: Duration) -> Result<(), Box<dyn Error>> {
        let deadline = Instant::now() + timeout;
        while self.node(id).role() != role {
            if Instant::now() >= deadline {
                return Err(format!("{} is still {:?} after {:?}", id, self.node(id).role(), timeout).into());
            }
            tokio::time::sleep(HEARTBEAT).await;
        }
        Ok(())
    }

    pub async fn committed_entries(&self, id: &str) -> Result<Vec<RaftEntry>, Box<dyn Error>> {
        Ok(self.node(id).read_log(0, ReaderMode::Commits).await?)
    }
}

pub fn application_data(entries: &[RaftEntry]) -> Vec<Bytes> {
    entries
        .iter()
        .filter_map(|entry| match &entry.payload {
            RaftEntryPayload::Application(data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

pub fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Info).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
