mod common;

use bytes::Bytes;
use common::{application_data, test_options, HEARTBEAT};
use logstream_raft::{RaftNode, RaftNodeConfig, RaftRole, RaftTransport, ReaderMode};
use std::collections::HashMap;
use std::error::Error;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::time::{Duration, Instant};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

async fn create_grpc_cluster(port_base: u16, num_members: usize) -> Result<Vec<RaftNode>, Box<dyn Error>> {
    let ids: Vec<String> = (1..=num_members).map(common::repl_id).collect();
    let peers: HashMap<String, SocketAddr> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), addr(port_base + i as u16)))
        .collect();

    let mut nodes = Vec::with_capacity(num_members);
    for (i, id) in ids.iter().enumerate() {
        let node = logstream_raft::try_create_raft_node(RaftNodeConfig {
            my_replica_id: id.clone(),
            transport: RaftTransport::Grpc {
                listen_addr: addr(port_base + i as u16),
                peers: peers.clone(),
            },
            info_logger: common::create_root_logger_for_stdout(),
            options: test_options(),
        })
        .await?;
        nodes.push(node);
    }
    for node in &nodes {
        node.bootstrap(&ids).await?;
    }

    Ok(nodes)
}

async fn find_leader(nodes: &[RaftNode], timeout: Duration) -> Result<&RaftNode, Box<dyn Error>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(leader) = nodes.iter().find(|node| node.role() == RaftRole::Leader) {
            return Ok(leader);
        }
        if Instant::now() >= deadline {
            return Err("Timeout waiting for leader election".into());
        }
        tokio::time::sleep(HEARTBEAT).await;
    }
}

#[tokio::test]
async fn replicates_over_grpc() -> Result<(), Box<dyn Error>> {
    let nodes = create_grpc_cluster(47310, 3).await?;
    let leader = find_leader(&nodes, Duration::from_secs(10)).await?;

    let data = Bytes::from("over the wire");
    let entry_id = leader.append(data.clone()).await?;

    for node in &nodes {
        let deadline = Instant::now() + Duration::from_secs(10);
        while node.status().await?.commit_index < entry_id.index() {
            assert!(Instant::now() < deadline, "{} never committed", node.replica_id());
            tokio::time::sleep(HEARTBEAT).await;
        }
        let committed = node.read_log(0, ReaderMode::Commits).await?;
        assert_eq!(application_data(&committed), vec![data.clone()]);
    }

    for node in &nodes {
        node.shutdown().await?;
    }
    Ok(())
}
