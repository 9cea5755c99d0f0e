mod common;

use bytes::Bytes;
use common::{application_data, TestCluster, ELECTION_BOUND};
use logstream_raft::{AppendError, RaftEvent, RaftEventKind, RaftRole};
use std::error::Error;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

#[tokio::test]
async fn committed_entries_reach_every_member() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::bootstrap(3).await?;
    let leader = cluster.wait_for_any_leader().await?;

    let mut listeners: Vec<_> = cluster
        .ids()
        .iter()
        .map(|id| cluster.node(id).subscribe(RaftEventKind::Commit))
        .collect();

    let data = Bytes::from("Hello world");
    let entry_id = cluster.append(&leader, data.clone()).await?;

    // Assert that every member observes the entry becoming committed.
    for listener in listeners.iter_mut() {
        loop {
            match listener.next_event().await {
                Some(RaftEvent::Commit(entry)) if entry.entry_id == entry_id => {
                    assert_eq!(application_data(&[entry]), vec![data.clone()]);
                    break;
                }
                Some(_) => continue,
                None => panic!("Node exited before committing"),
            }
        }
    }

    Ok(())
}

#[tokio::test]
async fn followers_redirect_appends_to_leader() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::bootstrap(3).await?;
    let leader = cluster.wait_for_any_leader().await?;
    cluster.append(&leader, Bytes::from("first")).await?;

    let follower = cluster.ids().into_iter().find(|id| *id != leader).unwrap();
    match cluster.node(&follower).append(Bytes::from("misdirected")).await {
        Err(AppendError::NotLeader { leader_hint }) => assert_eq!(leader_hint, leader),
        other => panic!("Expected a redirect, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn new_leader_contains_every_committed_entry() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::bootstrap(3).await?;
    let leader = cluster.wait_for_any_leader().await?;

    let last = cluster.append_many(&leader, "entry", 1000).await?;
    let committed_before = cluster.committed_entries(&leader).await?;
    assert_eq!(application_data(&committed_before).len(), 1000);

    cluster.kill(&leader).await?;
    let survivors = cluster.ids();
    let new_leader = cluster.wait_for_leader(&survivors, ELECTION_BOUND).await?;
    cluster.wait_for_commit(&new_leader, last.index(), ELECTION_BOUND).await?;

    // Same entries at the same indexes.
    let committed_after = cluster.committed_entries(&new_leader).await?;
    assert!(committed_after.len() >= committed_before.len());
    assert_eq!(&committed_after[..committed_before.len()], &committed_before[..]);

    Ok(())
}

#[tokio::test]
async fn commit_index_never_decreases() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::bootstrap(3).await?;
    let violations = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for id in cluster.ids() {
        let mut listener = cluster.node(&id).subscribe(RaftEventKind::Commit);
        let violations = violations.clone();
        tasks.push(tokio::spawn(async move {
            let mut last_index = 0;
            while let Some(event) = listener.next_event().await {
                if let RaftEvent::Commit(entry) = event {
                    let index = entry.entry_id.index();
                    if index <= last_index {
                        violations.lock().unwrap().push((id.clone(), last_index, index));
                    }
                    last_index = index;
                }
            }
        }));
    }

    let mut high_water = std::collections::HashMap::new();
    let mut leader = cluster.wait_for_any_leader().await?;
    for round in 0..3 {
        cluster.append_many(&leader, &format!("round-{}", round), 50).await?;

        for id in cluster.ids() {
            let commit_index = cluster.node(&id).status().await?.commit_index;
            let previous = high_water.insert(id.clone(), commit_index).unwrap_or(0);
            assert!(commit_index >= previous, "{} went from {} to {}", id, previous, commit_index);
        }

        cluster.network.partition(&leader);
        let others: Vec<String> = cluster.ids().into_iter().filter(|id| *id != leader).collect();
        let new_leader = cluster.wait_for_leader(&others, ELECTION_BOUND).await?;
        cluster.network.heal(&leader);
        leader = new_leader;
    }

    tokio::time::sleep(common::HEARTBEAT * 2).await;
    for task in tasks {
        task.abort();
    }
    assert!(violations.lock().unwrap().is_empty(), "{:?}", violations.lock().unwrap());

    Ok(())
}

#[tokio::test]
async fn partitioned_leader_rejoins_as_follower() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::bootstrap(3).await?;
    let old_leader = cluster.wait_for_any_leader().await?;
    cluster.append_many(&old_leader, "before", 10).await?;

    cluster.network.partition(&old_leader);
    let majority: Vec<String> = cluster.ids().into_iter().filter(|id| *id != old_leader).collect();
    let new_leader = cluster.wait_for_leader(&majority, ELECTION_BOUND).await?;

    // Cut off from the quorum, the old leader gives up on its own.
    tokio::time::sleep(common::HEARTBEAT * 16).await;
    assert_ne!(cluster.node(&old_leader).role(), RaftRole::Leader);

    let last = cluster.append_many(&new_leader, "after", 10).await?;

    cluster.network.heal(&old_leader);
    cluster.wait_for_commit(&old_leader, last.index(), ELECTION_BOUND).await?;

    let status = cluster.node(&old_leader).status().await?;
    assert_eq!(status.role, RaftRole::Follower);
    assert_eq!(status.leader.as_deref(), Some(new_leader.as_str()));
    assert_eq!(
        application_data(&cluster.committed_entries(&old_leader).await?),
        application_data(&cluster.committed_entries(&new_leader).await?)
    );

    Ok(())
}

#[tokio::test]
async fn appends_fail_when_leadership_is_lost() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::bootstrap(3).await?;
    let leader = cluster.wait_for_any_leader().await?;
    cluster.append(&leader, Bytes::from("committed")).await?;

    for id in cluster.ids().into_iter().filter(|id| *id != leader) {
        cluster.network.partition(&id);
    }

    // Can't commit without a quorum. Once the leader notices, the append fails.
    let result = tokio::time::timeout(Duration::from_secs(5), cluster.node(&leader).append(Bytes::from("stuck"))).await?;
    assert!(matches!(result, Err(AppendError::LeadershipLost)), "{:?}", result);

    Ok(())
}
