mod common;

use bytes::Bytes;
use common::{test_options, TestCluster, ELECTION_BOUND};
use logstream_raft::{MembershipChange, MembershipError, RaftOptions, RaftRole};
use std::error::Error;
use tokio::time::Duration;

async fn assert_available(cluster: &TestCluster, members: &[String], step: &str) -> Result<(), Box<dyn Error>> {
    let leader = cluster.wait_for_leader(members, ELECTION_BOUND).await?;
    let entry_id = cluster.append(&leader, Bytes::from(step.to_string())).await?;
    for id in members {
        cluster.wait_for_commit(id, entry_id.index(), ELECTION_BOUND).await?;
    }
    Ok(())
}

async fn active_members(cluster: &TestCluster, id: &str) -> Result<Vec<String>, Box<dyn Error>> {
    let mut active: Vec<String> = cluster
        .node(id)
        .status()
        .await?
        .configuration
        .into_iter()
        .filter(|m| m.active)
        .map(|m| m.replica_id)
        .collect();
    active.sort();
    Ok(active)
}

#[tokio::test]
async fn quorum_resize() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::bootstrap(1).await?;
    let original = "node-1".to_string();
    assert_available(&cluster, &[original.clone()], "one member").await?;

    let mut members = vec![original.clone()];
    for joiner in &["node-2", "node-3"] {
        cluster.create_node(joiner).await?;
        cluster.node(joiner).join(&members).await?;
        members.push(joiner.to_string());
        assert_available(&cluster, &members, &format!("{} joined", joiner)).await?;
    }
    assert_eq!(active_members(&cluster, &original).await?, members);

    // The original member is the leader, so it has to step aside for its own removal.
    cluster.node(&original).leave().await?;
    members.retain(|id| *id != original);
    assert_available(&cluster, &members, "original left").await?;
    assert_ne!(cluster.node(&original).role(), RaftRole::Leader);

    let leader = cluster.wait_for_leader(&members, ELECTION_BOUND).await?;
    let leaving = members.iter().find(|id| **id != leader).unwrap().clone();
    cluster.node(&leaving).leave().await?;
    members.retain(|id| *id != leaving);
    assert_available(&cluster, &members, "joiner left").await?;

    assert_eq!(active_members(&cluster, &members[0]).await?, members);

    Ok(())
}

#[tokio::test]
async fn second_change_is_rejected_while_first_is_pending() -> Result<(), Box<dyn Error>> {
    let options = RaftOptions {
        membership_change_timeout: Some(Duration::from_secs(2)),
        ..test_options()
    };
    let cluster = TestCluster::bootstrap_with_options(3, options).await?;
    let leader = cluster.wait_for_any_leader().await?;
    cluster.append(&leader, Bytes::from("ready")).await?;

    // Nobody answers for "ghost", so its promotion stays pending until it times out.
    let first = cluster
        .node(&leader)
        .submit_configuration_change(MembershipChange::JoinActive("ghost".to_string()));
    let second = async {
        tokio::time::sleep(common::HEARTBEAT * 2).await;
        cluster
            .node(&leader)
            .submit_configuration_change(MembershipChange::JoinPassive("other".to_string()))
            .await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(second, Err(MembershipError::ChangePending)), "{:?}", second);
    assert!(matches!(first, Err(MembershipError::Timeout)), "{:?}", first);

    // "ghost" stays behind as Passive, and the next change goes through.
    let version = cluster
        .node(&leader)
        .submit_configuration_change(MembershipChange::JoinPassive("other".to_string()))
        .await?;
    assert!(version > 0);
    let status = cluster.node(&leader).status().await?;
    assert!(status.configuration.iter().any(|m| m.replica_id == "ghost" && !m.active));
    assert!(status.configuration.iter().any(|m| m.replica_id == "other" && !m.active));

    Ok(())
}

#[tokio::test]
async fn removing_last_active_member_is_rejected() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::bootstrap(1).await?;
    let leader = cluster.wait_for_any_leader().await?;

    let result = cluster.node(&leader).leave().await;
    assert!(matches!(result, Err(MembershipError::WouldRemoveLastActiveMember)), "{:?}", result);

    let result = cluster
        .node(&leader)
        .submit_configuration_change(MembershipChange::Leave("stranger".to_string()))
        .await;
    assert!(matches!(result, Err(MembershipError::UnknownMember)), "{:?}", result);

    Ok(())
}

#[tokio::test]
async fn passive_member_replicates_without_voting() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::bootstrap(3).await?;
    let leader = cluster.wait_for_any_leader().await?;
    let existing = cluster.ids();

    cluster.create_node("listener").await?;
    cluster.node("listener").listen(&existing).await?;
    cluster
        .wait_for_role("listener", RaftRole::Passive, ELECTION_BOUND)
        .await?;

    let last = cluster.append_many(&leader, "observed", 20).await?;
    cluster.wait_for_commit("listener", last.index(), ELECTION_BOUND).await?;
    assert_eq!(active_members(&cluster, &leader).await?, existing);

    // Promotion makes it a full voting member.
    cluster.node("listener").promote().await?;
    cluster
        .wait_for_role("listener", RaftRole::Follower, ELECTION_BOUND)
        .await?;

    cluster.node("listener").demote().await?;
    cluster
        .wait_for_role("listener", RaftRole::Passive, ELECTION_BOUND)
        .await?;
    assert_eq!(active_members(&cluster, &leader).await?, existing);

    Ok(())
}

#[tokio::test]
async fn leader_demotion_completes_through_its_successor() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::bootstrap(3).await?;
    let leader = cluster.wait_for_any_leader().await?;
    cluster.append(&leader, Bytes::from("ready")).await?;

    // A single attempt only gets the leader to step aside.
    let result = cluster
        .node(&leader)
        .submit_configuration_change(MembershipChange::Demote(leader.clone()))
        .await;
    assert!(
        matches!(result, Err(MembershipError::NotLeader { leader_hint: None })),
        "{:?}",
        result
    );

    // The retrying call lands on whoever wins the next election.
    cluster.node(&leader).demote().await?;
    cluster.wait_for_role(&leader, RaftRole::Passive, ELECTION_BOUND).await?;

    let mut remaining: Vec<String> = cluster.ids().into_iter().filter(|id| *id != leader).collect();
    remaining.sort();
    let successor = cluster.wait_for_leader(&remaining, ELECTION_BOUND).await?;
    assert_ne!(successor, leader);
    assert_eq!(active_members(&cluster, &successor).await?, remaining);

    Ok(())
}
