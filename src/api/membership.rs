use crate::actor::ActorClient;
use crate::api::MembershipError;
use crate::replica::{ConfigurationChange, ConfigurationChangeInput, ConfigurationChangeOutput, ReplicaId};
use crate::transport::PeerConnector;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// ChangeSubmitter drives one membership change to commit from the client side. Only the leader
/// accepts changes, so it follows leader hints, and otherwise cycles through the members it knows
/// about until someone commits the change or the deadline passes.
pub(crate) struct ChangeSubmitter {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    local_replica: ActorClient,
    connector: Arc<dyn PeerConnector>,
    timeout: Duration,
    retry_backoff: Duration,
}

impl ChangeSubmitter {
    pub(crate) fn new(
        logger: slog::Logger,
        my_replica_id: ReplicaId,
        local_replica: ActorClient,
        connector: Arc<dyn PeerConnector>,
        timeout: Duration,
        retry_backoff: Duration,
    ) -> Self {
        ChangeSubmitter {
            logger,
            my_replica_id,
            local_replica,
            connector,
            timeout,
            retry_backoff,
        }
    }

    pub(crate) async fn submit(
        &self,
        change: ConfigurationChange,
        members: Vec<ReplicaId>,
    ) -> Result<ConfigurationChangeOutput, MembershipError> {
        let deadline = Instant::now() + self.timeout;
        let mut candidates: VecDeque<ReplicaId> = members.into_iter().collect();
        let mut hinted: Option<ReplicaId> = None;

        loop {
            let target = match hinted.take() {
                Some(leader) => leader,
                None => match candidates.pop_front() {
                    Some(candidate) => {
                        candidates.push_back(candidate.clone());
                        candidate
                    }
                    None => return Err(MembershipError::Unavailable("No members to contact".to_string())),
                },
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_secs(0) {
                return Err(MembershipError::Timeout);
            }

            slog::debug!(self.logger, "Submitting {:?} to {}", change, target);
            let input = ConfigurationChangeInput { change: change.clone() };
            let result = match tokio::time::timeout(remaining, self.send(&target, input)).await {
                Ok(result) => result,
                Err(_) => return Err(MembershipError::Timeout),
            };

            match result {
                Ok(output) => {
                    slog::info!(self.logger, "{:?} committed at {:?}", change, output.configuration_version);
                    return Ok(output);
                }
                Err(MembershipError::NotLeader {
                    leader_hint: Some(leader),
                }) if leader != target.as_str() => {
                    hinted = Some(ReplicaId::new(leader));
                    continue;
                }
                Err(
                    e @ MembershipError::UnknownMember
                    | e @ MembershipError::WouldRemoveLastActiveMember
                    | e @ MembershipError::Timeout
                    | e @ MembershipError::ReplicaExited,
                ) => return Err(e),
                Err(e) => {
                    slog::debug!(self.logger, "{} couldn't apply {:?}: {}", target, change, e);
                }
            }

            let backoff = self.retry_backoff.min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(backoff).await;
        }
    }

    async fn send(
        &self,
        target: &ReplicaId,
        input: ConfigurationChangeInput,
    ) -> Result<ConfigurationChangeOutput, MembershipError> {
        if *target == self.my_replica_id {
            self.local_replica.configuration_change(input).await
        } else {
            self.connector
                .peer_client(&self.my_replica_id, target)
                .configuration_change(input)
                .await
        }
    }
}
