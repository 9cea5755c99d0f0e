use super::{with_timeout, Replica};
use crate::actor::{Callback, WeakActorClient};
use crate::api::{MembershipError, RaftRole, TransferLeadershipError};
use crate::commitlog::{Index, Log};
use crate::replica::cluster::{ChangeRejection, ClusterConfiguration, ConfigurationChange, Member, MemberType, ReplicaId};
use crate::replica::election::{PendingChange, PendingPromotion, PendingTransfer};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::replica_api::{
    ConfigurationChangeInput, ConfigurationChangeOutput, LeadershipHandoff, RpcError, TransferLeadershipInput,
    TransferLeadershipReplyFromPeer,
};
use crate::replica::write_ahead_log::RaftLogEntry;
use crate::transport::PeerClient;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

type MembershipCallback = Callback<ConfigurationChangeOutput, MembershipError>;

impl<L, S> Replica<L, S>
where
    L: Log<RaftLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    /// Applies one membership change at a time. A member joining as Active first joins as
    /// Passive, and is promoted once its log has caught up with ours.
    pub(crate) fn handle_configuration_change(&mut self, input: ConfigurationChangeInput, callback: MembershipCallback) {
        let change = input.change;
        if let Err(e) = self.check_can_change_membership(&change) {
            callback.send(Err(e));
            return;
        }

        let configuration = match self.configurations.latest() {
            Some(configuration) => configuration.clone(),
            None => {
                callback.send(Err(MembershipError::Inactive));
                return;
            }
        };
        let current_version = configuration.version();

        // We can't replicate our own removal, so let someone else do it.
        match &change {
            ConfigurationChange::Leave(id) | ConfigurationChange::Demote(id)
                if *id == self.my_replica_id && configuration.contains(id) =>
            {
                slog::info!(self.logger, "Stepping down so another leader can apply {:?}", change);
                self.become_follower_or_passive(None);
                callback.send(Err(MembershipError::NotLeader { leader_hint: None }));
                return;
            }
            _ => {}
        }

        let promote = match &change {
            ConfigurationChange::Join {
                member,
                member_type: MemberType::Active,
            } => match configuration.member(member) {
                Some(existing) if existing.is_active() => {
                    callback.send(Ok(ConfigurationChangeOutput {
                        configuration_version: current_version,
                    }));
                    return;
                }
                Some(_) => Some(member.clone()),
                None => {
                    let mut members = configuration.members().to_vec();
                    members.push(Member::new(member.clone(), MemberType::Passive));
                    if let Err(e) = self.append_configuration(members) {
                        callback.send(Err(e));
                        return;
                    }
                    slog::info!(self.logger, "{:?} joined as Passive, promoting once caught up", member);
                    Some(member.clone())
                }
            },
            ConfigurationChange::Promote(member) if matches!(configuration.member(member), Some(m) if !m.is_active()) => {
                Some(member.clone())
            }
            _ => None,
        };

        if let Some(member) = promote {
            self.await_promotion(member, callback);
            self.advance_commit_index();
            self.replicate_to_all_peers();
            return;
        }

        let members = match configuration.apply_change(&change) {
            Ok(Some(members)) => members,
            Ok(None) => {
                callback.send(Ok(ConfigurationChangeOutput {
                    configuration_version: current_version,
                }));
                return;
            }
            Err(ChangeRejection::UnknownMember) => {
                callback.send(Err(MembershipError::UnknownMember));
                return;
            }
            Err(ChangeRejection::LastActiveMember) => {
                callback.send(Err(MembershipError::WouldRemoveLastActiveMember));
                return;
            }
        };

        match self.append_configuration(members) {
            Ok(version) => {
                slog::info!(self.logger, "Appended configuration {:?} for {:?}", version, change);
                if let Some(tracker) = self.election_state.leader_state_mut() {
                    tracker.pending_change.replace(PendingChange { version, callback });
                }
                self.advance_commit_index();
                self.replicate_to_all_peers();
            }
            Err(e) => callback.send(Err(e)),
        }
    }

    fn check_can_change_membership(&self, change: &ConfigurationChange) -> Result<(), MembershipError> {
        let tracker = match self.election_state.leader_state() {
            Some(tracker) => tracker,
            None => {
                return Err(match self.election_state.role() {
                    RaftRole::Inactive => MembershipError::Inactive,
                    _ => MembershipError::NotLeader {
                        leader_hint: self.election_state.leader().map(ReplicaId::into_inner),
                    },
                })
            }
        };

        let commit_index = self.raft_log.commit_index();
        if !tracker.is_ready(commit_index) {
            return Err(MembershipError::LeaderNotReady);
        }
        let uncommitted = match self.configurations.latest().and_then(|c| c.version()) {
            Some(version) => !matches!(commit_index, Some(ci) if ci >= version),
            None => false,
        };
        if uncommitted || tracker.pending_change.is_some() {
            return Err(MembershipError::ChangePending);
        }
        // A retry for the member being promoted is fine; anyone else waits.
        if matches!(&tracker.pending_promotion, Some(p) if p.member != *change.member()) {
            return Err(MembershipError::ChangePending);
        }

        Ok(())
    }

    fn await_promotion(&mut self, member: ReplicaId, callback: MembershipCallback) {
        let deadline = Instant::now() + self.options.membership_change_timeout;
        let tracker = match self.election_state.leader_state_mut() {
            Some(tracker) => tracker,
            None => {
                callback.send(Err(MembershipError::LeadershipLost));
                return;
            }
        };

        let previous = tracker.pending_promotion.replace(PendingPromotion {
            member,
            deadline,
            callback,
        });
        if let Some(previous) = previous {
            previous.callback.send(Err(MembershipError::ChangePending));
        }

        self.check_promotion();
    }

    /// Appends the configuration entry, and starts using it right away: quorum, replication
    /// targets, and our own role.
    fn append_configuration(&mut self, members: Vec<Member>) -> Result<Index, MembershipError> {
        let term = self.current_term();
        let version = match self
            .raft_log
            .append(RaftLogEntry::configuration(term, members.clone()))
        {
            Ok(version) => version,
            Err(ioe) => {
                self.fail(format!("Failed to append configuration: {}", ioe));
                return Err(MembershipError::Inactive);
            }
        };

        self.configurations
            .push(ClusterConfiguration::new(Some(version), members));
        let peer_ids = self.replication_peer_ids();
        self.election_state.sync_leader_peers(peer_ids, version);
        self.refresh_role();

        Ok(version)
    }

    /// Promotes the pending member once the previous change has committed and its log is within
    /// the lag threshold of ours.
    pub(super) fn check_promotion(&mut self) {
        let commit_index = self.raft_log.commit_index();
        let latest_index = self.raft_log.latest_index();
        let lag_threshold = self.options.promotion_lag_threshold;

        let member = {
            let tracker = match self.election_state.leader_state() {
                Some(tracker) => tracker,
                None => return,
            };
            let promotion = match &tracker.pending_promotion {
                Some(promotion) => promotion,
                None => return,
            };
            let uncommitted = match self.configurations.latest().and_then(|c| c.version()) {
                Some(version) => !matches!(commit_index, Some(ci) if ci >= version),
                None => false,
            };
            if uncommitted || tracker.pending_change.is_some() {
                return;
            }

            let matched = tracker
                .peer_state(&promotion.member)
                .and_then(|peer_state| peer_state.matched());
            let caught_up = match (matched, latest_index) {
                (Some(matched), Some(latest)) => matched.as_u64() + lag_threshold >= latest.as_u64(),
                _ => false,
            };
            if !caught_up {
                return;
            }
            promotion.member.clone()
        };

        let promotion = match self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.pending_promotion.take())
        {
            Some(promotion) => promotion,
            None => return,
        };

        let change = ConfigurationChange::Promote(member.clone());
        let applied = match self.configurations.latest() {
            Some(configuration) => configuration.apply_change(&change).map(|members| (members, configuration.version())),
            None => Err(ChangeRejection::UnknownMember),
        };
        let members = match applied {
            Ok((Some(members), _)) => members,
            Ok((None, version)) => {
                promotion.callback.send(Ok(ConfigurationChangeOutput {
                    configuration_version: version,
                }));
                return;
            }
            // Left while catching up.
            Err(_) => {
                promotion.callback.send(Err(MembershipError::UnknownMember));
                return;
            }
        };

        match self.append_configuration(members) {
            Ok(version) => {
                slog::info!(self.logger, "{:?} caught up, promoting to Active at {:?}", member, version);
                match self.election_state.leader_state_mut() {
                    Some(tracker) => {
                        tracker.pending_change.replace(PendingChange {
                            version,
                            callback: promotion.callback,
                        });
                    }
                    None => promotion.callback.send(Err(MembershipError::LeadershipLost)),
                }
                self.advance_commit_index();
                self.replicate_to_all_peers();
            }
            Err(e) => promotion.callback.send(Err(e)),
        }
    }

    /// Fails promotions and transfers that ran out of time.
    pub(super) fn check_leader_deadlines(&mut self) {
        let now = Instant::now();
        let tracker = match self.election_state.leader_state_mut() {
            Some(tracker) => tracker,
            None => return,
        };

        if matches!(&tracker.pending_promotion, Some(p) if now >= p.deadline) {
            if let Some(promotion) = tracker.pending_promotion.take() {
                // The member stays Passive. Retrying the join resumes the promotion.
                slog::warn!(self.logger, "{:?} didn't catch up in time, not promoting", promotion.member);
                promotion.callback.send(Err(MembershipError::Timeout));
            }
        }

        if matches!(&tracker.pending_transfer, Some(t) if now >= t.deadline) {
            if let Some(transfer) = tracker.pending_transfer.take() {
                if let Some(callback) = transfer.callback {
                    slog::warn!(self.logger, "Leadership transfer to {:?} timed out", transfer.target);
                    callback.send(Err(TransferLeadershipError::Timeout));
                }
            }
        }
    }

    // ------- Leadership transfer --------

    pub(crate) fn handle_transfer_leadership(
        &mut self,
        input: TransferLeadershipInput,
        callback: Callback<(), TransferLeadershipError>,
    ) {
        match input.handoff {
            Some(handoff) => callback.send(self.accept_leadership_handoff(handoff)),
            None => self.start_leadership_transfer(input.target_id, callback),
        }
    }

    /// We're the transfer target and the leader says we're caught up. Campaign right away,
    /// skipping the poll.
    fn accept_leadership_handoff(&mut self, handoff: LeadershipHandoff) -> Result<(), TransferLeadershipError> {
        if self.election_state.is_inactive() {
            return Err(TransferLeadershipError::Inactive);
        }
        if handoff.leader_term < self.current_term() {
            return Err(TransferLeadershipError::StaleTerm);
        }
        if self.candidacy_suspended {
            return Err(TransferLeadershipError::CandidacySuspended);
        }
        if !self.is_active_member() {
            return Err(TransferLeadershipError::TargetNotActive);
        }

        slog::info!(
            self.logger,
            "Leadership handed off by {:?} in term {:?}",
            handoff.leader_id,
            handoff.leader_term
        );
        let result = self
            .local_state
            .store_term_if_increased(handoff.leader_term)
            .and_then(|_| self.start_election());
        if let Err(ioe) = result {
            self.fail(format!("Failed to start election after hand-off: {}", ioe));
            return Err(TransferLeadershipError::Inactive);
        }

        Ok(())
    }

    fn start_leadership_transfer(&mut self, target: ReplicaId, callback: Callback<(), TransferLeadershipError>) {
        if let Err(e) = self.check_can_transfer(&target) {
            callback.send(Err(e));
            return;
        }
        if target == self.my_replica_id {
            callback.send(Ok(()));
            return;
        }

        let deadline = Instant::now() + self.options.follower_max_timeout * 2;
        if let Some(tracker) = self.election_state.leader_state_mut() {
            tracker.pending_transfer.replace(PendingTransfer {
                target: target.clone(),
                deadline,
                callback: Some(callback),
                handoff_sent: false,
            });
        }
        slog::info!(self.logger, "Transferring leadership to {:?}", target);

        self.check_transfer_progress();
        self.replicate_to_peer(&target);
    }

    fn check_can_transfer(&self, target: &ReplicaId) -> Result<(), TransferLeadershipError> {
        let tracker = match self.election_state.leader_state() {
            Some(tracker) => tracker,
            None => {
                return Err(match self.election_state.role() {
                    RaftRole::Inactive => TransferLeadershipError::Inactive,
                    _ => TransferLeadershipError::NotLeader {
                        leader_hint: self.election_state.leader().map(ReplicaId::into_inner),
                    },
                })
            }
        };
        if *target == self.my_replica_id {
            return Ok(());
        }

        match self.configurations.latest().and_then(|c| c.member(target)) {
            None => return Err(TransferLeadershipError::UnknownMember),
            Some(member) if !member.is_active() => return Err(TransferLeadershipError::TargetNotActive),
            Some(_) => {}
        }
        if tracker.pending_transfer.is_some() {
            return Err(TransferLeadershipError::TransferInProgress);
        }

        Ok(())
    }

    /// Once the target holds our whole log, tell it to campaign.
    pub(super) fn check_transfer_progress(&mut self) {
        let target = match self
            .election_state
            .leader_state()
            .and_then(|tracker| tracker.pending_transfer.as_ref())
        {
            Some(transfer) if !transfer.handoff_sent => transfer.target.clone(),
            _ => return,
        };
        let matched = self
            .election_state
            .leader_state()
            .and_then(|tracker| tracker.peer_state(&target))
            .and_then(|peer_state| peer_state.matched());
        if matched.is_none() || matched != self.raft_log.latest_index() {
            return;
        }

        if let Some(transfer) = self
            .election_state
            .leader_state_mut()
            .and_then(|tracker| tracker.pending_transfer.as_mut())
        {
            transfer.handoff_sent = true;
        }

        let term = self.current_term();
        let input = TransferLeadershipInput {
            target_id: target.clone(),
            handoff: Some(LeadershipHandoff {
                leader_id: self.my_replica_id.clone(),
                leader_term: term,
            }),
        };
        slog::info!(self.logger, "{:?} caught up at {:?}, handing off leadership", target, matched);

        let peer_client = self.peer_client(&target);
        tokio::task::spawn(Self::call_peer_transfer_leadership(
            self.logger.clone(),
            peer_client,
            target,
            term,
            input,
            self.rpc_timeout(),
            self.actor_client.clone(),
        ));
    }

    async fn call_peer_transfer_leadership(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        peer_id: ReplicaId,
        term: Term,
        input: TransferLeadershipInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
    ) {
        let call = async { Ok::<_, RpcError>(peer_client.transfer_leadership(input).await) };
        let result = match with_timeout(rpc_timeout, call).await {
            Ok(result) => result,
            Err(RpcError::Timeout) => Err(TransferLeadershipError::Timeout),
            Err(e) => Err(TransferLeadershipError::Unavailable(e.to_string())),
        };
        slog::debug!(logger, "TransferLeadership reply from {:?}: {:?}", peer_id, result);

        callback
            .notify_transfer_leadership_reply_from_peer(TransferLeadershipReplyFromPeer { peer_id, term, result })
            .await;
    }

    pub(crate) fn handle_transfer_leadership_reply_from_peer(&mut self, reply: TransferLeadershipReplyFromPeer) {
        if reply.term != self.current_term() {
            return;
        }
        let tracker = match self.election_state.leader_state_mut() {
            Some(tracker) => tracker,
            None => return,
        };

        match reply.result {
            Ok(()) => {
                slog::info!(self.logger, "{:?} accepted leadership hand-off", reply.peer_id);
                // Appends stay blocked until the target wins or the deadline passes.
                if let Some(callback) = tracker.pending_transfer.as_mut().and_then(|t| t.callback.take()) {
                    callback.send(Ok(()));
                }
            }
            Err(e) => {
                slog::warn!(self.logger, "{:?} refused leadership hand-off: {}", reply.peer_id, e);
                if let Some(PendingTransfer {
                    callback: Some(callback),
                    ..
                }) = tracker.pending_transfer.take()
                {
                    callback.send(Err(e));
                }
            }
        }
    }
}
