use super::{with_timeout, Replica};
use crate::actor::WeakActorClient;
use crate::api::RaftRole;
use crate::backpressure::CommitLimiter;
use crate::commitlog::{Index, Log};
use crate::replica::cluster::ReplicaId;
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::replica_api::{
    ElectionTimeoutTick, PollInput, PollOutput, PollReplyFromPeer, RequestVoteInput, RequestVoteOutput,
    RequestVoteReplyFromPeer, RpcError,
};
use crate::replica::write_ahead_log::RaftLogEntry;
use crate::transport::PeerClient;
use std::io;
use std::sync::Arc;
use tokio::time::Duration;

impl<L, S> Replica<L, S>
where
    L: Log<RaftLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    pub(crate) fn handle_election_timeout(&mut self, tick: ElectionTimeoutTick) {
        if tick.epoch != self.election_state.epoch() {
            slog::debug!(
                self.logger,
                "Ignoring stale election timeout from epoch {}, current epoch {}",
                tick.epoch,
                self.election_state.epoch()
            );
            return;
        }
        if self.candidacy_suspended {
            slog::debug!(self.logger, "Election timeout while candidacy is suspended.");
            return;
        }
        if !self.is_active_member() {
            return;
        }

        match self.election_state.role() {
            // A follower first finds out whether it could win, without touching its term.
            RaftRole::Follower => self.start_poll(),
            // Split vote or lost requests. Try again in a new term.
            RaftRole::Candidate => self.start_election_or_fail(),
            RaftRole::Inactive | RaftRole::Passive | RaftRole::Leader => {}
        }
    }

    fn start_poll(&mut self) {
        let poll_term = self.current_term().next();
        let round = match self.election_state.start_poll_round(poll_term) {
            Some(round) => round,
            None => return,
        };
        if self.quorum_size() <= 1 {
            self.start_election_or_fail();
            return;
        }

        let peer_ids = self.other_active_member_ids();
        slog::info!(
            self.logger,
            "Timed out as follower. Polling {} peers for term {:?}, round {}",
            peer_ids.len(),
            poll_term,
            round
        );

        let input = PollInput {
            candidate_term: poll_term,
            candidate_id: self.my_replica_id.clone(),
            candidate_last_log_entry: self.raft_log.latest_entry(),
        };
        for peer_id in peer_ids {
            let client = self.peer_client(&peer_id);
            tokio::task::spawn(Self::call_peer_poll(
                self.logger.clone(),
                client,
                peer_id,
                input.clone(),
                round,
                self.rpc_timeout(),
                self.actor_client.clone(),
            ));
        }
    }

    async fn call_peer_poll(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        peer_id: ReplicaId,
        input: PollInput,
        round: u64,
        rpc_timeout: Duration,
        callback: WeakActorClient,
    ) {
        let poll_term = input.candidate_term;
        let result = with_timeout(rpc_timeout, peer_client.poll(input)).await;
        slog::debug!(logger, "Poll reply from {:?}: {:?}", peer_id, result);

        callback
            .notify_poll_reply_from_peer(PollReplyFromPeer {
                peer_id,
                round,
                poll_term,
                result,
            })
            .await;
    }

    pub(crate) fn server_handle_poll(&mut self, input: PollInput) -> Result<PollOutput, RpcError> {
        if self.election_state.is_inactive() {
            return Err(RpcError::Inactive);
        }

        let current_term = self.current_term();
        let accepted = self.would_vote_in_poll(&input, current_term);
        slog::debug!(
            self.logger,
            "Poll from {:?} for term {:?}: accepted={}",
            input.candidate_id,
            input.candidate_term,
            accepted
        );

        // Answering a poll never changes our term or vote.
        Ok(PollOutput {
            term: current_term,
            accepted,
        })
    }

    fn would_vote_in_poll(&self, input: &PollInput, current_term: Term) -> bool {
        if input.candidate_term <= current_term {
            return false;
        }
        // While a leader is around, a candidate can only disrupt it.
        if self.election_state.is_leader() || self.heard_from_leader_recently() {
            return false;
        }
        let candidate_is_active = self
            .configurations
            .latest()
            .map(|c| c.is_active(&input.candidate_id))
            .unwrap_or(false);
        if !candidate_is_active {
            return false;
        }

        self.is_candidate_log_gte_mine(input.candidate_last_log_entry)
    }

    fn heard_from_leader_recently(&self) -> bool {
        self.last_leader_contact.within(self.options.follower_min_timeout)
    }

    pub(crate) fn handle_poll_reply_from_peer(&mut self, reply: PollReplyFromPeer) {
        let output = match reply.result {
            Ok(output) => output,
            Err(e) => {
                slog::debug!(self.logger, "Poll to {:?} failed: {}", reply.peer_id, e);
                return;
            }
        };

        if output.term > self.current_term() && self.step_down_if_term_increased(output.term) {
            return;
        }
        if !output.accepted || reply.poll_term != self.current_term().next() {
            return;
        }
        if !self.is_active(&reply.peer_id) {
            return;
        }

        let num_accepted = match self
            .election_state
            .add_poll_acceptance(reply.round, reply.poll_term, reply.peer_id)
        {
            Some(n) => n,
            None => return,
        };

        let quorum = self.quorum_size();
        slog::info!(
            self.logger,
            "Poll for term {:?} accepted by {}/{} needed",
            reply.poll_term,
            num_accepted,
            quorum
        );
        if num_accepted >= quorum {
            self.start_election_or_fail();
        }
    }

    pub(super) fn start_election_or_fail(&mut self) {
        if let Err(ioe) = self.start_election() {
            self.fail(format!("Failed to start election: {}", ioe));
        }
    }

    pub(super) fn start_election(&mut self) -> Result<(), io::Error> {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = self.local_state.increment_term_and_vote_for_self()?;
        let tracker = self
            .election_state
            .transition_to_candidate_and_vote_for_self(new_term);
        Self::abandon_leadership(tracker);
        self.discard_stale_pending_snapshot();
        slog::info!(
            self.logger,
            "Changed to candidate for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if self.quorum_size() <= 1 {
            self.become_leader();
            return Ok(());
        }

        let input = RequestVoteInput {
            candidate_term: new_term,
            candidate_id: self.my_replica_id.clone(),
            candidate_last_log_entry: self.raft_log.latest_entry(),
        };
        for peer_id in self.other_active_member_ids() {
            let client = self.peer_client(&peer_id);
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.clone(),
                client,
                peer_id,
                input.clone(),
                self.rpc_timeout(),
                self.actor_client.clone(),
            ));
        }

        Ok(())
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        peer_id: ReplicaId,
        input: RequestVoteInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
    ) {
        let term = input.candidate_term;
        let result = with_timeout(rpc_timeout, peer_client.request_vote(input)).await;
        slog::debug!(logger, "RequestVote reply from {:?}: {:?}", peer_id, result);

        callback
            .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer { peer_id, term, result })
            .await;
    }

    pub(crate) fn server_handle_request_vote(&mut self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError> {
        if self.election_state.is_inactive() {
            return Err(RpcError::Inactive);
        }

        match self.try_handle_request_vote(input) {
            Ok(output) => Ok(output),
            Err(ioe) => {
                let message = ioe.to_string();
                self.fail(format!("Failed to persist vote: {}", ioe));
                Err(RpcError::ServerFault(message))
            }
        }
    }

    fn try_handle_request_vote(&mut self, input: RequestVoteInput) -> Result<RequestVoteOutput, io::Error> {
        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote to {:?}. Its term is out of date.", input.candidate_id);
            return Ok(RequestVoteOutput {
                term: current_term,
                vote_granted: false,
            });
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self.local_state.store_term_if_increased(input.candidate_term)?;
        if increased {
            self.become_follower_or_passive(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Election state: {:?}",
                self.election_state
            );
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }
        let deny = RequestVoteOutput {
            term: input.candidate_term,
            vote_granted: false,
        };

        // Only Active members vote, and only for Active members.
        if !self.is_active_member() {
            slog::info!(self.logger, "Not granting vote. We're not an Active member.");
            return Ok(deny);
        }
        if !self.is_active(&input.candidate_id) {
            slog::info!(self.logger, "Not granting vote. {:?} isn't an Active member.", input.candidate_id);
            return Ok(deny);
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(deny);
            }
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(deny);
        }

        // ...grant vote
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())?;
        let granted = cas_success || self.already_voted_for(input.candidate_term, &input.candidate_id);

        if granted {
            slog::info!(self.logger, "Voted for {:?} in term {:?}.", input.candidate_id, input.candidate_term);
            // Granting a vote counts as hearing from a would-be leader.
            self.election_state.reset_timeout_if_follower();
        } else {
            slog::info!(self.logger, "Not granting vote. Lost vote CAS for term {:?}.", input.candidate_term);
        }

        Ok(RequestVoteOutput {
            term: input.candidate_term,
            vote_granted: granted,
        })
    }

    // A retried request finds its own vote already stored. Award the vote again.
    fn already_voted_for(&self, term: Term, candidate_id: &ReplicaId) -> bool {
        match self.local_state.voted_for_current_term() {
            (reread_current_term, Some(reread_voted_for)) => {
                reread_current_term == term && reread_voted_for.as_ref() == candidate_id
            }
            _ => false,
        }
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.raft_log.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (
                Some((my_last_entry_term, my_last_entry_index)),
                Some((candidate_last_entry_term, candidate_last_entry_index)),
            ) => {
                if candidate_last_entry_term != my_last_entry_term {
                    return candidate_last_entry_term > my_last_entry_term;
                }

                candidate_last_entry_index >= my_last_entry_index
            }
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let output = match reply.result {
            Ok(output) => output,
            Err(e) => {
                // No retry. If the election stalls, the next timeout starts a new one.
                slog::debug!(self.logger, "RequestVote to {:?} failed: {}", reply.peer_id, e);
                return;
            }
        };

        let current_term = self.current_term();
        if output.term > current_term && self.step_down_if_term_increased(output.term) {
            return;
        }
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }
        if !output.vote_granted {
            slog::info!(
                self.logger,
                "Vote not granted from {:?} for term {:?}",
                reply.peer_id,
                reply.term,
            );
            return;
        }
        if !self.is_active(&reply.peer_id) {
            return;
        }

        let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
            Some(v) => v,
            None => {
                slog::debug!(
                    self.logger,
                    "Received vote for term {:?} after transitioning to election state: {:?}",
                    reply.term,
                    self.election_state,
                );
                return;
            }
        };

        let quorum = self.quorum_size();
        slog::info!(
            self.logger,
            "Received {} votes, {} needed for term {:?}",
            num_votes_received,
            quorum,
            reply.term,
        );

        if num_votes_received >= quorum {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        let term = self.current_term();
        let peer_ids = self.replication_peer_ids();
        let next_index = self.raft_log.next_index();
        let commit_limiter = CommitLimiter::new(&self.options.backpressure);
        self.election_state
            .transition_to_leader(term, peer_ids, next_index, commit_limiter);
        self.last_leader_contact.forget();
        self.discard_stale_pending_snapshot();
        slog::info!(self.logger, "Became leader for term {:?}", term);

        // Leader accession: our own Initialize entry. Once it commits, everything before it from
        // older terms is committed too.
        match self.raft_log.append(RaftLogEntry::initialize(term)) {
            Ok(index) => {
                if let Some(tracker) = self.election_state.leader_state_mut() {
                    tracker.initialize_index.replace(index);
                }
            }
            Err(ioe) => {
                self.fail(format!("Failed to append Initialize entry: {}", ioe));
                return;
            }
        }

        self.advance_commit_index();
        self.replicate_to_all_peers();
    }

    // ------- Membership arithmetic --------

    pub(super) fn is_active(&self, replica_id: &ReplicaId) -> bool {
        self.configurations
            .latest()
            .map(|c| c.is_active(replica_id))
            .unwrap_or(false)
    }

    pub(super) fn quorum_size(&self) -> usize {
        self.configurations
            .latest()
            .map(|c| c.quorum_size())
            .unwrap_or(1)
    }

    fn other_active_member_ids(&self) -> Vec<ReplicaId> {
        match self.configurations.latest() {
            Some(c) => c
                .active_ids()
                .filter(|id| **id != self.my_replica_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}
