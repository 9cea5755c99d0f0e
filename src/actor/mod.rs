use crate::api::{
    AppendError, CompactError, MembershipError, RaftEntry, RaftEntryId, RaftNodeExited, RaftStatus, ReadLogError,
    ReaderMode, StartError, StepDownError, TransferLeadershipError,
};
use crate::commitlog::{Index, Log};
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, ConfigurationChangeInput,
    ConfigurationChangeOutput, ElectionTimeoutTick, InstallSnapshotInput, InstallSnapshotOutput,
    InstallSnapshotReplyFromPeer, LeaderTimerTick, PersistentLocalState, PollInput, PollOutput, PollReplyFromPeer,
    RaftLogEntry, Replica, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, RpcError, StartMode,
    TransferLeadershipInput, TransferLeadershipReplyFromPeer,
};
use crate::snapshot::SnapshotMeta;
use bytes::Bytes;
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Every protocol state mutation for one replica happens on this event loop. RPC completions and
// timer firings come back in as events, so the replica never needs a lock.
#[derive(Debug)]
pub(crate) enum Event {
    // All roles: begin participating. Inactive only.
    Start(StartMode, Callback<(), StartError>),

    // Leader: admit, write to disk, replicate, resolve on commit.
    // Others: Redirect.
    Append(Bytes, Callback<RaftEntryId, AppendError>),

    // All roles: grant vote if applicable (includes write to disk). Step down on higher term.
    RequestVote(RequestVoteInput, Callback<RequestVoteOutput, RpcError>),
    // Candidate: count vote, become leader on quorum. Others: discard.
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),

    // All roles: would we vote? No state change.
    Poll(PollInput, Callback<PollOutput, RpcError>),
    // Follower: count acceptance, start election on quorum. Others: discard.
    PollReplyFromPeer(PollReplyFromPeer),

    // Follower/Passive: write to disk then respond. Reset timeout.
    // Candidate: Transition to follower.
    AppendEntries(AppendEntriesInput, Callback<AppendEntriesOutput, RpcError>),
    // Leader: Update peer progress, advance commit. Others: discard.
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),

    // Follower/Passive: assemble chunk, install on last chunk.
    InstallSnapshot(InstallSnapshotInput, Callback<InstallSnapshotOutput, RpcError>),
    // Leader: advance the transfer. Others: discard.
    InstallSnapshotReplyFromPeer(InstallSnapshotReplyFromPeer),

    // Leader: append a configuration entry, resolve on commit. Others: redirect.
    ConfigurationChange(
        ConfigurationChangeInput,
        Callback<ConfigurationChangeOutput, MembershipError>,
    ),
    // Leader: hand leadership to a caught up peer. Target: start an election right away.
    TransferLeadership(TransferLeadershipInput, Callback<(), TransferLeadershipError>),
    TransferLeadershipReplyFromPeer(TransferLeadershipReplyFromPeer),

    // Leader: send AppendEntries (or a snapshot chunk) to the peer. Check quorum liveness.
    LeaderTimer(LeaderTimerTick),
    // Follower: poll. Candidate: new election. Others: discard.
    ElectionTimeout(ElectionTimeoutTick),

    SuspendCandidacy { step_down: bool, callback: Callback<(), RaftNodeExited> },
    ResumeCandidacy(Callback<(), RaftNodeExited>),
    StepDown(Callback<(), StepDownError>),
    Compact(Option<Index>, Callback<SnapshotMeta, CompactError>),
    Status(Callback<RaftStatus, RaftNodeExited>),
    ReadLog(Index, ReaderMode, Callback<Vec<RaftEntry>, ReadLogError>),
    CurrentSnapshot(Callback<Option<SnapshotMeta>, ReadLogError>),
    Shutdown(Callback<(), RaftNodeExited>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

/// The replica's event loop is gone.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ActorExited;

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    /// Background tasks hold weak clients, so dropping the last strong client stops the replica.
    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn start(&self, mode: StartMode) -> Result<(), StartError> {
        self.call(|cb| Event::Start(mode, cb)).await
    }

    pub(crate) async fn append(&self, data: Bytes) -> Result<RaftEntryId, AppendError> {
        self.call(|cb| Event::Append(data, cb)).await
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError> {
        self.call(|cb| Event::RequestVote(input, cb)).await
    }

    pub(crate) async fn poll(&self, input: PollInput) -> Result<PollOutput, RpcError> {
        self.call(|cb| Event::Poll(input, cb)).await
    }

    pub(crate) async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RpcError> {
        self.call(|cb| Event::AppendEntries(input, cb)).await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, RpcError> {
        self.call(|cb| Event::InstallSnapshot(input, cb)).await
    }

    pub(crate) async fn configuration_change(
        &self,
        input: ConfigurationChangeInput,
    ) -> Result<ConfigurationChangeOutput, MembershipError> {
        self.call(|cb| Event::ConfigurationChange(input, cb)).await
    }

    pub(crate) async fn transfer_leadership(&self, input: TransferLeadershipInput) -> Result<(), TransferLeadershipError> {
        self.call(|cb| Event::TransferLeadership(input, cb)).await
    }

    pub(crate) async fn suspend_candidacy(&self, step_down: bool) -> Result<(), RaftNodeExited> {
        self.call(|callback| Event::SuspendCandidacy { step_down, callback }).await
    }

    pub(crate) async fn resume_candidacy(&self) -> Result<(), RaftNodeExited> {
        self.call(Event::ResumeCandidacy).await
    }

    pub(crate) async fn step_down(&self) -> Result<(), StepDownError> {
        self.call(Event::StepDown).await
    }

    pub(crate) async fn compact(&self, up_to: Option<Index>) -> Result<SnapshotMeta, CompactError> {
        self.call(|cb| Event::Compact(up_to, cb)).await
    }

    pub(crate) async fn status(&self) -> Result<RaftStatus, RaftNodeExited> {
        self.call(Event::Status).await
    }

    pub(crate) async fn read_log(&self, from: Index, mode: ReaderMode) -> Result<Vec<RaftEntry>, ReadLogError> {
        self.call(|cb| Event::ReadLog(from, mode, cb)).await
    }

    pub(crate) async fn current_snapshot(&self) -> Result<Option<SnapshotMeta>, ReadLogError> {
        self.call(Event::CurrentSnapshot).await
    }

    pub(crate) async fn shutdown(&self) -> Result<(), RaftNodeExited> {
        self.call(Event::Shutdown).await
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(&self, reply: RequestVoteReplyFromPeer) {
        let _ = self.send(Event::RequestVoteReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_poll_reply_from_peer(&self, reply: PollReplyFromPeer) {
        let _ = self.send(Event::PollReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(&self, reply: AppendEntriesReplyFromPeer) {
        let _ = self.send(Event::AppendEntriesReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(&self, reply: InstallSnapshotReplyFromPeer) {
        let _ = self.send(Event::InstallSnapshotReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_transfer_leadership_reply_from_peer(&self, reply: TransferLeadershipReplyFromPeer) {
        let _ = self.send(Event::TransferLeadershipReplyFromPeer(reply)).await;
    }

    async fn call<O, E, F>(&self, to_event: F) -> Result<O, E>
    where
        O: Debug,
        E: Error + From<ActorExited>,
        F: FnOnce(Callback<O, E>) -> Event,
    {
        let (tx, rx) = oneshot::channel();
        self.send(to_event(Callback(tx))).await?;

        match rx.await {
            Ok(result) => result,
            // Replica dropped our callback without replying. Only happens when it exits.
            Err(_) => Err(E::from(ActorExited)),
        }
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// WeakActorClient doesn't keep the replica alive. Every call fails with `ActorExited` once the
/// last strong client is dropped.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub(crate) fn upgrade(&self) -> Result<ActorClient, ActorExited> {
        self.sender
            .upgrade()
            .map(|sender| ActorClient { sender })
            .ok_or(ActorExited)
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RpcError> {
        self.upgrade()?.request_vote(input).await
    }

    pub(crate) async fn poll(&self, input: PollInput) -> Result<PollOutput, RpcError> {
        self.upgrade()?.poll(input).await
    }

    pub(crate) async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, RpcError> {
        self.upgrade()?.append_entries(input).await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, RpcError> {
        self.upgrade()?.install_snapshot(input).await
    }

    pub(crate) async fn configuration_change(
        &self,
        input: ConfigurationChangeInput,
    ) -> Result<ConfigurationChangeOutput, MembershipError> {
        self.upgrade()?.configuration_change(input).await
    }

    pub(crate) async fn transfer_leadership(&self, input: TransferLeadershipInput) -> Result<(), TransferLeadershipError> {
        self.upgrade()?.transfer_leadership(input).await
    }

    pub(crate) async fn leader_timer(&self, tick: LeaderTimerTick) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn election_timeout(&self, tick: ElectionTimeoutTick) -> Result<(), ActorExited> {
        self.upgrade()?.send(Event::ElectionTimeout(tick)).await
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(&self, reply: RequestVoteReplyFromPeer) {
        if let Ok(client) = self.upgrade() {
            client.notify_request_vote_reply_from_peer(reply).await;
        }
    }

    pub(crate) async fn notify_poll_reply_from_peer(&self, reply: PollReplyFromPeer) {
        if let Ok(client) = self.upgrade() {
            client.notify_poll_reply_from_peer(reply).await;
        }
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(&self, reply: AppendEntriesReplyFromPeer) {
        if let Ok(client) = self.upgrade() {
            client.notify_append_entries_reply_from_peer(reply).await;
        }
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(&self, reply: InstallSnapshotReplyFromPeer) {
        if let Ok(client) = self.upgrade() {
            client.notify_install_snapshot_reply_from_peer(reply).await;
        }
    }

    pub(crate) async fn notify_transfer_leadership_reply_from_peer(&self, reply: TransferLeadershipReplyFromPeer) {
        if let Ok(client) = self.upgrade() {
            client.notify_transfer_leadership_reply_from_peer(reply).await;
        }
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L, S>
where
    L: Log<RaftLogEntry>,
    S: PersistentLocalState,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: Log<RaftLogEntry> + Send + 'static,
    S: PersistentLocalState + Send + 'static,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: Replica<L, S>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);

            if self.replica.is_shut_down() {
                break;
            }
        }

        slog::info!(self.logger, "Replica event loop exited.");
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Start(mode, callback) => callback.send(self.replica.handle_start(mode)),
            Event::Append(data, callback) => self.replica.handle_append(data, callback),
            Event::RequestVote(input, callback) => callback.send(self.replica.server_handle_request_vote(input)),
            Event::RequestVoteReplyFromPeer(reply) => self.replica.handle_request_vote_reply_from_peer(reply),
            Event::Poll(input, callback) => callback.send(self.replica.server_handle_poll(input)),
            Event::PollReplyFromPeer(reply) => self.replica.handle_poll_reply_from_peer(reply),
            Event::AppendEntries(input, callback) => callback.send(self.replica.server_handle_append_entries(input)),
            Event::AppendEntriesReplyFromPeer(reply) => self.replica.handle_append_entries_reply_from_peer(reply),
            Event::InstallSnapshot(input, callback) => {
                callback.send(self.replica.server_handle_install_snapshot(input))
            }
            Event::InstallSnapshotReplyFromPeer(reply) => self.replica.handle_install_snapshot_reply_from_peer(reply),
            Event::ConfigurationChange(input, callback) => self.replica.handle_configuration_change(input, callback),
            Event::TransferLeadership(input, callback) => self.replica.handle_transfer_leadership(input, callback),
            Event::TransferLeadershipReplyFromPeer(reply) => {
                self.replica.handle_transfer_leadership_reply_from_peer(reply)
            }
            Event::LeaderTimer(tick) => self.replica.handle_leader_timer(tick),
            Event::ElectionTimeout(tick) => self.replica.handle_election_timeout(tick),
            Event::SuspendCandidacy { step_down, callback } => {
                self.replica.suspend_candidacy(step_down);
                callback.send(Ok(()));
            }
            Event::ResumeCandidacy(callback) => {
                self.replica.resume_candidacy();
                callback.send(Ok(()));
            }
            Event::StepDown(callback) => callback.send(self.replica.handle_step_down()),
            Event::Compact(up_to, callback) => callback.send(self.replica.handle_compact(up_to)),
            Event::Status(callback) => callback.send(Ok(self.replica.status())),
            Event::ReadLog(from, mode, callback) => callback.send(self.replica.read_log(from, mode)),
            Event::CurrentSnapshot(callback) => callback.send(self.replica.current_snapshot()),
            Event::Shutdown(callback) => {
                self.replica.shutdown();
                callback.send(Ok(()));
            }
        }
    }
}
