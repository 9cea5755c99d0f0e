use crate::api::{RaftElectionState, RaftEntry, RaftRole};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot};
use crate::snapshot::SnapshotMeta;
use tokio::sync::mpsc;

/// An event that happened, as observed by the local raft replica.
#[derive(Clone, Debug, PartialEq)]
pub enum RaftEvent {
    RoleChange { old: RaftRole, new: RaftRole, term: u64 },
    /// Every committed entry, in index order. A node that restarts from a snapshot starts
    /// publishing after the snapshot, so consumers should track their own high-water mark.
    Commit(RaftEntry),
    /// Unrecoverable local failure. The node is Inactive after this.
    Failure { reason: String },
    SnapshotInstalled(SnapshotMeta),
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum RaftEventKind {
    RoleChange,
    Commit,
    Failure,
    SnapshotInstalled,
}

impl RaftEvent {
    pub fn kind(&self) -> RaftEventKind {
        match self {
            RaftEvent::RoleChange { .. } => RaftEventKind::RoleChange,
            RaftEvent::Commit(_) => RaftEventKind::Commit,
            RaftEvent::Failure { .. } => RaftEventKind::Failure,
            RaftEvent::SnapshotInstalled(_) => RaftEventKind::SnapshotInstalled,
        }
    }
}

/// Queued subscription to raft events. Events are never dropped for a live listener, so a
/// listener that stops reading grows its own queue. Drop it to unsubscribe.
pub struct RaftEventListener {
    receiver: mpsc::UnboundedReceiver<RaftEvent>,
}

impl RaftEventListener {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<RaftEvent>) -> Self {
        RaftEventListener { receiver }
    }

    /// `next_event()` returns the next event that this local raft replica observes, or `None`
    /// once the node has exited.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.receiver.recv().await
    }
}

/// Latest role and leader only. Consuming this is subtle: it doesn't queue intermediate states.
/// If the state changes several times between calls, only the most recent is returned.
pub struct RaftElectionStateListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl RaftElectionStateListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        RaftElectionStateListener {
            election_state_change_listener,
        }
    }

    pub fn current(&self) -> RaftElectionState {
        RaftElectionState::from(self.election_state_change_listener.current())
    }

    pub async fn next_state(&mut self) -> Option<RaftElectionState> {
        self.election_state_change_listener
            .next()
            .await
            .map(RaftElectionState::from)
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for RaftElectionState {
    fn from(snapshot: ElectionStateSnapshot) -> Self {
        RaftElectionState {
            role: snapshot.role,
            term: snapshot.term.as_u64(),
            leader_replica_id: snapshot.leader.map(|id| id.into_inner()),
        }
    }
}
