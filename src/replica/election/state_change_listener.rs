use crate::api::RaftRole;
use crate::replica::{ReplicaId, Term};
use tokio::sync::watch;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ElectionStateSnapshot {
    pub(crate) role: RaftRole,
    pub(crate) term: Term,
    // Ourselves when we're leader.
    pub(crate) leader: Option<ReplicaId>,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

pub(super) struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // Watchers only care about actual changes.
        if *self.snd.borrow() != new_state {
            let _ = self.snd.send(new_state);
        }
    }
}

#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rcv.borrow().clone()
    }

    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }
}
