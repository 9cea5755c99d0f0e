use crate::replica::election::timers::time::Clock;
use std::sync::{Arc, Mutex, Weak};
use tokio::time::{Duration, Instant};

/// The point in time a timer fires unless somebody pushes it back first. The role that spawned
/// the timer owns the `Deadline`. The timer task only holds a `DeadlineWatch`, so it winds down
/// once the role's state is dropped.
pub(super) struct Deadline<C: Clock> {
    clock: C,
    at: Mutex<Instant>,
}

pub(super) struct DeadlineWatch<C: Clock> {
    clock: C,
    deadline: Weak<Deadline<C>>,
}

#[derive(Debug, Eq, PartialEq)]
pub(super) enum Expiry {
    Elapsed,
    /// The owner dropped the deadline. Nothing will fire again.
    Abandoned,
}

pub(super) fn new<C: Clock>(clock: C, at: Instant) -> (Arc<Deadline<C>>, DeadlineWatch<C>) {
    let deadline = Arc::new(Deadline {
        clock: clock.clone(),
        at: Mutex::new(at),
    });
    let watch = DeadlineWatch {
        clock,
        deadline: Arc::downgrade(&deadline),
    };

    (deadline, watch)
}

impl<C: Clock> Deadline<C> {
    /// Next expiry is `after` from now, whether that is earlier or later than the current one.
    pub(super) fn extend(&self, after: Duration) {
        let at = self.clock.now() + after;
        *self.at.lock().expect("Deadline mutex poisoned") = at;
    }

    fn at(&self) -> Instant {
        *self.at.lock().expect("Deadline mutex poisoned")
    }
}

impl<C: Clock> DeadlineWatch<C> {
    /// Returns once the deadline passes without being extended, or once its owner is gone.
    pub(super) async fn expired(&self) -> Expiry {
        loop {
            // Never hold the Arc across the sleep, or the owner can't drop it.
            let at = match self.deadline.upgrade() {
                Some(deadline) => deadline.at(),
                None => return Expiry::Abandoned,
            };
            if self.clock.now() >= at {
                return Expiry::Elapsed;
            }
            self.clock.sleep_until(at).await;
        }
    }

    /// Re-arms the timer after it fired. False once the owner is gone.
    pub(super) fn extend(&self, after: Duration) -> bool {
        match self.deadline.upgrade() {
            Some(deadline) => {
                deadline.extend(after);
                true
            }
            None => false,
        }
    }
}
