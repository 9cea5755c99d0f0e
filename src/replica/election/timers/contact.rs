use crate::replica::election::timers::time::{Clock, RealClock};
use tokio::time::{Duration, Instant};

/// When we last heard from someone. Leaders keep one per peer to tell whether a quorum is still
/// reachable. Followers keep one for their leader so they ignore disruptive polls while the
/// leader is alive.
#[derive(Clone)]
pub(crate) struct LastContact<C: Clock = RealClock> {
    clock: C,
    at: Option<Instant>,
}

impl LastContact {
    pub(crate) fn never() -> Self {
        Self::with_clock(RealClock)
    }
}

impl<C: Clock> LastContact<C> {
    pub(crate) fn with_clock(clock: C) -> Self {
        LastContact { clock, at: None }
    }

    pub(crate) fn record(&mut self) {
        self.at.replace(self.clock.now());
    }

    pub(crate) fn forget(&mut self) {
        self.at = None;
    }

    /// Heard from them less than `window` ago.
    pub(crate) fn within(&self, window: Duration) -> bool {
        match self.at {
            Some(at) => self.clock.now().saturating_duration_since(at) < window,
            None => false,
        }
    }
}
