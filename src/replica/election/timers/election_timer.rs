use crate::replica::election::timers::deadline::{self, Deadline, DeadlineWatch, Expiry};
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::{actor, replica};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::time::Duration;

/// Drives election timeouts for followers and candidates. The task fires
/// `ElectionTimeoutTick { epoch }` whenever the deadline passes without a reset, then re-arms
/// itself with a fresh random deadline. A follower that can't win a poll keeps re-polling, and a
/// candidate that split the vote keeps starting new elections.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    timeout_range: RangeInclusive<Duration>,
    deadline: Arc<Deadline<C>>,
}

struct ElectionTimerTask<C: Clock> {
    timeout_range: RangeInclusive<Duration>,
    deadline: DeadlineWatch<C>,
    actor_client: actor::WeakActorClient,
    tick: replica::ElectionTimeoutTick,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        epoch: u64,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout..=max_timeout, actor_client, epoch, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> ElectionTimerHandle<C> {
    /// Heard from a live leader (or granted a vote). Start a new random timeout.
    pub(crate) fn reset_timeout(&self) {
        self.deadline.extend(random_timeout(&self.timeout_range));
    }
}

fn random_timeout(timeout_range: &RangeInclusive<Duration>) -> Duration {
    rand::thread_rng().gen_range(timeout_range.clone())
}

impl<C: Clock> ElectionTimerTask<C> {
    fn new(
        timeout_range: RangeInclusive<Duration>,
        actor_client: actor::WeakActorClient,
        epoch: u64,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        // Armed from the start, so a fresh follower waits out a full timeout before polling.
        let first = clock.now() + random_timeout(&timeout_range);
        let (deadline, watch) = deadline::new(clock, first);

        let task = ElectionTimerTask {
            timeout_range: timeout_range.clone(),
            deadline: watch,
            actor_client,
            tick: replica::ElectionTimeoutTick { epoch },
        };
        let handle = ElectionTimerHandle {
            timeout_range,
            deadline,
        };

        (task, handle)
    }

    async fn run(self) {
        // The replica may be handling an AppendEntries while our tick sits in its queue. It
        // decides what a timeout means, we just keep ticking until the role's handle drops.
        while self.deadline.expired().await == Expiry::Elapsed {
            if self.actor_client.election_timeout(self.tick.clone()).await.is_err() {
                return;
            }
            if !self.deadline.extend(random_timeout(&self.timeout_range)) {
                return;
            }
        }
    }
}
