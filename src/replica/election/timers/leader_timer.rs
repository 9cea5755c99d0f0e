use crate::replica::election::timers::deadline::{self, Deadline, DeadlineWatch, Expiry};
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::{actor, replica};
use std::sync::Arc;
use tokio::time::Duration;

/// Heartbeat timer for one peer while we lead. Fires `LeaderTimerTick` once the peer has gone a
/// whole heartbeat without hearing from us. Every AppendEntries or snapshot chunk we send it
/// pushes the next heartbeat back.
pub(crate) struct LeaderTimerHandle<C: Clock = RealClock> {
    heartbeat: Duration,
    next_heartbeat: Arc<Deadline<C>>,
}

struct LeaderTimerTask<C: Clock> {
    heartbeat: Duration,
    next_heartbeat: DeadlineWatch<C>,
    actor_client: actor::WeakActorClient,
    tick: replica::LeaderTimerTick,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
    ) -> Self {
        let (task, handle) = LeaderTimerTask::new(heartbeat, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> LeaderTimerHandle<C> {
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.next_heartbeat.extend(self.heartbeat);
    }
}

impl<C: Clock> LeaderTimerTask<C> {
    fn new(
        heartbeat: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
        clock: C,
    ) -> (Self, LeaderTimerHandle<C>) {
        // Due right away: a new leader (or a new member) should hear from us immediately.
        let now = clock.now();
        let (next_heartbeat, watch) = deadline::new(clock, now);

        let task = LeaderTimerTask {
            heartbeat,
            next_heartbeat: watch,
            actor_client,
            tick: replica::LeaderTimerTick { peer_id, term },
        };
        let handle = LeaderTimerHandle {
            heartbeat,
            next_heartbeat,
        };

        (task, handle)
    }

    async fn run(self) {
        while self.next_heartbeat.expired().await == Expiry::Elapsed {
            if self.actor_client.leader_timer(self.tick.clone()).await.is_err() {
                return;
            }
            // Handle dropped while the tick was queued: we no longer lead this peer in this term.
            if !self.next_heartbeat.extend(self.heartbeat) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::test_utils::QueueObserver;
    use crate::replica::election::timers::time::manual_clock;
    use crate::replica::{LeaderTimerTick, ReplicaId, Term};

    fn tick() -> LeaderTimerTick {
        LeaderTimerTick {
            peer_id: ReplicaId::new("follower-2"),
            term: Term::new(4),
        }
    }

    #[tokio::test]
    async fn idle_peer_gets_one_heartbeat_per_period() {
        let heartbeat = Duration::from_millis(50);
        let (client, rx) = ActorClient::new(10);
        let mut queue = QueueObserver::new(rx);
        let (clock, mut driver) = manual_clock();

        let (task, handle) = LeaderTimerTask::new(heartbeat, client.weak(), tick().peer_id, tick().term, clock);
        let task = tokio::task::spawn(task.run());

        // Immediately due for a fresh leader.
        queue.expect_heartbeat(tick()).await;
        queue.expect_nothing().await;

        for _ in 0..3 {
            driver.advance(heartbeat);
            queue.expect_heartbeat(tick()).await;
            queue.expect_nothing().await;
        }

        // A long stall still produces a single tick, not a backlog.
        driver.advance(heartbeat * 10);
        queue.expect_heartbeat(tick()).await;
        queue.expect_nothing().await;

        drop(handle);
        driver.advance(heartbeat);
        task.await.unwrap();
        queue.expect_nothing().await;
    }

    #[tokio::test]
    async fn traffic_to_peer_postpones_heartbeat() {
        let heartbeat = Duration::from_millis(50);
        let (client, rx) = ActorClient::new(10);
        let mut queue = QueueObserver::new(rx);
        let (clock, mut driver) = manual_clock();

        let (task, handle) = LeaderTimerTask::new(heartbeat, client.weak(), tick().peer_id, tick().term, clock);
        tokio::task::spawn(task.run());
        queue.expect_heartbeat(tick()).await;

        // Replication traffic every half period keeps the heartbeat away.
        for _ in 0..4 {
            driver.advance(heartbeat / 2);
            handle.reset_heartbeat_timer();
        }
        queue.expect_nothing().await;
        assert_eq!(driver.elapsed(), heartbeat * 2);

        driver.advance(heartbeat - Duration::from_millis(1));
        queue.expect_nothing().await;

        driver.advance(Duration::from_millis(1));
        queue.expect_heartbeat(tick()).await;
    }

    #[tokio::test]
    async fn timer_stops_when_replica_is_gone() {
        let (client, rx) = ActorClient::new(10);
        drop(rx);
        let (clock, _driver) = manual_clock();

        let (task, _handle) =
            LeaderTimerTask::new(Duration::from_millis(50), client.weak(), tick().peer_id, tick().term, clock);

        tokio::time::timeout(Duration::from_secs(5), task.run())
            .await
            .expect("Timer kept running without a replica");
    }
}
