use tokio::time::Instant;

/// Where timers and liveness checks read the time from. Tests swap in `ManualClock` so they
/// decide when a heartbeat is due or an election timeout elapses.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) use manual::manual_clock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use tokio::sync::watch;
    use tokio::time::{Duration, Instant};

    /// A clock pair: every `ManualClock` clone reads the time that the `ClockDriver` last set.
    pub(crate) fn manual_clock() -> (ManualClock, ClockDriver) {
        let start = Instant::now();
        let (tx, rx) = watch::channel(start);
        (ManualClock { now: rx }, ClockDriver { tx, start, now: start })
    }

    #[derive(Clone)]
    pub(crate) struct ManualClock {
        now: watch::Receiver<Instant>,
    }

    #[async_trait::async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.borrow()
        }

        async fn sleep_until(&self, deadline: Instant) {
            let mut now = self.now.clone();
            while *now.borrow() < deadline {
                if now.changed().await.is_err() {
                    // Driver is gone. Time stands still, so this sleep never ends.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    pub(crate) struct ClockDriver {
        tx: watch::Sender<Instant>,
        start: Instant,
        now: Instant,
    }

    impl ClockDriver {
        /// Moves time forward in one jump. A sleeper only learns it's past its deadline, not by
        /// how much, so step in increments finer than what the test observes.
        pub(crate) fn advance(&mut self, by: Duration) {
            self.now += by;
            let _ = self.tx.send(self.now);
        }

        pub(crate) fn elapsed(&self) -> Duration {
            self.now - self.start
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use tokio::time::Duration;

    #[tokio::test]
    async fn manual_clock_wakes_sleepers_once_time_passes() {
        let (clock, mut driver) = manual_clock();
        let deadline = clock.now() + Duration::from_millis(300);
        let (woke_tx, mut woke_rx) = oneshot::channel();

        tokio::spawn({
            let clock = clock.clone();
            async move {
                clock.sleep_until(deadline).await;
                let _ = woke_tx.send(());
            }
        });

        driver.advance(Duration::from_millis(200));
        tokio::time::timeout(Duration::from_millis(20), &mut woke_rx)
            .await
            .expect_err("Sleeper woke up early");

        driver.advance(Duration::from_millis(100));
        tokio::time::timeout(Duration::from_secs(5), woke_rx)
            .await
            .expect("Sleeper never woke up")
            .unwrap();
        assert_eq!(driver.elapsed(), Duration::from_millis(300));
        assert_eq!(clock.now(), deadline);
    }
}
