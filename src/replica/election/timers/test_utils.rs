use crate::actor::Event;
use crate::replica::{ElectionTimeoutTick, LeaderTimerTick};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Stands in for the replica's event loop and checks what the timers put in its queue.
pub(super) struct QueueObserver {
    rx: mpsc::Receiver<Event>,
}

impl QueueObserver {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        QueueObserver { rx }
    }

    pub(super) async fn expect_heartbeat(&mut self, expected: LeaderTimerTick) {
        match self.next().await {
            Event::LeaderTimer(tick) => assert_eq!(tick, expected),
            other => panic!("Expected heartbeat tick, got {:?}", other),
        }
    }

    pub(super) async fn expect_election_timeout(&mut self, epoch: u64) {
        match self.next().await {
            Event::ElectionTimeout(tick) => assert_eq!(tick, ElectionTimeoutTick { epoch }),
            other => panic!("Expected election timeout, got {:?}", other),
        }
    }

    /// Nothing shows up for a little while of real time.
    pub(super) async fn expect_nothing(&mut self) {
        if let Ok(event) = tokio::time::timeout(Duration::from_millis(10), self.rx.recv()).await {
            panic!("Expected empty queue, got {:?}", event);
        }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Timed out waiting for a timer event")
            .expect("Event queue closed")
    }
}
