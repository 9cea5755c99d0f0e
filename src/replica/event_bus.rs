use crate::api::{RaftEvent, RaftEventKind};
use tokio::sync::mpsc;

// Publishing never blocks the replica. A dedicated dispatcher task owns the subscriber list and
// fans each event out, so a slow subscriber only grows its own queue.

pub(crate) fn new(logger: slog::Logger) -> (EventPublisher, EventDispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();

    (
        EventPublisher { sender: tx },
        EventDispatcher {
            logger,
            receiver: rx,
            subscribers: Vec::new(),
        },
    )
}

enum BusMessage {
    Publish(RaftEvent),
    Subscribe(Subscriber),
}

struct Subscriber {
    // None means every kind.
    kind: Option<RaftEventKind>,
    sender: mpsc::UnboundedSender<RaftEvent>,
}

#[derive(Clone)]
pub(crate) struct EventPublisher {
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl EventPublisher {
    pub(crate) fn publish(&self, event: RaftEvent) {
        // Dispatcher only exits once every publisher is gone, so this can't fail while we hold one.
        let _ = self.sender.send(BusMessage::Publish(event));
    }

    /// The returned receiver gets every matching event published after this call, in publish
    /// order. Dropping it unsubscribes.
    pub(crate) fn subscribe(&self, kind: Option<RaftEventKind>) -> mpsc::UnboundedReceiver<RaftEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.sender.send(BusMessage::Subscribe(Subscriber { kind, sender: tx }));
        rx
    }
}

pub(crate) struct EventDispatcher {
    logger: slog::Logger,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    subscribers: Vec<Subscriber>,
}

impl EventDispatcher {
    pub(crate) async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                BusMessage::Subscribe(subscriber) => self.subscribers.push(subscriber),
                BusMessage::Publish(event) => self.dispatch(event),
            }
        }

        slog::debug!(self.logger, "Event dispatcher exiting, all publishers dropped.");
    }

    fn dispatch(&mut self, event: RaftEvent) {
        let kind = event.kind();
        let before = self.subscribers.len();

        self.subscribers.retain(|subscriber| {
            if matches!(subscriber.kind, Some(k) if k != kind) {
                return true;
            }
            subscriber.sender.send(event.clone()).is_ok()
        });

        let pruned = before - self.subscribers.len();
        if pruned > 0 {
            slog::debug!(self.logger, "Pruned {} closed event subscribers", pruned);
        }
    }
}
