use std::future::Future;
use tokio::sync::oneshot;

/// Pairs a node with its RPC listener. The listener serves until the node calls `stop()` or drops
/// the `ListenerStop`, whichever comes first.
pub(crate) fn listener_stop() -> (ListenerStop, impl Future<Output = ()> + Send + 'static) {
    let (tx, rx) = oneshot::channel::<()>();
    let stopped = async move {
        // Dropped or sent, either way the node is done with us.
        let _ = rx.await;
    };

    (ListenerStop { tx }, stopped)
}

pub(crate) struct ListenerStop {
    tx: oneshot::Sender<()>,
}

impl ListenerStop {
    pub(crate) fn stop(self, logger: &slog::Logger) {
        slog::info!(logger, "Stopping RPC listener");
        // The listener may have exited on its own already.
        let _ = self.tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn stop_releases_listener() {
        let (stop, stopped) = listener_stop();
        let listener = tokio::spawn(stopped);

        stop.stop(&logger());
        tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .expect("Listener still serving")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_node_releases_listener() {
        let (stop, stopped) = listener_stop();
        let mut listener = tokio::spawn(stopped);
        tokio::time::timeout(Duration::from_millis(20), &mut listener)
            .await
            .expect_err("Listener stopped on its own");

        drop(stop);
        tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .expect("Listener still serving")
            .unwrap();
    }
}
