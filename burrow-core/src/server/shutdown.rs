//! Listens for the server shutdown broadcast
use tokio::sync::broadcast;

/// Listens for the shutdown signal. Carries a flag so callers can poll
/// after the signal was seen once.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` once the signal has been received
    is_shutdown: bool,
    /// channel used to listen for shutdown
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// New `Shutdown` backed by the given receiver
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Receive the shutdown notice, waiting if necessary
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // every sender gone also counts as shutdown
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
