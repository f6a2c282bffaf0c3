use tokio::sync::watch;

/// Cooperative cancellation observed by every task started by the agent.
///
/// Cloning is cheap and a clone taken after the signal was sent still
/// observes it.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownSender(tx), ShutdownSignal { rx })
    }

    /// Waits for the shutdown signal. Dropping the sender counts as a signal.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

pub struct ShutdownSender(watch::Sender<bool>);

impl ShutdownSender {
    pub fn send_signal(self) {
        let _ = self.0.send(true);
    }
}
