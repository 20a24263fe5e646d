use std::time::Duration;

use tokio::sync::watch;

/// Creates a connected pair of shutdown trigger and shutdown signal.
pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownHandle { sender }, Shutdown { receiver })
}

/// Triggers shutdown of every task holding a [`Shutdown`] created from the same channel.
/// Dropping the handle triggers shutdown as well.
#[derive(Debug)]
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signals every listener to stop.
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    /// Creates a new listener.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            receiver: self.sender.subscribe(),
        }
    }
}

/// The listening side of the root cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    /// Returns true once shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Completes once shutdown has been signalled.
    pub async fn wait(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for `duration`. Returns false if shutdown was signalled first.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_is_interrupted_by_shutdown() {
        let (handle, mut shutdown) = shutdown_channel();
        let waiter = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(3600)).await });
        handle.shutdown();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn dropping_the_handle_shuts_down() {
        let (handle, mut shutdown) = shutdown_channel();
        assert!(!shutdown.is_shutdown());
        drop(handle);
        assert!(shutdown.is_shutdown());
        shutdown.wait().await;
    }
}
