//! Payload-free change notification streams.
//!
//! Watchers deliver coalesced "something changed" events: the value on the
//! channel carries no payload and consumers must tolerate spurious wakeups
//! by re-reading the state they care about.

use tokio::sync::mpsc;

/// Create a notification channel.
pub fn channel() -> (NotifyHandle, NotifyWatcher) {
    let (tx, rx) = mpsc::channel(1);
    (NotifyHandle { tx }, NotifyWatcher { rx })
}

/// Sending side, held by whatever observes the underlying resource.
#[derive(Clone)]
pub struct NotifyHandle {
    tx: mpsc::Sender<()>,
}

impl NotifyHandle {
    /// Signal a change. Bursts coalesce: if a wakeup is already pending the
    /// signal is dropped.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Receiving side, owned by the worker's event loop.
pub struct NotifyWatcher {
    rx: mpsc::Receiver<()>,
}

impl NotifyWatcher {
    /// Wait for the next change notification. `None` means the watcher was
    /// closed by its source.
    pub async fn changes(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bursts_coalesce_into_one_wakeup() {
        let (handle, mut watcher) = channel();
        handle.notify();
        handle.notify();
        handle.notify();

        assert_eq!(watcher.changes().await, Some(()));

        // Only one wakeup was pending; the channel is empty again.
        handle.notify();
        assert_eq!(watcher.changes().await, Some(()));
    }

    #[tokio::test]
    async fn closed_watcher_yields_none() {
        let (handle, mut watcher) = channel();
        drop(handle);
        assert_eq!(watcher.changes().await, None);
    }
}
