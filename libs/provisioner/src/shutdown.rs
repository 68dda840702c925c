//! Cooperative shutdown signalling shared by a worker and its children.

use tokio::sync::watch;

/// Create a shutdown channel. The sender flips it to `true` exactly once.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Completes once shutdown has been requested. A dropped sender counts as a
/// request so orphaned workers stop rather than hang.
pub async fn wait(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
