//! Connection observer.
//!
//! Watches the client handle's `connected` signal for a silent logout and
//! posts a connection-error message when it fires, which is what triggers
//! the UI's reconnect cycle. Also provides the synchronous
//! [`Observer::emit_if_not_connected`] guard other handlers call before
//! issuing commands, to fail fast with a reconnect trigger instead of
//! hanging on a dead socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use maildeck_worker::{Response, Worker};
use tokio::sync::{oneshot, watch};

use crate::error::Error;

/// Logout watcher for one worker.
pub struct Observer {
    worker: Arc<Worker>,
    reconnect_maxwait: Duration,
    connected: Option<watch::Receiver<bool>>,
    stop_tx: Option<oneshot::Sender<()>>,
    running: Arc<AtomicBool>,
    retries: u32,
}

impl Observer {
    /// Creates a stopped observer.
    #[must_use]
    pub fn new(worker: Arc<Worker>, reconnect_maxwait: Duration) -> Self {
        Self {
            worker,
            reconnect_maxwait,
            connected: None,
            stop_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            retries: 0,
        }
    }

    /// Updates the reconnect backoff cap from a new configuration.
    pub fn set_reconnect_maxwait(&mut self, maxwait: Duration) {
        self.reconnect_maxwait = maxwait;
    }

    /// Installs a new client's logout signal (or `None` on disconnect) and
    /// restarts the watch. Installing a client resets the reconnect
    /// backoff.
    pub fn set_client(&mut self, connected: Option<watch::Receiver<bool>>) {
        self.stop();
        self.connected = connected;
        self.start();
        self.retries = 0;
    }

    /// Whether the watch task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_client_connected(&self) -> bool {
        self.connected.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fail-fast guard: when the client is not connected, posts the
    /// reconnect trigger and returns `true`.
    pub fn emit_if_not_connected(&self) -> bool {
        if self.is_client_connected() {
            return false;
        }
        emit(&self.worker, "imap client not connected: attempt reconnect");
        true
    }

    /// Starts watching, if a client is installed and the watch is not
    /// already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let Some(connected) = self.connected.clone() else {
            return;
        };
        if self.emit_if_not_connected() {
            return;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = Arc::clone(&self.worker);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);
        let mut connected = connected;
        tokio::spawn(async move {
            tokio::select! {
                changed = connected.wait_for(|up| !*up) => {
                    // A dropped sender means the client handle itself is
                    // gone, which is a logout all the same.
                    let reason = if changed.is_ok() { "logged out" } else { "connection dropped" };
                    emit(&worker, reason);
                }
                _ = stop_rx => {}
            }
            running.store(false, Ordering::SeqCst);
            tracing::trace!("observer stopped");
        });
        self.stop_tx = Some(stop_tx);
        tracing::trace!("observer started");
    }

    /// Stops watching. Always leaves the observer in the stopped state,
    /// whatever it was doing.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Schedules a reconnect trigger after an exponential backoff, capped
    /// at `reconnect-maxwait`. Returns the error describing the delay, for
    /// correlation with the failed action.
    pub fn delayed_reconnect(&mut self) -> Error {
        let wait = if self.retries > 0 {
            let backoff = 1.8_f64
                .powi(i32::try_from(self.retries).unwrap_or(i32::MAX))
                .min(self.reconnect_maxwait.as_secs_f64());
            Duration::from_secs_f64(backoff)
        } else {
            Duration::ZERO
        };
        self.retries += 1;

        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            emit(&worker, "reconnect");
        });

        if wait.is_zero() {
            Error::Protocol("reconnect".to_string())
        } else {
            Error::Protocol(format!("reconnect in {wait:?}"))
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn emit(worker: &Worker, reason: &str) {
    tracing::debug!(reason, "connection lost, requesting reconnect");
    worker.post_message(
        Response::ConnError {
            cause: Arc::new(Error::Protocol(reason.to_string())),
        },
        None,
        None,
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn conn_error_count(channels: &mut maildeck_worker::WorkerChannels) -> usize {
        let mut count = 0;
        while let Ok(msg) = channels.messages.try_recv() {
            if matches!(msg.body, Response::ConnError { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn logout_emits_exactly_once() {
        let (worker, mut channels) = Worker::new("test");
        let mut observer = Observer::new(Arc::clone(&worker), Duration::from_secs(30));
        let (tx, rx) = watch::channel(true);

        observer.set_client(Some(rx));
        assert!(observer.is_running());

        tx.send_replace(false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(conn_error_count(&mut channels), 1);
        assert!(!observer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_suppresses_the_emit() {
        let (worker, mut channels) = Worker::new("test");
        let mut observer = Observer::new(Arc::clone(&worker), Duration::from_secs(30));
        let (tx, rx) = watch::channel(true);

        observer.set_client(Some(rx));
        observer.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tx.send_replace(false);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(conn_error_count(&mut channels), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_if_not_connected_guard() {
        let (worker, mut channels) = Worker::new("test");
        let mut observer = Observer::new(Arc::clone(&worker), Duration::from_secs(30));

        // No client installed at all.
        assert!(observer.emit_if_not_connected());
        assert_eq!(conn_error_count(&mut channels), 1);

        let (tx, rx) = watch::channel(true);
        observer.set_client(Some(rx));
        assert!(!observer.emit_if_not_connected());
        assert_eq!(conn_error_count(&mut channels), 0);

        observer.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_replace(false);
        assert!(observer.emit_if_not_connected());
        assert_eq!(conn_error_count(&mut channels), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reconnect_backs_off() {
        let (worker, mut channels) = Worker::new("test");
        let mut observer = Observer::new(Arc::clone(&worker), Duration::from_secs(30));

        // First attempt fires immediately.
        observer.delayed_reconnect();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(conn_error_count(&mut channels), 1);

        // Second attempt waits ~1.8s.
        observer.delayed_reconnect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(conn_error_count(&mut channels), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(conn_error_count(&mut channels), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_client_replaces_the_watch() {
        let (worker, mut channels) = Worker::new("test");
        let mut observer = Observer::new(Arc::clone(&worker), Duration::from_secs(30));

        let (old_tx, old_rx) = watch::channel(true);
        observer.set_client(Some(old_rx));
        let (_new_tx, new_rx) = watch::channel(true);
        observer.set_client(Some(new_rx));
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The old client's death is no longer interesting.
        old_tx.send_replace(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conn_error_count(&mut channels), 0);
    }
}
