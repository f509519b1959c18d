//! IMAP IDLE lifecycle: debounced entry, bounded exit.
//!
//! The worker enters IDLE only after `idle-debounce` of quiescence, so a
//! burst of actions does not thrash the connection with IDLE/DONE pairs.
//! Stopping is bounded by `idle-timeout`: if the server does not
//! acknowledge DONE within the bound, the connection is presumed stuck and
//! the caller must rebuild it.
//!
//! Ownership: the driver *takes* the wire session while idling and hands
//! it back through the done channel when idling ends. The [`IdleDriver`]
//! trait is the seam between the state machine and the wire session, so
//! the debounce/stop behaviour is testable without a socket.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::client::{MailboxUpdate, Session, update_from_response};
use crate::error::{Error, Result};

/// The part of idling that actually talks to the server.
pub trait IdleDriver: Send + Sized + 'static {
    /// Whether the underlying client is in a state where IDLE may be
    /// attempted at all.
    fn ready(&self) -> bool;

    /// Runs IDLE until `stop` fires, forwarding server events as they
    /// arrive. Returns itself (with the session it owns) and the idle
    /// outcome.
    fn run(
        self,
        stop: oneshot::Receiver<()>,
    ) -> impl Future<Output = (Self, Result<()>)> + Send;
}

type DoneMessage<D> = (D, Result<()>, bool);

/// Debounce/stop state machine around an [`IdleDriver`].
#[derive(Debug)]
pub struct Idler<D: IdleDriver> {
    debounce: Duration,
    timeout: Duration,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<DoneMessage<D>>>,
}

impl<D: IdleDriver> Idler<D> {
    /// Creates an idler with the configured debounce and stop bound.
    #[must_use]
    pub fn new(debounce: Duration, timeout: Duration) -> Self {
        Self {
            debounce,
            timeout,
            stop_tx: None,
            done_rx: None,
        }
    }

    /// Whether an idle task (pending or active) exists.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.done_rx.is_some()
    }

    /// Arms the debounce timer and enters IDLE once it fires. Returns the
    /// driver untouched when idling is not started (already running, or
    /// the client is not ready); starting twice does not produce a second
    /// idle entry.
    pub fn start(&mut self, driver: D) -> Option<D> {
        if self.is_running() {
            tracing::trace!("idler not started: already running");
            return Some(driver);
        }
        if !driver.ready() {
            tracing::trace!("idler not started: client not ready");
            return Some(driver);
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {
                    // Stopped inside the debounce window: no round trip
                    // happened, nothing to wait for.
                    tracing::trace!("idle entry debounced");
                    let _ = done_tx.send((driver, Ok(()), false));
                }
                () = tokio::time::sleep(debounce) => {
                    let started = tokio::time::Instant::now();
                    tracing::trace!("=> idle");
                    let (driver, result) = driver.run(stop_rx).await;
                    tracing::trace!(elapsed = ?started.elapsed(), "<= idle");
                    let _ = done_tx.send((driver, result, true));
                }
            }
        });
        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);
        None
    }

    /// Stops idling and waits up to `idle-timeout` for the driver (and
    /// the session it owns) to come back.
    ///
    /// Returns the driver when it made it back, plus the idle outcome. On
    /// timeout the driver is abandoned with the stuck connection and
    /// [`Error::IdleTimeout`] is returned; the caller must rebuild the
    /// connection. Not running is a no-op.
    pub async fn stop(&mut self) -> (Option<D>, Result<()>) {
        let Some(done_rx) = self.done_rx.take() else {
            return (None, Ok(()));
        };
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match tokio::time::timeout(self.timeout, done_rx).await {
            Ok(Ok((driver, result, _entered))) => (Some(driver), result),
            Ok(Err(_)) => (
                None,
                Err(Error::Protocol("idle task vanished".to_string())),
            ),
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "idle stop timed out, abandoning session");
                (None, Err(Error::IdleTimeout(self.timeout)))
            }
        }
    }
}

/// The production driver: owns the session, loops on IDLE, forwards
/// server events to the worker's updates channel and re-enters IDLE after
/// each one until stopped.
pub struct SessionIdleDriver {
    session: Option<Session>,
    updates: mpsc::UnboundedSender<MailboxUpdate>,
}

impl SessionIdleDriver {
    pub(crate) fn new(session: Session, updates: mpsc::UnboundedSender<MailboxUpdate>) -> Self {
        Self {
            session: Some(session),
            updates,
        }
    }

    /// Takes the session back out of the driver after idling ended.
    pub(crate) fn into_session(mut self) -> Option<Session> {
        self.session.take()
    }

    fn forward_unsolicited(&self, session: &mut Session) {
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            if let Some(update) = crate::client::unsolicited_update(&response) {
                let _ = self.updates.send(update);
            }
        }
    }
}

enum WaitOutcome {
    Stopped,
    Server(std::result::Result<async_imap::extensions::idle::IdleResponse, async_imap::error::Error>),
}

impl IdleDriver for SessionIdleDriver {
    fn ready(&self) -> bool {
        self.session.is_some()
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) -> (Self, Result<()>) {
        use async_imap::extensions::idle::IdleResponse;

        let Some(mut session) = self.session.take() else {
            return (self, Err(Error::NotConnected));
        };

        loop {
            let mut handle = session.idle();
            if let Err(err) = handle.init().await {
                return match handle.done().await {
                    Ok(session) => {
                        self.session = Some(session);
                        (self, Err(err.into()))
                    }
                    Err(done_err) => (self, Err(done_err.into())),
                };
            }

            let (wait_fut, _interrupt) = handle.wait();
            let outcome = tokio::select! {
                res = wait_fut => WaitOutcome::Server(res),
                _ = &mut stop => WaitOutcome::Stopped,
            };

            match handle.done().await {
                Ok(restored) => session = restored,
                Err(err) => return (self, Err(err.into())),
            }

            match outcome {
                WaitOutcome::Stopped => {
                    self.session = Some(session);
                    return (self, Ok(()));
                }
                WaitOutcome::Server(Ok(IdleResponse::NewData(data))) => {
                    if let Some(update) = update_from_response(data.parsed()) {
                        let _ = self.updates.send(update);
                    }
                    self.forward_unsolicited(&mut session);
                    // Still quiescent from the worker's side; go back to
                    // idling for the next event.
                }
                WaitOutcome::Server(Ok(_)) => {
                    // Keepalive timeout or manual interrupt: re-enter.
                }
                WaitOutcome::Server(Err(err)) => {
                    self.session = Some(session);
                    return (self, Err(err.into()));
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FakeDriver {
        entries: Arc<AtomicUsize>,
        ready: bool,
        /// When set, ignore the stop signal to simulate a stuck server.
        hang_on_stop: bool,
    }

    impl FakeDriver {
        fn new(entries: Arc<AtomicUsize>) -> Self {
            Self {
                entries,
                ready: true,
                hang_on_stop: false,
            }
        }
    }

    impl IdleDriver for FakeDriver {
        fn ready(&self) -> bool {
            self.ready
        }

        async fn run(self, stop: oneshot::Receiver<()>) -> (Self, Result<()>) {
            self.entries.fetch_add(1, Ordering::SeqCst);
            if self.hang_on_stop {
                std::future::pending::<()>().await;
            }
            let _ = stop.await;
            (self, Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_yields_one_idle_entry() {
        let entries = Arc::new(AtomicUsize::new(0));
        let mut idler = Idler::new(Duration::from_millis(10), Duration::from_secs(10));

        assert!(idler.start(FakeDriver::new(Arc::clone(&entries))).is_none());
        // Second start within the debounce window: driver is handed back,
        // no second task.
        assert!(idler.start(FakeDriver::new(Arc::clone(&entries))).is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entries.load(Ordering::SeqCst), 1);

        let (driver, result) = idler.stop().await;
        assert!(driver.is_some());
        assert!(result.is_ok());
        assert_eq!(entries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_within_debounce_window_never_enters_idle() {
        let entries = Arc::new(AtomicUsize::new(0));
        let mut idler = Idler::new(Duration::from_secs(5), Duration::from_secs(10));

        assert!(idler.start(FakeDriver::new(Arc::clone(&entries))).is_none());
        let (driver, result) = idler.stop().await;

        assert!(driver.is_some());
        assert!(result.is_ok());
        // The debounce timer was still pending: no network call happened.
        assert_eq!(entries.load(Ordering::SeqCst), 0);
        assert!(!idler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_driver_is_handed_back() {
        let entries = Arc::new(AtomicUsize::new(0));
        let mut idler = Idler::new(Duration::from_millis(1), Duration::from_secs(1));

        let mut driver = FakeDriver::new(Arc::clone(&entries));
        driver.ready = false;
        assert!(idler.start(driver).is_some());
        assert!(!idler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_idle_times_out_and_abandons_the_driver() {
        let entries = Arc::new(AtomicUsize::new(0));
        let mut idler = Idler::new(Duration::from_millis(1), Duration::from_millis(100));

        let mut driver = FakeDriver::new(Arc::clone(&entries));
        driver.hang_on_stop = true;
        assert!(idler.start(driver).is_none());

        // Let the debounce fire so the driver is actually idling.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(entries.load(Ordering::SeqCst), 1);

        let (driver, result) = idler.stop().await;
        assert!(driver.is_none());
        assert!(matches!(result, Err(Error::IdleTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_not_running_is_a_noop() {
        let mut idler: Idler<FakeDriver> =
            Idler::new(Duration::from_millis(1), Duration::from_millis(1));
        let (driver, result) = idler.stop().await;
        assert!(driver.is_none());
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_enters_again() {
        let entries = Arc::new(AtomicUsize::new(0));
        let mut idler = Idler::new(Duration::from_millis(1), Duration::from_secs(1));

        assert!(idler.start(FakeDriver::new(Arc::clone(&entries))).is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (driver, result) = idler.stop().await;
        assert!(result.is_ok());

        assert!(idler.start(driver.unwrap()).is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (_, result) = idler.stop().await;
        assert!(result.is_ok());
        assert_eq!(entries.load(Ordering::SeqCst), 2);
    }
}
