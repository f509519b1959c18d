//! The backend plugin contract and the URL-scheme registry.
//!
//! A backend registers a factory under its URL scheme at process start;
//! given a [`Worker`] handle and the Actions receiver, the factory builds a
//! [`Backend`] whose `run` future loops over the Actions channel until it
//! closes, posting exactly one terminal response per action.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, RwLock};

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{Action, WorkerMessage};
use crate::worker::Worker;

/// A store worker's execution capability.
pub trait Backend: Send + 'static {
    /// Consumes the Actions channel until it closes. The returned future is
    /// expected to be spawned as the backend's single long-lived task; all
    /// protocol calls it makes are synchronous from its own perspective.
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Builds a backend for one account.
pub type BackendFactory = fn(
    worker: Arc<Worker>,
    actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
) -> Result<Box<dyn Backend>>;

static FACTORIES: LazyLock<RwLock<HashMap<String, BackendFactory>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Registers a backend factory under a URL scheme. Later registrations for
/// the same scheme replace earlier ones.
pub fn register_backend(scheme: &str, factory: BackendFactory) {
    let mut factories = match FACTORIES.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    factories.insert(scheme.to_string(), factory);
}

/// Instantiates the backend registered for `scheme`.
///
/// # Errors
///
/// Returns [`Error::UnknownBackend`] if no factory is registered for the
/// scheme, or whatever the factory itself fails with.
pub fn backend_for_scheme(
    scheme: &str,
    worker: Arc<Worker>,
    actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
) -> Result<Box<dyn Backend>> {
    let factory = {
        let factories = match FACTORIES.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        factories.get(scheme).copied()
    };
    match factory {
        Some(factory) => factory(worker, actions),
        None => Err(Error::UnknownBackend(scheme.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct NullBackend;

    impl Backend for NullBackend {
        fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    fn null_factory(
        _worker: Arc<Worker>,
        _actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
    ) -> Result<Box<dyn Backend>> {
        Ok(Box::new(NullBackend))
    }

    #[tokio::test]
    async fn unknown_scheme_is_an_error() {
        let (worker, channels) = Worker::new("test");
        let err = match backend_for_scheme("gopher", worker, channels.actions) {
            Ok(_) => panic!("expected an error for an unknown scheme"),
            Err(err) => err,
        };
        assert!(matches!(err, Error::UnknownBackend(s) if s == "gopher"));
    }

    #[tokio::test]
    async fn registered_scheme_resolves() {
        register_backend("null", null_factory);
        let (worker, channels) = Worker::new("test");
        let backend = backend_for_scheme("null", worker, channels.actions).unwrap();
        backend.run().await;
    }
}
