//! The request/response bus between the UI and one store worker.
//!
//! One [`Worker`] exists per account. The UI side calls
//! [`Worker::post_action`] and consumes the Messages channel, invoking
//! [`Worker::process_message`] for each inbound response; the backend side
//! consumes the Actions channel, invoking [`Worker::process_action`], and
//! answers with [`Worker::post_message`].
//!
//! The callback tables are explicitly locked, so posting from multiple
//! tasks is safe. Delivery order is channel order: responses to a given
//! action are dispatched in the order the backend posted them, and a
//! callback is dropped once a terminal response for its action has been
//! processed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::message::{Action, MessageId, Response, WorkerMessage};
use crate::models::{Flags, MessageInfo, Uid};

/// Callback invoked for every response to a posted action.
pub type ResponseCallback = Box<dyn FnMut(&WorkerMessage<Response>) + Send>;

/// Callback invoked for every action posted in response to a message.
pub type ActionCallback = Box<dyn FnMut(&WorkerMessage<Action>) + Send>;

// Identities are global across workers so a message id never repeats within
// a process, whichever account it belongs to.
static LAST_ID: AtomicU64 = AtomicU64::new(0);

fn next_id() -> MessageId {
    LAST_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// The receiving halves of a worker's two channels.
///
/// The Actions receiver goes to the backend's [`run`](crate::Backend) loop;
/// the Messages receiver goes to the UI event loop.
pub struct WorkerChannels {
    /// UI → backend.
    pub actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
    /// Backend → UI.
    pub messages: mpsc::UnboundedReceiver<WorkerMessage<Response>>,
}

/// The message bus for one account.
pub struct Worker {
    name: String,
    actions_tx: mpsc::UnboundedSender<WorkerMessage<Action>>,
    messages_tx: mpsc::UnboundedSender<WorkerMessage<Response>>,
    action_callbacks: Mutex<HashMap<MessageId, ResponseCallback>>,
    message_callbacks: Mutex<HashMap<MessageId, ActionCallback>>,
}

impl Worker {
    /// Creates a worker and hands back the receiving halves of its
    /// channels.
    #[must_use]
    pub fn new(name: impl Into<String>) -> (Arc<Self>, WorkerChannels) {
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Self {
            name: name.into(),
            actions_tx,
            messages_tx,
            action_callbacks: Mutex::new(HashMap::new()),
            message_callbacks: Mutex::new(HashMap::new()),
        });
        (
            worker,
            WorkerChannels {
                actions: actions_rx,
                messages: messages_rx,
            },
        )
    }

    /// The account name this worker serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Posts an action to the backend. Returns the identity stamped on the
    /// message; if `callback` is given it will be invoked for every
    /// response carrying that identity in `in_response_to`, until a
    /// terminal response arrives.
    ///
    /// Never blocks; the Actions channel is unbounded.
    pub fn post_action(
        &self,
        body: Action,
        in_response_to: Option<MessageId>,
        callback: Option<ResponseCallback>,
    ) -> MessageId {
        let id = next_id();
        tracing::trace!(account = %self.name, action = body.name(), id, "post action");
        let msg = WorkerMessage {
            id,
            in_response_to,
            account: self.name.clone(),
            body,
        };
        if self.actions_tx.send(msg).is_err() {
            tracing::error!(account = %self.name, "actions channel closed, dropping action");
            return id;
        }
        if let Some(cb) = callback {
            self.lock_action_callbacks().insert(id, cb);
        }
        id
    }

    /// Posts a response to the UI, the symmetric primitive to
    /// [`post_action`](Self::post_action): same identity and registration
    /// discipline, separate channel and callback table.
    pub fn post_message(
        &self,
        body: Response,
        in_response_to: Option<MessageId>,
        callback: Option<ActionCallback>,
    ) -> MessageId {
        let id = next_id();
        tracing::trace!(account = %self.name, response = body.name(), id, "post message");
        let msg = WorkerMessage {
            id,
            in_response_to,
            account: self.name.clone(),
            body,
        };
        if self.messages_tx.send(msg).is_err() {
            tracing::error!(account = %self.name, "messages channel closed, dropping message");
            return id;
        }
        if let Some(cb) = callback {
            self.lock_message_callbacks().insert(id, cb);
        }
        id
    }

    /// Dispatches an inbound response to the callback registered for the
    /// action it responds to, if any. Messages without `in_response_to`
    /// are unsolicited and bypass dispatch entirely.
    ///
    /// The callback is invoked outside the table lock and removed for good
    /// once the response is terminal.
    pub fn process_message(&self, msg: &WorkerMessage<Response>) {
        tracing::trace!(
            account = %self.name,
            response = msg.body.name(),
            id = msg.id,
            in_response_to = ?msg.in_response_to,
            "process message"
        );
        let Some(request_id) = msg.in_response_to else {
            return;
        };
        let cb = self.lock_action_callbacks().remove(&request_id);
        if let Some(mut cb) = cb {
            cb(msg);
            if !msg.body.is_terminal() {
                self.lock_action_callbacks().insert(request_id, cb);
            }
        }
    }

    /// Dispatches an inbound action to the callback registered for the
    /// message it responds to, if any. The backend calls this for every
    /// action it receives before handling it.
    pub fn process_action(&self, msg: &WorkerMessage<Action>) {
        tracing::trace!(
            account = %self.name,
            action = msg.body.name(),
            id = msg.id,
            in_response_to = ?msg.in_response_to,
            "process action"
        );
        let Some(request_id) = msg.in_response_to else {
            return;
        };
        let cb = self.lock_message_callbacks().remove(&request_id);
        if let Some(mut cb) = cb {
            cb(msg);
            // Actions have no terminal variant; the entry stays registered.
            self.lock_message_callbacks().insert(request_id, cb);
        }
    }

    /// Posts a `MessageInfo` response reporting that fetching one header
    /// failed, so the UI can render a placeholder instead of hanging.
    pub fn post_message_info_error(
        &self,
        in_response_to: Option<MessageId>,
        uid: Uid,
        error: &dyn std::error::Error,
    ) {
        self.post_message(
            Response::MessageInfo {
                info: MessageInfo {
                    uid,
                    flags: Flags::SEEN,
                    error: Some(error.to_string()),
                    ..MessageInfo::default()
                },
                needs_flags: false,
            },
            in_response_to,
            None,
        );
    }

    fn lock_action_callbacks(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, ResponseCallback>> {
        match self.action_callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_message_callbacks(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, ActionCallback>> {
        match self.message_callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, ResponseCallback) {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: ResponseCallback = Box::new(move |msg| {
            sink.lock().unwrap().push(msg.body.name().to_string());
        });
        (seen, cb)
    }

    #[tokio::test]
    async fn round_trip_invokes_callback_until_done() {
        let (worker, mut channels) = Worker::new("test");
        let (seen, cb) = recorder();

        let action_id = worker.post_action(Action::ListDirectories, None, Some(cb));
        let received = channels.actions.recv().await.unwrap();
        assert_eq!(received.id, action_id);

        // Backend: one data response, then Done, then a stray post-Done
        // response that must not reach the released callback.
        worker.post_message(
            Response::DirectoryContents { uids: vec![1, 2] },
            Some(action_id),
            None,
        );
        worker.post_message(Response::Done, Some(action_id), None);
        worker.post_message(Response::Done, Some(action_id), None);

        while let Ok(msg) = channels.messages.try_recv() {
            worker.process_message(&msg);
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["DirectoryContents", "Done"]);
    }

    #[tokio::test]
    async fn error_also_deregisters() {
        let (worker, mut channels) = Worker::new("test");
        let (seen, cb) = recorder();

        let action_id = worker.post_action(Action::Connect, None, Some(cb));
        worker.post_message(
            Response::Error {
                cause: Arc::new(std::io::Error::other("refused")),
            },
            Some(action_id),
            None,
        );
        worker.post_message(Response::Done, Some(action_id), None);

        while let Ok(msg) = channels.messages.try_recv() {
            worker.process_message(&msg);
        }

        assert_eq!(seen.lock().unwrap().as_slice(), ["Error"]);
    }

    #[tokio::test]
    async fn unsolicited_messages_bypass_callbacks() {
        let (worker, mut channels) = Worker::new("test");
        let (seen, cb) = recorder();

        worker.post_action(Action::Connect, None, Some(cb));
        worker.post_message(Response::MessagesDeleted { uids: vec![3] }, None, None);

        while let Ok(msg) = channels.messages.try_recv() {
            worker.process_message(&msg);
        }

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn identities_strictly_increase() {
        let (worker, _channels) = Worker::new("test");
        let a = worker.post_action(Action::Connect, None, None);
        let b = worker.post_action(Action::Disconnect, None, None);
        let c = worker.post_message(Response::Done, Some(b), None);
        assert!(a < b);
        assert!(b < c);
    }

    #[tokio::test]
    async fn responses_dispatch_in_post_order() {
        let (worker, mut channels) = Worker::new("test");
        let order: Arc<Mutex<Vec<Vec<Uid>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let cb: ResponseCallback = Box::new(move |msg| {
            if let Response::DirectoryContents { uids } = &msg.body {
                sink.lock().unwrap().push(uids.clone());
            }
        });

        let id = worker.post_action(Action::ListDirectories, None, Some(cb));
        for batch in [vec![1], vec![2], vec![3]] {
            worker.post_message(Response::DirectoryContents { uids: batch }, Some(id), None);
        }
        worker.post_message(Response::Done, Some(id), None);

        while let Ok(msg) = channels.messages.try_recv() {
            worker.process_message(&msg);
        }

        assert_eq!(
            order.lock().unwrap().as_slice(),
            [vec![1], vec![2], vec![3]]
        );
    }
}
