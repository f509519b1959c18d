//! Integration tests for the message bus: a scripted backend consuming
//! the Actions channel end-to-end, the way a real store worker does.

use std::sync::{Arc, Mutex};

use maildeck_worker::{
    Action, Backend, Response, ResponseCallback, Worker, WorkerMessage, backend_for_scheme,
    register_backend,
};
use tokio::sync::mpsc;

/// A backend that answers `ListDirectories` with two streamed responses
/// and `Done`, and everything else with `Unsupported`.
struct ScriptedBackend {
    worker: Arc<Worker>,
    actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
}

impl Backend for ScriptedBackend {
    fn run(
        mut self: Box<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            while let Some(msg) = self.actions.recv().await {
                self.worker.process_action(&msg);
                match msg.body {
                    Action::ListDirectories => {
                        for uids in [vec![1, 2], vec![3]] {
                            self.worker.post_message(
                                Response::DirectoryContents { uids },
                                Some(msg.id),
                                None,
                            );
                        }
                        self.worker
                            .post_message(Response::Done, Some(msg.id), None);
                    }
                    Action::Disconnect => {
                        self.worker
                            .post_message(Response::Done, Some(msg.id), None);
                        break;
                    }
                    _ => {
                        self.worker
                            .post_message(Response::Unsupported, Some(msg.id), None);
                    }
                }
            }
        })
    }
}

fn scripted_factory(
    worker: Arc<Worker>,
    actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
) -> maildeck_worker::Result<Box<dyn Backend>> {
    Ok(Box::new(ScriptedBackend { worker, actions }))
}

fn record_names(log: &Arc<Mutex<Vec<String>>>) -> ResponseCallback {
    let log = Arc::clone(log);
    Box::new(move |msg| {
        log.lock().unwrap().push(msg.body.name().to_string());
    })
}

#[tokio::test]
async fn scripted_backend_round_trip() {
    register_backend("scripted", scripted_factory);
    let (worker, mut channels) = Worker::new("acct");
    let backend = backend_for_scheme("scripted", Arc::clone(&worker), channels.actions).unwrap();
    let handle = tokio::spawn(backend.run());

    let log = Arc::new(Mutex::new(Vec::new()));

    worker.post_action(Action::ListDirectories, None, Some(record_names(&log)));
    worker.post_action(Action::Connect, None, Some(record_names(&log)));
    worker.post_action(Action::Disconnect, None, None);

    // UI side: pump the Messages channel until all three exchanges have
    // seen their terminal response.
    let mut terminals = 0;
    while terminals < 3 {
        let Some(msg) = channels.messages.recv().await else {
            break;
        };
        if msg.body.is_terminal() {
            terminals += 1;
        }
        worker.process_message(&msg);
    }

    handle.await.unwrap();
    assert_eq!(
        log.lock().unwrap().as_slice(),
        [
            "DirectoryContents",
            "DirectoryContents",
            "Done",
            "Unsupported"
        ]
    );
}

#[tokio::test]
async fn unsupported_is_terminal_for_its_exchange() {
    register_backend("scripted2", scripted_factory);
    let (worker, mut channels) = Worker::new("acct");
    let backend = backend_for_scheme("scripted2", Arc::clone(&worker), channels.actions).unwrap();
    tokio::spawn(backend.run());

    let log = Arc::new(Mutex::new(Vec::new()));
    let id = worker.post_action(Action::Connect, None, Some(record_names(&log)));

    let msg = channels.messages.recv().await.unwrap();
    assert_eq!(msg.in_response_to, Some(id));
    worker.process_message(&msg);

    // A duplicate (buggy) response after the terminal one is not
    // delivered: the callback was released.
    worker.post_message(Response::Done, Some(id), None);
    let stray = channels.messages.recv().await.unwrap();
    worker.process_message(&stray);

    assert_eq!(log.lock().unwrap().as_slice(), ["Unsupported"]);
}
