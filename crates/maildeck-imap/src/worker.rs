//! The IMAP worker: one long-lived task per account, selecting over the
//! bus's Actions channel and the connection's update stream.
//!
//! Before each action the idler is stopped (bounded by `idle-timeout`);
//! after the action's terminal response is posted, piggybacked unsolicited
//! responses are drained and the idler is re-armed. Updates delivered
//! while idling (EXISTS, EXPUNGE, FETCH) flow through the same internal
//! channel and are handled between actions.

use std::sync::Arc;

use maildeck_worker::models::Flags;
use maildeck_worker::{
    Action, AccountConfig, Backend, MessageId, Response, Uid, Worker, WorkerMessage,
    register_backend,
};
use tokio::sync::mpsc;

use crate::cache::HeaderCache;
use crate::client::{ImapClient, MailboxUpdate, SelectedMailbox, Session};
use crate::config::ImapConfig;
use crate::connect;
use crate::error::{Error, Result};
use crate::expunge::ExpungeHandler;
use crate::idler::{Idler, SessionIdleDriver};
use crate::observer::Observer;
use crate::seq_map::SeqMap;

/// Registers the IMAP backend factory under its URL schemes. Call once at
/// process start.
pub fn register_defaults() {
    register_backend("imap", new_backend);
    register_backend("imaps", new_backend);
}

fn new_backend(
    worker: Arc<Worker>,
    actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
) -> maildeck_worker::Result<Box<dyn Backend>> {
    Ok(Box::new(ImapWorker::new(worker, actions)))
}

/// The IMAP store worker.
pub struct ImapWorker {
    pub(crate) worker: Arc<Worker>,
    actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
    pub(crate) config: ImapConfig,
    pub(crate) client: Option<ImapClient>,
    pub(crate) seq_map: SeqMap,
    pub(crate) expunger: Option<ExpungeHandler>,
    idler: Idler<SessionIdleDriver>,
    pub(crate) observer: Observer,
    pub(crate) cache: Option<HeaderCache>,
    updates_tx: mpsc::UnboundedSender<MailboxUpdate>,
    updates_rx: mpsc::UnboundedReceiver<MailboxUpdate>,
    no_check_mail_before: tokio::time::Instant,
}

impl Backend for ImapWorker {
    fn run(self: Box<Self>) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self.run_loop())
    }
}

impl ImapWorker {
    /// Creates an unconfigured worker bound to one bus.
    #[must_use]
    pub fn new(
        worker: Arc<Worker>,
        actions: mpsc::UnboundedReceiver<WorkerMessage<Action>>,
    ) -> Self {
        let config = ImapConfig::default();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            observer: Observer::new(Arc::clone(&worker), config.reconnect_maxwait),
            idler: Idler::new(config.idle_debounce, config.idle_timeout),
            worker,
            actions,
            config,
            client: None,
            seq_map: SeqMap::new(),
            expunger: None,
            cache: None,
            updates_tx,
            updates_rx,
            no_check_mail_before: tokio::time::Instant::now(),
        }
    }

    async fn run_loop(mut self) {
        loop {
            tokio::select! {
                maybe_msg = self.actions.recv() => {
                    let Some(msg) = maybe_msg else {
                        tracing::debug!(account = %self.worker.name(), "actions channel closed");
                        break;
                    };
                    self.handle_action(msg).await;
                }
                Some(update) = self.updates_rx.recv() => {
                    self.handle_update(update);
                }
            }
        }
    }

    async fn handle_action(&mut self, msg: WorkerMessage<Action>) {
        if let Err(err) = self.stop_idler().await {
            self.respond(msg.id, Response::Error { cause: Arc::new(err) });
            return;
        }
        tracing::trace!(action = msg.body.name(), id = msg.id, "ready to handle");

        self.worker.process_action(&msg);

        let result = self.dispatch(&msg).await;
        match result {
            Err(Error::Cancelled) => self.respond(msg.id, Response::Cancelled),
            Err(Error::Unsupported) => self.respond(msg.id, Response::Unsupported),
            Err(err) => {
                if matches!(err, Error::CommandTimeout(_)) {
                    // The socket is mid-command in an unknown state; only a
                    // rebuild gets it back.
                    self.terminate();
                    self.observer.emit_if_not_connected();
                }
                self.respond(msg.id, Response::Error { cause: Arc::new(err) });
            }
            Ok(()) => self.respond(msg.id, Response::Done),
        }

        if let Some(client) = self.client.as_mut() {
            client.drain_unsolicited(&self.updates_tx);
        }
        self.start_idler();
    }

    async fn dispatch(&mut self, msg: &WorkerMessage<Action>) -> Result<()> {
        // Until a connection exists only the lifecycle actions are valid.
        if self.client.is_none() {
            match msg.body {
                Action::Configure { .. }
                | Action::Connect
                | Action::Reconnect
                | Action::Disconnect => {}
                _ => return Err(Error::ClientNotReady),
            }
        }

        let deadline = self.config.connection_timeout;
        let bounded = !deadline.is_zero()
            && !matches!(
                msg.body,
                Action::Configure { .. }
                    | Action::Connect
                    | Action::Reconnect
                    | Action::Disconnect
            );
        if bounded {
            match tokio::time::timeout(deadline, self.dispatch_inner(msg)).await {
                Ok(result) => result,
                Err(_) => Err(Error::CommandTimeout(deadline)),
            }
        } else {
            self.dispatch_inner(msg).await
        }
    }

    async fn dispatch_inner(&mut self, msg: &WorkerMessage<Action>) -> Result<()> {
        match &msg.body {
            Action::Configure { config } => self.handle_configure(config).await,
            Action::Connect => self.handle_connect().await,
            Action::Reconnect => self.handle_reconnect().await,
            Action::Disconnect => self.handle_disconnect().await,
            Action::ListDirectories => self.handle_list_directories(msg.id).await,
            Action::OpenDirectory { ctx, directory } => {
                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.handle_open_directory(directory).await
            }
            Action::FetchDirectoryContents { ctx } => {
                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.handle_fetch_directory_contents(msg.id, ctx).await
            }
            Action::FetchMessageHeaders { ctx, uids } => {
                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.handle_fetch_message_headers(msg.id, ctx, uids).await
            }
            Action::FetchFullMessages { uids } => {
                self.handle_fetch_full_messages(msg.id, uids).await
            }
            Action::FetchMessageBodyPart { uid, part } => {
                self.handle_fetch_message_body_part(msg.id, *uid, part).await
            }
            Action::FetchMessageFlags { ctx, uids } => {
                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.handle_fetch_message_flags(msg.id, uids).await
            }
            Action::DeleteMessages { uids } => self.handle_delete_messages(msg.id, uids).await,
            Action::FlagMessages {
                enable,
                flags,
                uids,
            } => self.handle_flag_messages(msg.id, *enable, *flags, uids).await,
            Action::AnsweredMessages { answered, uids } => {
                self.handle_flag_messages(msg.id, *answered, Flags::ANSWERED, uids)
                    .await
            }
            Action::CopyMessages { destination, uids } => {
                self.handle_copy_messages(destination, uids).await
            }
            Action::MoveMessages { destination, uids } => {
                self.handle_move_messages(destination, uids).await
            }
            Action::CreateDirectory { directory, quiet } => {
                self.handle_create_directory(directory, *quiet).await
            }
            Action::RemoveDirectory { directory, quiet } => {
                self.handle_remove_directory(directory, *quiet).await
            }
            Action::AppendMessage {
                destination,
                flags,
                date,
                content,
            } => self.handle_append_message(destination, *flags, *date, content).await,
            Action::SearchDirectory { ctx, criteria } => {
                if ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.handle_search_directory(msg.id, ctx, criteria).await
            }
            Action::CheckMail { directories } => self.handle_check_mail(msg.id, directories).await,
            _ => Err(Error::Unsupported),
        }
    }

    // === Lifecycle handlers ===

    async fn handle_configure(&mut self, account: &AccountConfig) -> Result<()> {
        self.config = ImapConfig::from_account(account)?;
        self.idler = Idler::new(self.config.idle_debounce, self.config.idle_timeout);
        self.observer.set_reconnect_maxwait(self.config.reconnect_maxwait);
        if self.config.cache_enabled {
            match HeaderCache::open(&self.config.name).await {
                Ok(cache) => self.cache = Some(cache),
                Err(err) => {
                    tracing::error!(%err, "failed to open header cache, caching disabled");
                    self.cache = None;
                }
            }
        }
        Ok(())
    }

    async fn handle_connect(&mut self) -> Result<()> {
        if self.client.as_ref().is_some_and(ImapClient::is_selected) {
            return Err(Error::AlreadyConnected);
        }
        match connect::establish(&self.config).await {
            Ok(client) => {
                self.install_client(client);
                Ok(())
            }
            Err(err) => {
                self.observer.emit_if_not_connected();
                Err(err)
            }
        }
    }

    async fn handle_reconnect(&mut self) -> Result<()> {
        // Never resume a half-open socket: tear down, then dial fresh.
        self.terminate();
        match connect::establish(&self.config).await {
            Ok(client) => {
                self.install_client(client);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "reconnect failed");
                // Schedule the next attempt with backoff; the action
                // itself completes so the UI's retry loop stays in charge.
                let _ = self.observer.delayed_reconnect();
                Ok(())
            }
        }
    }

    async fn handle_disconnect(&mut self) -> Result<()> {
        self.observer.stop();
        self.observer.set_client(None);

        let Some(mut client) = self.client.take() else {
            return Err(Error::NotConnected);
        };
        self.seq_map.clear();
        self.expunger = None;
        if !client.is_selected() {
            return Err(Error::NotConnected);
        }
        client.logout().await
    }

    fn install_client(&mut self, client: ImapClient) {
        self.observer.set_client(Some(client.connected_watch()));
        self.seq_map.clear();
        self.expunger = None;
        self.client = Some(client);
    }

    pub(crate) fn terminate(&mut self) {
        self.observer.stop();
        self.observer.set_client(None);
        if let Some(mut client) = self.client.take() {
            client.terminate();
        }
        self.seq_map.clear();
        self.expunger = None;
    }

    // === Mailbox handlers ===

    async fn handle_open_directory(&mut self, directory: &str) -> Result<()> {
        tracing::trace!(directory, "opening directory");
        let mailbox = self.session()?.select(directory).await?;
        let selected = SelectedMailbox::from_mailbox(directory, &mailbox);
        if let Some(client) = self.client.as_mut() {
            client.selected = Some(selected);
        }
        self.seq_map.clear();

        if let Some(cache) = self.cache.clone()
            && !self.config.cache_max_age.is_zero()
        {
            // Never blocks the command loop; completion is only logged.
            let max_age = self.config.cache_max_age;
            tokio::spawn(async move {
                if let Err(err) = cache.sweep(max_age).await {
                    tracing::error!(%err, "header cache sweep failed");
                }
            });
        }
        Ok(())
    }

    async fn handle_create_directory(&mut self, directory: &str, quiet: bool) -> Result<()> {
        match self.session()?.create(directory).await {
            Ok(()) => Ok(()),
            Err(_) if quiet => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_remove_directory(&mut self, directory: &str, quiet: bool) -> Result<()> {
        match self.session()?.delete(directory).await {
            Ok(()) => Ok(()),
            Err(_) if quiet => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_append_message(
        &mut self,
        destination: &str,
        flags: Flags,
        date: chrono::DateTime<chrono::Utc>,
        content: &[u8],
    ) -> Result<()> {
        let flag_list = crate::translate::flag_list(flags);
        let internal_date = format!("\"{}\"", date.format("%d-%b-%Y %H:%M:%S +0000"));
        self.session()?
            .append(destination, Some(&flag_list), Some(&internal_date), content)
            .await?;
        Ok(())
    }

    // === Unsolicited update handling ===

    pub(crate) fn handle_update(&mut self, update: MailboxUpdate) {
        tracing::trace!(?update, "mailbox update");
        match update {
            MailboxUpdate::Exists(_) | MailboxUpdate::Recent(_) => {
                let Some(selected) = self.selected_name() else {
                    return;
                };
                // Servers deliver these in bursts; a short holdoff keeps
                // one burst from fanning out into several STATUS rounds.
                let now = tokio::time::Instant::now();
                if now >= self.no_check_mail_before {
                    self.worker.post_action(
                        Action::CheckMail {
                            directories: vec![selected],
                        },
                        None,
                        None,
                    );
                } else {
                    tracing::debug!("ignored duplicate mailbox update");
                }
                self.no_check_mail_before = now + std::time::Duration::from_millis(20);
            }
            MailboxUpdate::Expunge(seq) => {
                if let Some(uid) = self.resolve_expunge(seq) {
                    self.worker.post_message(
                        Response::MessagesDeleted { uids: vec![uid] },
                        None,
                        None,
                    );
                } else {
                    tracing::error!(seq, "expunge update for unknown sequence number");
                }
            }
            MailboxUpdate::Fetch { seq, uid, flags } => {
                let uid = match uid {
                    Some(uid) => uid,
                    None => match self.seq_map.get(seq) {
                        Some(uid) => uid,
                        None => {
                            tracing::error!(seq, "flag update for unknown sequence number");
                            return;
                        }
                    },
                };
                if self
                    .expunger
                    .as_ref()
                    .is_some_and(|handler| handler.is_expunging(uid))
                {
                    // Some servers confirm the \Deleted store before the
                    // expunge lands; processing that would corrupt the
                    // sequence accounting.
                    return;
                }
                if seq as usize > self.seq_map.size() {
                    self.seq_map.put(seq, uid);
                }
                self.worker.post_message(
                    Response::MessageInfo {
                        info: maildeck_worker::MessageInfo {
                            uid,
                            flags,
                            ..maildeck_worker::MessageInfo::default()
                        },
                        needs_flags: false,
                    },
                    None,
                    None,
                );
            }
            MailboxUpdate::Bye => {
                tracing::info!("server closed the connection");
                self.terminate();
                self.observer.emit_if_not_connected();
            }
        }
    }

    /// Resolves one EXPUNGE sequence number to its UID: through the
    /// current batch's handler when one is live, falling back to the live
    /// mailbox view (which renumbers globally on pop).
    pub(crate) fn resolve_expunge(&mut self, seq: u32) -> Option<Uid> {
        let mut uid = None;
        let mut batch_done = false;
        if let Some(handler) = self.expunger.as_ref() {
            uid = handler.pop_sequence_number(seq);
            batch_done = handler.remaining() == 0;
        }
        if batch_done {
            self.expunger = None;
        }
        if uid.is_none() {
            uid = self.seq_map.pop(seq);
        }
        uid
    }

    // === Idle lifecycle ===

    async fn stop_idler(&mut self) -> Result<()> {
        let (driver, result) = self.idler.stop().await;
        if let Some(driver) = driver
            && let Some(session) = driver.into_session()
            && let Some(client) = self.client.as_mut()
        {
            client.restore_session(session);
        }
        if let Err(err) = result {
            tracing::error!(%err, "idler stopped with error");
            self.terminate();
            self.observer.emit_if_not_connected();
            return Err(err);
        }
        Ok(())
    }

    fn start_idler(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if !client.is_selected() {
            return;
        }
        let Some(session) = client.take_session() else {
            return;
        };
        let driver = SessionIdleDriver::new(session, self.updates_tx.clone());
        if let Some(driver) = self.idler.start(driver)
            && let Some(session) = driver.into_session()
        {
            client.restore_session(session);
        }
    }

    // === Shared helpers ===

    /// Whether further actions are already queued behind the current one.
    pub(crate) fn actions_pending(&self) -> bool {
        !self.actions.is_empty()
    }

    pub(crate) fn client(&mut self) -> Result<&mut ImapClient> {
        self.client.as_mut().ok_or(Error::NotConnected)
    }

    pub(crate) fn session(&mut self) -> Result<&mut Session> {
        self.client()?.session()
    }

    pub(crate) fn selected_name(&self) -> Option<String> {
        self.client
            .as_ref()
            .and_then(|c| c.selected.as_ref())
            .map(|s| s.name.clone())
    }

    pub(crate) fn respond(&self, in_response_to: MessageId, response: Response) {
        self.worker
            .post_message(response, Some(in_response_to), None);
    }
}
