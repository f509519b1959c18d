//! The wire-client handle.
//!
//! [`ImapClient`] owns the `async-imap` session plus the connection-scoped
//! state around it: the currently selected mailbox, the server
//! capabilities, and the `connected` watch channel the observer subscribes
//! to. The session itself is owned exclusively by the worker task; the
//! idler borrows it by *taking* it for the duration of an IDLE and handing
//! it back on stop.

use async_imap::imap_proto::types::{MailboxDatum, Response, Status};
use async_imap::types::{Capabilities, Mailbox, UnsolicitedResponse};
use maildeck_worker::models::{Flags, SeqNum, Uid};
use tokio::sync::{mpsc, watch};

use crate::connect::ImapStream;
use crate::error::{Error, Result};
use crate::translate;

/// The concrete wire session type.
pub type Session = async_imap::Session<ImapStream>;

/// Status of the currently selected mailbox.
#[derive(Debug, Clone, Default)]
pub struct SelectedMailbox {
    /// Mailbox name.
    pub name: String,
    /// Total number of messages.
    pub exists: u32,
    /// Number of recent messages.
    pub recent: u32,
    /// First unseen message, when reported.
    pub unseen: Option<u32>,
    /// Predicted next UID, when reported.
    pub uid_next: Option<u32>,
    /// UIDVALIDITY, when reported. Namespaces the header cache.
    pub uid_validity: Option<u32>,
}

impl SelectedMailbox {
    pub(crate) fn from_mailbox(name: &str, mailbox: &Mailbox) -> Self {
        Self {
            name: name.to_string(),
            exists: mailbox.exists,
            recent: mailbox.recent,
            unseen: mailbox.unseen,
            uid_next: mailbox.uid_next,
            uid_validity: mailbox.uid_validity,
        }
    }
}

/// A mailbox change the server reported out-of-band, either during IDLE or
/// piggybacked on another command's responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxUpdate {
    /// Message count changed.
    Exists(u32),
    /// Recent count changed.
    Recent(u32),
    /// A message was removed, identified by sequence number.
    Expunge(SeqNum),
    /// Flags changed on a message.
    Fetch {
        /// Sequence number the server used.
        seq: SeqNum,
        /// UID, when the response carried one.
        uid: Option<Uid>,
        /// The new flag set.
        flags: Flags,
    },
    /// The server is closing the connection.
    Bye,
}

/// Handle around one established connection.
pub struct ImapClient {
    session: Option<Session>,
    capabilities: Capabilities,
    connected: watch::Sender<bool>,
    /// Status of the selected mailbox, kept current by SELECT and STATUS.
    pub selected: Option<SelectedMailbox>,
}

impl ImapClient {
    /// Wraps a freshly connected, authenticated and selected session.
    #[must_use]
    pub(crate) fn new(
        session: Session,
        capabilities: Capabilities,
        selected: SelectedMailbox,
    ) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            session: Some(session),
            capabilities,
            connected,
            selected: Some(selected),
        }
    }

    /// The logout signal the observer watches: flips to `false` when the
    /// connection is torn down or dies.
    #[must_use]
    pub(crate) fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Whether a mailbox is currently selected on a live session.
    #[must_use]
    pub fn is_selected(&self) -> bool {
        self.session.is_some() && self.selected.is_some()
    }

    /// Whether the server advertised `cap`.
    #[must_use]
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.has_str(cap)
    }

    /// UIDVALIDITY of the selected mailbox, `0` when unknown.
    #[must_use]
    pub fn uid_validity(&self) -> u32 {
        self.selected
            .as_ref()
            .and_then(|s| s.uid_validity)
            .unwrap_or(0)
    }

    pub(crate) fn session(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(Error::NotConnected)
    }

    /// Takes the session out of the handle, for IDLE.
    pub(crate) fn take_session(&mut self) -> Option<Session> {
        self.session.take()
    }

    /// Puts the session back after IDLE.
    pub(crate) fn restore_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    /// Logs out politely. Errors are reported; the handle is unusable
    /// afterwards either way.
    pub(crate) async fn logout(&mut self) -> Result<()> {
        self.connected.send_replace(false);
        if let Some(mut session) = self.session.take() {
            session.logout().await?;
        }
        Ok(())
    }

    /// Marks the connection dead without a logout exchange. Flipping the
    /// watch channel is what wakes the observer.
    pub(crate) fn terminate(&mut self) {
        self.connected.send_replace(false);
        self.session = None;
        self.selected = None;
    }

    /// Drains unsolicited responses the server piggybacked onto command
    /// replies, forwarding anything of interest to the worker's updates
    /// channel.
    pub(crate) fn drain_unsolicited(&mut self, updates: &mpsc::UnboundedSender<MailboxUpdate>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            if let Some(update) = unsolicited_update(&response) {
                let _ = updates.send(update);
            }
        }
    }
}

impl Drop for ImapClient {
    fn drop(&mut self) {
        self.connected.send_replace(false);
    }
}

impl std::fmt::Debug for ImapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapClient")
            .field("connected", &self.session.is_some())
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

/// Translates one unsolicited response into a mailbox update.
pub(crate) fn unsolicited_update(response: &UnsolicitedResponse) -> Option<MailboxUpdate> {
    match response {
        UnsolicitedResponse::Exists(n) => Some(MailboxUpdate::Exists(*n)),
        UnsolicitedResponse::Recent(n) => Some(MailboxUpdate::Recent(*n)),
        UnsolicitedResponse::Expunge(seq) => Some(MailboxUpdate::Expunge(*seq)),
        UnsolicitedResponse::Other(data) => update_from_response(data.parsed()),
        _ => None,
    }
}

/// Translates a raw parsed response (e.g. received while idling) into a
/// mailbox update.
pub(crate) fn update_from_response(response: &Response<'_>) -> Option<MailboxUpdate> {
    match response {
        Response::MailboxData(MailboxDatum::Exists(n)) => Some(MailboxUpdate::Exists(*n)),
        Response::MailboxData(MailboxDatum::Recent(n)) => Some(MailboxUpdate::Recent(*n)),
        Response::Expunge(seq) => Some(MailboxUpdate::Expunge(*seq)),
        Response::Fetch(seq, attrs) => {
            use async_imap::imap_proto::types::AttributeValue;
            let mut uid = None;
            let mut flags = Flags::empty();
            for attr in attrs {
                match attr {
                    AttributeValue::Uid(u) => uid = Some(*u),
                    AttributeValue::Flags(raw) => {
                        flags = translate::flags_from_strs(raw.iter().map(|f| f.as_ref()));
                    }
                    _ => {}
                }
            }
            Some(MailboxUpdate::Fetch {
                seq: *seq,
                uid,
                flags,
            })
        }
        Response::Data {
            status: Status::Bye,
            ..
        } => Some(MailboxUpdate::Bye),
        _ => None,
    }
}
