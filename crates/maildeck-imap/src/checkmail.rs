//! STATUS-based mail check.
//!
//! Refreshes counts for the requested mailboxes. When new actions are
//! already queued behind the check, the remaining mailboxes are handed
//! back as `CheckMailDirectories` instead of holding the queue hostage on
//! a long STATUS round; the UI re-requests them.

use maildeck_worker::models::DirectoryInfo;
use maildeck_worker::{MessageId, Response};

use crate::client::SelectedMailbox;
use crate::error::Result;
use crate::worker::ImapWorker;

const STATUS_ITEMS: &str = "(MESSAGES RECENT UNSEEN UIDNEXT UIDVALIDITY)";

impl ImapWorker {
    pub(crate) async fn handle_check_mail(
        &mut self,
        msg_id: MessageId,
        directories: &[String],
    ) -> Result<()> {
        let mut remaining = Vec::new();
        let mut statuses = Vec::new();

        for dir in directories {
            if self.actions_pending() {
                remaining.push(dir.clone());
                continue;
            }
            tracing::trace!(directory = %dir, "getting mailbox status");
            match self.session()?.status(dir, STATUS_ITEMS).await {
                Ok(mailbox) => statuses.push((dir.clone(), mailbox)),
                Err(err) => {
                    // One broken mailbox should not hide the others; its
                    // DirectoryInfo simply never arrives.
                    tracing::warn!(directory = %dir, %err, "cannot get mailbox status");
                }
            }
        }

        let selected_name = self.selected_name();
        for (dir, mailbox) in statuses {
            if Some(&dir) == selected_name.as_ref()
                && let Some(client) = self.client.as_mut()
            {
                client.selected = Some(SelectedMailbox::from_mailbox(&dir, &mailbox));
            }
            self.respond(
                msg_id,
                Response::DirectoryInfo {
                    info: DirectoryInfo {
                        name: dir,
                        exists: mailbox.exists,
                        recent: mailbox.recent,
                        unseen: mailbox.unseen.unwrap_or(0),
                        accurate_counts: true,
                    },
                },
            );
        }

        if !remaining.is_empty() {
            self.respond(
                msg_id,
                Response::CheckMailDirectories {
                    directories: remaining,
                },
            );
        }
        Ok(())
    }
}
