//! Flag stores, deletion and copy/move.
//!
//! Deletion is the protocol-sensitive path: flag the batch `\Deleted` by
//! UID, issue one EXPUNGE, then resolve the server's EXPUNGE replies back
//! to UIDs through a fresh [`ExpungeHandler`](crate::ExpungeHandler) built
//! for exactly this batch.

use futures::StreamExt;
use maildeck_worker::models::{Flags, MessageInfo, Uid};
use maildeck_worker::{Action, MessageId, Response};

use crate::error::Result;
use crate::expunge::ExpungeHandler;
use crate::translate;
use crate::worker::ImapWorker;

impl ImapWorker {
    /// Builds the per-batch EXPUNGE handler from the live mailbox view.
    fn build_expunger(&mut self, uids: &[Uid]) {
        let (snapshot, min_seq) = self.seq_map.snapshot(uids);
        self.expunger = Some(ExpungeHandler::new(
            self.config.expunge_policy,
            snapshot,
            min_seq,
        ));
    }

    pub(crate) async fn handle_delete_messages(
        &mut self,
        msg_id: MessageId,
        uids: &[Uid],
    ) -> Result<()> {
        tracing::trace!(?uids, "deleting messages");
        self.build_expunger(uids);

        let set = translate::uid_set(uids);
        self.store_flags(&set, "+FLAGS (\\Deleted)").await?;

        let expunged = {
            let session = self.session()?;
            let mut stream = std::pin::pin!(session.expunge().await?);
            let mut seqs = Vec::new();
            while let Some(seq) = stream.next().await {
                seqs.push(seq?);
            }
            seqs
        };

        for seq in expunged {
            if let Some(uid) = self.resolve_expunge(seq) {
                self.respond(msg_id, Response::MessagesDeleted { uids: vec![uid] });
            }
        }
        self.expunger = None;
        Ok(())
    }

    pub(crate) async fn handle_flag_messages(
        &mut self,
        msg_id: MessageId,
        enable: bool,
        flags: Flags,
        uids: &[Uid],
    ) -> Result<()> {
        let item = if enable { "+FLAGS" } else { "-FLAGS" };
        let command = format!("{item} {}", translate::flag_list(flags));
        let set = translate::uid_set(uids);

        let updated = self.store_flags(&set, &command).await?;
        for (uid, flags) in updated {
            self.respond(
                msg_id,
                Response::MessageInfo {
                    info: MessageInfo {
                        uid,
                        flags,
                        ..MessageInfo::default()
                    },
                    needs_flags: false,
                },
            );
        }

        // Unseen counts just changed; refresh the open mailbox.
        if let Some(selected) = self.selected_name() {
            self.worker.post_action(
                Action::CheckMail {
                    directories: vec![selected],
                },
                None,
                None,
            );
        }
        Ok(())
    }

    /// Runs one UID STORE and returns the `(uid, flags)` updates the
    /// server reported back.
    async fn store_flags(&mut self, set: &str, command: &str) -> Result<Vec<(Uid, Flags)>> {
        let session = self.session()?;
        let mut stream = session.uid_store(set, command).await?;
        let mut updated = Vec::new();
        while let Some(fetch) = stream.next().await {
            let fetch = fetch?;
            if let Some(uid) = fetch.uid {
                updated.push((uid, translate::flags(fetch.flags())));
            }
        }
        Ok(updated)
    }

    pub(crate) async fn handle_copy_messages(
        &mut self,
        destination: &str,
        uids: &[Uid],
    ) -> Result<()> {
        tracing::trace!(?uids, destination, "copying messages");
        let set = translate::uid_set(uids);
        self.session()?.uid_copy(&set, destination).await?;
        Ok(())
    }

    pub(crate) async fn handle_move_messages(
        &mut self,
        destination: &str,
        uids: &[Uid],
    ) -> Result<()> {
        tracing::trace!(?uids, destination, "moving messages");
        // The server reports the removal from the source mailbox as
        // EXPUNGEs; resolve them through a batch handler like a delete.
        self.build_expunger(uids);
        let set = translate::uid_set(uids);

        let has_move = self.client()?.has_capability("MOVE");
        if has_move {
            self.session()?.uid_mv(&set, destination).await?;
            return Ok(());
        }

        // No MOVE capability: copy, flag deleted, expunge.
        self.session()?.uid_copy(&set, destination).await?;
        self.store_flags(&set, "+FLAGS (\\Deleted)").await?;
        let expunged = {
            let session = self.session()?;
            let mut stream = std::pin::pin!(session.expunge().await?);
            let mut seqs = Vec::new();
            while let Some(seq) = stream.next().await {
                seqs.push(seq?);
            }
            seqs
        };
        for seq in expunged {
            if let Some(uid) = self.resolve_expunge(seq) {
                self.worker.post_message(
                    Response::MessagesDeleted { uids: vec![uid] },
                    None,
                    None,
                );
            }
        }
        self.expunger = None;
        Ok(())
    }
}
