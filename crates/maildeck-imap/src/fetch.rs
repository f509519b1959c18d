//! Message fetch handlers: headers, full bodies, body parts and flags.

use std::collections::HashSet;

use async_imap::imap_proto::types::{MessageSection, SectionPath};
use async_imap::types::Fetch;
use chrono::Utc;
use futures::StreamExt;
use maildeck_worker::models::{Flags, FullMessage, MessageBodyPart, MessageInfo, Uid};
use maildeck_worker::{MessageId, Response};
use tokio_util::sync::CancellationToken;

use crate::cache::CachedHeader;
use crate::client::Session;
use crate::error::{Error, Result};
use crate::translate;
use crate::worker::ImapWorker;

const HEADER_ITEMS: &str =
    "(UID FLAGS INTERNALDATE RFC822.SIZE ENVELOPE BODYSTRUCTURE BODY.PEEK[HEADER])";

async fn collect_fetches(
    session: &mut Session,
    set: &str,
    items: &str,
) -> Result<Vec<Fetch>> {
    let mut stream = session.uid_fetch(set, items).await?;
    let mut fetches = Vec::new();
    while let Some(fetch) = stream.next().await {
        fetches.push(fetch?);
    }
    Ok(fetches)
}

fn message_info(fetch: &Fetch, with_header: bool) -> MessageInfo {
    let header = if with_header {
        fetch.header().map(<[u8]>::to_vec)
    } else {
        None
    };
    let refs = header
        .as_deref()
        .map(translate::references)
        .unwrap_or_default();
    MessageInfo {
        body_structure: fetch.bodystructure().map(translate::body_structure),
        envelope: fetch.envelope().map(translate::envelope),
        flags: translate::flags(fetch.flags()),
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        size: fetch.size.unwrap_or(0),
        uid: fetch.uid.unwrap_or(0),
        header,
        refs,
        error: None,
    }
}

impl ImapWorker {
    pub(crate) async fn handle_fetch_message_headers(
        &mut self,
        msg_id: MessageId,
        ctx: &CancellationToken,
        uids: &[Uid],
    ) -> Result<()> {
        let mut to_fetch = uids.to_vec();
        if self.config.cache_enabled && self.cache.is_some() {
            to_fetch = self.serve_cached_headers(msg_id, &to_fetch).await;
        }
        if to_fetch.is_empty() {
            return Ok(());
        }
        tracing::trace!(?to_fetch, "fetching message headers");

        let set = translate::uid_set(&to_fetch);
        let fetches = collect_fetches(self.session()?, &set, HEADER_ITEMS).await?;
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut missing: HashSet<Uid> = to_fetch.iter().copied().collect();
        let uid_validity = self.client()?.uid_validity();
        for fetch in &fetches {
            let Some(uid) = fetch.uid else {
                // Flag-update noise without a UID; not ours to report.
                continue;
            };
            missing.remove(&uid);
            let info = message_info(fetch, true);
            if self.config.cache_enabled
                && let Some(cache) = self.cache.as_ref()
                && let Some(header) = info.header.clone()
                && let (Some(body_structure), Some(envelope)) =
                    (info.body_structure.clone(), info.envelope.clone())
            {
                let record = CachedHeader {
                    body_structure,
                    envelope,
                    internal_date: info.internal_date,
                    uid,
                    header,
                    created: Utc::now(),
                };
                if let Err(err) = cache.put(uid_validity, &record).await {
                    tracing::error!(uid, %err, "cannot cache header");
                }
            }
            self.respond(
                msg_id,
                Response::MessageInfo {
                    info,
                    needs_flags: false,
                },
            );
        }

        for uid in missing {
            self.worker.post_message_info_error(
                Some(msg_id),
                uid,
                &Error::Protocol("invalid response from server".into()),
            );
        }
        Ok(())
    }

    /// Serves whatever headers the cache holds, posting a synthesized
    /// `MessageInfo` for each hit, and returns the UIDs that still have to
    /// be fetched from the server. The cache does not track live flag
    /// state, so hits carry a Seen placeholder and `needs_flags`.
    async fn serve_cached_headers(&mut self, msg_id: MessageId, uids: &[Uid]) -> Vec<Uid> {
        let uid_validity = self.client.as_ref().map_or(0, |c| c.uid_validity());
        let Some(cache) = self.cache.as_ref() else {
            return uids.to_vec();
        };
        let mut need = Vec::new();
        for &uid in uids {
            match cache.get(uid_validity, uid).await {
                Ok(Some(record)) => {
                    tracing::trace!(uid_validity, uid, "located cached header");
                    let refs = translate::references(&record.header);
                    self.worker.post_message(
                        Response::MessageInfo {
                            info: MessageInfo {
                                body_structure: Some(record.body_structure),
                                envelope: Some(record.envelope),
                                flags: Flags::SEEN,
                                internal_date: record.internal_date,
                                uid,
                                header: Some(record.header),
                                refs,
                                size: 0,
                                error: None,
                            },
                            needs_flags: true,
                        },
                        Some(msg_id),
                        None,
                    );
                }
                Ok(None) => need.push(uid),
                Err(err) => {
                    tracing::error!(uid, %err, "cache read failed");
                    need.push(uid);
                }
            }
        }
        need
    }

    pub(crate) async fn handle_fetch_full_messages(
        &mut self,
        msg_id: MessageId,
        uids: &[Uid],
    ) -> Result<()> {
        tracing::trace!(?uids, "fetching full messages");
        let set = translate::uid_set(uids);
        let fetches = collect_fetches(self.session()?, &set, "(UID FLAGS BODY.PEEK[])").await?;
        for fetch in &fetches {
            let Some(uid) = fetch.uid else { continue };
            let Some(body) = fetch.body() else {
                self.worker.post_message_info_error(
                    Some(msg_id),
                    uid,
                    &Error::Protocol("server returned no body".into()),
                );
                continue;
            };
            self.respond(
                msg_id,
                Response::FullMessage {
                    content: FullMessage {
                        uid,
                        content: body.to_vec(),
                    },
                },
            );
            // Flags changed as a side effect (the message lost \Recent or
            // was marked read by another client meanwhile); let the UI
            // know.
            self.respond(
                msg_id,
                Response::MessageInfo {
                    info: MessageInfo {
                        uid,
                        flags: translate::flags(fetch.flags()),
                        ..MessageInfo::default()
                    },
                    needs_flags: false,
                },
            );
        }
        Ok(())
    }

    pub(crate) async fn handle_fetch_message_body_part(
        &mut self,
        msg_id: MessageId,
        uid: Uid,
        part: &[u32],
    ) -> Result<()> {
        tracing::trace!(uid, ?part, "fetching body part");
        let (items, path) = if part.is_empty() {
            (
                "(UID FLAGS BODY.PEEK[TEXT])".to_string(),
                SectionPath::Full(MessageSection::Text),
            )
        } else {
            let joined = part
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(".");
            (
                format!("(UID FLAGS BODY.PEEK[{joined}])"),
                SectionPath::Part(part.to_vec(), None),
            )
        };

        let set = uid.to_string();
        let fetches = collect_fetches(self.session()?, &set, &items).await?;
        for fetch in &fetches {
            if fetch.uid != Some(uid) {
                continue;
            }
            let Some(content) = fetch.section(&path) else {
                return Err(Error::Protocol(format!(
                    "failed to find part {part:?} for uid {uid}"
                )));
            };
            self.respond(
                msg_id,
                Response::MessageBodyPart {
                    part: MessageBodyPart {
                        uid,
                        content: content.to_vec(),
                    },
                },
            );
            self.respond(
                msg_id,
                Response::MessageInfo {
                    info: MessageInfo {
                        uid,
                        flags: translate::flags(fetch.flags()),
                        ..MessageInfo::default()
                    },
                    needs_flags: false,
                },
            );
            return Ok(());
        }
        Err(Error::Protocol(format!("no response for uid {uid}")))
    }

    pub(crate) async fn handle_fetch_message_flags(
        &mut self,
        msg_id: MessageId,
        uids: &[Uid],
    ) -> Result<()> {
        let set = translate::uid_set(uids);
        let fetches = collect_fetches(self.session()?, &set, "(UID FLAGS)").await?;
        for fetch in &fetches {
            let Some(uid) = fetch.uid else { continue };
            self.respond(
                msg_id,
                Response::MessageInfo {
                    info: MessageInfo {
                        uid,
                        flags: translate::flags(fetch.flags()),
                        ..MessageInfo::default()
                    },
                    needs_flags: false,
                },
            );
        }
        Ok(())
    }
}
