//! Directory listing, contents and search.

use futures::StreamExt;
use async_imap::types::{Name, NameAttribute};
use maildeck_worker::models::{Directory, Role, Uid};
use maildeck_worker::{MessageId, Response, SearchCriteria};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::translate;
use crate::worker::ImapWorker;

fn can_open(name: &Name) -> bool {
    !name.attributes().iter().any(|attr| match attr {
        NameAttribute::NoSelect => true,
        NameAttribute::Extension(ext) => ext.as_ref() == "\\NonExistent",
        _ => false,
    })
}

fn role_of(name: &Name) -> Option<Role> {
    if name.name() == "INBOX" {
        return Some(Role::Inbox);
    }
    name.attributes().iter().find_map(|attr| {
        if let NameAttribute::Extension(ext) = attr {
            translate::role_from_attribute(ext.as_ref())
        } else {
            None
        }
    })
}

impl ImapWorker {
    pub(crate) async fn handle_list_directories(&mut self, msg_id: MessageId) -> Result<()> {
        tracing::trace!("listing mailboxes");
        let names = {
            let session = self.session()?;
            let mut stream = session.list(Some(""), Some("*")).await?;
            let mut names = Vec::new();
            while let Some(name) = stream.next().await {
                names.push(name?);
            }
            names
        };

        for name in &names {
            if !can_open(name) {
                continue;
            }
            self.respond(
                msg_id,
                Response::Directory {
                    dir: Directory {
                        name: name.name().to_string(),
                        uid_validity: None,
                        role: role_of(name),
                    },
                },
            );
        }
        Ok(())
    }

    pub(crate) async fn handle_fetch_directory_contents(
        &mut self,
        msg_id: MessageId,
        ctx: &CancellationToken,
    ) -> Result<()> {
        tracing::trace!("fetching directory contents");
        let uids = self.search_uids("ALL").await?;
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // The mailbox-ordered UID list is also the authoritative
        // sequence-number assignment for the open mailbox.
        self.seq_map.initialize(&uids);
        self.respond(msg_id, Response::DirectoryContents { uids });
        Ok(())
    }

    pub(crate) async fn handle_search_directory(
        &mut self,
        msg_id: MessageId,
        ctx: &CancellationToken,
        criteria: &SearchCriteria,
    ) -> Result<()> {
        let query = search_query(criteria);
        tracing::trace!(%query, "executing search");
        let uids = self.search_uids(&query).await?;
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.respond(msg_id, Response::SearchResults { uids });
        Ok(())
    }

    async fn search_uids(&mut self, query: &str) -> Result<Vec<Uid>> {
        let session = self.session()?;
        let found = session.uid_search(query).await?;
        let mut uids: Vec<Uid> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }
}

fn search_query(criteria: &SearchCriteria) -> String {
    let mut terms = Vec::new();
    if criteria.unseen {
        terms.push("UNSEEN".to_string());
    }
    if criteria.flagged {
        terms.push("FLAGGED".to_string());
    }
    if let Some(from) = criteria.from.as_deref() {
        terms.push(format!("FROM \"{}\"", escape_quoted(from)));
    }
    if let Some(to) = criteria.to.as_deref() {
        terms.push(format!("TO \"{}\"", escape_quoted(to)));
    }
    if let Some(text) = criteria.text.as_deref() {
        terms.push(format!("TEXT \"{}\"", escape_quoted(text)));
    }
    if terms.is_empty() {
        "ALL".to_string()
    } else {
        terms.join(" ")
    }
}

fn escape_quoted(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}
