//! Data models shared between the UI and the store workers.
//!
//! These are the payload types carried inside bus responses. They are
//! deliberately wire-agnostic: each backend translates its own protocol
//! types into these before posting.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stable per-mailbox message identifier. Unlike a sequence number it does
/// not change as other messages are added or removed.
pub type Uid = u32;

/// A message's 1-based position in the server's current view of a mailbox.
/// Shifts when other messages are expunged.
pub type SeqNum = u32;

bitflags! {
    /// System flags on a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Flags: u32 {
        /// Message has been read.
        const SEEN = 1 << 0;
        /// Message arrived recently.
        const RECENT = 1 << 1;
        /// Message has been replied to.
        const ANSWERED = 1 << 2;
        /// Message is marked for deletion.
        const DELETED = 1 << 3;
        /// Message is flagged for attention.
        const FLAGGED = 1 << 4;
        /// Message is an unsent draft.
        const DRAFT = 1 << 5;
    }
}

/// Well-known mailbox roles, mapped from special-use attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The primary inbox.
    Inbox,
    /// Archived mail.
    Archive,
    /// Unsent drafts.
    Drafts,
    /// Spam.
    Junk,
    /// Sent mail.
    Sent,
    /// Deleted mail.
    Trash,
}

/// A mailbox as reported by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    /// Mailbox name, including any hierarchy delimiters.
    pub name: String,
    /// UIDVALIDITY of the mailbox if the listing carried it.
    pub uid_validity: Option<u32>,
    /// Special-use role, if any.
    pub role: Option<Role>,
}

/// Message counts and state for one mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryInfo {
    /// Mailbox name.
    pub name: String,
    /// Total number of messages.
    pub exists: u32,
    /// Number of recent messages.
    pub recent: u32,
    /// Number of unseen messages.
    pub unseen: u32,
    /// Whether the counts are exact rather than estimated.
    pub accurate_counts: bool,
}

/// A single sender or recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Display name, if present.
    pub name: Option<String>,
    /// The `mailbox@host` address.
    pub address: String,
}

impl Address {
    /// Creates an address from its mailbox and host parts.
    #[must_use]
    pub fn new(name: Option<String>, mailbox: &str, host: &str) -> Self {
        Self {
            name,
            address: format!("{mailbox}@{host}"),
        }
    }
}

/// The envelope of a message: addressing and subject metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message date from the Date header.
    pub date: Option<DateTime<Utc>>,
    /// Decoded subject.
    pub subject: String,
    /// From addresses.
    pub from: Vec<Address>,
    /// Reply-To addresses.
    pub reply_to: Vec<Address>,
    /// To addresses.
    pub to: Vec<Address>,
    /// Cc addresses.
    pub cc: Vec<Address>,
    /// Bcc addresses.
    pub bcc: Vec<Address>,
    /// Message-Id header value.
    pub message_id: String,
    /// In-Reply-To header value.
    pub in_reply_to: String,
}

/// A MIME body structure tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyStructure {
    /// MIME type, e.g. `text`.
    pub mime_type: String,
    /// MIME subtype, e.g. `plain`.
    pub mime_subtype: String,
    /// Content-Type parameters.
    pub params: Vec<(String, String)>,
    /// Content-Description, if present.
    pub description: Option<String>,
    /// Content-Transfer-Encoding, if present.
    pub encoding: Option<String>,
    /// Child parts for multipart messages.
    pub parts: Vec<BodyStructure>,
    /// Content-Disposition type, if present.
    pub disposition: Option<String>,
    /// Content-Disposition parameters.
    pub disposition_params: Vec<(String, String)>,
}

/// Metadata for one message, as delivered to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageInfo {
    /// MIME structure, when fetched.
    pub body_structure: Option<BodyStructure>,
    /// Envelope, when fetched.
    pub envelope: Option<Envelope>,
    /// System flags.
    pub flags: Flags,
    /// Server-reported arrival time.
    pub internal_date: Option<DateTime<Utc>>,
    /// RFC822 size in bytes, when known.
    pub size: u32,
    /// Message UID.
    pub uid: Uid,
    /// Raw header bytes, when fetched.
    pub header: Option<Vec<u8>>,
    /// Message-ids from the References header, for threading.
    pub refs: Vec<String>,
    /// Set when the fetch for this UID failed; the rest of the fields are
    /// then unreliable.
    pub error: Option<String>,
}

/// A complete RFC822 message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullMessage {
    /// Message UID.
    pub uid: Uid,
    /// Raw message content.
    pub content: Vec<u8>,
}

/// One decoded body part of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBodyPart {
    /// Message UID.
    pub uid: Uid,
    /// Raw part content.
    pub content: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_formats_mailbox_and_host() {
        let addr = Address::new(Some("Kate".into()), "kate", "example.org");
        assert_eq!(addr.address, "kate@example.org");
        assert_eq!(addr.name.as_deref(), Some("Kate"));
    }

    #[test]
    fn flags_combine() {
        let flags = Flags::SEEN | Flags::ANSWERED;
        assert!(flags.contains(Flags::SEEN));
        assert!(!flags.contains(Flags::DELETED));
    }
}
