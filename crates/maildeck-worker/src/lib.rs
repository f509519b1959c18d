//! # maildeck-worker
//!
//! The message bus shared by every maildeck store worker.
//!
//! A [`Worker`] decouples UI intent from backend execution: the UI posts
//! [`Action`]s with an optional callback, the backend consumes them from the
//! Actions channel and answers with zero or more [`Response`]s on the
//! Messages channel, each carrying the id of the action it responds to. The
//! bus correlates responses back to callbacks and releases a callback once a
//! terminal response (`Done`, `Error`, `Unsupported`, `Cancelled`) arrives.
//!
//! Backends implement [`Backend`] and register a factory under their URL
//! scheme (`imap`, `imaps`, `maildir`, ...) in the process-wide
//! [registry](backend::register_backend).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod backend;
mod error;
pub mod message;
pub mod models;
pub mod worker;

pub use backend::{Backend, BackendFactory, backend_for_scheme, register_backend};
pub use error::{Error, Result};
pub use message::{AccountConfig, Action, Cause, MessageId, Response, SearchCriteria, WorkerMessage};
pub use models::{
    Address, BodyStructure, Directory, DirectoryInfo, Envelope, Flags, FullMessage,
    MessageBodyPart, MessageInfo, Role, SeqNum, Uid,
};
pub use worker::{ActionCallback, ResponseCallback, Worker, WorkerChannels};
