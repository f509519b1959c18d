//! # maildeck-imap
//!
//! The IMAP store worker. Keeps a locally cached view of a remote mailbox
//! consistent while the server mutates it out-of-band:
//!
//! - [`seq_map`]: concurrency-safe sequence-number → UID mapping with
//!   RFC 3501 renumbering on expunge.
//! - [`expunge`]: per-batch EXPUNGE resolution that auto-detects whether
//!   the server renumbers while it deletes.
//! - [`idler`] / [`observer`]: IDLE entry/exit with debounce and bounded
//!   stop, plus silent-logout detection driving reconnects.
//! - [`cache`]: on-disk header cache keyed by UIDVALIDITY and UID, with
//!   age-based eviction.
//! - [`worker`]: the action dispatch loop wiring it all to the
//!   `maildeck-worker` bus.
//!
//! The IMAP wire protocol itself is delegated to `async-imap`, consumed as
//! a black box through [`client::ImapClient`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod cache;
mod checkmail;
pub mod client;
pub mod config;
pub mod connect;
mod error;
pub mod expunge;
mod fetch;
mod flags;
pub mod idler;
mod list;
pub mod observer;
pub mod seq_map;
mod translate;
pub mod worker;

pub use config::ImapConfig;
pub use error::{Error, Result};
pub use expunge::{ExpungeHandler, ExpungePolicy};
pub use seq_map::SeqMap;
pub use worker::{ImapWorker, register_defaults};
