//! Provider-dependent EXPUNGE resolution.
//!
//! To delete N messages in one command the worker sets `\Deleted` on them
//! and issues a single EXPUNGE, then receives N untagged EXPUNGE replies,
//! each naming a sequence number. RFC 3501 does not fix the order, and
//! servers differ:
//!
//! - GMail and FastMail expunge in increasing sequence order and renumber
//!   the remaining messages after each one.
//! - Office 365 expunges in decreasing order.
//! - Dovecot expunges in a seemingly random, stable order.
//!
//! An [`ExpungeHandler`] is built fresh for every delete/move batch from a
//! snapshot of the batch's `{sequence number → UID}` mapping. It resolves
//! each reply to its UID and infers which renumbering policy the server
//! uses from the very first reply, unless a policy was configured
//! statically. Because the behaviour is observed rather than declared, an
//! inferred policy must never leak into an unrelated batch.

use std::collections::BTreeMap;
use std::sync::Mutex;

use maildeck_worker::{SeqNum, Uid};

/// The configured EXPUNGE renumbering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpungePolicy {
    /// Infer the behaviour from the first reply of each batch.
    #[default]
    Auto,
    /// The server expunges in increasing sequence order, renumbering the
    /// outstanding messages after each delete.
    LowToHigh,
    /// The server expunges in arbitrary order without renumbering.
    Stable,
}

/// The policy actually in effect for one batch, once known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedPolicy {
    LowToHigh,
    Stable,
}

#[derive(Debug)]
struct State {
    items: BTreeMap<SeqNum, Uid>,
    resolved: Option<ResolvedPolicy>,
}

/// Per-batch EXPUNGE reply resolver.
#[derive(Debug)]
pub struct ExpungeHandler {
    configured: ExpungePolicy,
    min_seq: SeqNum,
    state: Mutex<State>,
}

impl ExpungeHandler {
    /// Creates a handler for one delete/move batch from the batch's
    /// sequence-number snapshot and its minimum sequence number.
    #[must_use]
    pub fn new(
        configured: ExpungePolicy,
        snapshot: BTreeMap<SeqNum, Uid>,
        min_seq: SeqNum,
    ) -> Self {
        Self {
            configured,
            min_seq,
            state: Mutex::new(State {
                items: snapshot,
                resolved: None,
            }),
        }
    }

    /// Resolves one untagged EXPUNGE reply to the UID it removed.
    ///
    /// The first reply of the batch fixes the policy: a statically
    /// configured policy is taken as-is; under [`ExpungePolicy::Auto`] a
    /// first reply equal to the batch minimum means the server renumbers
    /// as it deletes (low-to-high), anything else means stable numbering.
    /// Under low-to-high, every remaining snapshot entry above the popped
    /// number is shifted down to track the server.
    ///
    /// Returns `None` for a sequence number that is not in the snapshot;
    /// this is logged as a consistency warning (the configured or
    /// inferred policy may be wrong for this server) but the batch
    /// continues, because aborting would leave already-applied deletions
    /// unaccounted for.
    pub fn pop_sequence_number(&self, seq: SeqNum) -> Option<Uid> {
        let mut state = self.lock();

        if state.resolved.is_none() {
            let (policy, origin) = match self.configured {
                ExpungePolicy::LowToHigh => (ResolvedPolicy::LowToHigh, "configured"),
                ExpungePolicy::Stable => (ResolvedPolicy::Stable, "configured"),
                ExpungePolicy::Auto if seq == self.min_seq => {
                    (ResolvedPolicy::LowToHigh, "deduced")
                }
                ExpungePolicy::Auto => (ResolvedPolicy::Stable, "deduced"),
            };
            match policy {
                ResolvedPolicy::LowToHigh => {
                    tracing::debug!("{origin} expunge policy: low-to-high");
                }
                ResolvedPolicy::Stable => tracing::debug!("{origin} expunge policy: stable"),
            }
            state.resolved = Some(policy);
        }

        let uid = state.items.remove(&seq);

        if uid.is_some() && state.resolved == Some(ResolvedPolicy::LowToHigh) {
            // The server renumbers the outstanding messages after each
            // delete; mirror it on the snapshot.
            let renumbered: BTreeMap<SeqNum, Uid> = state
                .items
                .iter()
                .map(|(&s, &u)| (if s > seq { s - 1 } else { s }, u))
                .collect();
            state.items = renumbered;
        }

        if uid.is_none() {
            tracing::warn!(
                seq,
                "unexpected sequence number in EXPUNGE reply; consider overriding \
                 the expunge-policy configuration"
            );
        }

        uid
    }

    /// Whether `uid` is part of this batch and still awaiting its EXPUNGE
    /// reply. Used to ignore the flag-update noise some servers send after
    /// `\Deleted` is set but before the expunge lands.
    #[must_use]
    pub fn is_expunging(&self, uid: Uid) -> bool {
        self.lock().items.values().any(|&u| u == uid)
    }

    /// Number of replies still expected.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.lock().items.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
