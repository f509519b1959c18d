//! Sequence-number → UID mapping for the currently opened mailbox.
//!
//! Sequence numbers are a moving target: per RFC 3501 §7.4.1, expunging a
//! message decrements the sequence number of every message after it. The
//! map mirrors that renumbering on [`SeqMap::pop`] so it always reflects
//! the server's current numbering.
//!
//! The map is owned by the IMAP worker task but guarded by a lock because
//! IDLE-delivered expunges and the action loop can touch the same mailbox
//! state concurrently.

use std::collections::BTreeMap;
use std::sync::Mutex;

use maildeck_worker::{SeqNum, Uid};

/// Concurrency-safe bidirectional sequence-number/UID map.
#[derive(Debug, Default)]
pub struct SeqMap {
    inner: Mutex<BTreeMap<SeqNum, Uid>>,
}

impl SeqMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped messages.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Looks up the UID mapped to `seq`.
    #[must_use]
    pub fn get(&self, seq: SeqNum) -> Option<Uid> {
        self.lock().get(&seq).copied()
    }

    /// Maps `seq` to `uid`, replacing any previous entry.
    pub fn put(&self, seq: SeqNum, uid: Uid) {
        self.lock().insert(seq, uid);
    }

    /// Rebuilds the map from a UID list in mailbox order: the first UID
    /// gets sequence number 1 and so on.
    pub fn initialize(&self, uids: &[Uid]) {
        let mut inner = self.lock();
        inner.clear();
        for (i, &uid) in uids.iter().enumerate() {
            inner.insert(u32::try_from(i).unwrap_or(u32::MAX).saturating_add(1), uid);
        }
    }

    /// Removes the entry for `seq` and renumbers the remainder: every
    /// entry with a sequence number greater than `seq` is shifted down by
    /// one, tracking the server's renumbering after an EXPUNGE. Entries
    /// below `seq` are untouched.
    ///
    /// Returns the removed UID, or `None` if `seq` was not mapped (the map
    /// is then left unchanged).
    pub fn pop(&self, seq: SeqNum) -> Option<Uid> {
        let mut inner = self.lock();
        let uid = inner.remove(&seq)?;
        let shifted: Vec<(SeqNum, Uid)> = inner
            .range(seq..)
            .map(|(&s, &u)| (s, u))
            .collect();
        for (s, u) in shifted {
            inner.remove(&s);
            inner.insert(s - 1, u);
        }
        Some(uid)
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Takes the `{sequence number → UID}` snapshot for exactly the given
    /// UIDs, together with the lowest sequence number among them. This is
    /// the input an [`ExpungeHandler`](crate::ExpungeHandler) needs for one
    /// delete/move batch.
    #[must_use]
    pub fn snapshot(&self, uids: &[Uid]) -> (BTreeMap<SeqNum, Uid>, SeqNum) {
        let inner = self.lock();
        let mut snapshot = BTreeMap::new();
        let mut min_seq = 0;
        for (&seq, &uid) in inner.iter() {
            if uids.contains(&uid) {
                snapshot.insert(seq, uid);
                if min_seq == 0 || seq < min_seq {
                    min_seq = seq;
                }
            }
        }
        (snapshot, min_seq)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SeqNum, Uid>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_map() {
        let map = SeqMap::new();
        assert_eq!(map.size(), 0);
        assert_eq!(map.get(42), None);
        assert_eq!(map.pop(0), None);
    }

    #[test]
    fn initialize_assigns_positional_sequence_numbers() {
        let map = SeqMap::new();
        map.initialize(&[1337, 42, 1107]);
        assert_eq!(map.size(), 3);
        assert_eq!(map.get(1), Some(1337));
        assert_eq!(map.get(2), Some(42));
        assert_eq!(map.get(3), Some(1107));

        map.initialize(&[]);
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn pop_renumbers_entries_above_only() {
        let map = SeqMap::new();
        map.initialize(&[10, 20, 30, 40]);

        assert_eq!(map.pop(2), Some(20));
        assert_eq!(map.size(), 3);
        // Below the popped number: unchanged.
        assert_eq!(map.get(1), Some(10));
        // Above: shifted down by exactly one.
        assert_eq!(map.get(2), Some(30));
        assert_eq!(map.get(3), Some(40));
        assert_eq!(map.get(4), None);
    }

    #[test]
    fn failed_pop_leaves_size_unchanged() {
        let map = SeqMap::new();
        map.initialize(&[10, 20]);
        assert_eq!(map.pop(5), None);
        assert_eq!(map.size(), 2);
        assert_eq!(map.get(1), Some(10));
        assert_eq!(map.get(2), Some(20));
    }

    #[test]
    fn repeated_pops_of_lowest_drain_in_order() {
        let map = SeqMap::new();
        map.initialize(&[10, 20, 30]);
        assert_eq!(map.pop(1), Some(10));
        assert_eq!(map.pop(1), Some(20));
        assert_eq!(map.pop(1), Some(30));
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn put_replaces_existing_entry() {
        let map = SeqMap::new();
        map.put(1, 100);
        map.put(1, 200);
        assert_eq!(map.size(), 1);
        assert_eq!(map.get(1), Some(200));
    }

    #[test]
    fn snapshot_selects_batch_and_min() {
        let map = SeqMap::new();
        map.initialize(&[10, 20, 30, 40, 50]);

        let (snapshot, min_seq) = map.snapshot(&[20, 40]);
        assert_eq!(min_seq, 2);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&2), Some(&20));
        assert_eq!(snapshot.get(&4), Some(&40));
        // Snapshots do not mutate the live map.
        assert_eq!(map.size(), 5);
    }

    #[test]
    fn snapshot_of_unknown_uids_is_empty() {
        let map = SeqMap::new();
        map.initialize(&[10]);
        let (snapshot, min_seq) = map.snapshot(&[99]);
        assert!(snapshot.is_empty());
        assert_eq!(min_seq, 0);
    }

    #[test]
    fn clear_empties_the_map() {
        let map = SeqMap::new();
        map.initialize(&[1, 2, 3]);
        map.clear();
        assert_eq!(map.size(), 0);
    }
}
