//! Per-transport record of quarantined peers.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::address::Address;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Entry {
    AllIncarnations,
    Incarnations(HashSet<u64>),
}

/// Addresses, and optionally specific incarnations of them, that a transport refuses to associate with.
#[derive(Debug, Default)]
pub struct QuarantineTable {
    entries: Mutex<HashMap<Address, Entry>>,
}

impl QuarantineTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        QuarantineTable::default()
    }

    /// Quarantines the `uid` incarnation of `address`, or every incarnation if `uid` is `None`.
    pub fn insert(&self, address: &Address, uid: Option<u64>) {
        let mut entries = self.entries.lock();
        match uid {
            None => {
                entries.insert(address.clone(), Entry::AllIncarnations);
            }
            Some(uid) => match entries
                .entry(address.clone())
                .or_insert_with(|| Entry::Incarnations(HashSet::new()))
            {
                Entry::AllIncarnations => {}
                Entry::Incarnations(uids) => {
                    uids.insert(uid);
                }
            },
        }
    }

    /// Removes every entry for `address`. Returns `true` if there was one.
    pub fn remove(&self, address: &Address) -> bool {
        self.entries.lock().remove(address).is_some()
    }

    /// Returns `true` if the `uid` incarnation of `address` is quarantined.
    pub fn is_quarantined(&self, address: &Address, uid: u64) -> bool {
        match self.entries.lock().get(address) {
            Some(Entry::AllIncarnations) => true,
            Some(Entry::Incarnations(uids)) => uids.contains(&uid),
            None => false,
        }
    }

    /// Returns `true` if every incarnation of `address` is quarantined.
    ///
    /// Used before the peer's uid is known.
    pub fn is_fully_quarantined(&self, address: &Address) -> bool {
        matches!(
            self.entries.lock().get(address),
            Some(Entry::AllIncarnations)
        )
    }

    /// Returns `true` if `uid` matches the quarantine filter given to [`QuarantineTable::insert`].
    pub(crate) fn matches(filter: Option<u64>, uid: u64) -> bool {
        filter.map_or(true, |filter| filter == uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        "test://sysB@localhost:2".parse().unwrap()
    }

    #[test]
    fn quarantines_single_incarnation() {
        let table = QuarantineTable::new();
        table.insert(&addr(), Some(1));
        assert!(table.is_quarantined(&addr(), 1));
        assert!(!table.is_quarantined(&addr(), 2));
        assert!(!table.is_fully_quarantined(&addr()));
    }

    #[test]
    fn quarantines_every_incarnation() {
        let table = QuarantineTable::new();
        table.insert(&addr(), Some(1));
        table.insert(&addr(), None);
        table.insert(&addr(), Some(3));
        assert!(table.is_quarantined(&addr(), 2));
        assert!(table.is_fully_quarantined(&addr()));
    }

    #[test]
    fn lifting_clears_all_entries() {
        let table = QuarantineTable::new();
        table.insert(&addr(), Some(1));
        assert!(table.remove(&addr()));
        assert!(!table.is_quarantined(&addr(), 1));
        assert!(!table.remove(&addr()));
    }
}
