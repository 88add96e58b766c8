// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fmt::{self, Display},
    sync::Arc,
};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// The two ways a named lock can be held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// A guard on the per-name lock that has been handed over to the table because
/// the caller used the explicit lock operations and keeps no guard of its own.
#[derive(Debug)]
pub(super) enum Held {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// State for one active name.
///
/// `refcount` counts every operation with a stake in the entry: acquisitions
/// that are still waiting, guards that are alive and holds stashed in
/// `exclusive` or `shared`. The entry must leave the table in the same
/// critical section that brings `refcount` to 0.
#[derive(Debug)]
pub(super) struct LockEntry {
    lock: Arc<RwLock<()>>,
    refcount: usize,
    exclusive: Option<OwnedRwLockWriteGuard<()>>,
    shared: Vec<OwnedRwLockReadGuard<()>>,
}

impl LockEntry {
    pub(super) fn new() -> Self {
        LockEntry {
            lock: Arc::new(RwLock::new(())),
            refcount: 0,
            exclusive: None,
            shared: Vec::new(),
        }
    }

    pub(super) fn lock(&self) -> &Arc<RwLock<()>> {
        &self.lock
    }

    pub(super) fn refcount(&self) -> usize {
        self.refcount
    }

    pub(super) fn add_reference(&mut self) {
        self.refcount += 1;
    }

    /// Drop one reference. Returns true if it was the last one.
    pub(super) fn remove_reference(&mut self) -> bool {
        self.refcount = self.refcount.checked_sub(1).expect("Cannot drop below 0");
        self.refcount == 0
    }

    /// Keep a guard obtained by an explicit lock operation until the matching
    /// explicit unlock.
    pub(super) fn stash(&mut self, held: Held) {
        match held {
            Held::Exclusive(guard) => {
                debug_assert!(self.exclusive.is_none() && self.shared.is_empty());
                self.exclusive = Some(guard);
            }
            Held::Shared(guard) => {
                debug_assert!(self.exclusive.is_none());
                self.shared.push(guard);
            }
        }
    }

    /// Release one stashed hold in `mode`, which unlocks the per-name lock for
    /// that holder. Returns false if there is no such hold.
    pub(super) fn release_stashed(&mut self, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => self.exclusive.take().is_some(),
            LockMode::Shared => self.shared.pop().is_some(),
        }
    }
}

impl Display for LockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "refcount: {}, held: ", self.refcount)?;
        if self.exclusive.is_some() {
            write!(f, "exclusive")
        } else if !self.shared.is_empty() {
            write!(f, "shared x{}", self.shared.len())
        } else {
            write!(f, "none")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_counting() {
        let mut entry = LockEntry::new();
        entry.add_reference();
        entry.add_reference();
        assert_eq!(entry.refcount(), 2);
        assert!(!entry.remove_reference());
        assert!(entry.remove_reference());
    }

    #[test]
    #[should_panic(expected = "Cannot drop below 0")]
    fn test_reference_underflow() {
        LockEntry::new().remove_reference();
    }

    #[test]
    fn test_stash_and_release() {
        let mut entry = LockEntry::new();

        let first = Arc::clone(entry.lock()).try_read_owned().unwrap();
        let second = Arc::clone(entry.lock()).try_read_owned().unwrap();
        entry.stash(Held::Shared(first));
        entry.stash(Held::Shared(second));
        assert_eq!(entry.to_string(), "refcount: 0, held: shared x2");

        assert!(!entry.release_stashed(LockMode::Exclusive));
        assert!(entry.lock().try_write().is_err());
        assert!(entry.release_stashed(LockMode::Shared));
        assert!(entry.release_stashed(LockMode::Shared));
        assert!(!entry.release_stashed(LockMode::Shared));

        let guard = Arc::clone(entry.lock()).try_write_owned().unwrap();
        entry.stash(Held::Exclusive(guard));
        assert_eq!(entry.to_string(), "refcount: 0, held: exclusive");
        assert!(entry.lock().try_read().is_err());
        assert!(entry.release_stashed(LockMode::Exclusive));
        assert!(entry.lock().try_read().is_ok());
    }
}
