// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::{Arc, Mutex, MutexGuard},
};

use futures::executor::block_on;
use tokio::sync::RwLock;

use crate::{
    errors::{NamedLockError, NamedLockResult},
    structures::{
        entry::{Held, LockEntry, LockMode},
        guard::Stake,
    },
};

/// The bookkeeping part of the table. Only ever touched with the table mutex
/// held, and nothing done with it held may block or panic.
#[derive(Debug, Default)]
pub(super) struct LockRecord {
    entries: HashMap<String, LockEntry>,
}

impl LockRecord {
    /// Register intent to use the lock for `name`, creating its entry if this
    /// is the first user. Returns the per-name lock to wait on.
    pub(super) fn add_reference(&mut self, name: &str) -> Arc<RwLock<()>> {
        if !self.entries.contains_key(name) {
            trace!("Creating entry for lock {}", name);
            self.entries.insert(name.to_owned(), LockEntry::new());
        }
        let entry = self
            .entries
            .get_mut(name)
            .expect("entry was inserted above if missing");
        entry.add_reference();
        Arc::clone(entry.lock())
    }

    /// Give up one reference on `name`, removing the entry with the last one.
    /// Precondition: the caller owns a reference on `name`.
    pub(super) fn remove_reference(&mut self, name: &str) {
        let last = self
            .entries
            .get_mut(name)
            .expect("a reference is owned, so the entry exists")
            .remove_reference();
        if last {
            self.entries.remove(name);
            trace!("Removed entry for lock {}", name);
        }
    }

    /// Hand a guard for `name` over to the table, along with the reference
    /// that was taken to acquire it.
    pub(super) fn stash(&mut self, name: &str, held: Held) {
        self.entries
            .get_mut(name)
            .expect("a reference is owned, so the entry exists")
            .stash(held);
    }

    /// Release a hold on `name` that was stashed by an explicit lock operation,
    /// then drop the reference that came with it.
    fn release_stashed(&mut self, name: &str, mode: LockMode) -> NamedLockResult<()> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| NamedLockError::NotAcquired(name.to_owned()))?;
        if !entry.release_stashed(mode) {
            return Err(NamedLockError::ModeMismatch {
                name: name.to_owned(),
                mode,
            });
        }
        self.remove_reference(name);
        Ok(())
    }
}

impl Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, entry)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: ({entry})")?;
        }
        write!(f, "}}")
    }
}

/// A table of read-write locks addressed by name.
///
/// Each name has its own independent lock. A name's state is created by the
/// first acquisition and removed by the release that leaves nobody holding or
/// waiting for it. The table mutex is held only for that bookkeeping. Waiting
/// for a lock happens outside of it, so operations on different names do not
/// wait on each other.
///
/// The per-name lock is a [`tokio::sync::RwLock`], which queues waiters fairly
/// in FIFO order: once an exclusive request is waiting, shared requests that
/// arrive after it wait behind it.
///
/// The blocking operations must not be called from within an asynchronous task.
/// Use [`NamedLockTable::read`] and [`NamedLockTable::write`] there.
///
/// Cloning a table yields another handle to the same set of locks.
#[derive(Debug, Clone, Default)]
pub struct NamedLockTable {
    lock_record: Arc<Mutex<LockRecord>>,
}

impl NamedLockTable {
    /// Create a new, empty table.
    pub fn new() -> Self {
        NamedLockTable::default()
    }

    /// Acquire the mutex protecting the table bookkeeping.
    pub(super) fn acquire_mutex(&self) -> MutexGuard<'_, LockRecord> {
        self.lock_record
            .lock()
            .expect("lock record mutex only locked internally")
    }

    /// Acquire exclusive access to `name`, blocking until it is granted.
    ///
    /// The hold lasts until a matching [`NamedLockTable::unlock_exclusive`].
    pub fn lock_exclusive(&self, name: &str) {
        trace!("Acquiring exclusive lock on {}", name);
        let stake = Stake::register(self, name);
        let guard = block_on(stake.lock().write_owned());
        stake.stash(Held::Exclusive(guard));
        trace!("Exclusive lock on {} acquired", name);
    }

    /// Acquire exclusive access to `name` if that is possible without waiting.
    pub fn try_lock_exclusive(&self, name: &str) -> bool {
        let stake = Stake::register(self, name);
        let acquired = stake.lock().try_write_owned();
        match acquired {
            Ok(guard) => {
                stake.stash(Held::Exclusive(guard));
                trace!("Exclusive lock on {} acquired", name);
                true
            }
            Err(_) => {
                trace!("Exclusive lock on {} is busy", name);
                false
            }
        }
    }

    /// Release exclusive access to `name` taken by [`NamedLockTable::lock_exclusive`].
    ///
    /// # Panics
    ///
    /// Panics if `name` is not held exclusively through the explicit lock
    /// operations. That is always a bug in the caller.
    pub fn unlock_exclusive(&self, name: &str) {
        if let Err(err) = self.try_unlock_exclusive(name) {
            panic!("{}", err);
        }
    }

    /// Like [`NamedLockTable::unlock_exclusive`], but reports a release that
    /// matches no acquisition as an error. The table is unchanged in that case.
    pub fn try_unlock_exclusive(&self, name: &str) -> NamedLockResult<()> {
        self.release(name, LockMode::Exclusive)
    }

    /// Acquire shared access to `name`, blocking until it is granted.
    ///
    /// The hold lasts until a matching [`NamedLockTable::unlock_shared`].
    pub fn lock_shared(&self, name: &str) {
        trace!("Acquiring shared lock on {}", name);
        let stake = Stake::register(self, name);
        let guard = block_on(stake.lock().read_owned());
        stake.stash(Held::Shared(guard));
        trace!("Shared lock on {} acquired", name);
    }

    /// Acquire shared access to `name` if that is possible without waiting.
    pub fn try_lock_shared(&self, name: &str) -> bool {
        let stake = Stake::register(self, name);
        let acquired = stake.lock().try_read_owned();
        match acquired {
            Ok(guard) => {
                stake.stash(Held::Shared(guard));
                trace!("Shared lock on {} acquired", name);
                true
            }
            Err(_) => {
                trace!("Shared lock on {} is busy", name);
                false
            }
        }
    }

    /// Release one shared hold on `name` taken by [`NamedLockTable::lock_shared`].
    ///
    /// # Panics
    ///
    /// Panics if `name` is not held shared through the explicit lock
    /// operations.
    pub fn unlock_shared(&self, name: &str) {
        if let Err(err) = self.try_unlock_shared(name) {
            panic!("{}", err);
        }
    }

    /// Like [`NamedLockTable::unlock_shared`], but reports a release that
    /// matches no acquisition as an error.
    pub fn try_unlock_shared(&self, name: &str) -> NamedLockResult<()> {
        self.release(name, LockMode::Shared)
    }

    fn release(&self, name: &str, mode: LockMode) -> NamedLockResult<()> {
        trace!("Releasing {} lock on {}", mode, name);
        let mut lock_record = self.acquire_mutex();
        let result = lock_record.release_stashed(name, mode);
        match result {
            Ok(()) => trace!("Lock table after release: {}", *lock_record),
            Err(ref err) => warn!("Rejected release: {}", err),
        }
        result
    }

    /// The number of names that currently have an entry.
    pub fn len(&self) -> usize {
        self.acquire_mutex().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquire_mutex().entries.is_empty()
    }

    /// Whether `name` currently has an entry, i.e. is held or waited for.
    pub fn contains(&self, name: &str) -> bool {
        self.acquire_mutex().entries.contains_key(name)
    }

    /// The number of holders and waiters that currently refer to `name`.
    /// A debugging aid; the answer may be stale by the time it is returned.
    pub fn references(&self, name: &str) -> usize {
        self.acquire_mutex()
            .entries
            .get(name)
            .map(LockEntry::refcount)
            .unwrap_or(0)
    }
}

impl Display for NamedLockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self.acquire_mutex())
    }
}
