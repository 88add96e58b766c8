// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt, sync::Arc};

use futures::executor::block_on;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::structures::{
    entry::Held,
    lock::{LockRecord, NamedLockTable},
};

/// One reference on the entry for a name, taken before waiting for its lock.
///
/// Whoever ends up owning the stake gives the reference back: a guard when it
/// is dropped, the entry itself when the hold is stashed, or the stake's own
/// `Drop` when the acquisition is abandoned, e.g. a future dropped while it
/// was still waiting.
#[derive(Debug)]
pub(super) struct Stake {
    table: NamedLockTable,
    name: String,
    lock: Arc<RwLock<()>>,
    live: bool,
}

impl Stake {
    pub(super) fn register(table: &NamedLockTable, name: &str) -> Stake {
        let lock = table.acquire_mutex().add_reference(name);
        Stake {
            table: table.clone(),
            name: name.to_owned(),
            lock,
            live: true,
        }
    }

    pub(super) fn lock(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.lock)
    }

    /// Move the hold and this reference into the table entry.
    pub(super) fn stash(mut self, held: Held) {
        let mut lock_record = self.table.acquire_mutex();
        lock_record.stash(&self.name, held);
        self.live = false;
        trace!("Lock table after acquisition: {}", *lock_record);
    }

    /// Give the reference back. The table mutex must be held by the caller.
    fn release(&mut self, lock_record: &mut LockRecord) {
        if self.live {
            lock_record.remove_reference(&self.name);
            self.live = false;
        }
    }
}

impl Drop for Stake {
    fn drop(&mut self) {
        if self.live {
            trace!("Withdrawing unused reference on lock {}", self.name);
            let table = self.table.clone();
            let mut lock_record = table.acquire_mutex();
            self.release(&mut lock_record);
        }
    }
}

/// Exclusive access to a name for as long as the guard lives.
pub struct NamedWriteGuard {
    stake: Stake,
    inner: Option<OwnedRwLockWriteGuard<()>>,
}

impl NamedWriteGuard {
    pub fn name(&self) -> &str {
        &self.stake.name
    }
}

impl fmt::Debug for NamedWriteGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedWriteGuard")
            .field("name", &self.stake.name)
            .finish()
    }
}

impl Drop for NamedWriteGuard {
    fn drop(&mut self) {
        trace!("Dropping exclusive lock on {}", self.stake.name);
        let table = self.stake.table.clone();
        let mut lock_record = table.acquire_mutex();
        drop(self.inner.take());
        self.stake.release(&mut lock_record);
        trace!("Lock table after release: {}", *lock_record);
    }
}

/// Shared access to a name for as long as the guard lives.
pub struct NamedReadGuard {
    stake: Stake,
    inner: Option<OwnedRwLockReadGuard<()>>,
}

impl NamedReadGuard {
    pub fn name(&self) -> &str {
        &self.stake.name
    }
}

impl fmt::Debug for NamedReadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedReadGuard")
            .field("name", &self.stake.name)
            .finish()
    }
}

impl Drop for NamedReadGuard {
    fn drop(&mut self) {
        trace!("Dropping shared lock on {}", self.stake.name);
        let table = self.stake.table.clone();
        let mut lock_record = table.acquire_mutex();
        drop(self.inner.take());
        self.stake.release(&mut lock_record);
        trace!("Lock table after release: {}", *lock_record);
    }
}

impl NamedLockTable {
    /// Wait for exclusive access to `name`.
    ///
    /// If the returned future is dropped before it completes, the table
    /// forgets the request again.
    pub async fn write(&self, name: &str) -> NamedWriteGuard {
        trace!("Acquiring exclusive lock on {}", name);
        let stake = Stake::register(self, name);
        let inner = stake.lock().write_owned().await;
        trace!("Exclusive lock on {} acquired", name);
        NamedWriteGuard {
            stake,
            inner: Some(inner),
        }
    }

    pub fn blocking_write(&self, name: &str) -> NamedWriteGuard {
        block_on(self.write(name))
    }

    pub fn try_write(&self, name: &str) -> Option<NamedWriteGuard> {
        let stake = Stake::register(self, name);
        let inner = stake.lock().try_write_owned().ok()?;
        trace!("Exclusive lock on {} acquired", name);
        Some(NamedWriteGuard {
            stake,
            inner: Some(inner),
        })
    }

    /// Wait for shared access to `name`.
    ///
    /// If the returned future is dropped before it completes, the table
    /// forgets the request again.
    pub async fn read(&self, name: &str) -> NamedReadGuard {
        trace!("Acquiring shared lock on {}", name);
        let stake = Stake::register(self, name);
        let inner = stake.lock().read_owned().await;
        trace!("Shared lock on {} acquired", name);
        NamedReadGuard {
            stake,
            inner: Some(inner),
        }
    }

    pub fn blocking_read(&self, name: &str) -> NamedReadGuard {
        block_on(self.read(name))
    }

    pub fn try_read(&self, name: &str) -> Option<NamedReadGuard> {
        let stake = Stake::register(self, name);
        let inner = stake.lock().try_read_owned().ok()?;
        trace!("Shared lock on {} acquired", name);
        Some(NamedReadGuard {
            stake,
            inner: Some(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::{errors::NamedLockError, structures::entry::LockMode};

    #[test]
    fn test_guards_release_on_drop() {
        let table = NamedLockTable::new();

        let writer = table.blocking_write("a");
        assert_eq!(writer.name(), "a");
        assert!(table.try_read("a").is_none());
        assert!(table.try_write("a").is_none());
        assert_eq!(table.references("a"), 1);
        drop(writer);
        assert!(table.is_empty());

        let first = table.blocking_read("a");
        let second = table.try_read("a").unwrap();
        assert!(table.try_write("a").is_none());
        assert_eq!(table.references("a"), 2);
        drop(first);
        assert!(table.contains("a"));
        drop(second);
        assert!(table.is_empty());
    }

    #[test]
    // Guards and the explicit operations exclude each other, but an explicit
    // unlock cannot release a guard's hold.
    fn test_guards_and_explicit_holds() {
        let table = NamedLockTable::new();

        let reader = table.blocking_read("a");
        assert!(table.try_lock_shared("a"));
        assert!(!table.try_lock_exclusive("a"));
        table.unlock_shared("a");
        assert_matches!(
            table.try_unlock_shared("a"),
            Err(NamedLockError::ModeMismatch {
                mode: LockMode::Shared,
                ..
            })
        );
        assert_eq!(table.references("a"), 1);
        drop(reader);
        assert!(table.is_empty());

        table.lock_exclusive("a");
        assert!(table.try_write("a").is_none());
        assert!(table.try_read("a").is_none());
        table.unlock_exclusive("a");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_async_write_waits_for_read() {
        let table = NamedLockTable::new();
        let x = Arc::new(AtomicUsize::new(0));

        let reader = table.read("a").await;
        let writer = {
            let table = table.clone();
            let x = Arc::clone(&x);
            tokio::spawn(async move {
                let guard = table.write("a").await;
                x.fetch_add(1, Ordering::SeqCst);
                drop(guard);
            })
        };

        sleep(Duration::from_millis(50)).await;
        assert_eq!(x.load(Ordering::SeqCst), 0);
        assert_eq!(table.references("a"), 2);
        drop(reader);

        writer.await.unwrap();
        assert_eq!(x.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    // A shared request queued behind a waiting writer is served after it.
    async fn test_waiting_writer_goes_first() {
        let table = NamedLockTable::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let reader = table.read("a").await;
        let writer = {
            let table = table.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = table.write("a").await;
                order.lock().unwrap().push("write");
            })
        };
        while table.references("a") < 2 {
            sleep(Duration::from_millis(5)).await;
        }
        let late_reader = {
            let table = table.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = table.read("a").await;
                order.lock().unwrap().push("read");
            })
        };
        while table.references("a") < 3 {
            sleep(Duration::from_millis(5)).await;
        }

        drop(reader);
        writer.await.unwrap();
        late_reader.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["write", "read"]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_withdraws_reference() {
        let table = NamedLockTable::new();

        let writer = table.write("a").await;
        assert_eq!(table.references("a"), 1);

        assert!(timeout(Duration::from_millis(50), table.write("a"))
            .await
            .is_err());
        assert!(timeout(Duration::from_millis(50), table.read("a"))
            .await
            .is_err());
        assert_eq!(table.references("a"), 1);

        drop(writer);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_on_new_name() {
        let table = NamedLockTable::new();

        // Never polled, so never registered.
        let pending = table.write("b");
        drop(pending);
        assert!(table.is_empty());

        let reader = table.read("b").await;
        let mut pending = Box::pin(table.write("b"));
        assert!(futures::poll!(pending.as_mut()).is_pending());
        assert_eq!(table.references("b"), 2);
        drop(pending);
        assert_eq!(table.references("b"), 1);
        drop(reader);
        assert!(table.is_empty());
    }
}
