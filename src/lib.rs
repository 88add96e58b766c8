// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read-write locks addressed by arbitrary string names.
//!
//! A [`NamedLockTable`] creates the lock for a name the first time somebody asks
//! for it and forgets it again as soon as no holder or waiter refers to it, so
//! the set of names in use may grow and shrink without bound.
//!
//! ```
//! use named_rwlock::NamedLockTable;
//!
//! let table = NamedLockTable::new();
//! table.lock_exclusive("a");
//! table.lock_shared("b");
//! assert_eq!(table.len(), 2);
//! table.unlock_exclusive("a");
//! table.unlock_shared("b");
//! assert!(table.is_empty());
//! ```

#[macro_use]
extern crate log;

mod errors;
mod structures;

pub use crate::{
    errors::{NamedLockError, NamedLockResult},
    structures::{LockMode, NamedLockTable, NamedReadGuard, NamedWriteGuard},
};
