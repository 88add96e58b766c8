// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt};

use crate::structures::LockMode;

pub type NamedLockResult<T> = Result<T, NamedLockError>;

/// A release that does not match an earlier acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamedLockError {
    /// There is no active entry for the name at all.
    NotAcquired(String),
    /// The name is active, but nobody holds it in `mode` through
    /// the explicit lock operations.
    ModeMismatch { name: String, mode: LockMode },
}

impl NamedLockError {
    /// The name of the lock the failed release referred to.
    pub fn name(&self) -> &str {
        match *self {
            NamedLockError::NotAcquired(ref name)
            | NamedLockError::ModeMismatch { ref name, .. } => name,
        }
    }
}

impl fmt::Display for NamedLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NamedLockError::NotAcquired(ref name) => {
                write!(f, "no named lock acquired: {name}")
            }
            NamedLockError::ModeMismatch { ref name, mode } => {
                write!(f, "named lock {name} is not held in {mode} mode")
            }
        }
    }
}

impl Error for NamedLockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_lock() {
        let err = NamedLockError::NotAcquired("pool-1".into());
        assert_eq!(err.to_string(), "no named lock acquired: pool-1");
        assert_eq!(err.name(), "pool-1");

        let err = NamedLockError::ModeMismatch {
            name: "pool-2".into(),
            mode: LockMode::Exclusive,
        };
        assert_eq!(
            err.to_string(),
            "named lock pool-2 is not held in exclusive mode"
        );
        assert_eq!(err.name(), "pool-2");
    }
}
