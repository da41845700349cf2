//! Transaction identifiers and the lock value.

use std::fmt;

use crate::{LockMode, ResourceName};

/// Transaction identifier, assigned by the transaction layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// A granted lock: one transaction holding one mode on one resource.
///
/// The manager retains at most one lock per `(txn, name)` pair, and never a
/// lock with mode `NL`; absence of a lock is how `NL` is represented.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Lock {
    pub name: ResourceName,
    pub mode: LockMode,
    pub txn: TxnId,
}

impl Lock {
    #[must_use]
    pub fn new(name: ResourceName, mode: LockMode, txn: TxnId) -> Self {
        Self { name, mode, txn }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) by {}", self.mode, self.name, self.txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_renders_mode_resource_and_owner() {
        let lock = Lock::new(
            ResourceName::new("database").child("users"),
            LockMode::IntentExclusive,
            TxnId::new(7),
        );
        assert_eq!(lock.to_string(), "IX(database/users) by txn#7");
    }
}
