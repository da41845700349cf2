//! Error types for the GraniteDB lock subsystem.
//!
//! Every failure a caller can observe is one of the four variants below.
//! Validation always runs before any bookkeeping mutation, so an `Err`
//! return means the manager state is exactly what it was before the call.
//! Blocking is *not* an error: a transaction parked on a wait queue simply
//! has not returned yet.

use granite_types::{ResourceName, TxnId};
use thiserror::Error;

/// Result alias used across the lock subsystem.
pub type LockResult<T> = Result<T, LockError>;

/// Failure modes of the lock manager and the lock-context hierarchy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The transaction already holds a lock on the resource (plain acquire),
    /// or already holds exactly the requested mode (promotion).
    #[error("{txn} already holds a lock on {name}")]
    DuplicateLockRequest { txn: TxnId, name: ResourceName },

    /// The operation expects a pre-existing lock the transaction does not hold.
    #[error("{txn} holds no lock on {name}")]
    NoLockHeld { txn: TxnId, name: ResourceName },

    /// A multigranularity or substitutability rule was violated: invalid
    /// promotion, redundant SIX under a SIX ancestor, releasing an ancestor
    /// while descendant locks are held, or acquiring `NL`.
    #[error("invalid lock request: {reason}")]
    InvalidLock { reason: String },

    /// Mutating call on a read-only lock context (indices, temporary tables).
    #[error("lock context {name} is read-only")]
    UnsupportedOperation { name: ResourceName },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_parties() {
        let err = LockError::DuplicateLockRequest {
            txn: TxnId::new(3),
            name: ResourceName::new("database").child("users"),
        };
        assert_eq!(
            err.to_string(),
            "txn#3 already holds a lock on database/users"
        );

        let err = LockError::UnsupportedOperation {
            name: ResourceName::new("database").child("idx_users"),
        };
        assert_eq!(err.to_string(), "lock context database/idx_users is read-only");
    }
}
