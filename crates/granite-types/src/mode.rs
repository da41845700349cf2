//! Lock modes and the multigranularity lock algebra.
//!
//! The three predicates here ([`LockMode::compatible`],
//! [`LockMode::substitutes`], [`LockMode::can_be_parent_of`]) are total, pure
//! and `const`; every locking decision in the manager reduces to them.

use std::fmt;

/// Lock mode held on (or requested for) one node of the resource hierarchy.
///
/// Rendered with the conventional short names (`NL`, `IS`, `IX`, `S`, `SIX`,
/// `X`) by `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockMode {
    /// No lock.
    NoLock,
    /// Intent to take shared locks at finer granularity.
    IntentShared,
    /// Intent to take exclusive locks at finer granularity.
    IntentExclusive,
    /// Shared access to this resource and everything beneath it.
    Shared,
    /// Shared access here, plus intent-exclusive on descendants.
    SharedIntentExclusive,
    /// Exclusive access to this resource and everything beneath it.
    Exclusive,
}

impl LockMode {
    /// Every mode, for exhaustive table checks.
    pub const ALL: [LockMode; 6] = [
        LockMode::NoLock,
        LockMode::IntentShared,
        LockMode::IntentExclusive,
        LockMode::Shared,
        LockMode::SharedIntentExclusive,
        LockMode::Exclusive,
    ];

    /// True iff two *distinct* transactions may hold `self` and `other` on
    /// the same resource at the same time. Symmetric.
    #[must_use]
    pub const fn compatible(self, other: LockMode) -> bool {
        use LockMode::{
            Exclusive, IntentExclusive, IntentShared, NoLock, Shared, SharedIntentExclusive,
        };
        match (self, other) {
            (NoLock, _) | (_, NoLock) => true,
            (IntentShared, Exclusive) | (Exclusive, IntentShared) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (IntentExclusive, _) | (_, IntentExclusive) => false,
            (Shared, Shared) => true,
            (Shared, _) | (_, Shared) => false,
            (SharedIntentExclusive, _) | (_, SharedIntentExclusive) => false,
            (Exclusive, Exclusive) => false,
        }
    }

    /// True iff holding `self` on a resource grants every right that holding
    /// `requested` would. Reflexive; everything substitutes for `NL`.
    ///
    /// `X` does *not* substitute for `SIX` (it carries no standing
    /// intent-exclusive declaration for descendants), and `SIX` does not
    /// substitute for `X`.
    #[must_use]
    pub const fn substitutes(self, requested: LockMode) -> bool {
        use LockMode::{
            Exclusive, IntentExclusive, IntentShared, NoLock, Shared, SharedIntentExclusive,
        };
        match (self, requested) {
            (_, NoLock) => true,
            (NoLock, _) => false,
            (IntentShared, IntentShared) => true,
            (IntentShared, _) => false,
            (IntentExclusive, IntentShared | IntentExclusive) => true,
            (IntentExclusive, _) => false,
            (Shared, IntentShared | Shared) => true,
            (Shared, _) => false,
            (SharedIntentExclusive, Exclusive) => false,
            (SharedIntentExclusive, _) => true,
            (Exclusive, SharedIntentExclusive) => false,
            (Exclusive, _) => true,
        }
    }

    /// True iff a transaction holding `self` on a resource may hold `child`
    /// on a direct descendant of that resource.
    #[must_use]
    pub const fn can_be_parent_of(self, child: LockMode) -> bool {
        use LockMode::{
            Exclusive, IntentExclusive, IntentShared, NoLock, Shared, SharedIntentExclusive,
        };
        match (self, child) {
            (_, NoLock) => true,
            (NoLock, _) => false,
            (IntentShared | Shared, IntentShared | Shared) => true,
            (IntentShared | Shared, _) => false,
            (IntentExclusive | SharedIntentExclusive | Exclusive, _) => true,
        }
    }

    /// True for the modes that declare intent on descendants (IS, IX, SIX).
    #[must_use]
    pub const fn is_intent(self) -> bool {
        matches!(
            self,
            LockMode::IntentShared | LockMode::IntentExclusive | LockMode::SharedIntentExclusive
        )
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = match self {
            LockMode::NoLock => "NL",
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::SharedIntentExclusive => "SIX",
            LockMode::Exclusive => "X",
        };
        f.write_str(short)
    }
}
