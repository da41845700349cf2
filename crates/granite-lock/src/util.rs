//! Declarative lock acquisition.
//!
//! Query operators and the storage layer do not reason about intent locks;
//! they state what they are about to do (`S` to read, `X` to write) against
//! a context, and [`ensure_sufficient_lock_held`] acquires the least
//! permissive set of locks (ancestor intents included) that makes the
//! access legal.

use std::sync::Arc;

use tracing::trace;

use granite_error::{LockError, LockResult};
use granite_types::LockMode;

use crate::context::LockContext;
use crate::txn::TransactionContext;

/// Ensure `txn` can perform accesses requiring `requested` on `ctx`.
///
/// `requested` must be `NL`, `S` or `X`. Idempotent: once the effective
/// lock type substitutes for the request, the call makes no lock manager
/// mutation. On return, `ctx.get_effective_lock_type(txn)` substitutes for
/// `requested`.
///
/// Ancestors are repaired root-first with the weakest sufficient step
/// (acquire IS/IX, promote IS→IX, promote S→SIX), then the target context
/// itself is acquired, escalated or promoted as its current explicit mode
/// requires.
///
/// # Errors
///
/// `InvalidLock` if `requested` is an intent mode; otherwise whatever the
/// underlying context operations surface (a read-only context on the path,
/// for instance).
pub fn ensure_sufficient_lock_held(
    txn: &Arc<TransactionContext>,
    ctx: &LockContext,
    requested: LockMode,
) -> LockResult<()> {
    match requested {
        LockMode::NoLock => return Ok(()),
        LockMode::Shared | LockMode::Exclusive => {}
        other => {
            return Err(LockError::InvalidLock {
                reason: format!("{other} is not an access mode; request NL, S or X"),
            });
        }
    }

    let id = txn.id();
    let effective = ctx.get_effective_lock_type(id);
    if effective.substitutes(requested) {
        return Ok(());
    }
    trace!(txn = %id, resource = %ctx.name(), %requested, %effective, "repairing lock chain");

    // Repair the ancestor chain, root first.
    let mut chain = Vec::new();
    let mut current = ctx.parent_context();
    while let Some(ancestor) = current {
        current = ancestor.parent_context();
        chain.push(ancestor);
    }
    for ancestor in chain.iter().rev() {
        let held = ancestor.get_explicit_lock_type(id);
        if requested == LockMode::Shared {
            if held == LockMode::NoLock {
                ancestor.acquire(txn, LockMode::IntentShared)?;
            }
        } else {
            match held {
                LockMode::NoLock => ancestor.acquire(txn, LockMode::IntentExclusive)?,
                LockMode::IntentShared => ancestor.promote(txn, LockMode::IntentExclusive)?,
                LockMode::Shared => ancestor.promote(txn, LockMode::SharedIntentExclusive)?,
                // IX, SIX and X already support exclusive descendants.
                _ => {}
            }
        }
    }

    // Fix the target context itself.
    let explicit = ctx.get_explicit_lock_type(id);
    if requested == LockMode::Shared {
        match explicit {
            LockMode::NoLock => ctx.acquire(txn, LockMode::Shared)?,
            LockMode::IntentShared => ctx.escalate(txn)?,
            // Only IX remains: S, SIX and X would have substituted above.
            _ => ctx.promote(txn, LockMode::SharedIntentExclusive)?,
        }
    } else {
        match explicit {
            LockMode::NoLock => ctx.acquire(txn, LockMode::Exclusive)?,
            LockMode::IntentShared => {
                ctx.escalate(txn)?;
                ctx.promote(txn, LockMode::Exclusive)?;
            }
            LockMode::Shared => ctx.promote(txn, LockMode::Exclusive)?,
            // IX and SIX both collapse to X by escalation.
            _ => ctx.escalate(txn)?,
        }
    }
    Ok(())
}
