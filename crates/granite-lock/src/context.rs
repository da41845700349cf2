//! Hierarchical lock contexts: multigranularity on top of the flat manager.
//!
//! Contexts form a tree mirroring the resource hierarchy (database → table →
//! page → row). Every context delegates the actual grant/release to the flat
//! manager but validates the multigranularity rules first: ancestor intent
//! locks, orphan-free releases, SIX promotion, and escalation.
//!
//! Each node carries a per-transaction count of the locks held on its strict
//! descendants. The count is a true subtree count: every acquire increments
//! the whole ancestor chain, every release decrements it, and the bulk
//! releases inside SIX promotion and escalation roll each released
//! descendant up its own chain.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use granite_error::{LockError, LockResult};
use granite_types::{Lock, LockMode, ResourceName, TxnId};

use crate::manager::LockCore;
use crate::txn::TransactionContext;

/// One node of the context tree. Shared between every handle for the same
/// resource; nodes link upward only, the registry in [`LockCore`] owns them.
pub(crate) struct ContextNode {
    name: ResourceName,
    parent: Option<Arc<ContextNode>>,
    /// Read-only contexts reject every mutating operation.
    readonly: bool,
    /// When set, children created from here on are read-only.
    child_locks_disabled: AtomicBool,
    /// Per-transaction count of locks held on strict descendants.
    num_child_locks: Mutex<HashMap<TxnId, usize>>,
}

impl ContextNode {
    fn new(name: ResourceName, parent: Option<Arc<ContextNode>>, readonly: bool) -> Self {
        Self {
            name,
            parent,
            readonly,
            child_locks_disabled: AtomicBool::new(false),
            num_child_locks: Mutex::new(HashMap::new()),
        }
    }

    fn adjust_count(&self, txn: TxnId, delta: isize) {
        let mut counts = self.num_child_locks.lock();
        let slot = counts.entry(txn).or_insert(0);
        *slot = slot.saturating_add_signed(delta);
        if *slot == 0 {
            counts.remove(&txn);
        }
    }
}

/// Apply `delta` to the subtree counters of every strict ancestor of `node`.
fn adjust_ancestor_counts(node: &ContextNode, txn: TxnId, delta: isize) {
    let mut current = node.parent.as_deref();
    while let Some(ancestor) = current {
        ancestor.adjust_count(txn, delta);
        current = ancestor.parent.as_deref();
    }
}

/// A handle to one point of the lock hierarchy.
///
/// Cheap to clone; all handles for the same resource share one node. Obtain
/// the root via [`LockManager::database_context`] and descend with
/// [`child_context`].
///
/// [`LockManager::database_context`]: crate::manager::LockManager::database_context
/// [`child_context`]: LockContext::child_context
#[derive(Clone)]
pub struct LockContext {
    core: Arc<LockCore>,
    node: Arc<ContextNode>,
}

impl LockContext {
    /// Get or create the top-level context for `segment`.
    pub(crate) fn root(core: &Arc<LockCore>, segment: String) -> LockContext {
        let name = ResourceName::new(segment);
        let node = {
            let mut registry = core.contexts.lock();
            Arc::clone(
                registry
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(ContextNode::new(name, None, false))),
            )
        };
        LockContext {
            core: Arc::clone(core),
            node,
        }
    }

    /// Get or create the child context for `segment`.
    ///
    /// A child created after [`disable_child_locks`] (or under a read-only
    /// context) is read-only; a context's read-only flag is fixed at first
    /// access.
    ///
    /// [`disable_child_locks`]: LockContext::disable_child_locks
    pub fn child_context(&self, segment: impl Into<String>) -> LockContext {
        let name = self.node.name.child(segment);
        let node = {
            let mut registry = self.core.contexts.lock();
            Arc::clone(registry.entry(name.clone()).or_insert_with(|| {
                let readonly = self.node.readonly
                    || self.node.child_locks_disabled.load(Ordering::Acquire);
                Arc::new(ContextNode::new(name, Some(Arc::clone(&self.node)), readonly))
            }))
        };
        LockContext {
            core: Arc::clone(&self.core),
            node,
        }
    }

    /// Child context for a numeric segment (page and row identifiers).
    pub fn child_context_id(&self, id: u64) -> LockContext {
        self.child_context(id.to_string())
    }

    /// The resource this context governs.
    #[must_use]
    pub fn name(&self) -> &ResourceName {
        &self.node.name
    }

    /// The context one level up, or `None` at a top-level context.
    #[must_use]
    pub fn parent_context(&self) -> Option<LockContext> {
        self.node.parent.as_ref().map(|parent| LockContext {
            core: Arc::clone(&self.core),
            node: Arc::clone(parent),
        })
    }

    /// Make all *future* children of this context read-only. Used for index
    /// and temporary-table subtrees, where finer-grained locks are either
    /// impractical or pointless. Existing children are unaffected.
    pub fn disable_child_locks(&self) {
        self.node.child_locks_disabled.store(true, Ordering::Release);
    }

    /// Whether mutating operations are rejected here.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.node.readonly
    }

    /// Acquire `mode` here for `txn`, blocking until granted.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a read-only context; `InvalidLock` for `NL`
    /// or when the parent lock cannot support `mode` at this granularity;
    /// `DuplicateLockRequest` if `txn` already holds a lock here.
    pub fn acquire(&self, txn: &Arc<TransactionContext>, mode: LockMode) -> LockResult<()> {
        self.check_writable()?;
        if mode == LockMode::NoLock {
            return Err(LockError::InvalidLock {
                reason: format!("cannot acquire NL on {}; release the lock instead", self.node.name),
            });
        }
        if self.core.lock_mode(txn.id(), &self.node.name) != LockMode::NoLock {
            return Err(LockError::DuplicateLockRequest {
                txn: txn.id(),
                name: self.node.name.clone(),
            });
        }
        if let Some(parent) = &self.node.parent {
            let parent_mode = self.core.lock_mode(txn.id(), &parent.name);
            if !parent_mode.can_be_parent_of(mode) {
                return Err(LockError::InvalidLock {
                    reason: format!(
                        "{parent_mode} on {} cannot support {mode} on {}",
                        parent.name, self.node.name
                    ),
                });
            }
        }
        self.core.acquire(txn, &self.node.name, mode)?;
        adjust_ancestor_counts(&self.node, txn.id(), 1);
        Ok(())
    }

    /// Release `txn`'s lock here.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a read-only context; `InvalidLock` while
    /// `txn` still holds locks on descendants (their ancestor intents must
    /// outlive them); `NoLockHeld` if nothing is held here.
    pub fn release(&self, txn: &Arc<TransactionContext>) -> LockResult<()> {
        self.check_writable()?;
        let id = txn.id();
        let descendants = self.descendant_locks(id);
        if !descendants.is_empty() {
            return Err(LockError::InvalidLock {
                reason: format!(
                    "{id} still holds {} lock(s) on descendants of {}",
                    descendants.len(),
                    self.node.name
                ),
            });
        }
        self.core.release(txn, &self.node.name)?;
        adjust_ancestor_counts(&self.node, id, -1);
        Ok(())
    }

    /// Promote `txn`'s lock here to `new_mode`.
    ///
    /// Promotion to SIX from IS/IX/S simultaneously releases every S and IS
    /// lock `txn` holds underneath this context, as one atomic
    /// acquire-and-release: SIX already grants shared access to the whole
    /// subtree.
    /// Any other target must substitute for the current mode.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a read-only context; `DuplicateLockRequest`
    /// if `new_mode` is already held; `NoLockHeld` if nothing is held;
    /// `InvalidLock` for a non-promotion or a SIX under a SIX ancestor.
    pub fn promote(&self, txn: &Arc<TransactionContext>, new_mode: LockMode) -> LockResult<()> {
        self.check_writable()?;
        let id = txn.id();
        let old = self.core.lock_mode(id, &self.node.name);
        if old != LockMode::NoLock && old == new_mode {
            return Err(LockError::DuplicateLockRequest {
                txn: id,
                name: self.node.name.clone(),
            });
        }
        if old == LockMode::NoLock {
            return Err(LockError::NoLockHeld {
                txn: id,
                name: self.node.name.clone(),
            });
        }

        if new_mode == LockMode::SharedIntentExclusive {
            if !matches!(
                old,
                LockMode::IntentShared | LockMode::IntentExclusive | LockMode::Shared
            ) {
                return Err(LockError::InvalidLock {
                    reason: format!("cannot promote {old} to SIX on {}", self.node.name),
                });
            }
            if self.has_six_ancestor(id) {
                return Err(LockError::InvalidLock {
                    reason: format!(
                        "an ancestor of {} already holds SIX for {id}",
                        self.node.name
                    ),
                });
            }
            let sis = self.sis_descendants(id);
            let mut names = sis.clone();
            names.push(self.node.name.clone());
            debug!(
                txn = %id,
                resource = %self.node.name,
                absorbed = sis.len(),
                "promoting to SIX"
            );
            self.core
                .acquire_and_release(txn, &self.node.name, new_mode, &names)?;
            for released in &sis {
                self.roll_up_release(released, id);
            }
            Ok(())
        } else {
            if !new_mode.substitutes(old) {
                return Err(LockError::InvalidLock {
                    reason: format!(
                        "{new_mode} is not a promotion from {old} on {}",
                        self.node.name
                    ),
                });
            }
            self.core.promote(txn, &self.node.name, new_mode)
        }
    }

    /// Collapse every lock `txn` holds underneath this context into a single
    /// lock here: X when the current rights include any exclusive flavour
    /// (IX, SIX or X, either here or on a descendant), S otherwise. One
    /// atomic call to the flat manager; idempotent, so escalating an already
    /// escalated context is a no-op.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` on a read-only context; `NoLockHeld` if `txn`
    /// holds nothing here.
    pub fn escalate(&self, txn: &Arc<TransactionContext>) -> LockResult<()> {
        self.check_writable()?;
        let id = txn.id();
        let explicit = self.core.lock_mode(id, &self.node.name);
        if explicit == LockMode::NoLock {
            return Err(LockError::NoLockHeld {
                txn: id,
                name: self.node.name.clone(),
            });
        }
        let descendants = self.descendant_locks(id);
        if descendants.is_empty()
            && matches!(explicit, LockMode::Shared | LockMode::Exclusive)
        {
            return Ok(());
        }

        let exclusive_flavour = |mode: LockMode| {
            matches!(
                mode,
                LockMode::IntentExclusive | LockMode::SharedIntentExclusive | LockMode::Exclusive
            )
        };
        let target = if exclusive_flavour(explicit)
            || descendants.iter().any(|lock| exclusive_flavour(lock.mode))
        {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };

        let mut names: Vec<ResourceName> =
            descendants.iter().map(|lock| lock.name.clone()).collect();
        names.push(self.node.name.clone());
        debug!(
            txn = %id,
            resource = %self.node.name,
            %target,
            collapsed = descendants.len(),
            "escalating subtree"
        );
        self.core
            .acquire_and_release(txn, &self.node.name, target, &names)?;
        for lock in &descendants {
            self.roll_up_release(&lock.name, id);
        }
        Ok(())
    }

    /// The mode `txn` holds *at this context*, or `NL`.
    #[must_use]
    pub fn get_explicit_lock_type(&self, txn: TxnId) -> LockMode {
        self.core.lock_mode(txn, &self.node.name)
    }

    /// The mode `txn` effectively has here, counting ancestors: an explicit
    /// lock wins; otherwise an X anywhere above grants X, an S or SIX above
    /// grants S, and nothing above grants NL.
    #[must_use]
    pub fn get_effective_lock_type(&self, txn: TxnId) -> LockMode {
        let explicit = self.get_explicit_lock_type(txn);
        if explicit != LockMode::NoLock {
            return explicit;
        }
        let mut inherited_shared = false;
        let mut current = self.node.parent.as_deref();
        while let Some(ancestor) = current {
            match self.core.lock_mode(txn, &ancestor.name) {
                LockMode::Exclusive => return LockMode::Exclusive,
                LockMode::Shared | LockMode::SharedIntentExclusive => inherited_shared = true,
                _ => {}
            }
            current = ancestor.parent.as_deref();
        }
        if inherited_shared {
            LockMode::Shared
        } else {
            LockMode::NoLock
        }
    }

    /// Number of locks `txn` holds on strict descendants of this context.
    #[must_use]
    pub fn get_num_children(&self, txn: TxnId) -> usize {
        self.node
            .num_child_locks
            .lock()
            .get(&txn)
            .copied()
            .unwrap_or(0)
    }

    /// True iff some strict ancestor holds SIX for `txn`.
    fn has_six_ancestor(&self, txn: TxnId) -> bool {
        let mut current = self.node.parent.as_deref();
        while let Some(ancestor) = current {
            if self.core.lock_mode(txn, &ancestor.name) == LockMode::SharedIntentExclusive {
                return true;
            }
            current = ancestor.parent.as_deref();
        }
        false
    }

    /// Names of the S and IS locks `txn` holds on strict descendants.
    fn sis_descendants(&self, txn: TxnId) -> Vec<ResourceName> {
        self.core
            .locks_held_by(txn)
            .into_iter()
            .filter(|lock| {
                matches!(lock.mode, LockMode::Shared | LockMode::IntentShared)
                    && lock.name.is_descendant_of(&self.node.name)
            })
            .map(|lock| lock.name)
            .collect()
    }

    /// Every lock `txn` holds on strict descendants of this context.
    fn descendant_locks(&self, txn: TxnId) -> Vec<Lock> {
        self.core
            .locks_held_by(txn)
            .into_iter()
            .filter(|lock| lock.name.is_descendant_of(&self.node.name))
            .collect()
    }

    /// Roll a released descendant lock up its ancestor chain, decrementing
    /// each subtree counter. Locks taken directly against the flat manager
    /// have no registered context and are skipped.
    fn roll_up_release(&self, released: &ResourceName, txn: TxnId) {
        let node = self.core.contexts.lock().get(released).cloned();
        if let Some(node) = node {
            adjust_ancestor_counts(&node, txn, -1);
        }
    }

    fn check_writable(&self) -> LockResult<()> {
        if self.node.readonly {
            return Err(LockError::UnsupportedOperation {
                name: self.node.name.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.node.name)
            .field("readonly", &self.node.readonly)
            .finish()
    }
}

impl fmt::Display for LockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockContext({})", self.node.name)
    }
}
