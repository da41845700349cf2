//! The flat lock manager: per-resource grant lists and FIFO wait queues.
//!
//! This layer knows nothing about granularity. It maps resources to granted
//! locks and parked requests, maps transactions to the locks they hold (in
//! acquisition order), enforces the compatibility matrix, and parks/wakes
//! transaction threads. Multigranularity rules live one layer up, in
//! [`crate::context::LockContext`], which callers should normally use
//! instead of this type.
//!
//! All bookkeeping is guarded by a single process-wide mutex. Operations
//! that park the caller do so *after* dropping that mutex: the pattern is
//! validate and mutate under the lock (arming the transaction's wait state
//! while still inside), release the lock, then block. Queue processing on
//! release runs entirely under the mutex and wakes granted transactions
//! inline; waking is a latched signal, never a join, so that is safe.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use granite_error::{LockError, LockResult};
use granite_types::{Lock, LockMode, ResourceName, TxnId};

use crate::context::{ContextNode, LockContext};
use crate::txn::TransactionContext;

/// A lock request parked on a resource's wait queue.
struct QueuedRequest {
    txn: Arc<TransactionContext>,
    lock: Lock,
    /// Locks to release in the same atomic step once `lock` is granted.
    release: SmallVec<[Lock; 4]>,
}

/// Grant list and wait queue for a single resource.
#[derive(Default)]
struct ResourceEntry {
    /// Currently granted locks, in grant order.
    granted: Vec<Lock>,
    /// Requests that could not be satisfied when they were made.
    queue: VecDeque<QueuedRequest>,
}

impl ResourceEntry {
    /// True iff `mode` is compatible with every granted lock not held by
    /// `except` (a transaction replacing its own lock ignores itself).
    fn check_compatible(&self, mode: LockMode, except: TxnId) -> bool {
        self.granted
            .iter()
            .all(|lock| lock.txn == except || lock.mode.compatible(mode))
    }

    fn mode_held_by(&self, txn: TxnId) -> LockMode {
        self.granted
            .iter()
            .find(|lock| lock.txn == txn)
            .map_or(LockMode::NoLock, |lock| lock.mode)
    }
}

/// Flat bookkeeping, all of it guarded by the single manager mutex.
#[derive(Default)]
struct ManagerState {
    resources: HashMap<ResourceName, ResourceEntry>,
    /// Locks held by each transaction. Order is first-acquisition order per
    /// resource; in-place replacement keeps the original position.
    txn_locks: HashMap<TxnId, Vec<Lock>>,
}

impl ManagerState {
    fn entry(&mut self, name: &ResourceName) -> &mut ResourceEntry {
        self.resources.entry(name.clone()).or_default()
    }

    fn mode_held(&self, txn: TxnId, name: &ResourceName) -> LockMode {
        self.resources
            .get(name)
            .map_or(LockMode::NoLock, |entry| entry.mode_held_by(txn))
    }

    /// Install `lock`, replacing the transaction's existing lock on the same
    /// resource in place (so acquisition order is preserved), or appending
    /// to both the grant list and the transaction's lock list otherwise.
    fn grant_or_update(&mut self, lock: Lock) {
        let entry = self.resources.entry(lock.name.clone()).or_default();
        match entry.granted.iter_mut().find(|held| held.txn == lock.txn) {
            Some(slot) => *slot = lock.clone(),
            None => entry.granted.push(lock.clone()),
        }
        let held = self.txn_locks.entry(lock.txn).or_default();
        match held.iter_mut().find(|held| held.name == lock.name) {
            Some(slot) => *slot = lock,
            None => held.push(lock),
        }
    }

    /// Drop `txn`'s lock on `name` from both tables, then process the
    /// resource's queue.
    fn release_and_process(&mut self, txn: TxnId, name: &ResourceName) {
        if let Some(entry) = self.resources.get_mut(name) {
            entry.granted.retain(|lock| lock.txn != txn);
        }
        if let Some(held) = self.txn_locks.get_mut(&txn) {
            held.retain(|lock| &lock.name != name);
        }
        self.process_queue(name);
    }

    /// Grant parked requests from the front of `name`'s queue until the head
    /// is incompatible with the remaining grants. Strictly order-preserving:
    /// a later compatible request never overtakes an earlier blocked one.
    ///
    /// Granting a request performs its bundled releases, each of which
    /// recurses into the released resource's queue. Every step removes a
    /// queue entry or a granted lock, so the recursion terminates.
    fn process_queue(&mut self, name: &ResourceName) {
        loop {
            let request = {
                let Some(entry) = self.resources.get_mut(name) else {
                    return;
                };
                let Some(head) = entry.queue.front() else {
                    return;
                };
                if !entry.check_compatible(head.lock.mode, head.lock.txn) {
                    return;
                }
                entry.queue.pop_front()
            };
            let Some(request) = request else {
                return;
            };

            trace!(lock = %request.lock, "granting queued request");
            self.grant_or_update(request.lock.clone());
            for released in &request.release {
                if released.name != request.lock.name {
                    self.release_and_process(released.txn, &released.name);
                }
            }
            debug!(txn = %request.txn, resource = %name, "waking granted transaction");
            request.txn.unblock();
        }
    }
}

/// State shared between the [`LockManager`] handle and every
/// [`LockContext`] handle derived from it.
pub(crate) struct LockCore {
    state: Mutex<ManagerState>,
    /// Every lock context ever created, keyed by full resource name.
    pub(crate) contexts: Mutex<HashMap<ResourceName, Arc<ContextNode>>>,
}

impl LockCore {
    fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire `mode` on `name`. Grants immediately iff the request is
    /// compatible with all granted locks *and* the wait queue is empty;
    /// otherwise parks the caller at the back of the queue.
    pub(crate) fn acquire(
        &self,
        txn: &Arc<TransactionContext>,
        name: &ResourceName,
        mode: LockMode,
    ) -> LockResult<()> {
        if mode == LockMode::NoLock {
            return Err(LockError::InvalidLock {
                reason: format!("cannot acquire NL on {name}; release the lock instead"),
            });
        }
        let must_wait = {
            let mut state = self.state.lock();
            if state.mode_held(txn.id(), name) != LockMode::NoLock {
                return Err(LockError::DuplicateLockRequest {
                    txn: txn.id(),
                    name: name.clone(),
                });
            }
            let lock = Lock::new(name.clone(), mode, txn.id());
            let entry = state.entry(name);
            let grantable = entry.queue.is_empty() && entry.check_compatible(mode, txn.id());
            if grantable {
                trace!(lock = %lock, "granting lock");
                state.grant_or_update(lock);
                false
            } else {
                txn.prepare_block();
                debug!(lock = %lock, "lock unavailable; parking at queue tail");
                state.entry(name).queue.push_back(QueuedRequest {
                    txn: Arc::clone(txn),
                    lock,
                    release: SmallVec::new(),
                });
                true
            }
        };
        if must_wait {
            txn.block();
        }
        Ok(())
    }

    /// Release `txn`'s lock on `name` and process the queue.
    pub(crate) fn release(&self, txn: &TransactionContext, name: &ResourceName) -> LockResult<()> {
        let mut state = self.state.lock();
        if state.mode_held(txn.id(), name) == LockMode::NoLock {
            return Err(LockError::NoLockHeld {
                txn: txn.id(),
                name: name.clone(),
            });
        }
        trace!(txn = %txn, resource = %name, "releasing lock");
        state.release_and_process(txn.id(), name);
        Ok(())
    }

    /// Replace `txn`'s lock on `name` with `new_mode`. The replacement keeps
    /// the lock's position in the transaction's acquisition order. An
    /// incompatible promotion parks the caller at the *front* of the queue:
    /// the transaction already holds a lock here and must not be starved by
    /// newer acquisitions.
    pub(crate) fn promote(
        &self,
        txn: &Arc<TransactionContext>,
        name: &ResourceName,
        new_mode: LockMode,
    ) -> LockResult<()> {
        let must_wait = {
            let mut state = self.state.lock();
            let old = state.mode_held(txn.id(), name);
            if old != LockMode::NoLock && old == new_mode {
                return Err(LockError::DuplicateLockRequest {
                    txn: txn.id(),
                    name: name.clone(),
                });
            }
            if old == LockMode::NoLock {
                return Err(LockError::NoLockHeld {
                    txn: txn.id(),
                    name: name.clone(),
                });
            }
            if !new_mode.substitutes(old) {
                return Err(LockError::InvalidLock {
                    reason: format!("{new_mode} is not a promotion from {old} on {name}"),
                });
            }
            let lock = Lock::new(name.clone(), new_mode, txn.id());
            if state.entry(name).check_compatible(new_mode, txn.id()) {
                trace!(lock = %lock, %old, "promoting in place");
                state.grant_or_update(lock);
                false
            } else {
                txn.prepare_block();
                debug!(lock = %lock, %old, "promotion blocked; parking at queue head");
                state.entry(name).queue.push_front(QueuedRequest {
                    txn: Arc::clone(txn),
                    lock,
                    release: SmallVec::new(),
                });
                true
            }
        };
        if must_wait {
            txn.block();
        }
        Ok(())
    }

    /// Acquire `mode` on `name` and release every lock in `release_names`,
    /// as one atomic step. A lock on `name` itself may appear in
    /// `release_names`, in which case it is replaced in place (acquisition
    /// order preserved) rather than released.
    ///
    /// Grants immediately iff `mode` is compatible with the other
    /// transactions' locks on `name`; parked queue entries do not defer a
    /// compatible grant, since the caller already holds a lock here and the
    /// operation is effectively a promotion. Otherwise the request parks at
    /// the *front* of the queue with its releases bundled; they happen when
    /// the grant does.
    pub(crate) fn acquire_and_release(
        &self,
        txn: &Arc<TransactionContext>,
        name: &ResourceName,
        mode: LockMode,
        release_names: &[ResourceName],
    ) -> LockResult<()> {
        if mode == LockMode::NoLock {
            return Err(LockError::InvalidLock {
                reason: format!("cannot acquire NL on {name}; release the lock instead"),
            });
        }
        let must_wait = {
            let mut state = self.state.lock();
            let held_here = state.mode_held(txn.id(), name);
            if held_here != LockMode::NoLock && !release_names.contains(name) {
                return Err(LockError::DuplicateLockRequest {
                    txn: txn.id(),
                    name: name.clone(),
                });
            }
            for released in release_names {
                if state.mode_held(txn.id(), released) == LockMode::NoLock {
                    return Err(LockError::NoLockHeld {
                        txn: txn.id(),
                        name: released.clone(),
                    });
                }
            }
            let lock = Lock::new(name.clone(), mode, txn.id());
            if state.entry(name).check_compatible(mode, txn.id()) {
                trace!(lock = %lock, releases = release_names.len(), "granting acquire-and-release");
                state.grant_or_update(lock);
                for released in release_names {
                    if released != name {
                        state.release_and_process(txn.id(), released);
                    }
                }
                false
            } else {
                let release: SmallVec<[Lock; 4]> = release_names
                    .iter()
                    .map(|released| {
                        Lock::new(released.clone(), state.mode_held(txn.id(), released), txn.id())
                    })
                    .collect();
                txn.prepare_block();
                debug!(lock = %lock, releases = release.len(), "acquire-and-release blocked; parking at queue head");
                state.entry(name).queue.push_front(QueuedRequest {
                    txn: Arc::clone(txn),
                    lock,
                    release,
                });
                true
            }
        };
        if must_wait {
            txn.block();
        }
        Ok(())
    }

    /// `txn`'s lock mode on `name`, or `NL`.
    pub(crate) fn lock_mode(&self, txn: TxnId, name: &ResourceName) -> LockMode {
        self.state.lock().mode_held(txn, name)
    }

    /// Snapshot of the granted locks on `name`, in grant order.
    pub(crate) fn locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|entry| entry.granted.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the locks `txn` holds, in acquisition order.
    pub(crate) fn locks_held_by(&self, txn: TxnId) -> Vec<Lock> {
        self.state
            .lock()
            .txn_locks
            .get(&txn)
            .cloned()
            .unwrap_or_default()
    }
}

/// The lock manager owned by the database instance.
///
/// Cheap to clone; clones share all state. Use [`database_context`] /
/// [`context`] to enter the hierarchical layer, or call the flat operations
/// directly when granularity does not apply.
///
/// [`database_context`]: LockManager::database_context
/// [`context`]: LockManager::context
#[derive(Clone)]
pub struct LockManager {
    pub(crate) core: Arc<LockCore>,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(LockCore::new()),
        }
    }

    /// Acquire `mode` on `name` for `txn`, parking the calling thread until
    /// the lock is granted.
    ///
    /// # Errors
    ///
    /// `DuplicateLockRequest` if `txn` already holds any lock on `name`;
    /// `InvalidLock` for `NL`.
    pub fn acquire(
        &self,
        txn: &Arc<TransactionContext>,
        name: &ResourceName,
        mode: LockMode,
    ) -> LockResult<()> {
        self.core.acquire(txn, name, mode)
    }

    /// Release `txn`'s lock on `name`, waking queued transactions whose
    /// requests become satisfiable.
    ///
    /// # Errors
    ///
    /// `NoLockHeld` if `txn` holds no lock on `name`.
    pub fn release(&self, txn: &TransactionContext, name: &ResourceName) -> LockResult<()> {
        self.core.release(txn, name)
    }

    /// Promote `txn`'s lock on `name` to `new_mode`, parking the calling
    /// thread if other transactions' locks conflict.
    ///
    /// # Errors
    ///
    /// `DuplicateLockRequest` if `new_mode` is already held; `NoLockHeld`
    /// if nothing is held; `InvalidLock` if `new_mode` does not substitute
    /// for the current mode.
    pub fn promote(
        &self,
        txn: &Arc<TransactionContext>,
        name: &ResourceName,
        new_mode: LockMode,
    ) -> LockResult<()> {
        self.core.promote(txn, name, new_mode)
    }

    /// Atomically acquire `mode` on `name` and release the locks on
    /// `release_names`. See [`LockContext::promote`] and
    /// [`LockContext::escalate`] for the two callers.
    ///
    /// # Errors
    ///
    /// `DuplicateLockRequest` if a lock on `name` is held and not being
    /// released; `NoLockHeld` for any name in `release_names` without a
    /// lock; `InvalidLock` for `NL`.
    pub fn acquire_and_release(
        &self,
        txn: &Arc<TransactionContext>,
        name: &ResourceName,
        mode: LockMode,
        release_names: &[ResourceName],
    ) -> LockResult<()> {
        self.core.acquire_and_release(txn, name, mode, release_names)
    }

    /// `txn`'s lock mode on `name`, or `NL` if none is held.
    #[must_use]
    pub fn lock_mode(&self, txn: TxnId, name: &ResourceName) -> LockMode {
        self.core.lock_mode(txn, name)
    }

    /// Snapshot of the granted locks on `name`, in grant order.
    #[must_use]
    pub fn locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        self.core.locks_on(name)
    }

    /// Snapshot of the locks `txn` holds, in acquisition order.
    #[must_use]
    pub fn locks_held_by(&self, txn: TxnId) -> Vec<Lock> {
        self.core.locks_held_by(txn)
    }

    /// The top-level context for `segment`, created on first access.
    pub fn context(&self, segment: impl Into<String>) -> LockContext {
        LockContext::root(&self.core, segment.into())
    }

    /// The root context of the whole database hierarchy.
    #[must_use]
    pub fn database_context(&self) -> LockContext {
        self.context("database")
    }

    /// The context for a full resource name, creating the chain of contexts
    /// down from the top-level segment as needed.
    #[must_use]
    pub fn context_for(&self, name: &ResourceName) -> LockContext {
        let (root, rest) = name
            .segments()
            .split_first()
            .expect("resource names have at least one segment");
        let mut ctx = self.context(root.clone());
        for segment in rest {
            ctx = ctx.child_context(segment.clone());
        }
        ctx
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("LockManager")
            .field("resources", &state.resources.len())
            .field("transactions", &state.txn_locks.len())
            .finish()
    }
}
