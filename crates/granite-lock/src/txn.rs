//! Transaction handles and the block/unblock parking handshake.

use std::fmt;

use parking_lot::{Condvar, Mutex};

use granite_types::TxnId;

/// Park state of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParkState {
    /// Not waiting on any lock request.
    Idle,
    /// `prepare_block` ran; the owning thread is about to park (or already has).
    Armed,
    /// `unblock` ran; the pending (or next) `block` returns immediately.
    Signalled,
}

/// A transaction's identity plus the parking primitive the lock manager uses
/// to suspend and resume its thread.
///
/// The handshake is a binary semaphore. The manager calls [`prepare_block`]
/// while holding its bookkeeping mutex (so the armed state and the queued
/// request become visible together), the owning thread calls [`block`] after
/// that mutex is dropped, and the queue processor calls [`unblock`] from
/// whichever thread performs the grant, possibly before the owner ever
/// reaches `block`. The signal is latched, not pulsed, so that race loses
/// nothing.
///
/// [`prepare_block`]: TransactionContext::prepare_block
/// [`block`]: TransactionContext::block
/// [`unblock`]: TransactionContext::unblock
pub struct TransactionContext {
    id: TxnId,
    state: Mutex<ParkState>,
    cv: Condvar,
}

impl TransactionContext {
    #[must_use]
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(ParkState::Idle),
            cv: Condvar::new(),
        }
    }

    /// The transaction's identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Arm the wait state. Called by the lock manager while its mutex is
    /// held, immediately before the request is queued.
    pub fn prepare_block(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            *state,
            ParkState::Idle,
            "{} armed while a block was already pending",
            self.id
        );
        *state = ParkState::Armed;
    }

    /// Park the calling thread until [`unblock`](Self::unblock). Must be
    /// called *after* the lock manager mutex has been released. Consumes the
    /// wake-up signal.
    pub fn block(&self) {
        let mut state = self.state.lock();
        while *state != ParkState::Signalled {
            self.cv.wait(&mut state);
        }
        *state = ParkState::Idle;
    }

    /// Wake the transaction. Safe to call while the lock manager mutex is
    /// held (it only signals, it never joins), and safe to call before the
    /// owner has reached [`block`](Self::block).
    pub fn unblock(&self) {
        let mut state = self.state.lock();
        *state = ParkState::Signalled;
        self.cv.notify_one();
    }

    /// True while the transaction is parked (or committed to parking) on a
    /// lock request.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        *self.state.lock() == ParkState::Armed
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl fmt::Display for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}
