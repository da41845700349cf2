//! Multigranular locking for GraniteDB.
//!
//! Two layers cooperate here:
//!
//! - [`LockManager`], the flat layer. It owns every resource's grant list
//!   and FIFO wait queue plus the global transaction→locks table, enforces
//!   the compatibility matrix, and parks/wakes transaction threads. It knows
//!   nothing about hierarchy.
//! - [`LockContext`], the hierarchical layer. One context per node of the
//!   resource tree (database → table → page → row). Contexts validate the
//!   multigranularity rules (ancestor intents, orphan-free releases, SIX
//!   subsumption, escalation) and issue appropriately shaped requests to the
//!   flat layer.
//!
//! Most callers should not touch either directly:
//! [`ensure_sufficient_lock_held`] turns "I am about to read/write this" into
//! the least permissive set of locks that makes the access legal.
//!
//! Deadlock detection, lock timeouts, and persistence of lock state are
//! deliberately out of scope; an external driver is responsible for breaking
//! deadlocks.

pub mod context;
pub mod manager;
pub mod txn;
pub mod util;

pub use context::LockContext;
pub use manager::LockManager;
pub use txn::TransactionContext;
pub use util::ensure_sufficient_lock_held;

pub use granite_error::{LockError, LockResult};
pub use granite_types::{Lock, LockMode, ResourceName, TxnId};
