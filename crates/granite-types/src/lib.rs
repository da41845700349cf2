//! Foundation value types for the GraniteDB lock subsystem.
//!
//! This crate defines the vocabulary shared by the flat lock manager and the
//! hierarchical lock-context layer: transaction identifiers, lock modes (with
//! the full multigranularity algebra), hierarchical resource names, and the
//! lock value itself. Everything here is a plain value: no interior state,
//! no synchronization.

pub mod lock;
pub mod mode;
pub mod resource;

pub use lock::{Lock, TxnId};
pub use mode::LockMode;
pub use resource::ResourceName;
