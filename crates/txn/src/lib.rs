//! # Transaction manager (C8)
//!
//! MVCC read sets, write sets, and isolation-level semantics over the lock
//! manager ([`lock::LockManager`]) and a storage back-end abstracted behind
//! [`StorageBackend`] — the `engine` crate supplies the real implementation;
//! tests supply an in-memory one. Kept free of any dependency on `engine`
//! itself so the cyclic engine/transaction/lock reference the design notes
//! call out is broken by construction: transactions hold a [`Weak`] handle
//! to the manager that created them rather than an owning one.
//!
//! Enhanced-transaction features (savepoints, nested transactions, read-only
//! mode, per-transaction timeout, retry with back-off) live alongside the
//! classic lock-based path rather than in a second subsystem — the open
//! question in the design notes resolves in favor of one unified manager.

mod backoff;
mod manager;
mod transaction;

pub use backoff::retry_with_backoff;
pub use config::IsolationLevel;
pub use manager::{StorageBackend, TransactionManager, WriteOp};
pub use transaction::{Savepoint, Transaction, TransactionState, TxnError};

use std::sync::Weak;

/// A non-owning reference to the manager that created a transaction. See the
/// module docs: this is how the cyclic engine/txn/lock reference is broken.
pub(crate) type ManagerHandle = Weak<TransactionManager>;
