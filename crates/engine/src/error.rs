//! Public error taxonomy for the `Database` facade (§6).
//!
//! Every component crate defines its own `thiserror` error type; `DbError`
//! is the one surface callers of `Database` actually match on, with `#[from]`
//! conversions folding each component error into the right variant.

use thiserror::Error;

/// Errors surfaced by [`crate::Database`].
#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("authentication failed: {0}")]
    AuthError(#[from] crypto::CryptoError),

    #[error("operation timed out")]
    Timeout,

    #[error("transaction aborted")]
    TransactionAborted,

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("index not found for {collection}.{field}")]
    IndexMissing { collection: String, field: String },

    #[error("resource busy")]
    Busy,

    /// An engine-level abort (§7): the on-disk state is inconsistent in a
    /// way that cannot be safely recovered from automatically. Covers IV
    /// counter regression, a WAL directory missing after a prior successful
    /// open, and a lock file held by another live process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<txn::TxnError> for DbError {
    fn from(e: txn::TxnError) -> Self {
        match e {
            txn::TxnError::LockTimeout => DbError::Timeout,
            txn::TxnError::Conflict(msg) => DbError::TransactionConflict(msg),
            txn::TxnError::AlreadyTerminated | txn::TxnError::Aborted => DbError::TransactionAborted,
            txn::TxnError::ReadOnly => {
                DbError::InvalidArgument("write attempted on a read-only transaction".into())
            }
            txn::TxnError::NoSuchSavepoint(name) => {
                DbError::InvalidArgument(format!("no savepoint named {name:?}"))
            }
            txn::TxnError::Storage(msg) => DbError::CorruptedData(msg),
        }
    }
}

impl From<index::IndexError> for DbError {
    fn from(e: index::IndexError) -> Self {
        match e {
            index::IndexError::AlreadyExists { .. } => DbError::AlreadyExists,
            index::IndexError::Missing { collection, field } => {
                DbError::IndexMissing { collection, field }
            }
            index::IndexError::CorruptPostings { collection, field } => DbError::CorruptedData(
                format!("corrupt posting list for {collection}.{field}"),
            ),
            index::IndexError::BTree(e) => DbError::CorruptedData(e.to_string()),
            index::IndexError::Page(e) => DbError::CorruptedData(e.to_string()),
            index::IndexError::Io(io) => DbError::IoError(io),
        }
    }
}

impl From<query::QueryError> for DbError {
    fn from(e: query::QueryError) -> Self {
        match e {
            query::QueryError::Index(inner) => inner.into(),
            query::QueryError::MalformedCondition { field, op } => DbError::InvalidArgument(
                format!("condition on `{field}` with op {op:?} requires a structured value it did not get"),
            ),
        }
    }
}

impl From<anyhow::Error> for DbError {
    fn from(e: anyhow::Error) -> Self {
        DbError::CorruptedData(e.to_string())
    }
}
