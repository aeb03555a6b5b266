use crate::manager::WriteOp;
use crate::{IsolationLevel, ManagerHandle, TransactionManager};
use lock::LockType;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors a transaction operation can surface (§4.7, §4.8, §7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxnError {
    /// The lock manager's `acquire` timed out (§4.7); the transaction is
    /// aborted as a side effect of surfacing this.
    #[error("lock acquisition timed out")]
    LockTimeout,
    /// Commit-time MVCC validation failed (§4.8, §7): a read-set entry no
    /// longer matches, or a recorded serializable predicate range changed.
    #[error("transaction conflict: {0}")]
    Conflict(String),
    /// The transaction has already committed or aborted.
    #[error("transaction already terminated")]
    AlreadyTerminated,
    /// The transaction was aborted (timeout, conflict, or explicit `abort`).
    #[error("transaction aborted")]
    Aborted,
    /// A write was attempted on a read-only transaction.
    #[error("read-only transaction attempted a write")]
    ReadOnly,
    /// `rollback_to` named a savepoint that does not exist.
    #[error("no savepoint named {0:?}")]
    NoSuchSavepoint(String),
    /// The storage back-end's `apply_batch` failed during commit.
    #[error("storage error during commit: {0}")]
    Storage(String),
}

/// Transaction lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Preparing,
    Prepared,
    Committed,
    Aborted,
}

/// A named snapshot of the write set, restorable by `rollback_to` (§4.8
/// "Enhanced transactions").
#[derive(Debug, Clone)]
pub struct Savepoint {
    name: String,
    write_ops_len: usize,
}

#[derive(Debug, Clone)]
struct ReadSetEntry {
    value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Predicate {
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    snapshot: Vec<(Vec<u8>, u64)>,
}

/// One ACID transaction. Created by [`TransactionManager::begin`] (or
/// [`Transaction::begin_nested`] for a child sharing its parent's lock
/// domain); terminated exactly once by [`Transaction::commit`] or
/// [`Transaction::abort`] — `Drop` aborts automatically if neither ran, so
/// locks are always released (§4.8 "guaranteed-release scope").
pub struct Transaction {
    id: u64,
    isolation: IsolationLevel,
    start_time: Instant,
    timeout: Option<Duration>,
    read_only: bool,
    state: TransactionState,
    is_nested: bool,

    write_ops: Vec<WriteOp>,
    write_index: HashMap<Vec<u8>, usize>,
    read_set: HashMap<Vec<u8>, ReadSetEntry>,
    predicates: Vec<Predicate>,
    savepoints: Vec<Savepoint>,

    manager: ManagerHandle,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        isolation: IsolationLevel,
        read_only: bool,
        timeout: Option<Duration>,
        start_time: Instant,
        manager: ManagerHandle,
    ) -> Self {
        Transaction {
            id,
            isolation,
            start_time,
            timeout,
            read_only,
            state: TransactionState::Active,
            is_nested: false,
            write_ops: Vec::new(),
            write_index: HashMap::new(),
            read_set: HashMap::new(),
            predicates: Vec::new(),
            savepoints: Vec::new(),
            manager,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    #[must_use]
    pub fn write_ops(&self) -> &[WriteOp] {
        &self.write_ops
    }

    fn manager(&self) -> std::sync::Arc<TransactionManager> {
        self.manager
            .upgrade()
            .expect("transaction outlived its manager")
    }

    /// Checks liveness, first expiring the transaction if its timeout has
    /// elapsed (§5: "on expiry, the next call transitions the transaction
    /// to Aborted and releases locks").
    fn ensure_active(&mut self) -> Result<(), TxnError> {
        if self.state == TransactionState::Active {
            if let Some(timeout) = self.timeout {
                if self.start_time.elapsed() > timeout {
                    self.abort_internal();
                }
            }
        }
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Aborted => Err(TxnError::Aborted),
            _ => Err(TxnError::AlreadyTerminated),
        }
    }

    fn ensure_writable(&mut self) -> Result<(), TxnError> {
        self.ensure_active()?;
        if self.read_only {
            return Err(TxnError::ReadOnly);
        }
        Ok(())
    }

    /// Reads `key`, consulting the write set first (read-your-own-writes).
    ///
    /// Lock behavior per isolation level (§4.8):
    /// - `ReadUncommitted`: no lock taken.
    /// - `ReadCommitted`: Shared lock taken and released immediately.
    /// - `RepeatableRead`/`Serializable`: Shared lock taken and held until
    ///   commit; the first read of a key is cached in the read set and
    ///   returned verbatim on subsequent reads of the same key.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TxnError> {
        self.ensure_active()?;

        if let Some(&idx) = self.write_index.get(key) {
            return Ok(match &self.write_ops[idx] {
                WriteOp::Put { value, .. } => Some(value.clone()),
                WriteOp::Delete { .. } => None,
            });
        }

        match self.isolation {
            IsolationLevel::ReadUncommitted => {
                let mgr = self.manager();
                Ok(mgr.storage().get(key).map(|(v, _)| v))
            }
            IsolationLevel::ReadCommitted => {
                let mgr = self.manager();
                if !mgr.lock_manager().acquire(key, self.id, LockType::Shared) {
                    self.abort_internal();
                    return Err(TxnError::LockTimeout);
                }
                let value = mgr.storage().get(key).map(|(v, _)| v);
                mgr.lock_manager().release(key, self.id);
                Ok(value)
            }
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                if let Some(entry) = self.read_set.get(key) {
                    return Ok(entry.value.clone());
                }
                let mgr = self.manager();
                if !mgr.lock_manager().acquire(key, self.id, LockType::Shared) {
                    self.abort_internal();
                    return Err(TxnError::LockTimeout);
                }
                let value = mgr.storage().get(key).map(|(v, _)| v);
                self.read_set.insert(
                    key.to_vec(),
                    ReadSetEntry {
                        value: value.clone(),
                    },
                );
                Ok(value)
            }
        }
    }

    /// Range scan used by the query layer for index-seeded/full scans. At
    /// `Serializable`, records the matching key/version snapshot as a
    /// predicate validated at commit (§4.8).
    pub fn scan(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TxnError> {
        self.ensure_active()?;
        let mgr = self.manager();
        let rows = mgr.storage().scan(start, end);

        if self.isolation == IsolationLevel::Serializable {
            let snapshot = rows.iter().map(|(k, _, v)| (k.clone(), *v)).collect();
            self.predicates.push(Predicate {
                start: start.map(<[u8]>::to_vec),
                end: end.map(<[u8]>::to_vec),
                snapshot,
            });
        }

        Ok(rows.into_iter().map(|(k, v, _)| (k, v)).collect())
    }

    /// Buffers a `Put`, taking (and holding until commit) an Exclusive lock
    /// regardless of isolation level (§4.8: "writes still take Exclusive").
    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TxnError> {
        self.ensure_writable()?;
        self.take_write_lock(key)?;
        self.record_write(WriteOp::Put {
            key: key.to_vec(),
            value,
        });
        Ok(())
    }

    /// Buffers a `Delete`, same locking as `put`.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), TxnError> {
        self.ensure_writable()?;
        self.take_write_lock(key)?;
        self.record_write(WriteOp::Delete { key: key.to_vec() });
        Ok(())
    }

    fn take_write_lock(&mut self, key: &[u8]) -> Result<(), TxnError> {
        let mgr = self.manager();
        if !mgr.lock_manager().acquire(key, self.id, LockType::Exclusive) {
            self.abort_internal();
            return Err(TxnError::LockTimeout);
        }
        Ok(())
    }

    fn record_write(&mut self, op: WriteOp) {
        let key = op.key().to_vec();
        if let Some(&idx) = self.write_index.get(&key) {
            self.write_ops[idx] = op;
        } else {
            self.write_index.insert(key, self.write_ops.len());
            self.write_ops.push(op);
        }
    }

    /// Names the current write-set length so `rollback_to` can restore it.
    pub fn savepoint(&mut self, name: impl Into<String>) {
        self.savepoints.push(Savepoint {
            name: name.into(),
            write_ops_len: self.write_ops.len(),
        });
    }

    /// Restores the write set to the state at `savepoint`, dropping any
    /// savepoints created after it (the named one itself survives, so it
    /// can be rolled back to again).
    pub fn rollback_to(&mut self, name: &str) -> Result<(), TxnError> {
        let pos = self
            .savepoints
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| TxnError::NoSuchSavepoint(name.to_string()))?;
        let target_len = self.savepoints[pos].write_ops_len;
        self.savepoints.truncate(pos + 1);
        self.write_ops.truncate(target_len);
        self.write_index.retain(|_, idx| *idx < target_len);
        Ok(())
    }

    /// Starts a child transaction sharing this transaction's lock domain
    /// (same `tx_id`, so its lock acquisitions never conflict with locks
    /// this transaction already holds). The child has its own write set;
    /// merge it in with [`Transaction::commit_nested`] or discard it with
    /// [`Transaction::rollback_nested`] (§4.8 "nested transactions").
    #[must_use]
    pub fn begin_nested(&self) -> Transaction {
        Transaction {
            id: self.id,
            isolation: self.isolation,
            start_time: self.start_time,
            timeout: self.timeout,
            read_only: self.read_only,
            state: TransactionState::Active,
            is_nested: true,
            write_ops: Vec::new(),
            write_index: HashMap::new(),
            read_set: HashMap::new(),
            predicates: Vec::new(),
            savepoints: Vec::new(),
            manager: self.manager.clone(),
        }
    }

    /// Merges a committed child's write set into this transaction's own.
    pub fn commit_nested(&mut self, mut child: Transaction) {
        child.state = TransactionState::Committed;
        for op in child.write_ops.drain(..) {
            self.record_write(op);
        }
    }

    /// Discards a child transaction's writes; this transaction is
    /// unaffected.
    pub fn rollback_nested(&mut self, mut child: Transaction) {
        child.state = TransactionState::Aborted;
    }

    fn validate(&self) -> Result<(), TxnError> {
        match self.isolation {
            IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => Ok(()),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                let mgr = self.manager();
                for (key, entry) in &self.read_set {
                    let current = mgr.storage().get(key).map(|(v, _)| v);
                    if current != entry.value {
                        return Err(TxnError::Conflict(format!(
                            "read set entry for key {key:?} no longer matches"
                        )));
                    }
                }
                if self.isolation == IsolationLevel::Serializable {
                    for pred in &self.predicates {
                        let rows = mgr.storage().scan(pred.start.as_deref(), pred.end.as_deref());
                        let current: Vec<(Vec<u8>, u64)> =
                            rows.into_iter().map(|(k, _, v)| (k, v)).collect();
                        if current != pred.snapshot {
                            return Err(TxnError::Conflict(
                                "serializable predicate range was mutated by another transaction"
                                    .to_string(),
                            ));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Validates (MVCC read-set and, at Serializable, predicate ranges),
    /// applies the write set as one atomic storage batch, and releases
    /// every lock this transaction holds. On any failure the transaction
    /// aborts and the error is returned (§4.8).
    #[tracing::instrument(skip(self), fields(tx_id = self.id, write_ops = self.write_ops.len()))]
    pub fn commit(&mut self) -> Result<(), TxnError> {
        self.ensure_active()?;
        self.state = TransactionState::Preparing;

        if let Err(e) = self.validate() {
            tracing::debug!(tx_id = self.id, error = %e, "commit validation failed");
            self.abort_internal();
            return Err(e);
        }
        self.state = TransactionState::Prepared;

        let mgr = self.manager();
        if let Err(e) = mgr.storage().apply_batch(&self.write_ops) {
            tracing::warn!(tx_id = self.id, error = %e, "commit apply_batch failed");
            self.abort_internal();
            return Err(e);
        }

        self.state = TransactionState::Committed;
        tracing::trace!(tx_id = self.id, "transaction committed");
        if !self.is_nested {
            mgr.end(self.id);
        }
        Ok(())
    }

    /// Aborts the transaction, discarding its write set and releasing its
    /// locks. A no-op if already terminated.
    pub fn abort(&mut self) {
        if matches!(
            self.state,
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return;
        }
        tracing::trace!(tx_id = self.id, "transaction abort requested");
        self.abort_internal();
    }

    fn abort_internal(&mut self) {
        self.state = TransactionState::Aborted;
        if !self.is_nested {
            if let Some(mgr) = self.manager.upgrade() {
                mgr.end(self.id);
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Active | TransactionState::Preparing
        ) {
            self.abort_internal();
        }
    }
}
