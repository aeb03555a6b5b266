use crate::transaction::{Transaction, TxnError};
use crate::{IsolationLevel, ManagerHandle};
use lock::LockManager;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One buffered mutation in a transaction's write set, in program order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WriteOp {
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } => key,
            WriteOp::Delete { key } => key,
        }
    }
}

/// What a transaction manager needs from the storage layer: point reads with
/// their MVCC version, range scans for predicate/serializable validation,
/// and atomic application of a committed write set. `engine::Engine`
/// implements this; tests use an in-memory stand-in.
pub trait StorageBackend: Send + Sync {
    /// Current value and version for `key`, or `None` if absent/deleted.
    fn get(&self, key: &[u8]) -> Option<(Vec<u8>, u64)>;

    /// All live (key, value, version) triples with `start <= key < end`
    /// (open-ended bounds when `None`), ascending by key.
    fn scan(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>, u64)>;

    /// Applies every operation in `ops` as a single atomic batch.
    fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), TxnError>;
}

/// Per-database transaction manager: owns the lock table and tracks the
/// oldest still-active transaction's start time (compaction needs this to
/// know which tombstones are safe to reclaim, per §4.4).
pub struct TransactionManager {
    lock_mgr: Arc<LockManager>,
    storage: Arc<dyn StorageBackend>,
    next_id: AtomicU64,
    active: Mutex<BTreeMap<u64, Instant>>,
}

impl TransactionManager {
    /// Builds a manager with its own fresh lock table.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Arc<Self> {
        Self::with_lock_manager(storage, Arc::new(LockManager::new()))
    }

    /// Builds a manager sharing an existing lock table (e.g. one configured
    /// with a non-default timeout).
    #[must_use]
    pub fn with_lock_manager(storage: Arc<dyn StorageBackend>, lock_mgr: Arc<LockManager>) -> Arc<Self> {
        Arc::new(TransactionManager {
            lock_mgr,
            storage,
            next_id: AtomicU64::new(1),
            active: Mutex::new(BTreeMap::new()),
        })
    }

    /// Starts a new top-level transaction at `isolation`, optionally
    /// read-only and/or bounded by `timeout`.
    pub fn begin(
        self: &Arc<Self>,
        isolation: IsolationLevel,
        read_only: bool,
        timeout: Option<Duration>,
    ) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        self.active.lock().insert(id, start);
        tracing::trace!(tx_id = id, ?isolation, read_only, "transaction begin");
        let handle: ManagerHandle = Arc::downgrade(self);
        Transaction::new(id, isolation, read_only, timeout, start, handle)
    }

    /// Starts a transaction at the manager's caller-supplied default
    /// isolation (`EngineConfig::default_isolation_level` in practice).
    pub fn begin_default(self: &Arc<Self>, default_isolation: IsolationLevel) -> Transaction {
        self.begin(default_isolation, false, None)
    }

    /// Called exactly once by a top-level transaction's commit/abort path:
    /// releases every lock it holds and stops tracking its start time.
    pub(crate) fn end(&self, tx_id: u64) {
        self.active.lock().remove(&tx_id);
        self.lock_mgr.release_all(tx_id);
        tracing::trace!(tx_id, "transaction ended");
    }

    pub(crate) fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Start time of the oldest transaction still active, used by
    /// compaction to decide which tombstones are safe to reclaim (§4.4: "...
    /// older than the oldest live transaction's start time").
    #[must_use]
    pub fn oldest_active_start_time(&self) -> Option<Instant> {
        self.active.lock().values().min().copied()
    }

    /// Number of transactions currently active. Diagnostic only.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
