//! # `Database` — the public storage-engine facade (§4.5, §6)
//!
//! Wires [`Engine`] (raw WAL/memtable/SSTable bytes) together with the
//! multi-level cache, lock manager, transaction manager, secondary index
//! manager, query executor, and change-stream bus into the single object
//! embedders open. `Engine` itself stays a narrow byte-oriented store, same
//! as the teacher's original design; everything document/collection-shaped
//! is a convention layered on top here (`<collection>:<doc_id>` keys,
//! `value::Value`-encoded bytes), exactly the separation `index` and `query`
//! already assume via their `StorageBackend`/`DocumentSource` seams.

use crypto::Cipher;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use value::Value;

use crate::manifest;
use crate::{DbError, Engine};

/// Snapshot of structural state, analogous to the teacher's `EngineStats`
/// but covering the whole facade rather than just the LSM tree.
#[derive(Debug, Clone)]
pub struct DbInfo {
    pub sstable_count: usize,
    pub l0_sstable_count: usize,
    pub l1_sstable_count: usize,
    pub l2_sstable_count: usize,
    pub seq: u64,
    pub subscriber_count: usize,
}

/// Runtime performance counters (§4.6's cache statistics plus lock/txn
/// concurrency counters).
#[derive(Debug, Clone)]
pub struct PerfStats {
    pub cache: cache::CacheStats,
    pub active_transactions: usize,
    pub locked_key_count: usize,
}

/// The embeddable database handle. One instance owns one `<db_root>/`
/// directory (§6); a second `Database::open` on the same directory, from
/// this process or another live process, fails via the `lock` file — with
/// [`DbError::Busy`] from within this process, or [`DbError::Fatal`] if
/// another live process holds it.
pub struct Database {
    engine: Arc<RwLock<Engine>>,
    cache: cache::MultiLevelCache,
    txn_mgr: Arc<txn::TransactionManager>,
    lock_mgr: Arc<lock::LockManager>,
    indexes: Arc<index::IndexManager>,
    changes: Arc<changestream::ChangeStreamBus>,
    document_source: Arc<dyn query::DocumentSource>,
    query_executor: query::QueryExecutor,
    config: config::EngineConfig,
    _lock_file: LockFile,
}

impl Database {
    /// Opens (or creates) a database rooted at `base_dir`, performing full
    /// WAL/SSTable recovery (§6's on-disk layout: `wal/`, `sst/`,
    /// `indexes/<collection>_<field>/`, `lock`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Busy`] if another `Database` already holds the
    /// lock file for this directory. Returns [`DbError::IoError`] or
    /// [`DbError::CorruptedData`] on recovery failure. Returns
    /// [`DbError::Fatal`] on any of the three engine-level abort conditions
    /// (§7): the lock file is held by another live process, the WAL
    /// directory is missing despite a manifest proving a prior successful
    /// open, or the manifest's persisted IV counter is behind the sequence
    /// number WAL replay recovered.
    #[tracing::instrument(skip(config), fields(base_dir = %base_dir.as_ref().display()))]
    pub fn open(base_dir: impl AsRef<Path>, config: config::EngineConfig) -> Result<Self, DbError> {
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir)?;
        let lock_file = LockFile::acquire(base_dir)?;

        let wal_dir = base_dir.join("wal");
        let wal_path = wal_dir.join("000001.log");
        let sst_dir = base_dir.join("sst");

        // Fatal (§7): a manifest on disk is evidence of a prior successful
        // open, which always creates `wal/`. If the manifest survived but
        // the WAL directory didn't, disk and manifest disagree about the
        // database's history — recreating the directory here would silently
        // start a new, empty WAL under an SSTable layout that assumes
        // otherwise.
        let manifest_path = sst_dir.join(manifest::MANIFEST_FILENAME);
        if manifest_path.exists() && !wal_dir.exists() {
            return Err(DbError::Fatal(format!(
                "WAL directory {} is missing but a manifest already exists at {} (manifest disagrees with disk)",
                wal_dir.display(),
                manifest_path.display()
            )));
        }
        std::fs::create_dir_all(&wal_dir)?;

        // Peek the manifest's persisted IV counter before constructing the
        // cipher, so a reopen resumes AES-GCM's counter instead of reusing
        // IVs already consumed by ciphertext from a prior session.
        std::fs::create_dir_all(&sst_dir)?;
        let persisted_iv_counter = manifest::Manifest::load_or_create(&sst_dir)?.iv_counter();
        let cipher = Arc::new(build_cipher(&config, persisted_iv_counter));

        let mut engine = Engine::new(
            &wal_path,
            &sst_dir,
            config.memtable_size_mb.saturating_mul(1024 * 1024),
            config.sync_writes,
            cipher.clone(),
        )?;

        // Fatal (§7): every WAL record bumps `Engine::seq` by one and costs
        // exactly one `cipher.encrypt()` call, and the same cipher also
        // encrypts index B+-tree pages, so the persisted IV counter is a
        // strict upper bound on the sequence number WAL replay recovers.
        // If it's lower, the manifest was restored from a stale copy and
        // continuing would reuse IVs already consumed on disk.
        if config.encryption_type == crypto::EncryptionType::Aes256
            && persisted_iv_counter < engine.seq()
        {
            return Err(DbError::Fatal(format!(
                "IV counter regression detected: manifest IV counter {} is behind the WAL's recovered sequence number {}",
                persisted_iv_counter,
                engine.seq()
            )));
        }

        engine.set_max_immutable_memtables(config.max_immutable_memtables);
        let engine = Arc::new(RwLock::new(engine));

        let lock_mgr = Arc::new(lock::LockManager::with_timeout(Duration::from_millis(
            config.lock_timeout_ms,
        )));
        let backend: Arc<dyn txn::StorageBackend> = Arc::new(EngineBackend(engine.clone()));
        let txn_mgr = txn::TransactionManager::with_lock_manager(backend, lock_mgr.clone());

        let indexes = Arc::new(index::IndexManager::new(base_dir, config.page_size, cipher.clone()));
        let changes = Arc::new(changestream::ChangeStreamBus::new(1024));

        let document_source: Arc<dyn query::DocumentSource> = Arc::new(EngineDocumentSource(engine.clone()));
        let query_executor = query::QueryExecutor::new(document_source.clone(), indexes.clone());

        let cache = cache::MultiLevelCache::new(
            cache::LevelBudget {
                max_entries: config.l1_cache_size,
                max_memory_bytes: config.l1_cache_memory,
            },
            cache::LevelBudget {
                max_entries: config.l2_cache_size,
                max_memory_bytes: config.l2_cache_memory,
            },
            cache::LevelBudget {
                max_entries: config.l3_cache_size,
                max_memory_bytes: config.l3_cache_memory,
            },
        );

        tracing::info!("database opened");
        Ok(Database {
            engine,
            cache,
            txn_mgr,
            lock_mgr,
            indexes,
            changes,
            document_source,
            query_executor,
            config,
            _lock_file: lock_file,
        })
    }

    /// Looks up `key`, consulting the cache first (§4.6) and populating L1
    /// on a storage-layer hit.
    #[tracing::instrument(skip(self))]
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(Some(cached));
        }
        let found = self.engine.read().get(key)?;
        if let Some((_, ref bytes)) = found {
            self.cache.put(key, bytes, cache::CacheLevel::L1);
        }
        Ok(found.map(|(_, v)| v))
    }

    /// Writes `key -> value` (§4.5): WAL + memtable, then cache invalidation,
    /// then secondary-index maintenance (if `key` is a `<collection>:<doc_id>`
    /// key with at least one index defined), then a change-stream event.
    #[tracing::instrument(skip(self, value))]
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), DbError> {
        let old = self.engine.read().get(&key)?.map(|(_, v)| v);
        self.engine.write().set(key.clone(), value.clone())?;
        self.cache.invalidate_key(&key);
        self.maybe_index_write(&key, old.as_deref(), &value)?;
        self.changes.publish(changestream::ChangeEvent {
            op: changestream::ChangeOp::Put,
            key,
            value: Some(value),
        });
        Ok(())
    }

    /// Deletes `key` via a tombstone (§4.5), mirroring `put`'s cache/index/
    /// change-stream side effects.
    #[tracing::instrument(skip(self))]
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        let old = self.engine.read().get(key)?;
        self.engine.write().del(key.to_vec())?;
        self.cache.invalidate_key(key);
        if let Some((_, old_bytes)) = &old {
            if let Some((collection, doc_id)) = value::split_collection_key(key) {
                if let Ok(old_doc) = Value::from_storage_bytes(old_bytes) {
                    self.indexes.on_delete(collection, doc_id, &old_doc)?;
                }
            }
        }
        self.changes.publish(changestream::ChangeEvent {
            op: changestream::ChangeOp::Delete,
            key: key.to_vec(),
            value: None,
        });
        Ok(())
    }

    /// Point-reads every key in `keys`, omitting absent ones from the result
    /// map. Never blocks beyond the cost of the individual `get`s it makes
    /// (§5: "`get_batch` never blocks beyond individual `get`s").
    pub fn get_batch(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Vec<u8>>, DbError> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key)? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    /// Applies every `(key, value)` pair from a single write-lock critical
    /// section, so no reader observes a partial batch. Unlike the
    /// single-key path this does not yet coalesce into one WAL record per
    /// §4.5's "single WAL transaction record... fsync once" — see
    /// DESIGN.md for why that part of batch atomicity is deferred.
    #[tracing::instrument(skip(self, items))]
    pub fn put_batch(&self, items: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), DbError> {
        let mut old_values = Vec::with_capacity(items.len());
        {
            let mut engine = self.engine.write();
            for (key, value) in &items {
                let old = engine.get(key)?.map(|(_, v)| v);
                engine.set(key.clone(), value.clone())?;
                old_values.push(old);
            }
        }
        for ((key, value), old) in items.iter().zip(old_values) {
            self.cache.invalidate_key(key);
            self.maybe_index_write(key, old.as_deref(), value)?;
            self.changes.publish(changestream::ChangeEvent {
                op: changestream::ChangeOp::Put,
                key: key.clone(),
                value: Some(value.clone()),
            });
        }
        Ok(())
    }

    /// Range scan over `[start, end)`; pass `&[]` for an open-ended bound
    /// (§4.5).
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        Ok(self.engine.read().scan(start, end)?)
    }

    /// Structural snapshot (§4.5's `info() -> DbInfo`).
    pub fn info(&self) -> DbInfo {
        let engine = self.engine.read();
        DbInfo {
            sstable_count: engine.sstable_count(),
            l0_sstable_count: engine.l0_sstable_count(),
            l1_sstable_count: engine.l1_sstable_count(),
            l2_sstable_count: engine.l2_sstable_count(),
            seq: engine.seq(),
            subscriber_count: self.changes.subscriber_count(),
        }
    }

    /// Performance counters (§4.5's `stats() -> PerfStats`).
    pub fn stats(&self) -> PerfStats {
        PerfStats {
            cache: self.cache.stats(),
            active_transactions: self.txn_mgr.active_count(),
            locked_key_count: self.lock_mgr.locked_key_count(),
        }
    }

    /// Flushes any buffered writes and releases the directory lock
    /// (§4.5's `close()`). Consumes `self`.
    pub fn close(self) -> Result<(), DbError> {
        self.engine.write().force_flush()?;
        Ok(())
    }

    /// Begins a transaction at an explicit isolation level (§4.8).
    pub fn begin(&self, isolation: config::IsolationLevel, read_only: bool) -> txn::Transaction {
        self.txn_mgr
            .begin(isolation, read_only, Some(Duration::from_millis(self.config.lock_timeout_ms)))
    }

    /// Begins a transaction at `config.default_isolation_level`.
    pub fn begin_default(&self) -> txn::Transaction {
        self.txn_mgr.begin_default(self.config.default_isolation_level)
    }

    /// Validates and applies `txn`'s write set, then runs the same
    /// cache-invalidation / index-maintenance / change-stream side effects
    /// `put`/`delete` run for each buffered operation, in program order
    /// (§5: "writes are observed in program order on commit").
    #[tracing::instrument(skip(self, txn))]
    pub fn commit(&self, mut txn: txn::Transaction) -> Result<(), DbError> {
        self.finalize_commit(&mut txn)
    }

    /// Discards `txn`'s write set and releases its locks (§4.8).
    pub fn abort(&self, mut txn: txn::Transaction) {
        txn.abort();
    }

    /// Runs `f` against a fresh transaction, committing it, retrying on
    /// conflict/timeout with exponential back-off + jitter up to
    /// `config.max_retries` (§4.8 "enhanced transactions... retry with
    /// exponential back-off"). `f` must be safe to run more than once: each
    /// retry begins an entirely new transaction.
    pub fn with_transaction<F, T>(&self, isolation: config::IsolationLevel, mut f: F) -> Result<T, DbError>
    where
        F: FnMut(&mut txn::Transaction) -> Result<T, DbError>,
    {
        txn::retry_with_backoff(
            self.config.max_retries,
            Duration::from_millis(10),
            |e: &DbError| matches!(e, DbError::TransactionConflict(_) | DbError::Timeout),
            || {
                let mut tx = self.begin(isolation, false);
                let value = f(&mut tx)?;
                self.finalize_commit(&mut tx)?;
                Ok(value)
            },
        )
    }

    fn finalize_commit(&self, txn: &mut txn::Transaction) -> Result<(), DbError> {
        let ops = txn.write_ops().to_vec();
        // Capture pre-commit values now — `txn.commit()` applies the batch
        // directly to the engine, after which the old value is gone.
        let old_values: Vec<Option<Vec<u8>>> = ops
            .iter()
            .map(|op| self.engine.read().get(op.key()).ok().flatten().map(|(_, v)| v))
            .collect();

        txn.commit()?;

        for (op, old) in ops.iter().zip(old_values) {
            self.cache.invalidate_key(op.key());
            match op {
                txn::WriteOp::Put { key, value } => {
                    if let Err(e) = self.maybe_index_write(key, old.as_deref(), value) {
                        tracing::warn!(error = %e, "secondary index maintenance failed after commit");
                    }
                    self.changes.publish(changestream::ChangeEvent {
                        op: changestream::ChangeOp::Put,
                        key: key.clone(),
                        value: Some(value.clone()),
                    });
                }
                txn::WriteOp::Delete { key } => {
                    if let Some(old_bytes) = &old {
                        if let Some((collection, doc_id)) = value::split_collection_key(key) {
                            if let Ok(old_doc) = Value::from_storage_bytes(old_bytes) {
                                if let Err(e) = self.indexes.on_delete(collection, doc_id, &old_doc) {
                                    tracing::warn!(error = %e, "secondary index maintenance failed after commit");
                                }
                            }
                        }
                    }
                    self.changes.publish(changestream::ChangeEvent {
                        op: changestream::ChangeOp::Delete,
                        key: key.clone(),
                        value: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// For a `<collection>:<doc_id>`-shaped key, runs the appropriate
    /// `IndexManager` hook: `on_insert` if the key had no prior value,
    /// `on_update` otherwise. A no-op for keys outside the collection
    /// convention, or when the collection has no indexes at all (the hooks
    /// themselves are no-ops in that case, but skipping the decode avoids
    /// paying for it on every raw-byte write).
    fn maybe_index_write(&self, key: &[u8], old_bytes: Option<&[u8]>, new_bytes: &[u8]) -> Result<(), DbError> {
        let Some((collection, doc_id)) = value::split_collection_key(key) else {
            return Ok(());
        };
        let new_doc =
            Value::from_storage_bytes(new_bytes).map_err(|e| DbError::CorruptedData(e.to_string()))?;
        match old_bytes {
            Some(old) => {
                let old_doc =
                    Value::from_storage_bytes(old).map_err(|e| DbError::CorruptedData(e.to_string()))?;
                self.indexes.on_update(collection, doc_id, &old_doc, &new_doc)?;
            }
            None => self.indexes.on_insert(collection, doc_id, &new_doc)?,
        }
        Ok(())
    }

    /// Subscribes to committed mutations matching `pattern` (§4.11).
    pub fn subscribe(&self, pattern: impl Into<String>) -> changestream::Subscription {
        self.changes.subscribe(pattern)
    }

    /// Creates a secondary index on `collection.field`, back-filling it from
    /// every document currently in the collection (§4.9).
    pub fn create_index(&self, collection: &str, field: &str) -> Result<(), DbError> {
        let docs = self.document_source.scan_collection(collection);
        self.indexes
            .create_index(collection, field, docs.iter().map(|(id, v)| (id.as_str(), v)))?;
        Ok(())
    }

    /// Drops a secondary index (§4.9).
    pub fn drop_index(&self, collection: &str, field: &str) -> Result<(), DbError> {
        Ok(self.indexes.drop_index(collection, field)?)
    }

    /// Plans and runs `q` (§4.10).
    pub fn query(&self, q: &query::Query) -> Result<query::QueryOutcome, DbError> {
        Ok(self.query_executor.execute(q)?)
    }
}

/// Derives the cipher wrapping WAL frames and secondary-index pages from
/// `config.encryption_type`/`encryption_key` (§4.2). `initial_counter` seeds
/// AES-256-GCM's IV counter from the manifest's last-persisted value so a
/// reopen never reuses an IV already consumed by ciphertext on disk.
fn build_cipher(config: &config::EngineConfig, initial_counter: u32) -> Cipher {
    let key = config.encryption_key.as_deref().unwrap_or("");
    match config.encryption_type {
        crypto::EncryptionType::None => Cipher::none(),
        crypto::EncryptionType::Xor => Cipher::xor(key.as_bytes()),
        crypto::EncryptionType::Aes256 => Cipher::aes256(key, initial_counter),
    }
}

/// Adapts [`Engine`] to [`txn::StorageBackend`], translating versioned reads
/// and routing `apply_batch` through the engine's own `set`/`del`.
struct EngineBackend(Arc<RwLock<Engine>>);

impl txn::StorageBackend for EngineBackend {
    fn get(&self, key: &[u8]) -> Option<(Vec<u8>, u64)> {
        self.0.read().get_versioned(key).ok().flatten()
    }

    fn scan(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>, u64)> {
        self.0
            .read()
            .scan_versioned(start.unwrap_or(b""), end.unwrap_or(b""))
            .unwrap_or_default()
    }

    fn apply_batch(&self, ops: &[txn::WriteOp]) -> Result<(), txn::TxnError> {
        let mut engine = self.0.write();
        for op in ops {
            match op {
                txn::WriteOp::Put { key, value } => engine
                    .set(key.clone(), value.clone())
                    .map_err(|e| txn::TxnError::Storage(e.to_string()))?,
                txn::WriteOp::Delete { key } => engine
                    .del(key.clone())
                    .map_err(|e| txn::TxnError::Storage(e.to_string()))?,
            }
        }
        Ok(())
    }
}

/// Adapts [`Engine`] to [`query::DocumentSource`] via the
/// `<collection>:<doc_id>` key convention and `Value`'s storage codec.
struct EngineDocumentSource(Arc<RwLock<Engine>>);

impl query::DocumentSource for EngineDocumentSource {
    fn get_document(&self, collection: &str, doc_id: &str) -> Option<Value> {
        let key = value::collection_key(collection, doc_id);
        let (_, bytes) = self.0.read().get(&key).ok().flatten()?;
        Value::from_storage_bytes(&bytes).ok()
    }

    fn scan_collection(&self, collection: &str) -> Vec<(String, Value)> {
        let prefix = value::collection_prefix(collection);
        let end = prefix_upper_bound(&prefix);
        let rows = self.0.read().scan(&prefix, &end).unwrap_or_default();
        rows.into_iter()
            .filter_map(|(key, bytes)| {
                let (_, doc_id) = value::split_collection_key(&key)?;
                let doc = Value::from_storage_bytes(&bytes).ok()?;
                Some((doc_id.to_string(), doc))
            })
            .collect()
    }
}

/// Smallest byte string greater than every string with prefix `prefix`, for
/// use as an exclusive scan upper bound. Returns an empty (unbounded) end
/// only in the degenerate case where `prefix` is empty or all `0xFF` —
/// collection names are ASCII text in practice, so this never triggers.
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(&last) = end.last() {
        if last == 0xFF {
            end.pop();
        } else {
            let len = end.len();
            end[len - 1] += 1;
            return end;
        }
    }
    Vec::new()
}

/// RAII guard for `<db_root>/lock`, giving the single-process-exclusion
/// behavior §5 requires ("one engine instance per database directory; a
/// lock file excludes other processes"). `create_new` makes acquisition
/// atomic and rejects a second open from this process too. The file's
/// contents are the holder's PID, so a stale lock left by a crashed process
/// can be told apart from one held by a still-live process (§7).
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(dir: &Path) -> Result<Self, DbError> {
        let path = dir.join("lock");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(LockFile { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Self::holder_is_live(&path) {
                    return Err(DbError::Fatal(format!(
                        "lock file {} is held by another live process",
                        path.display()
                    )));
                }
                // The previous holder is gone: reclaim the stale lock.
                std::fs::remove_file(&path).map_err(DbError::IoError)?;
                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::AlreadyExists => DbError::Busy,
                        _ => DbError::IoError(e),
                    })?;
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(LockFile { path })
            }
            Err(e) => Err(DbError::IoError(e)),
        }
    }

    /// Whether the process recorded in an existing lock file is still alive.
    /// Unreadable or unparsable contents are treated conservatively as live,
    /// since there's no safe default that doesn't risk two engines on the
    /// same directory.
    fn holder_is_live(path: &Path) -> bool {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return true;
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            return true;
        };
        Self::pid_is_alive(pid)
    }

    #[cfg(target_os = "linux")]
    fn pid_is_alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(not(target_os = "linux"))]
    fn pid_is_alive(_pid: u32) -> bool {
        true
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
