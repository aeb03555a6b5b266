//! # Engine - RiptideKV Storage Engine
//!
//! The central orchestrator that ties together the [`memtable`], [`wal`], and
//! [`sstable`] crates into a complete LSM-tree key-value store.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌───────────────────────────────────────────────┐
//! │                   ENGINE                      │
//! │                                               │
//! │ write.rs → WAL append → Memtable insert       │
//! │              |                                │
//! │              |  (threshold exceeded?)         │
//! │              |            yes                 │
//! │              v                                │
//! │    freeze active memtable (immutable list)    │
//! │              |                                │
//! │              v                                │
//! │  background worker → new SSTable (async)      │
//! │              |                                │
//! │              |  (L0 count >= trigger?)        │
//! │              |            yes                 │
//! │              v                                │
//! │           compact() → merged L1 SST           │
//! │                                               │
//! │ read.rs → Memtable → immutable → L0 → L1      │
//! │            (first match wins)                 │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module        | Purpose                                               |
//! |--------------|-------------------------------------------------------|
//! | [`lib.rs`]   | `Engine` struct, constructor, accessors, `Debug`, `Drop` |
//! | [`recovery`] | WAL replay, SSTable loading, tmp file cleanup          |
//! | [`write`]    | `set()`, `del()`, `force_flush()`, background flush worker |
//! | [`read`]     | `get()`, `scan()`                                      |
//! | [`compaction`] | `compact()` with streaming merge + tombstone GC     |
//! | [`manifest`] | Persistent L0/L1 level tracking (atomic file ops)      |
//!
//! ## Levels
//!
//! ```text
//! ┌────────────────────────────┐  ← freshest, checked first
//! │ MEMTABLE                   │
//! ├────────────────────────────┤  ← frozen, awaiting background flush
//! │ IMMUTABLE MEMTABLES        │
//! ├────────────────────────────┤  ← from flushes (may overlap)
//! │ L0 SSTables                │
//! ├────────────────────────────┤  ← from compaction (no overlap)
//! │ L1 SSTables                │
//! └────────────────────────────┘
//! ```
//!
//! ## Crash Safety
//!
//! Every write is appended to the WAL **before** the Memtable update. When
//! the active memtable is frozen, its contents stay in the WAL (the WAL is
//! only rewritten once every outstanding frozen memtable has been durably
//! flushed — see [`write::checkpoint_wal`]). SSTables are written atomically
//! via temp file + rename. The manifest uses the same atomic write pattern.
//! See [`ARCHITECTURE.md`] for the full crash matrix.
mod compaction;
mod database;
mod error;
mod manifest;
mod read;
mod recovery;
mod write;

use anyhow::{Context, Result};
use crossbeam::channel::{Receiver, Sender};
use crypto::Cipher;
use manifest::Manifest;
use memtable::Memtable;
pub use database::{DbInfo, Database, PerfStats};
pub use error::DbError;
pub use recovery::replay_wal_and_build;
use sstable::{MergeIterator, SSTableReader, SSTableWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use wal::WalWriter;
use write::{FlushJob, FlushOutcome};

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Default number of L0 SSTables that triggers automatic compaction.
///
/// When the L0 count reaches this threshold after a flush, the engine
/// automatically runs compaction to merge L0 + L1 into a single L1 SSTable.
/// Set to `0` to disable auto-compaction.
pub const DEFAULT_L0_COMPACTION_TRIGGER: usize = 4;

/// Default on-disk byte budget for L1 before it cascades into L2.
///
/// Once an L0-into-L1 compaction leaves L1 holding more than this many bytes,
/// [`Engine::compact`] also merges L1 into L2 (10x fan-out is the conventional
/// per-level growth factor for a levelled LSM tree). Set to `0` to disable
/// the L1-into-L2 cascade.
pub const DEFAULT_L1_SIZE_BUDGET_BYTES: u64 = 10 * 1024 * 1024;

/// Default back-pressure threshold: `set`/`del` block once this many frozen
/// memtables are awaiting background flush. Overridden by
/// `EngineConfig::max_immutable_memtables` via [`Engine::set_max_immutable_memtables`].
pub const DEFAULT_MAX_IMMUTABLE_MEMTABLES: usize = 4;

/// Bound on the background flush job queue. Decoupled from
/// `max_immutable_memtables` (which is the real back-pressure knob and can be
/// changed after construction) — this just needs to be large enough that the
/// channel itself is never the bottleneck.
const FLUSH_QUEUE_CAPACITY: usize = 64;

/// A memtable that has been frozen (swapped out of the write path) and is
/// either queued for or in the middle of a background flush. Reads still
/// check it — the data isn't durable in an SSTable yet.
pub(crate) struct ImmutableMemtable {
    pub(crate) generation: u64,
    pub(crate) mem: Arc<Memtable>,
}

/// The central storage engine orchestrating Memtable, WAL, and SSTables.
///
/// # Write Path
///
/// 1. Increment the monotonic sequence number.
/// 2. Append the record to the WAL (crash-safe durability).
/// 3. Apply the mutation to the in-memory Memtable.
/// 4. If `approx_size >= flush_threshold`, freeze the Memtable into the
///    immutable list and hand it to the background flush worker, which
///    writes a new SSTable and reports back once durable.
///
/// # Read Path
///
/// 1. Check the Memtable (freshest data, includes tombstones).
/// 2. Check immutable memtables (newest first).
/// 3. Check SSTables from newest to oldest.
/// 4. First match wins; tombstones shadow older values.
///
/// # Recovery
///
/// On construction ([`Engine::new`]), the WAL is replayed into a fresh Memtable
/// and existing `.sst` files are loaded from the SST directory.
pub struct Engine {
    pub(crate) mem: Memtable,
    /// Memtables frozen out of the write path, newest-last, each either
    /// queued for or mid-way through a background flush. Reads check these
    /// (newest first) between the active memtable and L0.
    pub(crate) immutable: Vec<ImmutableMemtable>,
    /// Level 0: SSTables from memtable flushes (may have overlapping key ranges).
    /// Ordered newest-first.
    pub(crate) l0_sstables: Vec<SSTableReader>,
    /// Level 1: SSTables from compaction (non-overlapping key ranges).
    /// Ordered newest-first.
    pub(crate) l1_sstables: Vec<SSTableReader>,
    /// Level 2: SSTables from L1 cascading once L1 exceeds
    /// `l1_size_budget_bytes` (non-overlapping key ranges). Ordered newest-first.
    pub(crate) l2_sstables: Vec<SSTableReader>,
    pub(crate) wal_path: PathBuf,
    pub(crate) sst_dir: PathBuf,
    pub(crate) wal_writer: WalWriter,
    /// Cipher wrapping every WAL frame; shared with whatever page-level
    /// stores this engine instance also owns (B+-tree, SSTables).
    pub(crate) cipher: Arc<Cipher>,
    /// Persistent manifest tracking which SSTable files belong to which level.
    /// Updated atomically on flush and compaction so that L0/L1 assignments
    /// survive restarts.
    pub(crate) manifest: Manifest,

    /// Current monotonic sequence number.
    pub(crate) seq: u64,

    /// Memtable byte-size threshold that triggers a flush to SSTable.
    pub(crate) flush_threshold: usize,

    /// Number of L0 SSTables that triggers automatic compaction after a flush.
    /// Set to `0` to disable auto-compaction (caller must invoke `compact()`).
    pub(crate) l0_compaction_trigger: usize,

    /// On-disk byte budget for L1 before `compact()` cascades it into L2.
    /// Set to `0` to disable the cascade.
    pub(crate) l1_size_budget_bytes: u64,

    /// If `true`, every WAL append is followed by `fsync` for durability.
    pub(crate) wal_sync: bool,

    /// Back-pressure threshold: `set`/`del` block once `immutable.len()`
    /// reaches this value.
    pub(crate) max_immutable_memtables: usize,
    /// Monotonic counter identifying each frozen memtable / flush job.
    pub(crate) next_generation: u64,
    /// Sender half of the job queue feeding the background flush worker.
    /// `None` only after the worker has been shut down (mid-`Drop`).
    pub(crate) flush_tx: Option<Sender<FlushJob>>,
    /// Completed (or failed) flush jobs, drained by `reconcile_flushes`.
    pub(crate) flush_rx: Receiver<FlushOutcome>,
    pub(crate) flush_worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("seq", &self.seq)
            .field("flush_threshold", &self.flush_threshold)
            .field("wal_sync", &self.wal_sync)
            .field("wal_path", &self.wal_path)
            .field("sst_dir", &self.sst_dir)
            .field("memtable_size", &self.mem.approx_size())
            .field("memtable_entries", &self.mem.len())
            .field("immutable_memtable_count", &self.immutable.len())
            .field("l0_sstable_count", &self.l0_sstables.len())
            .field("l1_sstable_count", &self.l1_sstables.len())
            .field("l2_sstable_count", &self.l2_sstables.len())
            .field("l0_compaction_trigger", &self.l0_compaction_trigger)
            .field("l1_size_budget_bytes", &self.l1_size_budget_bytes)
            .field("max_immutable_memtables", &self.max_immutable_memtables)
            .finish()
    }
}

impl Engine {
    /// Creates a new engine, performing full recovery from the WAL and existing
    /// SSTable files.
    ///
    /// # Arguments
    ///
    /// * `wal_path` — path to the write-ahead log file.
    /// * `sst_dir` — directory where SSTable files are stored.
    /// * `flush_threshold` — memtable byte-size threshold that triggers flush.
    /// * `wal_sync` — if `true`, every WAL append calls `fsync`.
    ///
    /// # Recovery Steps
    ///
    /// 1. Create the SST directory if it does not exist.
    /// 2. Clean up leftover `.sst.tmp` files from interrupted flushes.
    /// 3. Replay the WAL into a fresh Memtable.
    /// 4. Open the WAL writer in append mode.
    /// 5. Load SSTables from the manifest (or scan directory for legacy DBs).
    /// 6. Determine the highest sequence number across WAL and SSTables.
    #[tracing::instrument(skip(cipher))]
    pub fn new<P1: AsRef<Path> + std::fmt::Debug, P2: AsRef<Path> + std::fmt::Debug>(
        wal_path: P1,
        sst_dir: P2,
        flush_threshold: usize,
        wal_sync: bool,
        cipher: Arc<Cipher>,
    ) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        let sst_dir = sst_dir.as_ref().to_path_buf();

        // ensure sst dir exists
        std::fs::create_dir_all(&sst_dir)?;

        // clean up any leftover .sst.tmp files from interrupted flushes
        Self::cleanup_tmp_files(&sst_dir);

        // replay wal into memtable and obtain last seq
        // (must happen BEFORE opening the writer to avoid file-sharing conflicts on Windows)
        let mut mem = Memtable::new();
        let seq = replay_wal_and_build(&wal_path, &mut mem, cipher.clone())?;

        // open wal writer in append mode (after replay is done)
        let wal_writer = WalWriter::create(&wal_path, wal_sync, cipher.clone())?;

        // Load or create the manifest to determine L0/L1 assignments.
        let mut manifest = Manifest::load_or_create(&sst_dir)?;

        let mut l0_sstables = Vec::new();
        let mut l1_sstables = Vec::new();
        let mut l2_sstables = Vec::new();
        let mut max_sst_seq = 0u64;

        // If the manifest has entries, use it to load SSTables into the
        // correct levels. This preserves L0/L1/L2 assignments across restarts.
        if !manifest.entries.is_empty() {
            for filename in manifest.l0_filenames() {
                let path = sst_dir.join(filename);
                if path.exists() {
                    let reader = SSTableReader::open(&path)?;
                    max_sst_seq = max_sst_seq.max(Self::reader_max_seq(&reader));
                    l0_sstables.push(reader);
                }
            }
            for filename in manifest.l1_filenames() {
                let path = sst_dir.join(filename);
                if path.exists() {
                    let reader = SSTableReader::open(&path)?;
                    max_sst_seq = max_sst_seq.max(Self::reader_max_seq(&reader));
                    l1_sstables.push(reader);
                }
            }
            for filename in manifest.l2_filenames() {
                let path = sst_dir.join(filename);
                if path.exists() {
                    let reader = SSTableReader::open(&path)?;
                    max_sst_seq = max_sst_seq.max(Self::reader_max_seq(&reader));
                    l2_sstables.push(reader);
                }
            }
        } else {
            // No manifest yet (fresh DB or pre-manifest upgrade).
            // Fall back to scanning the directory and loading all SSTables
            // into L0 (conservative - compaction will sort them out).
            let mut paths: Vec<_> = std::fs::read_dir(&sst_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "sst").unwrap_or(false))
                .collect();

            // newest first (filename contains seq + timestamp)
            paths.sort();
            paths.reverse();

            for path in &paths {
                let reader = SSTableReader::open(path)?;
                max_sst_seq = max_sst_seq.max(Self::reader_max_seq(&reader));
                l0_sstables.push(reader);
            }

            // Bootstrap the manifest from the discovered files.
            if !paths.is_empty() {
                for path in &paths {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        manifest.add(name.to_string(), 0);
                    }
                }
                manifest.save()?;
            }
        }

        // seq must be the max of WAL seq and SSTable seq
        let seq = seq.max(max_sst_seq);
        tracing::debug!(
            seq,
            l0 = l0_sstables.len(),
            l1 = l1_sstables.len(),
            l2 = l2_sstables.len(),
            "engine opened"
        );

        let (flush_tx, job_rx) = crossbeam::channel::bounded::<FlushJob>(FLUSH_QUEUE_CAPACITY);
        let (outcome_tx, flush_rx) = crossbeam::channel::unbounded::<FlushOutcome>();
        let flush_worker = std::thread::Builder::new()
            .name("riptide-flush".into())
            .spawn(move || write::run_flush_worker(job_rx, outcome_tx))
            .context("failed to spawn background flush worker")?;

        Ok(Self {
            mem,
            immutable: Vec::new(),
            l0_sstables,
            l1_sstables,
            l2_sstables,
            wal_path,
            sst_dir,
            wal_writer,
            cipher,
            manifest,
            seq,
            flush_threshold,
            l0_compaction_trigger: DEFAULT_L0_COMPACTION_TRIGGER,
            l1_size_budget_bytes: DEFAULT_L1_SIZE_BUDGET_BYTES,
            wal_sync,
            max_immutable_memtables: DEFAULT_MAX_IMMUTABLE_MEMTABLES,
            next_generation: 0,
            flush_tx: Some(flush_tx),
            flush_rx,
            flush_worker: Some(flush_worker),
        })
    }

    /// Returns the current monotonic sequence number.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the current flush threshold in bytes.
    #[must_use]
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Updates the flush threshold. Useful for testing or runtime tuning.
    pub fn set_flush_threshold(&mut self, threshold: usize) {
        self.flush_threshold = threshold;
    }

    /// Returns the current L0 compaction trigger threshold.
    ///
    /// When the number of L0 SSTables reaches this value after a flush,
    /// compaction is triggered automatically. A value of 0 disables
    /// auto-compaction.
    #[must_use]
    pub fn l0_compaction_trigger(&self) -> usize {
        self.l0_compaction_trigger
    }

    /// Updates the L0 compaction trigger. Set to `0` to disable auto-compaction.
    pub fn set_l0_compaction_trigger(&mut self, trigger: usize) {
        self.l0_compaction_trigger = trigger;
    }

    /// Returns the current L1 on-disk byte budget.
    ///
    /// Once an L0-into-L1 compaction leaves L1 holding more than this many
    /// bytes, [`Engine::compact`] also cascades L1 into L2. A value of 0
    /// disables the cascade.
    #[must_use]
    pub fn l1_size_budget_bytes(&self) -> u64 {
        self.l1_size_budget_bytes
    }

    /// Updates the L1 size budget. Set to `0` to disable the L1-into-L2 cascade.
    pub fn set_l1_size_budget_bytes(&mut self, budget: u64) {
        self.l1_size_budget_bytes = budget;
    }

    /// Stamps the manifest with the cipher's current IV counter, then saves
    /// it. Called from every site that already persists the manifest (flush
    /// reconciliation, compaction, the L1-into-L2 cascade) so the counter is
    /// never more stale than the SSTable layout it's saved alongside.
    pub(crate) fn persist_manifest(&mut self) -> Result<()> {
        self.manifest.set_iv_counter(self.cipher.counter())?;
        self.manifest.save()
    }

    /// Returns the back-pressure threshold: `set`/`del` block once this many
    /// frozen memtables are awaiting background flush.
    #[must_use]
    pub fn max_immutable_memtables(&self) -> usize {
        self.max_immutable_memtables
    }

    /// Updates the back-pressure threshold.
    pub fn set_max_immutable_memtables(&mut self, max: usize) {
        self.max_immutable_memtables = max.max(1);
    }

    /// Returns the number of frozen memtables currently queued for or
    /// undergoing background flush.
    #[must_use]
    pub fn immutable_memtable_count(&self) -> usize {
        self.immutable.len()
    }

    /// Returns the total number of SSTables across all levels.
    #[must_use]
    pub fn sstable_count(&self) -> usize {
        self.l0_sstables.len() + self.l1_sstables.len() + self.l2_sstables.len()
    }

    /// Returns the number of L0 SSTables (from memtable flushes).
    #[must_use]
    pub fn l0_sstable_count(&self) -> usize {
        self.l0_sstables.len()
    }

    /// Returns the number of L1 SSTables (from compaction).
    #[must_use]
    pub fn l1_sstable_count(&self) -> usize {
        self.l1_sstables.len()
    }

    /// Returns the number of L2 SSTables (from a levelled L1-into-L2 cascade).
    #[must_use]
    pub fn l2_sstable_count(&self) -> usize {
        self.l2_sstables.len()
    }
}

/// Best-effort flush and worker shutdown on drop.
///
/// When the `Engine` is dropped, any data remaining in the memtable (and any
/// frozen memtables still awaiting background flush) are flushed to SSTables
/// so they are not lost. Errors are silently ignored because Drop cannot
/// propagate errors — the data is still safe in the WAL and will be
/// recovered on the next startup. The background flush worker is then shut
/// down by closing its job queue and joining the thread.
impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.force_flush();
        self.flush_tx.take();
        if let Some(handle) = self.flush_worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests;
