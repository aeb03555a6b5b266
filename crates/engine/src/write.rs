/// Write path: `set()`, `del()`, `force_flush()`, and the background flush
/// worker that turns frozen memtables into SSTables off the write path.
///
/// Each write is first appended to the WAL for durability, then applied to
/// the in-memory Memtable. When the Memtable exceeds the configured flush
/// threshold, it is frozen (moved out of the write path into the `immutable`
/// list) and handed to a background thread for SSTable conversion, so `set`
/// and `del` don't block on disk I/O except when back-pressure kicks in.
use anyhow::Result;
use crossbeam::channel::{Receiver, Sender};
use memtable::Memtable;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use wal::{WalRecord, WalWriter};

use crate::{Engine, ImmutableMemtable, SSTableReader, SSTableWriter, MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// A frozen memtable handed to the background flush worker.
pub(crate) struct FlushJob {
    pub(crate) generation: u64,
    pub(crate) mem: Arc<Memtable>,
    pub(crate) sst_path: PathBuf,
}

/// Result of a background flush, reported back to the foreground thread.
pub(crate) enum FlushOutcome {
    Done {
        generation: u64,
        sst_name: String,
        max_seq: u64,
    },
    Failed {
        generation: u64,
        error: String,
    },
}

/// Background worker loop: converts each [`FlushJob`] into an SSTable on
/// disk, reporting the outcome back over `tx`. Exits once `rx` is
/// disconnected (the `Engine` dropped its sender) or `tx` can no longer be
/// sent on (the `Engine` is gone).
pub(crate) fn run_flush_worker(rx: Receiver<FlushJob>, tx: Sender<FlushOutcome>) {
    while let Ok(job) = rx.recv() {
        let outcome = match SSTableWriter::write_from_memtable(&job.sst_path, &job.mem) {
            Ok(()) => {
                let max_seq = job.mem.iter().map(|(_, e)| e.seq).max().unwrap_or(0);
                let sst_name = job
                    .sst_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                FlushOutcome::Done {
                    generation: job.generation,
                    sst_name,
                    max_seq,
                }
            }
            Err(e) => FlushOutcome::Failed {
                generation: job.generation,
                error: e.to_string(),
            },
        };
        if tx.send(outcome).is_err() {
            break;
        }
    }
}

impl Engine {
    /// Inserts a key-value pair (the `SET` command).
    ///
    /// The operation is first appended to the WAL, then applied to the
    /// Memtable. If the Memtable exceeds the flush threshold, the active
    /// memtable is frozen and handed to the background flush worker.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        anyhow::ensure!(!key.is_empty(), "key must not be empty");
        anyhow::ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key too large: {} bytes (max {})",
            key.len(),
            MAX_KEY_SIZE
        );
        anyhow::ensure!(
            value.len() <= MAX_VALUE_SIZE,
            "value too large: {} bytes (max {})",
            value.len(),
            MAX_VALUE_SIZE
        );

        self.seq = self
            .seq
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("sequence number overflow (u64::MAX reached)"))?;
        let seq = self.seq;

        // Append to WAL first (crash safety), carrying the document version
        // this write will bump the key to in the memtable.
        let version = self.mem.next_version(&key);
        self.wal_writer.append(&WalRecord::Put {
            seq,
            version,
            key: key.clone(),
            value: value.clone(),
        })?;

        // Apply to memtable
        self.mem.put(key, value, seq);

        self.reconcile_flushes()?;

        // Maybe freeze memtable for background flush
        if self.mem.approx_size() >= self.flush_threshold {
            self.freeze_active_memtable()?;
        }

        Ok(())
    }

    /// Deletes a key by writing a tombstone (the `DEL` command).
    ///
    /// A tombstone record is appended to the WAL and inserted into the
    /// Memtable. The tombstone shadows any older value in SSTables.
    pub fn del(&mut self, key: Vec<u8>) -> Result<()> {
        anyhow::ensure!(!key.is_empty(), "key must not be empty");
        anyhow::ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key too large: {} bytes (max {})",
            key.len(),
            MAX_KEY_SIZE
        );

        self.seq = self
            .seq
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("sequence number overflow (u64::MAX reached)"))?;
        let seq = self.seq;

        let version = self.mem.next_version(&key);
        self.wal_writer.append(&WalRecord::Del {
            seq,
            version,
            key: key.clone(),
        })?;

        self.mem.delete(key, seq);

        self.reconcile_flushes()?;

        if self.mem.approx_size() >= self.flush_threshold {
            self.freeze_active_memtable()?;
        }

        Ok(())
    }

    /// Forces the active memtable to flush and blocks until every
    /// outstanding immutable memtable (this one included) has been durably
    /// written to an SSTable.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure during SSTable write, manifest
    /// update, or WAL checkpoint, or if the background worker disconnects
    /// unexpectedly.
    pub fn force_flush(&mut self) -> Result<()> {
        if !self.mem.is_empty() {
            self.freeze_active_memtable()?;
        }
        self.wait_for_flushes()
    }

    /// Drains any completed flush jobs without blocking, applying each
    /// [`FlushOutcome`] as it arrives. Called opportunistically from `set`
    /// and `del` so the manifest and L0 list stay current without the
    /// caller ever waiting on the background worker.
    fn reconcile_flushes(&mut self) -> Result<()> {
        while let Ok(outcome) = self.flush_rx.try_recv() {
            self.apply_flush_outcome(outcome)?;
        }
        Ok(())
    }

    /// Blocks until every outstanding immutable memtable has been flushed.
    fn wait_for_flushes(&mut self) -> Result<()> {
        while !self.immutable.is_empty() {
            let outcome = self
                .flush_rx
                .recv()
                .map_err(|_| anyhow::anyhow!("background flush worker disconnected"))?;
            self.apply_flush_outcome(outcome)?;
        }
        Ok(())
    }

    /// Freezes the active memtable into the `immutable` list and hands it to
    /// the background flush worker, blocking first if the back-pressure
    /// threshold (`max_immutable_memtables`) is already reached.
    #[tracing::instrument(skip(self))]
    fn freeze_active_memtable(&mut self) -> Result<()> {
        self.reconcile_flushes()?;
        while self.immutable.len() >= self.max_immutable_memtables {
            tracing::warn!(
                immutable = self.immutable.len(),
                "back-pressure: waiting for a flush to free up an immutable memtable slot"
            );
            let outcome = self
                .flush_rx
                .recv()
                .map_err(|_| anyhow::anyhow!("background flush worker disconnected"))?;
            self.apply_flush_outcome(outcome)?;
        }

        if self.mem.is_empty() {
            return Ok(());
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let sst_name = format!("sst-{:020}-{}.sst", self.seq, ts);
        let sst_path = self.sst_dir.join(&sst_name);

        let frozen = Arc::new(std::mem::replace(&mut self.mem, Memtable::new()));
        tracing::debug!(
            generation,
            sst = %sst_name,
            entries = frozen.len(),
            "freezing memtable for background flush"
        );
        self.immutable.push(ImmutableMemtable {
            generation,
            mem: frozen.clone(),
        });

        let tx = self
            .flush_tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("background flush worker already shut down"))?;
        tx.send(FlushJob {
            generation,
            mem: frozen,
            sst_path,
        })
        .map_err(|_| anyhow::anyhow!("background flush worker disconnected"))?;

        Ok(())
    }

    /// Applies a completed (or failed) flush job: on success, records the new
    /// SSTable in the manifest, loads it into L0, removes the corresponding
    /// immutable memtable, checkpoints the WAL once no immutables remain, and
    /// triggers auto-compaction if the L0 trigger is reached. On failure, the
    /// immutable memtable is dropped from tracking and a warning is logged —
    /// its data remains safe in the WAL and will be replayed on next open.
    fn apply_flush_outcome(&mut self, outcome: FlushOutcome) -> Result<()> {
        match outcome {
            FlushOutcome::Done {
                generation,
                sst_name,
                max_seq,
            } => {
                self.immutable.retain(|im| im.generation != generation);

                let sst_path = self.sst_dir.join(&sst_name);
                self.manifest.add(sst_name.clone(), 0);
                self.persist_manifest()?;

                let reader = SSTableReader::open(&sst_path)?;
                self.l0_sstables.insert(0, reader);
                self.seq = self.seq.max(max_seq);

                tracing::debug!(generation, sst = %sst_name, "background flush complete");

                if self.immutable.is_empty() {
                    self.checkpoint_wal()?;
                }

                if self.l0_compaction_trigger > 0
                    && self.l0_sstables.len() >= self.l0_compaction_trigger
                {
                    tracing::debug!(l0 = self.l0_sstables.len(), "L0 compaction trigger reached");
                    self.compact()?;
                }

                Ok(())
            }
            FlushOutcome::Failed { generation, error } => {
                self.immutable.retain(|im| im.generation != generation);
                tracing::warn!(generation, %error, "background flush failed; data remains in WAL");
                Ok(())
            }
        }
    }

    /// Rewrites the WAL to contain only the active memtable's current live
    /// entries, via the same atomic temp-file-plus-rename pattern used
    /// elsewhere in the engine. Only safe to call once `immutable` is empty
    /// — everything flushed out of the memtable before now is durable in an
    /// SSTable, so the WAL no longer needs to carry it.
    fn checkpoint_wal(&mut self) -> Result<()> {
        debug_assert!(self.immutable.is_empty());

        let tmp_path = self.wal_path.with_extension("wal.tmp");
        {
            let mut tmp_writer = WalWriter::create(&tmp_path, self.wal_sync, self.cipher.clone())?;
            for (key, entry) in self.mem.iter() {
                match &entry.value {
                    Some(value) => tmp_writer.append(&WalRecord::Put {
                        seq: entry.seq,
                        version: entry.version,
                        key: key.to_vec(),
                        value: value.clone(),
                    })?,
                    None => tmp_writer.append(&WalRecord::Del {
                        seq: entry.seq,
                        version: entry.version,
                        key: key.to_vec(),
                    })?,
                }
            }
        }
        std::fs::rename(&tmp_path, &self.wal_path)?;
        self.wal_writer = WalWriter::create(&self.wal_path, self.wal_sync, self.cipher.clone())?;
        tracing::debug!("WAL checkpointed after immutable memtables drained");
        Ok(())
    }
}

