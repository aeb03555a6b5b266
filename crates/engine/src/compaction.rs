/// Compaction: merges all L0 + L1 SSTables into a single L1 SSTable, then
/// cascades L1 into L2 if the merged L1 file grows past its byte budget.
///
/// Uses [`MergeIterator`] for sorted, deduplicated streaming from multiple
/// SSTables. Tombstone GC drops dead keys when no older SSTables remain.
/// The result is written atomically (temp file + rename), old files are
/// deleted, and the manifest is updated.
use anyhow::Result;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Engine, MergeIterator, SSTableReader, SSTableWriter};

impl Engine {
    /// Compacts all SSTables into a single merged SSTable.
    ///
    /// Uses [`MergeIterator`] to walk all SSTables in sorted key order,
    /// resolving duplicates by highest sequence number. The merged result is
    /// written to a new SSTable, old SSTable files are deleted, and the
    /// engine's SSTable list is replaced with the single merged reader.
    ///
    /// Tombstone GC: since this is a full compaction (all L0 + L1 -> single
    /// L1), tombstones are safe to drop unless the memtable still references
    /// the key (the memtable is not part of compaction).
    ///
    /// # When to compact
    ///
    /// Called automatically when L0 count reaches `l0_compaction_trigger`
    /// after a flush, or manually by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure during merge, write, or cleanup.
    #[tracing::instrument(skip(self))]
    pub fn compact(&mut self) -> Result<()> {
        let total = self.l0_sstables.len() + self.l1_sstables.len();
        if total <= 1 {
            return Ok(()); // nothing to compact
        }
        tracing::debug!(l0 = self.l0_sstables.len(), l1 = self.l1_sstables.len(), "starting compaction");

        // Collect the paths of the old L0 + L1 files before we start. Read
        // these from the manifest rather than scanning the directory so that
        // L2 SSTables (untouched by this merge) are never swept up.
        let old_paths: Vec<PathBuf> = self
            .manifest
            .l0_filenames()
            .into_iter()
            .chain(self.manifest.l1_filenames())
            .map(|f| self.sst_dir.join(f))
            .collect();

        // Move L0 + L1 into a contiguous vec for MergeIterator.
        let mut all_sstables: Vec<SSTableReader> = Vec::new();
        let mut l0 = std::mem::take(&mut self.l0_sstables);
        let mut l1 = std::mem::take(&mut self.l1_sstables);
        all_sstables.append(&mut l0);
        all_sstables.append(&mut l1);

        // Estimate total entry count for bloom filter sizing.
        let estimated_count: usize = all_sstables.iter().map(|r| r.len()).sum();

        let mut merge = MergeIterator::new(&all_sstables);

        // Stram directly from MergeIterator -> SSTableWriter without
        // materializing the entire dataset in RAM. Memory usage is bounded
        // by the bloom filter + index, not the data volume.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let sst_name = format!("sst-{:020}-{}.sst", self.seq, ts);
        let sst_path = self.sst_dir.join(&sst_name);

        // Tombstone GC: since this is a full compaction (all L0 + L1 -> single
        // L1), there are no older SSTables that could contain shadowed values.
        // Tombstones are therefore safe to drop â€” they have no older data to
        // shadow. Also check if the active or any immutable memtable contains
        // the key: if so, the tombstone must be preserved to shadow that
        // in-memory entry on recovery.
        //
        // Build a streaming iterator adapter from MergeIterator.
        // MergeIterator::next() returns Result<Option<...>>, so we collect
        // into a fallible iterator that stops on error or exhaustion.
        let mem_ref = &self.mem;
        let immutable_ref = &self.immutable;
        let mut merge_error: Option<anyhow::Error> = None;
        let streaming_iter = std::iter::from_fn(|| {
            loop {
                match merge.next_entry() {
                    Ok(Some((key, entry))) => {
                        // Drop tombstones unless the active or an immutable
                        // memtable still references this key (neither is part
                        // of compaction, so we must keep tombstones that
                        // shadow in-memory data).
                        let shadowed_in_memory = mem_ref.contains_key(&key)
                            || immutable_ref.iter().any(|im| im.mem.contains_key(&key));
                        if entry.value.is_none() && shadowed_in_memory {
                            continue; // GC this tombstone
                        }
                        return Some((key, entry));
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        merge_error = Some(e);
                        return None;
                    }
                }
            }
        });

        let write_result =
            SSTableWriter::write_from_iterator(&sst_path, estimated_count, streaming_iter);

        // Check for merge errors first, then write errors.
        if let Some(e) = merge_error {
            // Clean up partial write if any.
            let _ = std::fs::remove_file(sst_path.with_extension("sst.tmp"));
            return Err(e);
        }

        // Handle the case where all SSTables were empty.
        if let Err(e) = write_result {
            if e.to_string().contains("empty") {
                drop(all_sstables);
                for p in &old_paths {
                    let _ = std::fs::remove_file(p);
                }
                self.manifest.entries.retain(|entry| entry.level > 1);
                self.persist_manifest()?;
                return Ok(());
            }
            return Err(e);
        }

        // Update the manifest atomically: replace all entries with the
        // single compacted L1 SSTable.
        self.manifest.replace_all_with_l1(sst_name);
        self.persist_manifest()?;

        // Drop old readers (releases file handles) before deleting files.
        drop(all_sstables);

        // Delete old SSTable files (but not the new one).
        for p in &old_paths {
            let _ = std::fs::remove_file(p);
        }

        // Open the new merged SSTable into L1 (compacted = non-overlapping).
        let reader = SSTableReader::open(&sst_path)?;
        self.l1_sstables = vec![reader];

        tracing::debug!(sst = %sst_name, "compaction finished");

        // Cascade: if L1 has grown past its byte budget, fold it into L2.
        if self.l1_size_budget_bytes > 0 {
            let l1_bytes = std::fs::metadata(&sst_path).map(|m| m.len()).unwrap_or(0);
            if l1_bytes > self.l1_size_budget_bytes {
                self.cascade_l1_into_l2()?;
            }
        }

        Ok(())
    }

    /// Merges L1 (currently a single SSTable after [`Engine::compact`]) with
    /// any existing L2 SSTables into a single new L2 SSTable, leaving L1 empty.
    ///
    /// Same streaming merge / tombstone-GC / atomic-write shape as the L0-into-L1
    /// merge in [`Engine::compact`], just one level down. Since L2 is currently
    /// the deepest level, a tombstone surviving this merge is safe to drop unless
    /// the active or an immutable memtable still shadows the key.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure during merge, write, or cleanup.
    #[tracing::instrument(skip(self))]
    fn cascade_l1_into_l2(&mut self) -> Result<()> {
        let total = self.l1_sstables.len() + self.l2_sstables.len();
        if total <= 1 {
            return Ok(());
        }
        tracing::debug!(l1 = self.l1_sstables.len(), l2 = self.l2_sstables.len(), "cascading L1 into L2");

        let old_paths: Vec<PathBuf> = self
            .manifest
            .l1_filenames()
            .into_iter()
            .chain(self.manifest.l2_filenames())
            .map(|f| self.sst_dir.join(f))
            .collect();

        let mut all_sstables: Vec<SSTableReader> = Vec::new();
        let mut l1 = std::mem::take(&mut self.l1_sstables);
        let mut l2 = std::mem::take(&mut self.l2_sstables);
        all_sstables.append(&mut l1);
        all_sstables.append(&mut l2);

        let estimated_count: usize = all_sstables.iter().map(|r| r.len()).sum();
        let mut merge = MergeIterator::new(&all_sstables);

        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let sst_name = format!("sst-{:020}-{}.sst", self.seq, ts);
        let sst_path = self.sst_dir.join(&sst_name);

        let mem_ref = &self.mem;
        let immutable_ref = &self.immutable;
        let mut merge_error: Option<anyhow::Error> = None;
        let streaming_iter = std::iter::from_fn(|| {
            loop {
                match merge.next_entry() {
                    Ok(Some((key, entry))) => {
                        let shadowed_in_memory = mem_ref.contains_key(&key)
                            || immutable_ref.iter().any(|im| im.mem.contains_key(&key));
                        if entry.value.is_none() && shadowed_in_memory {
                            continue;
                        }
                        return Some((key, entry));
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        merge_error = Some(e);
                        return None;
                    }
                }
            }
        });

        let write_result =
            SSTableWriter::write_from_iterator(&sst_path, estimated_count, streaming_iter);

        if let Some(e) = merge_error {
            let _ = std::fs::remove_file(sst_path.with_extension("sst.tmp"));
            return Err(e);
        }

        if let Err(e) = write_result {
            if e.to_string().contains("empty") {
                drop(all_sstables);
                for p in &old_paths {
                    let _ = std::fs::remove_file(p);
                }
                self.manifest.entries.retain(|entry| entry.level != 1 && entry.level != 2);
                self.persist_manifest()?;
                return Ok(());
            }
            return Err(e);
        }

        self.manifest.replace_level_with(1, 2, sst_name.clone());
        self.persist_manifest()?;

        drop(all_sstables);
        for p in &old_paths {
            let _ = std::fs::remove_file(p);
        }

        let reader = SSTableReader::open(&sst_path)?;
        self.l2_sstables = vec![reader];

        tracing::debug!(sst = %sst_name, "L1-into-L2 cascade finished");
        Ok(())
    }
}
