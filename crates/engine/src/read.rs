/// Read path: get() and scan().
///
/// Point lookups check the memtable first (freshest data), then frozen
/// immutable memtables (newest-first, awaiting background flush), then L0
/// SSTables (newest-first, may overlap), then L1, then L2 SSTables
/// (newest-first, non-overlapping within each level). The first match wins;
/// tombstones shadow older values.
///
/// Range scans merge data from all sources, deduplicate by highest sequence
/// number, and filter out tombstones before returning sorted results.

use anyhow::Result;
use memtable::ValueEntry;
use std::collections::BTreeMap;

use crate::Engine;

impl Engine {
    /// Looks up a key, returning `Some((seq, value))` if found and live.
    ///
    /// The read path checks the Memtable first, then SSTables from newest to
    /// oldest. Tombstones in any layer shadow older values, causing `None` to
    /// be returned.
    ///
    /// # Errors
    ///
    /// Returns an error if any SSTable read fails (e.g. corruption, I/O).
    pub fn get(&self, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        Ok(self
            .get_live_entry(key)?
            .map(|entry| (entry.seq, entry.value.expect("tombstones filtered out above"))))
    }

    /// Same as [`Engine::get`], but returns the document version alongside
    /// the value instead of the sequence number. Used by layers (the
    /// transaction manager, the query executor) that need MVCC versions
    /// rather than raw write-order sequence numbers.
    pub fn get_versioned(&self, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>> {
        Ok(self
            .get_live_entry(key)?
            .map(|entry| (entry.value.expect("tombstones filtered out above"), entry.version)))
    }

    /// Looks up the live (non-tombstone) entry for `key`, checking the
    /// memtable, then frozen immutable memtables (newest first), then L0,
    /// then L1, then L2. Returns `None` both when the key is absent and when
    /// the newest entry found is a tombstone.
    fn get_live_entry(&self, key: &[u8]) -> Result<Option<ValueEntry>> {
        // 1. Check memtable FIRST (and respect tombstones)
        if let Some(entry) = self.mem.get_entry(key) {
            return Ok(if entry.value.is_some() {
                Some(entry.clone())
            } else {
                None
            });
        }

        // 2. Check frozen immutable memtables, newest first — they're
        // awaiting background flush and aren't durable in an SSTable yet.
        for im in self.immutable.iter().rev() {
            if let Some(entry) = im.mem.get_entry(key) {
                return Ok(if entry.value.is_some() {
                    Some(entry.clone())
                } else {
                    None
                });
            }
        }

        // 3. Check L0 SSTables (newest -> oldest, may overlap)
        for sst in &self.l0_sstables {
            match sst.get(key) {
                Ok(Some(entry)) => {
                    return Ok(if entry.value.is_some() { Some(entry) } else { None });
                }
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }

        // 4. Check L1 SSTables (newest -> oldest, non-overlapping)
        for sst in &self.l1_sstables {
            match sst.get(key) {
                Ok(Some(entry)) => {
                    return Ok(if entry.value.is_some() { Some(entry) } else { None });
                }
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }

        // 5. Check L2 SSTables (newest -> oldest, non-overlapping)
        for sst in &self.l2_sstables {
            match sst.get(key) {
                Ok(Some(entry)) => {
                    return Ok(if entry.value.is_some() { Some(entry) } else { None });
                }
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }

        // 6. Not found anywhere
        Ok(None)
    }

    /// Scans a range of keys, returning all live key-value pairs in ascending
    /// key order.
    ///
    /// The scan merges data from the memtable and all SSTable levels, resolving
    /// duplicates by keeping the entry with the highest sequence number.
    /// Tombstones are filtered out — only live values are returned.
    ///
    /// # Arguments
    ///
    /// * `start` — inclusive lower bound of the key range. Pass `b""` to start
    ///   from the beginning.
    /// * `end` — exclusive upper bound of the key range. Pass `b""` to scan to
    ///   the end.
    ///
    /// # Returns
    ///
    /// A `Vec<(Vec<u8>, Vec<u8>)>` of `(key, value)` pairs in ascending key
    /// order. Empty if no live keys exist in the range.
    ///
    /// # Errors
    ///
    /// Returns an error if any SSTable read fails.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let result = self
            .merge_range(start, end)?
            .into_iter()
            .map(|(key, _version, value)| (key, value))
            .collect();
        Ok(result)
    }

    /// Same as [`Engine::scan`], but also returns each key's document version
    /// (as opposed to its write-order sequence number), for callers doing
    /// MVCC-aware reads.
    pub fn scan_versioned(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>, u64)>> {
        let result = self
            .merge_range(start, end)?
            .into_iter()
            .map(|(key, version, value)| (key, value, version))
            .collect();
        Ok(result)
    }

    /// Merges memtable + all SSTable levels over `[start, end)`, keeping only
    /// the highest-seq entry per key and dropping tombstones. Shared by
    /// [`Engine::scan`] and [`Engine::scan_versioned`]. The `u64` in the
    /// result is each entry's document version.
    fn merge_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, u64, Vec<u8>)>> {
        // Collect the best (highest-seq) entry per key across all sources.
        // BTreeMap ensures ascending key order in the output.
        let mut merged: BTreeMap<Vec<u8>, ValueEntry> = BTreeMap::new();

        // Helper: insert only if this entry has a higher seq than any existing one.
        let mut merge_entry = |key: Vec<u8>, entry: ValueEntry| {
            match merged.get(&key) {
                Some(existing) if existing.seq >= entry.seq => {}
                _ => {
                    merged.insert(key, entry);
                }
            }
        };

        // 1. Memtable entries (highest priority — freshest data).
        for (key, entry) in self.mem.iter() {
            if !start.is_empty() && key < start {
                continue;
            }
            if !end.is_empty() && key >= end {
                continue;
            }
            merge_entry(key.to_vec(), entry.clone());
        }

        // 2. Frozen immutable memtables, oldest first so the merge_entry
        // highest-seq rule lets newer generations override older ones.
        for im in &self.immutable {
            for (key, entry) in im.mem.iter() {
                if !start.is_empty() && key < start {
                    continue;
                }
                if !end.is_empty() && key >= end {
                    continue;
                }
                merge_entry(key.to_vec(), entry.clone());
            }
        }

        // 3. L0 SSTables (newest first, may overlap).
        for sst in &self.l0_sstables {
            for key_ref in sst.keys() {
                if !start.is_empty() && key_ref < start {
                    continue;
                }
                if !end.is_empty() && key_ref >= end {
                    continue;
                }
                if let Ok(Some(entry)) = sst.get(key_ref) {
                    merge_entry(key_ref.to_vec(), entry);
                }
            }
        }

        // 4. L1 SSTables (newest first, non-overlapping).
        for sst in &self.l1_sstables {
            for key_ref in sst.keys() {
                if !start.is_empty() && key_ref < start {
                    continue;
                }
                if !end.is_empty() && key_ref >= end {
                    continue;
                }
                if let Ok(Some(entry)) = sst.get(key_ref) {
                    merge_entry(key_ref.to_vec(), entry);
                }
            }
        }

        // 5. L2 SSTables (newest first, non-overlapping).
        for sst in &self.l2_sstables {
            for key_ref in sst.keys() {
                if !start.is_empty() && key_ref < start {
                    continue;
                }
                if !end.is_empty() && key_ref >= end {
                    continue;
                }
                if let Ok(Some(entry)) = sst.get(key_ref) {
                    merge_entry(key_ref.to_vec(), entry);
                }
            }
        }

        // Filter out tombstones and collect live values.
        let result: Vec<(Vec<u8>, u64, Vec<u8>)> = merged
            .into_iter()
            .filter_map(|(key, entry)| entry.value.map(|v| (key, entry.version, v)))
            .collect();

        Ok(result)
    }
}
