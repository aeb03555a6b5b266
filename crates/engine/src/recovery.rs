/// WAL replay and SSTable recovery logic.
///
/// This module handles the cold-start path: replaying the WAL into a fresh
/// memtable, loading existing SSTables from disk, and bootstrapping the
/// manifest when upgrading from a pre-manifest database.
use anyhow::Result;
use crypto::Cipher;
use memtable::Memtable;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use wal::{WalReader, WalRecord};

use crate::{Engine, SSTableReader};

/// Replays a WAL file into the given memtable, returning the highest sequence
/// number encountered.
///
/// If the WAL file does not exist, returns `Ok(0)` (fresh start).
///
/// Replay stops at the first unreadable or corrupt record rather than
/// failing outright — everything decoded up to that point is applied, and
/// the WAL file is truncated to that boundary so the corrupt/partial tail
/// left over from a crash doesn't linger ahead of the next appended record.
///
/// # Errors
///
/// Propagates any I/O error opening the WAL, or a parse error from a frame
/// whose header itself doesn't decode as a record at all.
#[tracing::instrument(skip(mem, cipher))]
pub fn replay_wal_and_build<P: AsRef<Path> + std::fmt::Debug>(
    path: P,
    mem: &mut Memtable,
    cipher: Arc<Cipher>,
) -> Result<u64> {
    match WalReader::open(path.as_ref(), cipher) {
        Ok(mut reader) => {
            let mut max_seq = 0u64;
            let mut replayed = 0u64;

            reader.replay(|r| match r {
                WalRecord::Put {
                    seq,
                    version: _,
                    key,
                    value,
                } => {
                    mem.put(key, value, seq);
                    max_seq = max_seq.max(seq);
                    replayed += 1;
                }
                WalRecord::Del {
                    seq,
                    version: _,
                    key,
                } => {
                    mem.delete(key, seq);
                    max_seq = max_seq.max(seq);
                    replayed += 1;
                }
            })?;

            let valid_len = reader.valid_len();
            drop(reader);
            truncate_to_valid_len(path.as_ref(), valid_len)?;

            tracing::debug!(replayed, max_seq, valid_len, "WAL replay complete");
            Ok(max_seq)
        }
        Err(e) => {
            // File doesn't exist yet -> fresh start
            if matches!(e, wal::WalError::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
            {
                tracing::trace!("no WAL file found, starting fresh");
                Ok(0)
            } else {
                Err(anyhow::anyhow!(e).context("failed to open WAL for replay"))
            }
        }
    }
}

/// Truncates the WAL file to `valid_len` bytes, dropping any truncated or
/// corrupt tail that `replay` stopped short of. A no-op when the file is
/// already exactly that length (the common case: a clean shutdown with no
/// torn tail at all).
fn truncate_to_valid_len(path: &Path, valid_len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() != valid_len {
        tracing::warn!(valid_len, "truncating WAL to last valid record after replay");
        file.set_len(valid_len)?;
    }
    Ok(())
}

impl Engine {
    /// Extracts the max sequence number from an SSTable reader.
    ///
    /// Uses the v3 footer's `max_seq` for O(1) access when available.
    /// Falls back to scanning all keys for legacy v1/v2 SSTables.
    pub(crate) fn reader_max_seq(reader: &SSTableReader) -> u64 {
        if let Some(seq) = reader.max_seq() {
            return seq;
        }
        let mut max = 0u64;
        for key in reader.keys() {
            if let Ok(Some(entry)) = reader.get(key) {
                max = max.max(entry.seq);
            }
        }
        max
    }

    /// Cleans up leftover `.sst.tmp` files from interrupted flushes.
    pub(crate) fn cleanup_tmp_files(sst_dir: &Path) {
        if let Ok(entries) = std::fs::read_dir(sst_dir) {
            for entry in entries.flatten() {
                let p = entry.path();
                if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                    if name.ends_with(".sst.tmp") {
                        let _ = std::fs::remove_file(&p);
                    }
                }
            }
        }
    }
}
