/// # Manifest - SSTable Level Metadata
///
/// Tracks which SSTable files belong to which level (L0, L1, L2, ...) so that
/// the engine can correctly reconstruct its state after a restart.
///
/// ## File Format
///
/// The manifest is a simple text-based file with one SSTable entry per line:
///
/// ```text
/// IV:4821
/// L0:sst-000000000000000005-1708600000000.sst
/// L0:sst-000000000000000003-1708599999000.sst
/// L1:sst-000000000000000010-1708600001000.sst
/// L2:sst-000000000000000002-1708599990000.sst
/// ```
///
/// Lines starting with `#` are comments. Empty lines are ignored. The `IV:`
/// line (at most one; later ones win) persists the AES-256-GCM IV counter so
/// it can be restored across restarts instead of resetting to 0, which would
/// reuse IVs already consumed by ciphertext written in a prior session.
///
/// ## Crash Safety
///
/// The manifest is rewritten atomically: write to a `.tmp` file, fsync, then
/// rename over the existing manifest. This ensures the manifest is never
/// partially written.
///
/// ## Design Rationale
///
/// A text format was chosen over binary for debuggability — operators can
/// inspect the manifest with any text editor. The file is small (one line per
/// SSTable) so parsing overhead is negligible.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Name of the manifest file within the SST directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

/// Temporary file used during atomic manifest writes.
const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

/// Represents the level assignment for a single SSTable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstMeta {
    /// The SSTable filename (not the full path — just the basename).
    pub filename: String,
    /// The level this SSTable belongs to (0 = L0, 1 = L1, 2 = L2, ...).
    pub level: u32,
}

/// In-memory representation of the manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Path to the manifest file on disk.
    path: PathBuf,
    /// All SSTable entries, in the order they appear in the file.
    pub entries: Vec<SstMeta>,
    /// Last-persisted AES-256-GCM IV counter value (§4.2/§7). `0` for a
    /// fresh manifest or when encryption is not AES-256.
    iv_counter: u32,
}

impl Manifest {
    /// Loads an existing manifest from `sst_dir/MANIFEST`, or creates an
    /// empty one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest file exists but cannot be parsed.
    pub fn load_or_create(sst_dir: &Path) -> Result<Self> {
        let path = sst_dir.join(MANIFEST_FILENAME);

        if path.exists() {
            let file = File::open(&path)
                .with_context(|| format!("failed to open manifest at {}", path.display()))?;
            let reader = BufReader::new(file);
            let mut entries = Vec::new();
            let mut iv_counter = 0u32;

            for (line_num, line) in reader.lines().enumerate() {
                let line = line.with_context(|| {
                    format!("failed to read manifest line {}", line_num + 1)
                })?;
                let trimmed = line.trim();

                // Skip empty lines and comments.
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }

                if let Some(counter_str) = trimmed.strip_prefix("IV:") {
                    iv_counter = counter_str.parse::<u32>().map_err(|_| {
                        anyhow::anyhow!(
                            "manifest line {}: invalid IV counter '{}'",
                            line_num + 1,
                            counter_str
                        )
                    })?;
                    continue;
                }

                // Expected format: "<level>:<filename>"
                let (level_str, filename) = trimmed.split_once(':').ok_or_else(|| {
                    anyhow::anyhow!(
                        "manifest line {}: invalid format (expected 'L<n>:<filename>'): {}",
                        line_num + 1,
                        trimmed
                    )
                })?;

                let level = match level_str.strip_prefix('L') {
                    Some(n) => n.parse::<u32>().map_err(|_| {
                        anyhow::anyhow!(
                            "manifest line {}: unknown level '{}' (expected 'L<n>')",
                            line_num + 1,
                            level_str
                        )
                    })?,
                    None => bail!(
                        "manifest line {}: unknown level '{}' (expected 'L<n>')",
                        line_num + 1,
                        level_str
                    ),
                };

                entries.push(SstMeta {
                    filename: filename.to_string(),
                    level,
                });
            }

            Ok(Self {
                path,
                entries,
                iv_counter,
            })
        } else {
            Ok(Self {
                path,
                entries: Vec::new(),
                iv_counter: 0,
            })
        }
    }

    /// Returns the last-persisted IV counter value.
    #[must_use]
    pub fn iv_counter(&self) -> u32 {
        self.iv_counter
    }

    /// Updates the persisted IV counter (does **not** save to disk).
    ///
    /// # Errors
    ///
    /// Returns an error if `counter` is less than the currently persisted
    /// value — an IV counter must never move backwards, since restarting
    /// from a lower value would reuse IVs already consumed by ciphertext
    /// written under the higher one (§7 "IV counter regression detected").
    pub fn set_iv_counter(&mut self, counter: u32) -> Result<()> {
        if counter < self.iv_counter {
            bail!(
                "IV counter regression detected: attempted to persist {} over existing {}",
                counter,
                self.iv_counter
            );
        }
        self.iv_counter = counter;
        Ok(())
    }

    /// Persists the current manifest state to disk.
    ///
    /// On Unix-like systems this uses atomic rename (write to `.tmp`, fsync,
    /// rename). On Windows, `rename` over an existing file can fail with
    /// "Access is denied" if the target is still cached by the OS or antivirus,
    /// so we fall back to a direct truncate-and-write strategy
    /// which is still safe because the manifest is small and fsynced.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_file_name(MANIFEST_TMP_FILENAME);

        // Write to a temp file first.
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| {
                    format!("failed to create manifest tmp at {}", tmp_path.display())
                })?;

            Self::write_manifest_contents(&mut f, &self.entries, self.iv_counter)?;
            f.flush()?;
            f.sync_all()?;
        }

        // Try atomic rename first. If it fails (common on Windows when the
        // target file is still cached), fall back to direct overwrite.
        if fs::rename(&tmp_path, &self.path).is_err() {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)
                .with_context(|| {
                    format!("failed to open manifest at {}", self.path.display())
                })?;

            Self::write_manifest_contents(&mut f, &self.entries, self.iv_counter)?;
            f.flush()?;
            f.sync_all()?;

            // Clean up the orphaned tmp file.
            let _ = fs::remove_file(&tmp_path);
        }

        Ok(())
    }

    /// Writes the manifest header, IV counter, and entries to a writer.
    fn write_manifest_contents(f: &mut File, entries: &[SstMeta], iv_counter: u32) -> Result<()> {
        writeln!(f, "# RiptideKV SSTable Manifest")?;
        writeln!(f, "# Format: <level>:<filename>")?;
        writeln!(f, "IV:{}", iv_counter)?;
        for entry in entries {
            writeln!(f, "L{}:{}", entry.level, entry.filename)?;
        }
        Ok(())
    }

    /// Returns the filenames of all L0 SSTables, in manifest order (newest first).
    pub fn l0_filenames(&self) -> Vec<&str> {
        self.filenames_for_level(0)
    }

    /// Returns the filenames of all L1 SSTables, in manifest order (newest first).
    pub fn l1_filenames(&self) -> Vec<&str> {
        self.filenames_for_level(1)
    }

    /// Returns the filenames of all L2 SSTables, in manifest order (newest first).
    pub fn l2_filenames(&self) -> Vec<&str> {
        self.filenames_for_level(2)
    }

    /// Returns the filenames of every SSTable at `level`, in manifest order
    /// (newest first).
    pub fn filenames_for_level(&self, level: u32) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.level == level)
            .map(|e| e.filename.as_str())
            .collect()
    }

    /// Adds an SSTable entry to the manifest (does **not** save to disk).
    ///
    /// New entries are inserted at the front (newest first) for the given level.
    pub fn add(&mut self, filename: String, level: u32) {
        // Insert at the beginning of entries for this level to maintain
        // newest-first ordering within each level.
        let insert_pos = self
            .entries
            .iter()
            .position(|e| e.level == level)
            .unwrap_or(self.entries.len());
        self.entries.insert(insert_pos, SstMeta { filename, level });
    }

    /// Removes all entries matching the given filenames.
    #[allow(dead_code)]
    pub fn remove_files(&mut self, filenames: &[&str]) {
        self.entries
            .retain(|e| !filenames.contains(&e.filename.as_str()));
    }

    /// Replaces all L0 and L1 entries with a single L1 entry (used after an
    /// L0-into-L1 compaction — L2+ entries are untouched).
    pub fn replace_all_with_l1(&mut self, filename: String) {
        self.entries.retain(|e| e.level > 1);
        self.entries.insert(0, SstMeta { filename, level: 1 });
    }

    /// Replaces every entry at `source_level` with a single new entry at
    /// `target_level` (used after a levelled compaction cascades one level
    /// down, e.g. L1 into L2). Entries at other levels are untouched.
    pub fn replace_level_with(&mut self, source_level: u32, target_level: u32, filename: String) {
        self.entries.retain(|e| e.level != source_level);
        let insert_pos = self
            .entries
            .iter()
            .position(|e| e.level == target_level)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            insert_pos,
            SstMeta {
                filename,
                level: target_level,
            },
        );
    }
}
