//! # Engine configuration (ambient — not part of the core contract)
//!
//! `EngineConfig` is the Rust-struct form of the option table in §6: a plain
//! data record with `Default` values. It does not read files or environment
//! variables — that is the host's job (see `crates/cli`, which builds one
//! from `RIPTIDE_*` environment variables).

use crypto::EncryptionType;

/// Isolation level a transaction runs under when none is given explicitly to
/// `begin`. Lives here rather than in `txn` so `EngineConfig` has no
/// dependency on the transaction manager; `txn` re-exports this type rather
/// than defining its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Plain-data configuration record for an `engine::Engine` instance.
///
/// Every field corresponds to one row of the option table; see each field's
/// doc comment for its effect.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Freeze threshold for the active memtable.
    pub memtable_size_mb: usize,
    /// SSTable & B+-tree page size, in bytes.
    pub page_size: usize,

    /// L1 cache max entry count.
    pub l1_cache_size: usize,
    /// L2 cache max entry count.
    pub l2_cache_size: usize,
    /// L3 cache max entry count.
    pub l3_cache_size: usize,
    /// L1 cache max memory budget, in bytes.
    pub l1_cache_memory: usize,
    /// L2 cache max memory budget, in bytes.
    pub l2_cache_memory: usize,
    /// L3 cache max memory budget, in bytes.
    pub l3_cache_memory: usize,

    /// Compress SSTable pages (implementation-defined codec).
    pub compression_enabled: bool,
    /// Whether every WAL append fsyncs before `put`/`delete` returns.
    pub sync_writes: bool,
    /// Back-pressure threshold: `put` blocks once this many immutable
    /// memtables are awaiting flush.
    pub max_immutable_memtables: usize,

    /// Which cipher wraps WAL frames and pages at rest.
    pub encryption_type: EncryptionType,
    /// Passphrase for `Xor`/`Aes256` modes. Ignored for `None`.
    pub encryption_key: Option<String>,

    /// Isolation level used by transactions begun without an explicit one.
    pub default_isolation_level: IsolationLevel,
    /// Default per-transaction lock-acquisition timeout.
    pub lock_timeout_ms: u64,
    /// Maximum commit retries before a transaction gives up (§4.8).
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memtable_size_mb: 4,
            page_size: 4096,
            l1_cache_size: 1_000,
            l2_cache_size: 10_000,
            l3_cache_size: 100_000,
            l1_cache_memory: 8 * 1024 * 1024,
            l2_cache_memory: 64 * 1024 * 1024,
            l3_cache_memory: 256 * 1024 * 1024,
            compression_enabled: false,
            sync_writes: true,
            max_immutable_memtables: 4,
            encryption_type: EncryptionType::None,
            encryption_key: None,
            default_isolation_level: IsolationLevel::ReadCommitted,
            lock_timeout_ms: 30_000,
            max_retries: 5,
        }
    }
}

#[cfg(test)]
mod tests;
