//! # CLI - RiptideKV Interactive Shell
//!
//! A REPL-style command-line interface for the RiptideKV embeddable
//! database. Reads commands from stdin, executes them against a
//! [`engine::Database`], and prints results to stdout. Designed for both
//! interactive use and scripted testing (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! SET key value           Insert or update a key-value pair
//! GET key                 Look up a key (prints value or "(nil)")
//! DEL key                 Delete a key (writes a tombstone)
//! SCAN [start] [end]      Range scan (inclusive start, exclusive end)
//! BEGIN / COMMIT / ABORT  Explicit transaction boundaries
//! TXSET key value         SET inside the open transaction
//! TXGET key               GET inside the open transaction
//! CREATEINDEX coll field  Build a secondary index, back-filled from existing docs
//! DROPINDEX coll field    Remove a secondary index
//! QUERY coll field value  Equality query against a collection (uses the index if present)
//! WATCH pattern           Print change-stream events matching a glob pattern
//! STATS                   Print cache/lock/transaction counters
//! INFO                    Print structural info (SSTable counts, seq, subscribers)
//! EXIT / QUIT             Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! All settings are controlled via environment variables; see
//! [`config_from_env`] for the full list and defaults.
use anyhow::Result;
use config::{EngineConfig, IsolationLevel};
use crypto::EncryptionType;
use engine::Database;
use std::io::{self, BufRead, Write};
use std::time::Duration;

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    env_or(key, &default.to_string()).parse().unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_or(key, &default.to_string()).parse().unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_or(key, &default.to_string()).parse().unwrap_or(default)
}

/// Builds an [`EngineConfig`] from `RIPTIDE_*` environment variables,
/// falling back to [`EngineConfig::default`] for anything unset.
///
/// ```text
/// RIPTIDE_DB_DIR             database directory          (default: "data")
/// RIPTIDE_MEMTABLE_MB        memtable flush threshold     (default: 4)
/// RIPTIDE_PAGE_SIZE          SSTable/B+-tree page size    (default: 4096)
/// RIPTIDE_L1_CACHE_ENTRIES   L1 cache max entries         (default: 1000)
/// RIPTIDE_L2_CACHE_ENTRIES   L2 cache max entries         (default: 10000)
/// RIPTIDE_L3_CACHE_ENTRIES   L3 cache max entries         (default: 100000)
/// RIPTIDE_WAL_SYNC           fsync every WAL append       (default: true)
/// RIPTIDE_ENCRYPTION_TYPE    "none" | "xor" | "aes256"    (default: none)
/// RIPTIDE_ENCRYPTION_KEY     passphrase for xor/aes256    (default: unset)
/// RIPTIDE_ISOLATION          default isolation level      (default: read-committed)
/// RIPTIDE_LOCK_TIMEOUT_MS    per-transaction lock timeout (default: 30000)
/// RIPTIDE_MAX_RETRIES        max commit retries           (default: 5)
/// ```
fn config_from_env() -> EngineConfig {
    let defaults = EngineConfig::default();
    EngineConfig {
        memtable_size_mb: env_usize("RIPTIDE_MEMTABLE_MB", defaults.memtable_size_mb),
        page_size: env_usize("RIPTIDE_PAGE_SIZE", defaults.page_size),
        l1_cache_size: env_usize("RIPTIDE_L1_CACHE_ENTRIES", defaults.l1_cache_size),
        l2_cache_size: env_usize("RIPTIDE_L2_CACHE_ENTRIES", defaults.l2_cache_size),
        l3_cache_size: env_usize("RIPTIDE_L3_CACHE_ENTRIES", defaults.l3_cache_size),
        sync_writes: env_bool("RIPTIDE_WAL_SYNC", defaults.sync_writes),
        encryption_type: parse_encryption_type(&env_or("RIPTIDE_ENCRYPTION_TYPE", "none")),
        encryption_key: std::env::var("RIPTIDE_ENCRYPTION_KEY").ok(),
        default_isolation_level: parse_isolation(&env_or("RIPTIDE_ISOLATION", "read-committed")),
        lock_timeout_ms: env_u64("RIPTIDE_LOCK_TIMEOUT_MS", defaults.lock_timeout_ms),
        max_retries: env_usize("RIPTIDE_MAX_RETRIES", defaults.max_retries as usize) as u32,
        ..defaults
    }
}

fn parse_encryption_type(s: &str) -> EncryptionType {
    match s.to_ascii_lowercase().as_str() {
        "xor" => EncryptionType::Xor,
        "aes256" | "aes-256" | "aes256gcm" => EncryptionType::Aes256,
        _ => EncryptionType::None,
    }
}

fn parse_isolation(s: &str) -> IsolationLevel {
    match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
        "readuncommitted" => IsolationLevel::ReadUncommitted,
        "repeatableread" => IsolationLevel::RepeatableRead,
        "serializable" => IsolationLevel::Serializable,
        _ => IsolationLevel::ReadCommitted,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db_dir = env_or("RIPTIDE_DB_DIR", "data");
    let config = config_from_env();
    let db = Database::open(&db_dir, config)?;

    let info = db.info();
    println!(
        "RiptideKV started (seq={}, sstables={}, dir={})",
        info.seq, info.sstable_count, db_dir
    );
    println!("Commands: SET key value | GET key | DEL key | SCAN [start] [end]");
    println!("          BEGIN | TXSET key value | TXGET key | COMMIT | ABORT");
    println!("          CREATEINDEX coll field | DROPINDEX coll field");
    println!("          QUERY coll field value | WATCH pattern | STATS | INFO | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let mut open_txn: Option<txn::Transaction> = None;
    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            match cmd.to_uppercase().as_str() {
                "SET" => match (parts.next(), rest(&mut parts)) {
                    (Some(k), Some(v)) => match db.put(k.as_bytes().to_vec(), v.into_bytes()) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR set failed: {e}"),
                    },
                    _ => println!("ERR usage: SET key value"),
                },
                "GET" => match parts.next() {
                    Some(k) => match db.get(k.as_bytes()) {
                        Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                        Ok(None) => println!("(nil)"),
                        Err(e) => println!("ERR read failed: {e}"),
                    },
                    None => println!("ERR usage: GET key"),
                },
                "DEL" => match parts.next() {
                    Some(k) => match db.delete(k.as_bytes()) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR del failed: {e}"),
                    },
                    None => println!("ERR usage: DEL key"),
                },
                "SCAN" => {
                    let start = parts.next().unwrap_or("").as_bytes();
                    let end = parts.next().unwrap_or("").as_bytes();
                    match db.scan(start, end) {
                        Ok(results) if results.is_empty() => println!("(empty)"),
                        Ok(results) => {
                            for (k, v) in &results {
                                println!("{} -> {}", String::from_utf8_lossy(k), String::from_utf8_lossy(v));
                            }
                            println!("({} entries)", results.len());
                        }
                        Err(e) => println!("ERR scan failed: {e}"),
                    }
                }
                "BEGIN" => {
                    if open_txn.is_some() {
                        println!("ERR a transaction is already open");
                    } else {
                        open_txn = Some(db.begin_default());
                        println!("OK");
                    }
                }
                "TXSET" => match (&mut open_txn, parts.next(), rest(&mut parts)) {
                    (Some(tx), Some(k), Some(v)) => match tx.put(k.as_bytes(), v.into_bytes()) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR txset failed: {e}"),
                    },
                    (None, _, _) => println!("ERR no open transaction; use BEGIN first"),
                    _ => println!("ERR usage: TXSET key value"),
                },
                "TXGET" => match (&mut open_txn, parts.next()) {
                    (Some(tx), Some(k)) => match tx.get(k.as_bytes()) {
                        Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                        Ok(None) => println!("(nil)"),
                        Err(e) => println!("ERR txget failed: {e}"),
                    },
                    (None, _) => println!("ERR no open transaction; use BEGIN first"),
                    _ => println!("ERR usage: TXGET key"),
                },
                "COMMIT" => match open_txn.take() {
                    Some(tx) => match db.commit(tx) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR commit failed: {e}"),
                    },
                    None => println!("ERR no open transaction"),
                },
                "ABORT" => match open_txn.take() {
                    Some(tx) => {
                        db.abort(tx);
                        println!("OK");
                    }
                    None => println!("ERR no open transaction"),
                },
                "CREATEINDEX" => match (parts.next(), parts.next()) {
                    (Some(coll), Some(field)) => match db.create_index(coll, field) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR createindex failed: {e}"),
                    },
                    _ => println!("ERR usage: CREATEINDEX collection field"),
                },
                "DROPINDEX" => match (parts.next(), parts.next()) {
                    (Some(coll), Some(field)) => match db.drop_index(coll, field) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR dropindex failed: {e}"),
                    },
                    _ => println!("ERR usage: DROPINDEX collection field"),
                },
                "QUERY" => match (parts.next(), parts.next(), rest(&mut parts)) {
                    (Some(coll), Some(field), Some(value)) => {
                        let q = query::Query::new(coll)
                            .where_equals(field, value::Value::String(value));
                        match db.query(&q) {
                            Ok(query::QueryOutcome::Documents(docs)) => {
                                for (id, doc) in &docs {
                                    println!("{id} -> {doc:?}");
                                }
                                println!("({} documents)", docs.len());
                            }
                            Ok(other) => println!("{other:?}"),
                            Err(e) => println!("ERR query failed: {e}"),
                        }
                    }
                    _ => println!("ERR usage: QUERY collection field value"),
                },
                "WATCH" => match parts.next() {
                    Some(pattern) => watch_for(&db, pattern, Duration::from_secs(5)),
                    None => println!("ERR usage: WATCH pattern"),
                },
                "STATS" => {
                    let stats = db.stats();
                    println!(
                        "cache_hits={} cache_misses={} active_txns={} locked_keys={}",
                        stats.cache.total_hits(),
                        stats.cache.total_misses(),
                        stats.active_transactions,
                        stats.locked_key_count
                    );
                }
                "INFO" => {
                    let info = db.info();
                    println!(
                        "seq={} sstables={} (l0={} l1={} l2={}) subscribers={}",
                        info.seq,
                        info.sstable_count,
                        info.l0_sstable_count,
                        info.l1_sstable_count,
                        info.l2_sstable_count,
                        info.subscriber_count
                    );
                }
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => println!("unknown command: {other}"),
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    db.close()?;
    Ok(())
}

fn rest<'a>(parts: &mut impl Iterator<Item = &'a str>) -> Option<String> {
    let joined = parts.collect::<Vec<&str>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Subscribes to `pattern` and prints every event received within `timeout`,
/// for demonstrating the change-stream bus from the shell.
fn watch_for(db: &Database, pattern: &str, timeout: Duration) {
    let sub = db.subscribe(pattern);
    let deadline = std::time::Instant::now() + timeout;
    let mut count = 0;
    while std::time::Instant::now() < deadline {
        match sub.try_recv() {
            Some(changestream::StreamEvent::Change(event)) => {
                println!(
                    "{:?} {}{}",
                    event.op,
                    String::from_utf8_lossy(&event.key),
                    event
                        .value
                        .as_ref()
                        .map(|v| format!(" -> {}", String::from_utf8_lossy(v)))
                        .unwrap_or_default()
                );
                count += 1;
            }
            Some(changestream::StreamEvent::Dropped) => {
                println!("(subscriber backlog dropped, some events were missed)");
                break;
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
    println!("({count} events)");
}
