//! # Lock manager (C7)
//!
//! Per-key shared/exclusive locks with a waiter queue and a mandatory
//! timeout on every wait (§4.7, §5). One [`LockManager`] instance is shared
//! by every transaction opened against an engine.
//!
//! Compatibility matrix: `Shared`×`Shared` is compatible; every other
//! combination conflicts. A transaction that already holds `Exclusive` on a
//! key may re-acquire either type (idempotent). A transaction holding
//! `Shared` may upgrade to `Exclusive` only while it is the sole shared
//! holder; otherwise it waits like any other conflicting request.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The two lock modes a transaction may hold on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

/// Default wait before `acquire` gives up and returns `false` (§4.7).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct KeyState {
    holders: HashMap<u64, LockType>,
}

impl KeyState {
    fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    fn all_shared(&self) -> bool {
        self.holders.values().all(|t| *t == LockType::Shared)
    }
}

/// Outcome of one pass of a lock request against the current key state.
enum Decision {
    Granted,
    Conflict,
}

/// Shared, per-database lock table.
pub struct LockManager {
    state: Mutex<HashMap<Vec<u8>, KeyState>>,
    cond: Condvar,
    timeout: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Builds a manager using the default 30-second acquisition timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Builds a manager with an explicit acquisition timeout (mainly for
    /// tests that want fast-failing waits).
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        LockManager {
            state: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            timeout,
        }
    }

    /// Attempts to acquire `lock_type` on `key` for `tx_id`, parking on the
    /// shared condition variable while the request conflicts, up to the
    /// manager's timeout. Returns `false` on timeout — the caller treats
    /// this as an abort signal (§4.7).
    #[tracing::instrument(skip(self, key), fields(key = %String::from_utf8_lossy(key)))]
    pub fn acquire(&self, key: &[u8], tx_id: u64, lock_type: LockType) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut guard = self.state.lock();

        loop {
            match Self::try_grant(&mut guard, key, tx_id, lock_type) {
                Decision::Granted => {
                    tracing::trace!(tx_id, ?lock_type, "lock granted");
                    return true;
                }
                Decision::Conflict => {}
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(tx_id, ?lock_type, "lock acquisition timed out");
                return false;
            }
            let remaining = deadline - now;
            let result = self.cond.wait_for(&mut guard, remaining);
            if result.timed_out() {
                tracing::debug!(tx_id, ?lock_type, "lock acquisition timed out");
                return false;
            }
            // Woken by a release; loop around and re-evaluate.
        }
    }

    /// Evaluates one non-blocking attempt to grant `lock_type` to `tx_id` on
    /// `key`, mutating `holders` in place when the request can be satisfied.
    fn try_grant(
        guard: &mut HashMap<Vec<u8>, KeyState>,
        key: &[u8],
        tx_id: u64,
        lock_type: LockType,
    ) -> Decision {
        let entry = guard.entry(key.to_vec()).or_default();

        if let Some(existing) = entry.holders.get(&tx_id).copied() {
            return match (existing, lock_type) {
                // Already holding Exclusive: idempotent re-acquire of either type.
                (LockType::Exclusive, _) => Decision::Granted,
                (LockType::Shared, LockType::Shared) => Decision::Granted,
                (LockType::Shared, LockType::Exclusive) => {
                    if entry.holders.len() == 1 {
                        entry.holders.insert(tx_id, LockType::Exclusive);
                        Decision::Granted
                    } else {
                        Decision::Conflict
                    }
                }
            };
        }

        match lock_type {
            LockType::Shared => {
                if entry.is_empty() || entry.all_shared() {
                    entry.holders.insert(tx_id, LockType::Shared);
                    Decision::Granted
                } else {
                    Decision::Conflict
                }
            }
            LockType::Exclusive => {
                if entry.is_empty() {
                    entry.holders.insert(tx_id, LockType::Exclusive);
                    Decision::Granted
                } else {
                    Decision::Conflict
                }
            }
        }
    }

    /// Releases `tx_id`'s lock on a single `key`, waking waiters on that key.
    ///
    /// Not part of the three calls §4.7 enumerates by name, but required by
    /// Read Committed transactions (§4.8), which take a Shared lock per
    /// operation and release it immediately rather than holding it until
    /// commit; `release_all` alone cannot express that without also
    /// releasing the transaction's other held locks.
    #[tracing::instrument(skip(self, key), fields(key = %String::from_utf8_lossy(key)))]
    pub fn release(&self, key: &[u8], tx_id: u64) {
        let mut guard = self.state.lock();
        let mut now_empty = false;
        if let Some(state) = guard.get_mut(key) {
            state.holders.remove(&tx_id);
            now_empty = state.is_empty();
        }
        if now_empty {
            guard.remove(key);
        }
        drop(guard);
        tracing::trace!(tx_id, "lock released");
        self.cond.notify_all();
    }

    /// Releases every lock held by `tx_id` across all keys and wakes every
    /// waiter so it can re-evaluate (§4.7).
    #[tracing::instrument(skip(self))]
    pub fn release_all(&self, tx_id: u64) {
        let mut guard = self.state.lock();
        let mut released = 0usize;
        guard.retain(|_key, state| {
            if state.holders.remove(&tx_id) {
                released += 1;
            }
            !state.is_empty()
        });
        drop(guard);
        tracing::trace!(tx_id, released, "released all locks for transaction");
        self.cond.notify_all();
    }

    /// Returns whether `tx_id` currently holds at least `lock_type` on
    /// `key` — an `Exclusive` holder also satisfies a `Shared` query, since
    /// it is the strictly stronger mode.
    #[must_use]
    pub fn holds(&self, key: &[u8], tx_id: u64, lock_type: LockType) -> bool {
        let guard = self.state.lock();
        match guard.get(key).and_then(|s| s.holders.get(&tx_id)) {
            Some(LockType::Exclusive) => true,
            Some(LockType::Shared) => lock_type == LockType::Shared,
            None => false,
        }
    }

    /// Number of keys with at least one live holder. Exposed for tests and
    /// diagnostics, not part of the §4.7 contract.
    #[must_use]
    pub fn locked_key_count(&self) -> usize {
        self.state.lock().len()
    }
}
