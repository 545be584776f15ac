//! Keyed reader/writer locks with timeout, fairness, and deadlock
//! detection.
//!
//! The table is sharded by key hash into `num_key_maps` maps, each behind
//! its own monitor; there is no global lock. Lock records themselves are
//! not synchronized: all mutation of owner/waiter lists happens under the
//! owning shard's monitor.
//!
//! Synchronization scheme, preserved by every code path here:
//!
//! 1. a thread holds at most one locker monitor and one shard monitor at a
//!    time;
//! 2. when it holds both, the locker monitor was acquired first;
//! 3. lock records are mutated only under their shard monitor;
//! 4. while a shard monitor is held, no other shard or locker monitor is
//!    acquired.
//!
//! Debug builds assert these rules with thread-local tracking; violating
//! them admits deadlock between the manager's own monitors.

mod locker;
mod table;

use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace};

use crate::core::time::now_millis;

pub use locker::{ConflictKind, LockConflict, Locker, LockerId};
pub use table::LockRequest;

use locker::WaitingFor;
use table::{Attempt, LockState};

#[cfg(debug_assertions)]
mod discipline {
    use std::cell::Cell;

    thread_local! {
        static LOCKER_HELD: Cell<bool> = const { Cell::new(false) };
        static SHARD_HELD: Cell<bool> = const { Cell::new(false) };
    }

    pub fn acquire_locker() {
        assert!(
            !LOCKER_HELD.get(),
            "thread is already synchronized on a locker"
        );
        assert!(
            !SHARD_HELD.get(),
            "locker monitor must be acquired before the shard monitor"
        );
        LOCKER_HELD.set(true);
    }

    pub fn release_locker() {
        LOCKER_HELD.set(false);
    }

    pub fn acquire_shard() {
        assert!(
            !SHARD_HELD.get(),
            "thread is already synchronized on a shard"
        );
        SHARD_HELD.set(true);
    }

    pub fn release_shard() {
        SHARD_HELD.set(false);
    }
}

#[cfg(not(debug_assertions))]
mod discipline {
    pub fn acquire_locker() {}
    pub fn release_locker() {}
    pub fn acquire_shard() {}
    pub fn release_shard() {}
}

/// RAII record that this thread is synchronized on a locker monitor.
///
/// Declare the note before the guard so it drops after the guard; a
/// condvar wait may temporarily give the monitor up while the note stays
/// in place, matching the logical hold.
struct LockerSyncNote;

impl LockerSyncNote {
    fn acquire() -> Self {
        discipline::acquire_locker();
        LockerSyncNote
    }
}

impl Drop for LockerSyncNote {
    fn drop(&mut self) {
        discipline::release_locker();
    }
}

/// A shard monitor guard that participates in the discipline tracking.
struct ShardGuard<'a, K> {
    guard: MutexGuard<'a, HashMap<K, LockState<K>>>,
    _note: ShardSyncNote,
}

struct ShardSyncNote;

impl Drop for ShardSyncNote {
    fn drop(&mut self) {
        discipline::release_shard();
    }
}

impl<'a, K> ShardGuard<'a, K> {
    fn acquire(shard: &'a Mutex<HashMap<K, LockState<K>>>) -> Self {
        discipline::acquire_shard();
        let _note = ShardSyncNote;
        Self {
            guard: shard.lock().expect("lock shard poisoned"),
            _note,
        }
    }
}

impl<K> Deref for ShardGuard<'_, K> {
    type Target = HashMap<K, LockState<K>>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<K> DerefMut for ShardGuard<'_, K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// One edge of the waits-for graph captured during a deadlock walk.
struct PathEdge<K> {
    waiter: Arc<Locker<K>>,
    key: K,
    for_write: bool,
    requested_start_time: i64,
    conflicting: Arc<Locker<K>>,
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// A table of reader/writer locks keyed by `K`.
///
/// The manager has no threads of its own; `lock` and `wait_for_lock` run
/// (and sleep) on caller threads. After any conflict the caller is
/// expected to release every key it requested and abort or retry.
pub struct LockManager<K> {
    id: u64,
    lock_timeout: u64,
    shards: Vec<Mutex<HashMap<K, LockState<K>>>>,
    next_locker_id: AtomicU64,
}

impl<K> LockManager<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Creates a manager with the given lock timeout in milliseconds and
    /// shard count. Both must be at least 1.
    pub fn new(lock_timeout: u64, num_key_maps: usize) -> Self {
        assert!(lock_timeout >= 1, "lock_timeout must not be less than 1");
        assert!(num_key_maps >= 1, "num_key_maps must not be less than 1");
        let mut shards = Vec::with_capacity(num_key_maps);
        for _ in 0..num_key_maps {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            lock_timeout,
            shards,
            next_locker_id: AtomicU64::new(1),
        }
    }

    /// Creates a locker bound to this manager.
    pub fn new_locker(&self) -> Arc<Locker<K>> {
        Arc::new(Locker::new(
            self.next_locker_id.fetch_add(1, Ordering::Relaxed),
            self.id,
            None,
        ))
    }

    /// Creates a locker whose waits additionally stop at the given
    /// absolute time (for transactions with their own deadline).
    pub fn new_locker_with_stop_time(&self, stop_time: u64) -> Arc<Locker<K>> {
        Arc::new(Locker::new(
            self.next_locker_id.fetch_add(1, Ordering::Relaxed),
            self.id,
            Some(stop_time),
        ))
    }

    /// Attempts to acquire a lock, waiting up to the locker's timeout.
    /// Returns `None` on grant, or the conflict that prevented it.
    ///
    /// `requested_start_time` is the time in milliseconds the operation
    /// behind this request was originally asked to start, or -1 for
    /// "right now"; older requests queue ahead of newer waiters.
    ///
    /// Panics if the locker belongs to another manager, is already
    /// waiting, or was marked as a deadlock victim.
    pub fn lock(
        &self,
        locker: &Arc<Locker<K>>,
        key: K,
        for_write: bool,
        requested_start_time: i64,
    ) -> Option<LockConflict<K>> {
        self.check_manager(locker);
        self.check_not_deadlocked(locker);
        match self.lock_no_wait_internal(locker, key, for_write, requested_start_time) {
            None => None,
            Some(_) => self.wait_for_lock_internal(locker),
        }
    }

    /// Attempts to acquire a lock without waiting. A blocked attempt
    /// returns a [`ConflictKind::Blocked`] conflict and leaves the request
    /// queued; complete it later with [`wait_for_lock`](Self::wait_for_lock).
    pub fn lock_no_wait(
        &self,
        locker: &Arc<Locker<K>>,
        key: K,
        for_write: bool,
        requested_start_time: i64,
    ) -> Option<LockConflict<K>> {
        self.check_manager(locker);
        self.check_not_deadlocked(locker);
        self.lock_no_wait_internal(locker, key, for_write, requested_start_time)
    }

    /// Waits out a previous attempt that returned blocked. Returns `None`
    /// if the lock was acquired (or the locker was not waiting).
    pub fn wait_for_lock(&self, locker: &Arc<Locker<K>>) -> Option<LockConflict<K>> {
        self.check_manager(locker);
        self.check_not_deadlocked(locker);
        self.wait_for_lock_internal(locker)
    }

    /// Releases a lock held by the locker. Does nothing if not held.
    pub fn release_lock(&self, locker: &Arc<Locker<K>>, key: &K) {
        trace!(locker = %locker.id(), ?key, "release");
        self.check_manager(locker);
        self.release_internal(locker, key, false);
    }

    /// Downgrades a write lock held by the locker to a read lock. Does
    /// nothing if the locker holds no write lock on the key.
    pub fn downgrade(&self, locker: &Arc<Locker<K>>, key: &K) {
        trace!(locker = %locker.id(), ?key, "downgrade");
        self.check_manager(locker);
        self.release_internal(locker, key, true);
    }

    /// A snapshot of the current owners of a key's lock.
    pub fn get_owners(&self, key: &K) -> Vec<LockRequest> {
        let shard = self.shard_guard(key);
        shard.get(key).map(LockState::copy_owners).unwrap_or_default()
    }

    /// A snapshot of the current waiters for a key's lock.
    pub fn get_waiters(&self, key: &K) -> Vec<LockRequest> {
        let shard = self.shard_guard(key);
        shard
            .get(key)
            .map(LockState::copy_waiters)
            .unwrap_or_default()
    }

    fn shard_guard(&self, key: &K) -> ShardGuard<'_, K> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        ShardGuard::acquire(&self.shards[index])
    }

    fn lock_no_wait_internal(
        &self,
        locker: &Arc<Locker<K>>,
        key: K,
        for_write: bool,
        requested_start_time: i64,
    ) -> Option<LockConflict<K>> {
        assert!(
            requested_start_time >= -1,
            "requested_start_time must be -1 or a timestamp, got {requested_start_time}"
        );
        {
            let _note = LockerSyncNote::acquire();
            let mut state = locker.state_guard();
            if state.waiting_for.is_some() {
                panic!(
                    "attempt to obtain a new lock while waiting: {}",
                    locker.id()
                );
            }
            match &state.conflict {
                Some(conflict) if conflict.kind == ConflictKind::Deadlock => {
                    panic!(
                        "attempt to obtain a new lock after a deadlock: {}",
                        locker.id()
                    );
                }
                Some(_) => state.conflict = None,
                None => {}
            }
        }

        let attempt = {
            let mut shard = self.shard_guard(&key);
            let lock = shard.entry(key.clone()).or_insert_with(LockState::new);
            let attempt = lock.attempt(locker, for_write, requested_start_time);
            #[cfg(debug_assertions)]
            lock.check_invariants();
            attempt
        };

        match attempt {
            Attempt::Granted => {
                trace!(locker = %locker.id(), ?key, for_write, "lock granted");
                None
            }
            Attempt::Blocked { conflicting } => {
                let conflict = LockConflict {
                    kind: ConflictKind::Blocked,
                    key: key.clone(),
                    for_write,
                    conflicting: conflicting.id(),
                };
                {
                    let _note = LockerSyncNote::acquire();
                    let mut state = locker.state_guard();
                    state.waiting_for = Some(WaitingFor {
                        key,
                        for_write,
                        requested_start_time,
                        conflicting,
                    });
                }
                self.detect_deadlock(locker);
                trace!(
                    locker = %locker.id(),
                    conflicting = %conflict.conflicting,
                    "lock attempt blocked"
                );
                Some(conflict)
            }
        }
    }

    fn wait_for_lock_internal(&self, locker: &Arc<Locker<K>>) -> Option<LockConflict<K>> {
        let _note = LockerSyncNote::acquire();
        let mut state = locker.state_guard();
        let Some(waiting) = state.waiting_for.clone() else {
            trace!(locker = %locker.id(), "not waiting");
            return None;
        };
        let key = waiting.key.clone();
        let mut now = now_millis();
        let stop = locker.lock_timeout_time(now, self.lock_timeout);

        let conflict = loop {
            if let Some(conflict) = state.conflict.clone() {
                break conflict;
            }
            if state.interrupted {
                state.interrupted = false;
                let conflict = LockConflict {
                    kind: ConflictKind::Interrupted,
                    key: key.clone(),
                    for_write: waiting.for_write,
                    conflicting: waiting.conflicting.id(),
                };
                state.conflict = Some(conflict.clone());
                break conflict;
            }
            if now >= stop {
                let conflict = LockConflict {
                    kind: ConflictKind::Timeout,
                    key: key.clone(),
                    for_write: waiting.for_write,
                    conflicting: waiting.conflicting.id(),
                };
                state.conflict = Some(conflict.clone());
                break conflict;
            }

            let is_owner = {
                let shard = self.shard_guard(&key);
                shard
                    .get(&key)
                    .is_some_and(|lock| lock.is_owner(locker.id(), waiting.for_write))
            };
            if is_owner {
                state.waiting_for = None;
                trace!(locker = %locker.id(), ?key, "lock granted after wait");
                return None;
            }

            trace!(locker = %locker.id(), ?key, wait_ms = stop - now, "waiting for lock");
            let (guard, _) = locker
                .changed
                .wait_timeout(state, Duration::from_millis(stop - now))
                .expect("locker state poisoned");
            state = guard;
            now = now_millis();
        };

        {
            let mut shard = self.shard_guard(&key);
            if let Some(lock) = shard.get_mut(&key) {
                lock.flush_waiter(locker.id());
                if !lock.in_use() {
                    shard.remove(&key);
                }
            }
        }
        state.waiting_for = None;
        debug!(locker = %locker.id(), ?key, kind = ?conflict.kind, "lock attempt failed");
        Some(conflict)
    }

    fn release_internal(&self, locker: &Arc<Locker<K>>, key: &K, downgrade: bool) {
        let promoted = {
            let mut shard = self.shard_guard(key);
            match shard.get_mut(key) {
                Some(lock) => {
                    let promoted = lock.release(locker.id(), downgrade);
                    #[cfg(debug_assertions)]
                    lock.check_invariants();
                    if !lock.in_use() {
                        shard.remove(key);
                    }
                    promoted
                }
                None => Vec::new(),
            }
        };
        for new_owner in promoted {
            trace!(new_owner = %new_owner.id(), ?key, "notify new owner");
            let _note = LockerSyncNote::acquire();
            let _state = new_owner.state_guard();
            new_owner.changed.notify_all();
        }
    }

    /// Walks the waits-for graph from `origin`; if a cycle is found and
    /// re-verified against the live table, convicts the youngest member.
    fn detect_deadlock(&self, origin: &Arc<Locker<K>>) {
        let Some(cycle) = self.find_cycle(origin) else {
            return;
        };
        if !self.cycle_live(&cycle) {
            return;
        }
        let victim = cycle
            .iter()
            .max_by_key(|edge| {
                (
                    table::waiter_rank(edge.requested_start_time),
                    edge.waiter.id(),
                )
            })
            .expect("deadlock cycle is non-empty");
        let _note = LockerSyncNote::acquire();
        let mut state = victim.waiter.state_guard();
        let still_waiting = state
            .waiting_for
            .as_ref()
            .is_some_and(|waiting| waiting.key == victim.key);
        if still_waiting && state.conflict.is_none() {
            debug!(
                victim = %victim.waiter.id(),
                key = ?victim.key,
                "deadlock detected"
            );
            state.conflict = Some(LockConflict {
                kind: ConflictKind::Deadlock,
                key: victim.key.clone(),
                for_write: victim.for_write,
                conflicting: victim.conflicting.id(),
            });
            victim.waiter.changed.notify_all();
        }
    }

    fn find_cycle(&self, origin: &Arc<Locker<K>>) -> Option<Vec<PathEdge<K>>> {
        let mut path: Vec<PathEdge<K>> = Vec::new();
        let mut on_path = vec![origin.id()];
        let mut current = Arc::clone(origin);
        loop {
            let waiting = {
                let _note = LockerSyncNote::acquire();
                let state = current.state_guard();
                state.waiting_for.clone()
            };
            let Some(waiting) = waiting else {
                return None;
            };
            let next = Arc::clone(&waiting.conflicting);
            path.push(PathEdge {
                waiter: current,
                key: waiting.key,
                for_write: waiting.for_write,
                requested_start_time: waiting.requested_start_time,
                conflicting: Arc::clone(&next),
            });
            if let Some(at) = on_path.iter().position(|id| *id == next.id()) {
                return Some(path.split_off(at));
            }
            on_path.push(next.id());
            current = next;
        }
    }

    /// Re-verifies every edge of a candidate cycle against the current
    /// table state: the waiter must still be blocked on the same key and
    /// the conflicting locker must still own it. Detection is definitive,
    /// never speculative.
    fn cycle_live(&self, cycle: &[PathEdge<K>]) -> bool {
        cycle.iter().all(|edge| {
            let still_waiting = {
                let _note = LockerSyncNote::acquire();
                let state = edge.waiter.state_guard();
                state.conflict.is_none()
                    && state.waiting_for.as_ref().is_some_and(|waiting| {
                        waiting.key == edge.key
                            && waiting.conflicting.id() == edge.conflicting.id()
                    })
            };
            if !still_waiting {
                return false;
            }
            let shard = self.shard_guard(&edge.key);
            shard.get(&edge.key).is_some_and(|lock| {
                lock.owns(edge.conflicting.id()) && !lock.is_owner(edge.waiter.id(), edge.for_write)
            })
        })
    }

    fn check_manager(&self, locker: &Arc<Locker<K>>) {
        assert!(
            locker.manager_id == self.id,
            "locker {} belongs to a different lock manager",
            locker.id()
        );
    }

    fn check_not_deadlocked(&self, locker: &Arc<Locker<K>>) {
        if locker.deadlocked() {
            panic!("locker must abort after deadlock: {}", locker.id());
        }
    }
}
