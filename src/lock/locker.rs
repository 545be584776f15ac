//! Lockers: transaction-scoped handles that own or wait for locks.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::core::time::deadline_saturating;

/// Stable identity of a locker, used for diagnostics and deadlock
/// victim tie-breaking.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockerId(pub(crate) u64);

impl fmt::Debug for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locker#{}", self.0)
    }
}

impl fmt::Display for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locker#{}", self.0)
    }
}

/// The kind of conflict that ended a lock attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// The attempt would have to wait (no-wait variants only).
    Blocked,
    /// The wait passed its deadline.
    Timeout,
    /// The locker was chosen as a deadlock victim. Definitive; the locker
    /// must be discarded.
    Deadlock,
    /// The wait was cooperatively interrupted.
    Interrupted,
}

/// Why a lock attempt failed, and with whom.
#[derive(Clone, Debug)]
pub struct LockConflict<K> {
    pub kind: ConflictKind,
    /// The key the failed request was for.
    pub key: K,
    pub for_write: bool,
    /// The owner the request first conflicted with.
    pub conflicting: LockerId,
}

/// The pending attempt a locker is blocked on, linking it into the
/// waits-for graph.
#[derive(Clone)]
pub(crate) struct WaitingFor<K> {
    pub key: K,
    pub for_write: bool,
    pub requested_start_time: i64,
    pub conflicting: std::sync::Arc<Locker<K>>,
}

pub(crate) struct LockerState<K> {
    pub conflict: Option<LockConflict<K>>,
    pub waiting_for: Option<WaitingFor<K>>,
    pub interrupted: bool,
}

/// A transaction-scoped entity that may own or wait for locks.
///
/// The locker's monitor protects its conflict and waiting-for slots; the
/// lock manager's wait loop sleeps on it and grant/deadlock paths notify
/// it. Created via [`LockManager::new_locker`](super::LockManager::new_locker).
pub struct Locker<K> {
    id: LockerId,
    pub(crate) manager_id: u64,
    /// Absolute deadline bounding every wait by this locker, if any.
    stop_time: Option<u64>,
    pub(crate) state: Mutex<LockerState<K>>,
    pub(crate) changed: Condvar,
}

impl<K> Locker<K> {
    pub(crate) fn new(id: u64, manager_id: u64, stop_time: Option<u64>) -> Self {
        Self {
            id: LockerId(id),
            manager_id,
            stop_time,
            state: Mutex::new(LockerState {
                conflict: None,
                waiting_for: None,
                interrupted: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> LockerId {
        self.id
    }

    /// The time at which a wait started at `now` should give up, given the
    /// manager-wide `lock_timeout`. Bounded by the locker's own stop time
    /// when one was set; saturates instead of wrapping, so a maximum-valued
    /// deadline means "never time out".
    pub fn lock_timeout_time(&self, now: u64, lock_timeout: u64) -> u64 {
        let stop = deadline_saturating(now, lock_timeout);
        match self.stop_time {
            Some(limit) => stop.min(limit),
            None => stop,
        }
    }

    /// Cooperatively interrupts a wait in progress, surfacing an
    /// [`Interrupted`](ConflictKind::Interrupted) conflict to the waiter.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().expect("locker state poisoned");
        state.interrupted = true;
        self.changed.notify_all();
    }

    /// The conflict recorded by the most recent failed attempt, if any.
    pub fn conflict(&self) -> Option<LockConflict<K>>
    where
        K: Clone,
    {
        self.state
            .lock()
            .expect("locker state poisoned")
            .conflict
            .clone()
    }

    /// Whether this locker has been marked as a deadlock victim. Once
    /// marked, every further lock or wait call on it panics.
    pub fn deadlocked(&self) -> bool {
        let state = self.state.lock().expect("locker state poisoned");
        matches!(
            state.conflict,
            Some(LockConflict {
                kind: ConflictKind::Deadlock,
                ..
            })
        )
    }

    pub(crate) fn state_guard(&self) -> MutexGuard<'_, LockerState<K>> {
        self.state.lock().expect("locker state poisoned")
    }
}

impl<K> fmt::Debug for Locker<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locker").field("id", &self.id).finish()
    }
}
