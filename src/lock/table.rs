//! Per-key lock records: owner and waiter lists.
//!
//! Nothing here is synchronized; every method must be called with the
//! owning shard's monitor held.

use std::sync::Arc;

use super::locker::{Locker, LockerId};

/// A snapshot of one owner or waiter of a lock.
#[derive(Clone, Debug)]
pub struct LockRequest {
    pub locker: LockerId,
    pub for_write: bool,
    /// Time the requesting operation was originally asked to start, or -1
    /// for "right now".
    pub requested_start_time: i64,
}

/// A live owner or waiter entry.
pub(crate) struct Request<K> {
    pub locker: Arc<Locker<K>>,
    pub for_write: bool,
    pub requested_start_time: i64,
}

impl<K> Request<K> {
    fn snapshot(&self) -> LockRequest {
        LockRequest {
            locker: self.locker.id(),
            for_write: self.for_write,
            requested_start_time: self.requested_start_time,
        }
    }
}

/// Outcome of a grant attempt.
pub(crate) enum Attempt<K> {
    /// The locker now owns the lock (or already did with sufficient
    /// access).
    Granted,
    /// The request was queued; the first incompatible owner is recorded.
    Blocked { conflicting: Arc<Locker<K>> },
}

/// The owner and waiter lists for one key.
///
/// Invariants (under the shard monitor): owners are mutually compatible
/// (all readers, or a single writer, or one writer that also appears as an
/// upgrading reader nowhere else); no waiter is compatible with the full
/// owner set; waiters are ordered by ascending requested start time, with
/// -1 sorting after every real timestamp.
pub(crate) struct LockState<K> {
    owners: Vec<Request<K>>,
    waiters: Vec<Request<K>>,
}

/// Sort key for waiter ordering: -1 means "right now" and queues behind
/// every timestamped request. Also ranks deadlock victims: the youngest
/// request loses.
pub(crate) fn waiter_rank(requested_start_time: i64) -> i64 {
    if requested_start_time < 0 {
        i64::MAX
    } else {
        requested_start_time
    }
}

impl<K> LockState<K> {
    pub fn new() -> Self {
        Self {
            owners: Vec::new(),
            waiters: Vec::new(),
        }
    }

    pub fn in_use(&self) -> bool {
        !self.owners.is_empty() || !self.waiters.is_empty()
    }

    /// Whether `locker` owns this lock with at least the requested access.
    pub fn is_owner(&self, locker: LockerId, for_write: bool) -> bool {
        self.owners
            .iter()
            .any(|owner| owner.locker.id() == locker && (owner.for_write || !for_write))
    }

    /// Whether `waiter` would be granted against the current owners,
    /// ignoring the waiter's own (read) ownership so upgrades can go
    /// through once every other reader is gone.
    fn compatible(&self, waiter_id: LockerId, for_write: bool) -> bool {
        self.owners
            .iter()
            .filter(|owner| owner.locker.id() != waiter_id)
            .all(|owner| !owner.for_write && !for_write)
    }

    /// Attempts to grant `locker` the requested access, queueing the
    /// request on conflict.
    ///
    /// The caller must have verified that the locker is not already
    /// waiting for some lock, so `locker` never appears in `waiters` here.
    pub fn attempt(
        &mut self,
        locker: &Arc<Locker<K>>,
        for_write: bool,
        requested_start_time: i64,
    ) -> Attempt<K> {
        let id = locker.id();
        if let Some(held) = self.owners.iter().position(|owner| owner.locker.id() == id) {
            if self.owners[held].for_write || !for_write {
                return Attempt::Granted;
            }
            // Upgrade: granted in place when this is the sole owner.
            if self.owners.len() == 1 {
                self.owners[held].for_write = true;
                return Attempt::Granted;
            }
        } else if self.compatible(id, for_write) {
            self.owners.push(Request {
                locker: Arc::clone(locker),
                for_write,
                requested_start_time,
            });
            return Attempt::Granted;
        }

        let conflicting = self
            .owners
            .iter()
            .find(|owner| owner.locker.id() != id && (owner.for_write || for_write))
            .map(|owner| Arc::clone(&owner.locker))
            .expect("blocked request with no incompatible owner");

        let rank = waiter_rank(requested_start_time);
        let at = self
            .waiters
            .iter()
            .position(|waiter| waiter_rank(waiter.requested_start_time) > rank)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(
            at,
            Request {
                locker: Arc::clone(locker),
                for_write,
                requested_start_time,
            },
        );
        Attempt::Blocked { conflicting }
    }

    /// Releases (or downgrades) `locker`'s ownership and promotes the
    /// longest compatible prefix of waiters. Returns the newly promoted
    /// lockers; the caller must notify each of them after dropping the
    /// shard monitor.
    pub fn release(&mut self, locker: LockerId, downgrade: bool) -> Vec<Arc<Locker<K>>> {
        let Some(held) = self
            .owners
            .iter()
            .position(|owner| owner.locker.id() == locker)
        else {
            return Vec::new();
        };
        if downgrade {
            if !self.owners[held].for_write {
                return Vec::new();
            }
            self.owners[held].for_write = false;
        } else {
            self.owners.remove(held);
        }
        self.promote_waiters()
    }

    fn promote_waiters(&mut self) -> Vec<Arc<Locker<K>>> {
        let mut promoted = Vec::new();
        while let Some(head) = self.waiters.first() {
            if !self.compatible(head.locker.id(), head.for_write) {
                break;
            }
            let request = self.waiters.remove(0);
            let id = request.locker.id();
            if let Some(held) = self.owners.iter().position(|owner| owner.locker.id() == id) {
                // A waiting upgrade replaces the reader entry.
                self.owners[held].for_write |= request.for_write;
            } else {
                promoted.push(Arc::clone(&request.locker));
                self.owners.push(request);
                continue;
            }
            promoted.push(request.locker);
        }
        promoted
    }

    /// Removes `locker` from the waiter list after its wait completed,
    /// whether granted or conflicted.
    pub fn flush_waiter(&mut self, locker: LockerId) {
        self.waiters.retain(|waiter| waiter.locker.id() != locker);
    }

    pub fn owns(&self, locker: LockerId) -> bool {
        self.owners.iter().any(|owner| owner.locker.id() == locker)
    }

    pub fn copy_owners(&self) -> Vec<LockRequest> {
        self.owners.iter().map(Request::snapshot).collect()
    }

    pub fn copy_waiters(&self) -> Vec<LockRequest> {
        self.waiters.iter().map(Request::snapshot).collect()
    }

    /// Debug check of the compatibility invariants.
    #[cfg(debug_assertions)]
    pub fn check_invariants(&self) {
        let writers = self.owners.iter().filter(|owner| owner.for_write).count();
        debug_assert!(
            writers == 0 || self.owners.len() == 1,
            "incompatible owners: {writers} writers among {} owners",
            self.owners.len()
        );
        if let Some(head) = self.waiters.first() {
            debug_assert!(
                !self.compatible(head.locker.id(), head.for_write),
                "head waiter is compatible with the owner set"
            );
        }
    }
}
