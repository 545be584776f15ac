//! A cache entry for one name binding.
//!
//! Only the `key` field may be read without holding the entry's monitor;
//! every other field, and every method taking an [`EntryInner`] reference,
//! requires it. The monitor also carries the pending-previous interlock:
//! an operation that is about to change the relationship between this
//! entry and its immediate predecessor claims the entry first, and
//! neighbor-dependent operations wait the claim out.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::key::{BindingKey, BindingState, ObjectId};
use crate::core::time::now_millis;

use super::CacheError;

/// Lifecycle states of a binding entry.
///
/// `Decached` is absorbing; a key must get a fresh entry to be cached
/// again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    FetchingRead,
    FetchingWrite,
    CachedRead,
    CachedWrite,
    Writing,
    Decached,
}

impl EntryState {
    /// Whether the entry's value is locally authoritative for reads.
    pub fn readable(self) -> bool {
        matches!(
            self,
            EntryState::CachedRead | EntryState::CachedWrite | EntryState::Writing
        )
    }

    pub fn writable(self) -> bool {
        matches!(self, EntryState::CachedWrite)
    }

    pub fn fetching(self) -> bool {
        matches!(self, EntryState::FetchingRead | EntryState::FetchingWrite)
    }
}

/// The mutable half of an entry, guarded by the entry monitor.
pub struct EntryInner {
    state: EntryState,
    value: ObjectId,
    context_id: u64,
    previous_key: Option<BindingKey>,
    previous_key_unbound: bool,
    pending_previous: bool,
    interrupted: bool,
}

impl EntryInner {
    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn value(&self) -> ObjectId {
        self.value
    }

    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    pub fn previous_key(&self) -> Option<&BindingKey> {
        self.previous_key.as_ref()
    }

    pub fn previous_key_unbound(&self) -> bool {
        self.previous_key_unbound
    }

    pub fn pending_previous(&self) -> bool {
        self.pending_previous
    }

    /// Records which transaction context last touched this entry.
    pub fn note_access(&mut self, context_id: u64) {
        self.context_id = context_id;
    }
}

/// A cache entry: an immutable key plus monitored mutable state.
pub struct BindingEntry {
    key: BindingKey,
    inner: Mutex<EntryInner>,
    changed: Condvar,
}

impl BindingEntry {
    fn new(key: BindingKey, state: EntryState, value: ObjectId, context_id: u64) -> Self {
        Self {
            key,
            inner: Mutex::new(EntryInner {
                state,
                value,
                context_id,
                previous_key: None,
                previous_key_unbound: false,
                pending_previous: false,
                interrupted: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// An entry for a binding whose fetch from the authority just started.
    pub(crate) fn new_fetching(key: BindingKey, for_write: bool) -> Self {
        let state = if for_write {
            EntryState::FetchingWrite
        } else {
            EntryState::FetchingRead
        };
        Self::new(key, state, ObjectId(0), 0)
    }

    /// An entry installed directly from a known value.
    pub(crate) fn new_cached(
        key: BindingKey,
        value: ObjectId,
        for_write: bool,
        context_id: u64,
    ) -> Self {
        let state = if for_write {
            EntryState::CachedWrite
        } else {
            EntryState::CachedRead
        };
        Self::new(key, state, value, context_id)
    }

    /// The single upper-sentinel entry. Carries the reserved dummy value
    /// and is never considered bound.
    pub(crate) fn new_last() -> Self {
        Self::new(
            BindingKey::LAST,
            EntryState::CachedRead,
            ObjectId::LAST_SENTINEL,
            0,
        )
    }

    pub fn key(&self) -> &BindingKey {
        &self.key
    }

    /// Acquires the entry monitor.
    pub fn lock(&self) -> MutexGuard<'_, EntryInner> {
        self.inner.lock().expect("binding entry poisoned")
    }

    /// Cooperatively interrupts any wait in progress on this entry.
    pub fn interrupt(&self) {
        let mut inner = self.lock();
        inner.interrupted = true;
        self.changed.notify_all();
    }

    /* -- Previous-key information -- */

    /// Updates the negative-range information given a claim that
    /// `new_previous` has the given binding state and that every name
    /// between `new_previous` and this entry's key is unbound. Returns
    /// whether anything changed.
    pub fn update_previous_key(
        &self,
        inner: &mut EntryInner,
        new_previous: &BindingKey,
        state: BindingState,
    ) -> bool {
        match &inner.previous_key {
            None => {
                if *new_previous < self.key {
                    inner.previous_key = Some(new_previous.clone());
                    inner.previous_key_unbound = state == BindingState::Unbound;
                    return true;
                }
            }
            Some(previous) => {
                if new_previous < previous {
                    inner.previous_key = Some(new_previous.clone());
                    inner.previous_key_unbound = state == BindingState::Unbound;
                    return true;
                } else if new_previous == previous
                    && !inner.previous_key_unbound
                    && state == BindingState::Unbound
                {
                    inner.previous_key_unbound = true;
                    return true;
                } else if state == BindingState::Bound {
                    // A known-bound name tightens the unbound interval
                    // from the left.
                    inner.previous_key = Some(new_previous.clone());
                    inner.previous_key_unbound = false;
                    return true;
                }
            }
        }
        false
    }

    /// Replaces the previous-key information outright.
    pub fn set_previous_key(
        &self,
        inner: &mut EntryInner,
        previous_key: Option<BindingKey>,
        previous_key_unbound: bool,
    ) {
        if let Some(previous) = &previous_key {
            assert!(
                *previous < self.key,
                "previous key {previous} is not below entry key {}",
                self.key
            );
        }
        inner.previous_key = previous_key;
        inner.previous_key_unbound = previous_key_unbound;
    }

    /// Whether `for_key` is known to be unbound from this entry's
    /// negative range.
    pub fn known_unbound(&self, inner: &EntryInner, for_key: &BindingKey) -> bool {
        let Some(previous) = &inner.previous_key else {
            return false;
        };
        if self.key <= *for_key {
            return false;
        }
        previous < for_key || (previous == for_key && inner.previous_key_unbound)
    }

    /// Whether this entry is known to be the next cached entry after
    /// `for_key`. The entry itself need not represent a bound name.
    pub fn is_next_entry(&self, inner: &EntryInner, for_key: &BindingKey) -> bool {
        *for_key < self.key
            && inner
                .previous_key
                .as_ref()
                .is_some_and(|previous| previous <= for_key)
    }

    /* -- Pending-previous interlock -- */

    /// Notes an operation in flight concerning the entry immediately
    /// previous to this one. Panics if a claim is already pending.
    pub fn set_pending_previous(&self, inner: &mut EntryInner) {
        if inner.pending_previous {
            panic!("already pending previous: {}", self.key);
        }
        inner.pending_previous = true;
    }

    /// Completes the pending operation and wakes every waiter.
    /// Panics if no claim is pending.
    pub fn set_not_pending_previous(&self, inner: &mut EntryInner) {
        if !inner.pending_previous {
            panic!("not pending previous: {}", self.key);
        }
        inner.pending_previous = false;
        self.changed.notify_all();
    }

    /// Waits until no pending-previous operation is in flight, up to the
    /// absolute deadline `stop` in milliseconds.
    pub fn await_not_pending_previous<'a>(
        &'a self,
        mut inner: MutexGuard<'a, EntryInner>,
        stop: u64,
    ) -> Result<MutexGuard<'a, EntryInner>, CacheError> {
        let start = now_millis();
        let mut now = start;
        while inner.pending_previous {
            if inner.interrupted {
                inner.interrupted = false;
                return Err(CacheError::Interrupted {
                    key: self.key.clone(),
                });
            }
            if now >= stop {
                return Err(CacheError::Timeout {
                    key: self.key.clone(),
                    waited_ms: now - start,
                });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(inner, Duration::from_millis(stop - now))
                .expect("binding entry poisoned");
            inner = guard;
            now = now_millis();
        }
        Ok(inner)
    }

    /// Waits until the entry leaves its FETCHING_* state, up to the
    /// absolute deadline `stop`.
    pub fn await_not_fetching<'a>(
        &'a self,
        mut inner: MutexGuard<'a, EntryInner>,
        stop: u64,
    ) -> Result<MutexGuard<'a, EntryInner>, CacheError> {
        let start = now_millis();
        let mut now = start;
        while inner.state.fetching() {
            if inner.interrupted {
                inner.interrupted = false;
                return Err(CacheError::Interrupted {
                    key: self.key.clone(),
                });
            }
            if now >= stop {
                return Err(CacheError::Timeout {
                    key: self.key.clone(),
                    waited_ms: now - start,
                });
            }
            let (guard, _) = self
                .changed
                .wait_timeout(inner, Duration::from_millis(stop - now))
                .expect("binding entry poisoned");
            inner = guard;
            now = now_millis();
        }
        Ok(inner)
    }

    /* -- State transitions -- */

    /// FETCHING_READ -> FETCHING_WRITE, when a writer joins an in-flight
    /// read fetch.
    pub fn upgrade_fetch(&self, inner: &mut EntryInner) {
        match inner.state {
            EntryState::FetchingRead => inner.state = EntryState::FetchingWrite,
            EntryState::FetchingWrite => {}
            other => panic!("upgrade_fetch on {} in state {other:?}", self.key),
        }
    }

    /// Completes a fetch with the authoritative value, waking any reader
    /// blocked on the in-flight state.
    pub fn complete_fetch(&self, inner: &mut EntryInner, value: ObjectId, context_id: u64) {
        match inner.state {
            EntryState::FetchingRead => inner.state = EntryState::CachedRead,
            EntryState::FetchingWrite => inner.state = EntryState::CachedWrite,
            other => panic!("complete_fetch on {} in state {other:?}", self.key),
        }
        inner.value = value;
        inner.context_id = context_id;
        self.changed.notify_all();
    }

    /// CACHED_READ -> CACHED_WRITE after the authority granted write
    /// access.
    pub fn upgrade(&self, inner: &mut EntryInner) {
        match inner.state {
            EntryState::CachedRead => inner.state = EntryState::CachedWrite,
            EntryState::CachedWrite => {}
            other => panic!("upgrade on {} in state {other:?}", self.key),
        }
    }

    /// CACHED_WRITE -> WRITING while the value is being written back.
    pub fn begin_writeback(&self, inner: &mut EntryInner) {
        match inner.state {
            EntryState::CachedWrite => inner.state = EntryState::Writing,
            other => panic!("begin_writeback on {} in state {other:?}", self.key),
        }
    }

    /// WRITING -> CACHED_WRITE once the write-back completed.
    pub fn end_writeback(&self, inner: &mut EntryInner) {
        match inner.state {
            EntryState::Writing => inner.state = EntryState::CachedWrite,
            other => panic!("end_writeback on {} in state {other:?}", self.key),
        }
        self.changed.notify_all();
    }

    /// Stores a new value on a write-cached entry.
    pub fn set_value(&self, inner: &mut EntryInner, value: ObjectId) {
        assert!(
            inner.state.writable() || inner.state == EntryState::Writing,
            "set_value on {} in state {:?}",
            self.key,
            inner.state
        );
        inner.value = value;
    }

    /// Terminal transition; the entry is dead afterwards and must never
    /// be reused.
    pub fn decache(&self, inner: &mut EntryInner) {
        assert!(
            inner.state != EntryState::Decached,
            "entry already decached: {}",
            self.key
        );
        inner.state = EntryState::Decached;
        self.changed.notify_all();
    }

    /// Marks the binding removed on its way out of the cache.
    pub fn mark_removed(&self, inner: &mut EntryInner) {
        inner.value = ObjectId::REMOVED;
        self.decache(inner);
    }
}

// Debug prints the key only; the mutable half would need the monitor.
impl fmt::Debug for BindingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingEntry")
            .field("key", &self.key)
            .finish()
    }
}
