//! The binding cache: an ordered, concurrent map from binding names to
//! object ids, with negative-range information.
//!
//! Each entry knows (optionally) a previous key such that every name in
//! the open interval between that key and its own is unbound, so a "does
//! X exist?" query can be answered locally even when X was never cached.
//! The index is an ordered lock-free skiplist; per-entry monitors protect
//! entry state, and the pending-previous interlock hands neighborhood
//! changes over one gap at a time. There is no global mutex.

mod entry;

use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use thiserror::Error;
use tracing::trace;

use crate::core::key::{BindingKey, BindingState, ObjectId};
use crate::core::time::{deadline_saturating, now_millis};
use crate::lock::LockManager;

pub use entry::{BindingEntry, EntryInner, EntryState};

/// Errors surfaced by cache operations. Invalid-state conditions
/// (double pending-previous claims, transitions out of DECACHED) are
/// programmer errors and panic instead.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("timeout after {waited_ms} ms waiting on entry {key}")]
    Timeout { key: BindingKey, waited_ms: u64 },
    #[error("interrupted while waiting on entry {key}")]
    Interrupted { key: BindingKey },
    #[error("entry {key} is busy in state {state:?}")]
    Busy { key: BindingKey, state: EntryState },
    #[error("lock still held for {key}")]
    Locked { key: BindingKey },
    #[error("no live entry cached for {key}")]
    NotCached { key: BindingKey },
}

/// Outcome of a cache lookup.
pub enum Lookup {
    /// Cached with sufficient access.
    Hit(Arc<BindingEntry>),
    /// The name is known to be unbound from a neighbor's negative range;
    /// no round-trip needed.
    Unbound,
    /// An in-flight fetch or write-back already covers the key; wait on
    /// the entry instead of issuing another request.
    Blocked(Arc<BindingEntry>),
    /// Cached read-only but write access was requested; issue an upgrade.
    Upgrade(Arc<BindingEntry>),
    /// Nothing known; fetch from the authority.
    Miss,
}

/// The per-node binding cache.
pub struct BindingCache {
    index: SkipMap<BindingKey, Arc<BindingEntry>>,
    locks: Arc<LockManager<BindingKey>>,
    lock_timeout: u64,
}

enum NewEntry {
    Fetching { for_write: bool },
    Cached {
        value: ObjectId,
        for_write: bool,
        context_id: u64,
    },
}

impl BindingCache {
    /// Creates an empty cache. `lock_timeout` (milliseconds, at least 1)
    /// bounds waits on the pending-previous interlock; `locks` is the
    /// lock manager consulted before eviction.
    pub fn new(lock_timeout: u64, locks: Arc<LockManager<BindingKey>>) -> Self {
        assert!(lock_timeout >= 1, "lock_timeout must not be less than 1");
        let index = SkipMap::new();
        index.insert(
            BindingKey::LAST,
            Arc::new(BindingEntry::new_last()),
        );
        Self {
            index,
            locks,
            lock_timeout,
        }
    }

    /// Looks up `key` for the requested access.
    pub fn get(&self, key: &BindingKey, for_write: bool) -> Lookup {
        assert!(!key.is_sentinel(), "lookup of sentinel key {key}");
        if let Some(handle) = self.index.get(key) {
            let entry = Arc::clone(handle.value());
            let state = entry.lock().state();
            match state {
                EntryState::FetchingRead | EntryState::FetchingWrite => {
                    return Lookup::Blocked(entry);
                }
                EntryState::CachedRead => {
                    return if for_write {
                        Lookup::Upgrade(entry)
                    } else {
                        Lookup::Hit(entry)
                    };
                }
                EntryState::CachedWrite => return Lookup::Hit(entry),
                EntryState::Writing => {
                    return if for_write {
                        Lookup::Blocked(entry)
                    } else {
                        Lookup::Hit(entry)
                    };
                }
                EntryState::Decached => {}
            }
        }
        match self.next_live_entry(key) {
            Some(next) => {
                let inner = next.lock();
                if next.known_unbound(&inner, key) {
                    trace!(%key, neighbor = %next.key(), "negative range hit");
                    Lookup::Unbound
                } else {
                    Lookup::Miss
                }
            }
            None => Lookup::Miss,
        }
    }

    /// Notes that a fetch of `key` from the authority is starting,
    /// creating (or joining) the in-flight entry.
    pub fn begin_fetch(
        &self,
        key: &BindingKey,
        for_write: bool,
    ) -> Result<Arc<BindingEntry>, CacheError> {
        assert!(!key.is_sentinel(), "fetch of sentinel key {key}");
        loop {
            if let Some(handle) = self.index.get(key) {
                let entry = Arc::clone(handle.value());
                let mut inner = entry.lock();
                match inner.state() {
                    EntryState::Decached => {
                        drop(inner);
                        handle.remove();
                        continue;
                    }
                    EntryState::FetchingRead if for_write => {
                        entry.upgrade_fetch(&mut inner);
                        drop(inner);
                        return Ok(entry);
                    }
                    _ => {
                        drop(inner);
                        return Ok(entry);
                    }
                }
            }
            if let Some(entry) = self.insert_between(key, NewEntry::Fetching { for_write })? {
                return Ok(entry);
            }
        }
    }

    /// Installs a value for `key`: completes an in-flight fetch, upgrades
    /// or refreshes an existing entry, or creates a new cached entry.
    pub fn install(
        &self,
        key: &BindingKey,
        value: ObjectId,
        for_write: bool,
        context_id: u64,
    ) -> Result<Arc<BindingEntry>, CacheError> {
        assert!(!key.is_sentinel(), "install of sentinel key {key}");
        assert!(
            value != ObjectId::REMOVED && value != ObjectId::LAST_SENTINEL,
            "reserved value {value:?} installed for {key}"
        );
        loop {
            if let Some(handle) = self.index.get(key) {
                let entry = Arc::clone(handle.value());
                let mut inner = entry.lock();
                match inner.state() {
                    EntryState::Decached => {
                        drop(inner);
                        handle.remove();
                        continue;
                    }
                    EntryState::FetchingRead | EntryState::FetchingWrite => {
                        entry.complete_fetch(&mut inner, value, context_id);
                        if for_write {
                            entry.upgrade(&mut inner);
                        }
                        drop(inner);
                        return Ok(entry);
                    }
                    EntryState::CachedRead => {
                        if for_write {
                            entry.upgrade(&mut inner);
                            entry.set_value(&mut inner, value);
                        }
                        inner.note_access(context_id);
                        drop(inner);
                        return Ok(entry);
                    }
                    EntryState::CachedWrite | EntryState::Writing => {
                        entry.set_value(&mut inner, value);
                        inner.note_access(context_id);
                        drop(inner);
                        return Ok(entry);
                    }
                }
            }
            let new_entry = NewEntry::Cached {
                value,
                for_write,
                context_id,
            };
            if let Some(entry) = self.insert_between(key, new_entry)? {
                return Ok(entry);
            }
        }
    }

    /// Replaces the previous-key information of an entry, waiting out any
    /// pending-previous operation first.
    pub fn set_previous_key(
        &self,
        entry: &BindingEntry,
        previous_key: Option<BindingKey>,
        previous_key_unbound: bool,
    ) -> Result<(), CacheError> {
        let stop = deadline_saturating(now_millis(), self.lock_timeout);
        let guard = entry.lock();
        let mut inner = entry.await_not_pending_previous(guard, stop)?;
        entry.set_previous_key(&mut inner, previous_key, previous_key_unbound);
        Ok(())
    }

    /// Applies a negative-range claim to an entry, waiting out any
    /// pending-previous operation first. Returns whether anything changed.
    pub fn update_previous_key(
        &self,
        entry: &BindingEntry,
        new_previous: &BindingKey,
        state: BindingState,
    ) -> Result<bool, CacheError> {
        let stop = deadline_saturating(now_millis(), self.lock_timeout);
        let guard = entry.lock();
        let mut inner = entry.await_not_pending_previous(guard, stop)?;
        Ok(entry.update_previous_key(&mut inner, new_previous, state))
    }

    /// Evicts `key` from the cache. Fails if a lock is still held on the
    /// key, the entry is mid-fetch, or an interlock deadline expires.
    pub fn evict(&self, key: &BindingKey) -> Result<(), CacheError> {
        assert!(!key.is_sentinel(), "evict of sentinel key {key}");
        let Some(handle) = self.index.get(key) else {
            return Err(CacheError::NotCached { key: key.clone() });
        };
        let entry = Arc::clone(handle.value());
        let next = self.next_live_entry(key);
        if let Some(next) = &next {
            self.claim_pending_previous(next)?;
        }

        let result = (|| {
            if !self.locks.get_owners(key).is_empty() {
                return Err(CacheError::Locked { key: key.clone() });
            }
            let guard = entry.lock();
            let stop = deadline_saturating(now_millis(), self.lock_timeout);
            let mut inner = entry.await_not_pending_previous(guard, stop)?;
            match inner.state() {
                EntryState::Decached => Err(CacheError::NotCached { key: key.clone() }),
                state if state.fetching() => Err(CacheError::Busy {
                    key: key.clone(),
                    state,
                }),
                _ => {
                    entry.decache(&mut inner);
                    Ok(())
                }
            }
        })();

        if result.is_ok() {
            handle.remove();
            trace!(%key, "evicted");
        }
        if let Some(next) = &next {
            let mut inner = next.lock();
            next.set_not_pending_previous(&mut inner);
        }
        result
    }

    /// Removes the binding for `key`, coalescing the successor's negative
    /// range across the removed name.
    pub fn remove(&self, key: &BindingKey) -> Result<(), CacheError> {
        assert!(!key.is_sentinel(), "remove of sentinel key {key}");
        let Some(handle) = self.index.get(key) else {
            return Err(CacheError::NotCached { key: key.clone() });
        };
        let entry = Arc::clone(handle.value());
        let Some(next) = self.next_live_entry(key) else {
            panic!("cache has no upper sentinel entry");
        };
        self.claim_pending_previous(&next)?;

        let removed = (|| {
            let guard = entry.lock();
            let stop = deadline_saturating(now_millis(), self.lock_timeout);
            let mut inner = entry.await_not_pending_previous(guard, stop)?;
            match inner.state() {
                EntryState::Decached => {
                    return Err(CacheError::NotCached { key: key.clone() });
                }
                state if state.fetching() => {
                    return Err(CacheError::Busy {
                        key: key.clone(),
                        state,
                    });
                }
                _ => {}
            }
            let previous = inner.previous_key().cloned();
            let previous_unbound = inner.previous_key_unbound();
            entry.mark_removed(&mut inner);
            Ok((previous, previous_unbound))
        })();

        let result = match removed {
            Ok((previous, previous_unbound)) => {
                handle.remove();
                let mut inner = next.lock();
                // Coalescing needs the successor's range to reach exactly
                // this key; otherwise its claim is independent of us.
                if inner.previous_key() == Some(key) {
                    next.update_previous_key(&mut inner, key, BindingState::Unbound);
                    if let Some(previous) = previous {
                        let state = if previous_unbound {
                            BindingState::Unbound
                        } else {
                            BindingState::Bound
                        };
                        next.update_previous_key(&mut inner, &previous, state);
                    }
                }
                next.set_not_pending_previous(&mut inner);
                trace!(%key, "binding removed");
                return Ok(());
            }
            Err(err) => Err(err),
        };
        let mut inner = next.lock();
        next.set_not_pending_previous(&mut inner);
        result
    }

    /// Marks `key`'s write-cached value as being written back to the
    /// authority, waiting out any pending-previous operation first. While
    /// the write-back is in flight the entry keeps serving reads; writers
    /// see [`Lookup::Blocked`].
    pub fn begin_writeback(&self, key: &BindingKey) -> Result<Arc<BindingEntry>, CacheError> {
        assert!(!key.is_sentinel(), "writeback of sentinel key {key}");
        let Some(handle) = self.index.get(key) else {
            return Err(CacheError::NotCached { key: key.clone() });
        };
        let entry = Arc::clone(handle.value());
        let guard = entry.lock();
        let stop = deadline_saturating(now_millis(), self.lock_timeout);
        let mut inner = entry.await_not_pending_previous(guard, stop)?;
        match inner.state() {
            EntryState::CachedWrite => {
                entry.begin_writeback(&mut inner);
                drop(inner);
                trace!(%key, "writeback started");
                Ok(entry)
            }
            EntryState::Decached => Err(CacheError::NotCached { key: key.clone() }),
            state => Err(CacheError::Busy {
                key: key.clone(),
                state,
            }),
        }
    }

    /// Completes a write-back: the entry returns to CACHED_WRITE and any
    /// blocked writers are woken. Reports `NotCached` if the entry was
    /// evicted while the write-back was in flight.
    pub fn end_writeback(&self, key: &BindingKey) -> Result<(), CacheError> {
        assert!(!key.is_sentinel(), "writeback of sentinel key {key}");
        let Some(handle) = self.index.get(key) else {
            return Err(CacheError::NotCached { key: key.clone() });
        };
        let entry = Arc::clone(handle.value());
        let mut inner = entry.lock();
        match inner.state() {
            EntryState::Writing => {
                entry.end_writeback(&mut inner);
                drop(inner);
                trace!(%key, "writeback completed");
                Ok(())
            }
            EntryState::Decached => Err(CacheError::NotCached { key: key.clone() }),
            state => Err(CacheError::Busy {
                key: key.clone(),
                state,
            }),
        }
    }

    /// The live cached entry with the greatest key strictly below `key`,
    /// skipping decached entries.
    pub fn lower_entry(&self, key: &BindingKey) -> Option<Arc<BindingEntry>> {
        let mut cursor = self.index.upper_bound(Bound::Excluded(key));
        while let Some(handle) = cursor {
            let entry = Arc::clone(handle.value());
            if entry.lock().state() != EntryState::Decached {
                return Some(entry);
            }
            cursor = handle.prev();
        }
        None
    }

    /// Blocks until the entry leaves its in-flight fetch state, bounded
    /// by the cache's lock timeout.
    pub fn wait_cached(&self, entry: &BindingEntry) -> Result<(), CacheError> {
        let stop = deadline_saturating(now_millis(), self.lock_timeout);
        let guard = entry.lock();
        entry.await_not_fetching(guard, stop).map(drop)
    }

    /// Verifies every entry against the cache invariants. Inconsistencies
    /// are fatal; an interlock deadline expiring surfaces as `Timeout`.
    pub fn check_consistency(&self) -> Result<(), CacheError> {
        let mut saw_last = false;
        let mut cursor = self.index.front();
        while let Some(handle) = cursor {
            let entry = Arc::clone(handle.value());
            cursor = handle.next();
            if *entry.key() == BindingKey::LAST {
                saw_last = true;
            }
            self.check_entry(&entry)?;
        }
        assert!(saw_last, "cache has no upper sentinel entry");
        Ok(())
    }

    fn check_entry(&self, entry: &Arc<BindingEntry>) -> Result<(), CacheError> {
        let guard = entry.lock();
        if guard.state() == EntryState::Decached {
            return Ok(());
        }
        let stop = deadline_saturating(now_millis(), self.lock_timeout);
        let inner = entry.await_not_pending_previous(guard, stop)?;
        let key = entry.key();
        assert!(
            *key != BindingKey::FIRST,
            "cache holds an entry for the first sentinel"
        );
        if *key == BindingKey::LAST {
            assert!(
                inner.value() == ObjectId::LAST_SENTINEL,
                "last sentinel entry has wrong value {:?}",
                inner.value()
            );
        } else {
            assert!(
                inner.value() != ObjectId::REMOVED,
                "live entry for a removed binding: {key}"
            );
        }
        if let Some(previous) = inner.previous_key() {
            assert!(
                previous < key,
                "entry key {key} is not greater than its previous key {previous}"
            );
        }
        if let Some(lower) = self.lower_entry(key) {
            let lower_key = lower.key();
            match inner.previous_key() {
                Some(previous) => {
                    assert!(
                        lower_key <= previous,
                        "previous key {previous} of {key} is below the lower entry {lower_key}"
                    );
                    assert!(
                        !(lower_key == previous && inner.previous_key_unbound()),
                        "{key} notes previous key {previous} unbound, but that name is cached"
                    );
                }
                None => {
                    assert!(
                        lower_key < key,
                        "lower entry {lower_key} is not below {key}"
                    );
                }
            }
        }
        Ok(())
    }

    /* -- Internals -- */

    fn next_live_entry(&self, key: &BindingKey) -> Option<Arc<BindingEntry>> {
        let mut cursor = self.index.lower_bound(Bound::Excluded(key));
        while let Some(handle) = cursor {
            let entry = Arc::clone(handle.value());
            if entry.lock().state() != EntryState::Decached {
                return Some(entry);
            }
            cursor = handle.next();
        }
        None
    }

    /// Claims the pending-previous interlock on `entry`, waiting out any
    /// claim already in flight.
    fn claim_pending_previous(&self, entry: &BindingEntry) -> Result<(), CacheError> {
        let stop = deadline_saturating(now_millis(), self.lock_timeout);
        let guard = entry.lock();
        let mut inner = entry.await_not_pending_previous(guard, stop)?;
        entry.set_pending_previous(&mut inner);
        Ok(())
    }

    /// Inserts a fresh entry for `key` between its neighbors, holding the
    /// successor's interlock across the splice. Returns `None` when the
    /// neighborhood changed underneath us and the caller should restart.
    fn insert_between(
        &self,
        key: &BindingKey,
        new_entry: NewEntry,
    ) -> Result<Option<Arc<BindingEntry>>, CacheError> {
        let Some(next) = self.next_live_entry(key) else {
            panic!("cache has no upper sentinel entry");
        };
        self.claim_pending_previous(&next)?;

        if !self.gap_clear(key, &next) {
            let mut inner = next.lock();
            next.set_not_pending_previous(&mut inner);
            return Ok(None);
        }

        let entry = Arc::new(match new_entry {
            NewEntry::Fetching { for_write } => BindingEntry::new_fetching(key.clone(), for_write),
            NewEntry::Cached {
                value,
                for_write,
                context_id,
            } => BindingEntry::new_cached(key.clone(), value, for_write, context_id),
        });
        self.index.insert(key.clone(), Arc::clone(&entry));

        let mut inner = next.lock();
        // The new name truncates a negative range that skipped it. The
        // remaining claim only shrinks, so it stays valid; a successor
        // with no claim gains none.
        if inner.previous_key().is_some_and(|previous| previous < key) {
            next.set_previous_key(&mut inner, Some(key.clone()), false);
        }
        next.set_not_pending_previous(&mut inner);
        Ok(Some(entry))
    }

    /// Under a claim on `next`: checks that `next` is still live and the
    /// immediate successor, and that `key` is still absent.
    fn gap_clear(&self, key: &BindingKey, next: &Arc<BindingEntry>) -> bool {
        if next.lock().state() == EntryState::Decached {
            return false;
        }
        let mut cursor = self.index.lower_bound(Bound::Excluded(key));
        while let Some(handle) = cursor {
            if *handle.key() >= *next.key() {
                break;
            }
            let entry = handle.value();
            if entry.lock().state() != EntryState::Decached {
                return false;
            }
            cursor = handle.next();
        }
        self.index.get(key).is_none_or(|handle| {
            let entry = handle.value();
            entry.lock().state() == EntryState::Decached
        })
    }
}
