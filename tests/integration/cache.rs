//! Binding cache scenarios: negative ranges and the pending-previous
//! interlock under real threads.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lodestore::cache::{BindingCache, CacheError, Lookup};
use lodestore::core::{BindingKey, ObjectId};
use lodestore::lock::LockManager;

fn cache_with_timeout(lock_timeout: u64) -> BindingCache {
    let locks = Arc::new(LockManager::new(lock_timeout, 4));
    BindingCache::new(lock_timeout, locks)
}

fn key(name: &str) -> BindingKey {
    BindingKey::name(name)
}

/// Install ("m", 100) with previous key ("a", unbound);
/// a query for "f" is answered locally, no round-trip.
#[test]
fn negative_range_hit_answers_without_fetch() {
    let cache = cache_with_timeout(1_000);
    let entry = cache.install(&key("m"), ObjectId(100), false, 1).unwrap();
    cache
        .set_previous_key(&entry, Some(key("a")), true)
        .unwrap();

    assert!(matches!(cache.get(&key("f"), false), Lookup::Unbound));
    assert!(matches!(cache.get(&key("a"), false), Lookup::Unbound));
    assert!(matches!(cache.get(&key("t"), false), Lookup::Miss));
    cache.check_consistency().unwrap();
}

/// Thread A claims the interlock on "m" for a simulated
/// 200 ms insert; thread B's set_previous_key blocks until the claim is
/// released, then succeeds.
#[test]
fn pending_previous_blocks_then_succeeds() {
    let cache = Arc::new(cache_with_timeout(1_000));
    let entry = cache.install(&key("m"), ObjectId(100), false, 1).unwrap();

    {
        let mut inner = entry.lock();
        entry.set_pending_previous(&mut inner);
    }
    let release_entry = Arc::clone(&entry);
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        let mut inner = release_entry.lock();
        release_entry.set_not_pending_previous(&mut inner);
    });

    let start = Instant::now();
    cache
        .set_previous_key(&entry, Some(key("k")), true)
        .unwrap();
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(150),
        "set_previous_key did not block: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(900),
        "set_previous_key blocked too long: {elapsed:?}"
    );
    releaser.join().unwrap();

    let inner = entry.lock();
    assert_eq!(inner.previous_key(), Some(&key("k")));
    assert!(inner.previous_key_unbound());
}

/// The same claim, held past the lock timeout: the waiter gets a
/// Timeout conflict instead.
#[test]
fn pending_previous_timeout_past_lock_timeout() {
    let cache = Arc::new(cache_with_timeout(100));
    let entry = cache.install(&key("m"), ObjectId(100), false, 1).unwrap();

    {
        let mut inner = entry.lock();
        entry.set_pending_previous(&mut inner);
    }
    let release_entry = Arc::clone(&entry);
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        let mut inner = release_entry.lock();
        release_entry.set_not_pending_previous(&mut inner);
    });

    let start = Instant::now();
    let err = cache
        .set_previous_key(&entry, Some(key("k")), true)
        .unwrap_err();
    assert!(matches!(err, CacheError::Timeout { .. }), "got {err:?}");
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(450), "outlived the claim: {elapsed:?}");
    releaser.join().unwrap();
}

#[test]
fn fetch_install_wakes_blocked_readers() {
    let cache = Arc::new(cache_with_timeout(2_000));
    let entry = cache.begin_fetch(&key("k"), false).unwrap();

    let wait_cache = Arc::clone(&cache);
    let wait_entry = Arc::clone(&entry);
    let waiter = thread::spawn(move || {
        wait_cache.wait_cached(&wait_entry).unwrap();
        wait_entry.lock().value()
    });

    thread::sleep(Duration::from_millis(50));
    cache.install(&key("k"), ObjectId(9), false, 3).unwrap();
    assert_eq!(waiter.join().unwrap(), ObjectId(9));
}

#[test]
fn concurrent_installs_keep_the_cache_consistent() {
    let cache = Arc::new(cache_with_timeout(2_000));
    let mut joins = Vec::new();
    for lane in 0..4u32 {
        let cache = Arc::clone(&cache);
        joins.push(thread::spawn(move || {
            for i in 0..50u32 {
                let name = format!("{:02}-{:03}", (i + lane) % 7, i * 4 + lane);
                let entry = cache
                    .install(&key(&name), ObjectId(i64::from(i + 1)), false, u64::from(lane))
                    .unwrap();
                assert_eq!(entry.key(), &key(&name));
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
    cache.check_consistency().unwrap();

    // Spot-check ordering through lower_entry.
    let below = cache.lower_entry(&BindingKey::LAST).unwrap();
    assert!(below.key() < &BindingKey::LAST);
}

/// The state diagram lets eviction take an entry straight out of
/// WRITING; a write-back completing afterwards finds the entry gone.
#[test]
fn eviction_allowed_during_writeback() {
    let cache = cache_with_timeout(1_000);
    cache.install(&key("m"), ObjectId(5), true, 1).unwrap();
    cache.begin_writeback(&key("m")).unwrap();

    cache.evict(&key("m")).unwrap();
    assert!(matches!(cache.get(&key("m"), false), Lookup::Miss));
    assert!(matches!(
        cache.end_writeback(&key("m")),
        Err(CacheError::NotCached { .. })
    ));
    cache.check_consistency().unwrap();
}

#[test]
fn eviction_interlocks_with_neighbors() {
    let cache = cache_with_timeout(1_000);
    cache.install(&key("a"), ObjectId(1), false, 1).unwrap();
    cache.install(&key("f"), ObjectId(2), false, 1).unwrap();
    let m = cache.install(&key("m"), ObjectId(3), false, 1).unwrap();
    cache.set_previous_key(&m, Some(key("f")), false).unwrap();

    cache.evict(&key("f")).unwrap();
    // Eviction forgets the entry but not the negative information around
    // it; "m" still claims (f, m) unbound.
    assert!(matches!(cache.get(&key("f"), false), Lookup::Miss));
    assert!(matches!(cache.get(&key("h"), false), Lookup::Unbound));
    cache.check_consistency().unwrap();
}
