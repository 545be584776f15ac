//! Lock manager scenarios: contention, fairness, deadlock, interrupts.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lodestore::lock::{ConflictKind, LockManager};

fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let stop = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < stop, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn readers_share_and_writer_waits() {
    let manager = Arc::new(LockManager::<&str>::new(5_000, 4));
    let r1 = manager.new_locker();
    let r2 = manager.new_locker();
    let w = manager.new_locker();

    assert!(manager.lock(&r1, "k", false, -1).is_none());
    assert!(manager.lock(&r2, "k", false, -1).is_none());

    let conflict = manager.lock_no_wait(&w, "k", true, -1).expect("writer should block");
    assert_eq!(conflict.kind, ConflictKind::Blocked);
    assert_eq!(manager.get_waiters(&"k").len(), 1);

    manager.release_lock(&r1, &"k");
    manager.release_lock(&r2, &"k");
    assert!(manager.wait_for_lock(&w).is_none());
    assert_eq!(manager.get_owners(&"k").len(), 1);
    manager.release_lock(&w, &"k");
    assert!(manager.get_owners(&"k").is_empty());
}

#[test]
fn blocked_wait_times_out() {
    let manager = Arc::new(LockManager::<&str>::new(100, 4));
    let owner = manager.new_locker();
    assert!(manager.lock(&owner, "k", true, -1).is_none());

    let waiter = manager.new_locker();
    let start = Instant::now();
    let conflict = manager.lock(&waiter, "k", true, -1).expect("expected a conflict");
    assert_eq!(conflict.kind, ConflictKind::Timeout);
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(90),
        "timed out too early: {elapsed:?}"
    );
    assert!(manager.get_waiters(&"k").is_empty(), "waiter not flushed");
}

#[test]
fn interrupt_surfaces_as_conflict() {
    let manager = Arc::new(LockManager::<&str>::new(5_000, 4));
    let owner = manager.new_locker();
    assert!(manager.lock(&owner, "k", true, -1).is_none());

    let waiter = manager.new_locker();
    let thread_manager = Arc::clone(&manager);
    let thread_waiter = Arc::clone(&waiter);
    let join = thread::spawn(move || thread_manager.lock(&thread_waiter, "k", true, -1));

    wait_for("waiter to queue", || !manager.get_waiters(&"k").is_empty());
    waiter.interrupt();
    let conflict = join.join().unwrap().expect("expected a conflict");
    assert_eq!(conflict.kind, ConflictKind::Interrupted);
}

/// Lockers A(ts=1) and B(ts=5) block on a write-held key,
/// then C(ts=2) arrives. Grants go out in timestamp order A, C, B.
#[test]
fn timestamp_fairness_orders_grants() {
    let manager = Arc::new(LockManager::<&str>::new(5_000, 4));
    let holder = manager.new_locker();
    assert!(manager.lock(&holder, "k", true, -1).is_none());

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut joins = Vec::new();
    for (label, timestamp) in [("A", 1), ("B", 5), ("C", 2)] {
        wait_for("previous waiter to queue", || {
            manager.get_waiters(&"k").len() == joins.len()
        });
        let manager = Arc::clone(&manager);
        let order = Arc::clone(&order);
        joins.push(thread::spawn(move || {
            let locker = manager.new_locker();
            assert!(
                manager.lock(&locker, "k", true, timestamp).is_none(),
                "locker {label} was not granted"
            );
            order.lock().unwrap().push(label);
            thread::sleep(Duration::from_millis(10));
            manager.release_lock(&locker, &"k");
        }));
    }
    wait_for("all three waiters to queue", || {
        manager.get_waiters(&"k").len() == 3
    });

    manager.release_lock(&holder, &"k");
    for join in joins {
        join.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["A", "C", "B"]);
}

/// Two lockers each hold one key and request the other's.
/// Exactly one receives a DEADLOCK conflict; reusing that locker is
/// fatal.
#[test]
fn deadlock_convicts_exactly_one_victim() {
    let manager = Arc::new(LockManager::<&str>::new(5_000, 4));
    let l1 = manager.new_locker();
    let l2 = manager.new_locker();
    assert!(manager.lock(&l1, "x", true, 1).is_none());
    assert!(manager.lock(&l2, "y", true, 2).is_none());

    let mut joins = Vec::new();
    for (locker, held, wanted, timestamp) in
        [(Arc::clone(&l1), "x", "y", 1i64), (Arc::clone(&l2), "y", "x", 2i64)]
    {
        let manager = Arc::clone(&manager);
        joins.push(thread::spawn(move || {
            let conflict = manager.lock(&locker, wanted, true, timestamp);
            // Whatever happened, give the keys back so the peer can make
            // progress.
            if conflict.is_none() {
                manager.release_lock(&locker, &wanted);
            }
            manager.release_lock(&locker, &held);
            conflict.map(|conflict| conflict.kind)
        }));
    }

    let outcomes: Vec<_> = joins.into_iter().map(|join| join.join().unwrap()).collect();
    let deadlocks = outcomes
        .iter()
        .filter(|kind| **kind == Some(ConflictKind::Deadlock))
        .count();
    assert_eq!(deadlocks, 1, "expected exactly one victim, got {outcomes:?}");
    assert!(
        outcomes.iter().any(Option::is_none),
        "the survivor should have been granted: {outcomes:?}"
    );

    let victim = if l1.deadlocked() { l1 } else { l2 };
    assert!(victim.deadlocked());
    let reuse = catch_unwind(AssertUnwindSafe(|| {
        manager.lock(&victim, "z", false, -1);
    }));
    assert!(reuse.is_err(), "reusing a deadlock victim must be fatal");
}

#[test]
fn victim_is_the_youngest_by_timestamp() {
    let manager = Arc::new(LockManager::<&str>::new(5_000, 4));
    let old = manager.new_locker();
    let young = manager.new_locker();
    assert!(manager.lock(&old, "x", true, 1).is_none());
    assert!(manager.lock(&young, "y", true, 100).is_none());

    // The older locker blocks first; the younger one closes the cycle
    // and must be the one convicted.
    let thread_manager = Arc::clone(&manager);
    let thread_old = Arc::clone(&old);
    let join = thread::spawn(move || thread_manager.lock(&thread_old, "y", true, 1));
    wait_for("old locker to queue", || !manager.get_waiters(&"y").is_empty());

    let conflict = manager
        .lock(&young, "x", true, 100)
        .expect("cycle must produce a conflict");
    assert_eq!(conflict.kind, ConflictKind::Deadlock);
    assert!(young.deadlocked());

    manager.release_lock(&young, &"y");
    assert!(join.join().unwrap().is_none(), "older locker should win");
    manager.release_lock(&old, &"x");
    manager.release_lock(&old, &"y");
}

#[test]
fn downgrade_lets_readers_in() {
    let manager = Arc::new(LockManager::<&str>::new(5_000, 4));
    let writer = manager.new_locker();
    assert!(manager.lock(&writer, "k", true, -1).is_none());

    let reader = manager.new_locker();
    let thread_manager = Arc::clone(&manager);
    let thread_reader = Arc::clone(&reader);
    let join = thread::spawn(move || thread_manager.lock(&thread_reader, "k", false, -1));
    wait_for("reader to queue", || !manager.get_waiters(&"k").is_empty());

    manager.downgrade(&writer, &"k");
    assert!(join.join().unwrap().is_none());
    assert_eq!(manager.get_owners(&"k").len(), 2);
    manager.release_lock(&writer, &"k");
    manager.release_lock(&reader, &"k");
}
