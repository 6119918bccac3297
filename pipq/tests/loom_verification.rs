//! Loom Exhaustive Concurrency Verification Tests
//!
//! Model checks of the two hand-rolled synchronization pieces the queue's
//! delete-min path is built from: the even/odd counter lock and the
//! announce slot handshake between a requester and the coordinator.
//!
//! # Running Loom Tests
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test -p pipq --features loom --test loom_verification --release
//! ```

#![cfg(loom)]

use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

use pipq::leader::{LeaderEntry, Owner};
use pipq::lock::{EvenOddLock, Spin};
use pipq::pq::AnnounceSlot;

fn entry(key: i64) -> LeaderEntry<u32> {
    LeaderEntry {
        key,
        value: key as u32,
        owner: Owner::default(),
    }
}

// ============================================================================
// EvenOddLock
// ============================================================================

#[test]
fn loom_test_01_mutual_exclusion() {
    loom::model(|| {
        let lock = Arc::new(EvenOddLock::new(0u32));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    let mut guard = lock.acquire();
                    let seen = *guard;
                    *guard = seen + 1;
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.acquire(), 2);
        assert_eq!(lock.version(), 6);
    });
}

#[test]
fn loom_test_02_try_acquire_never_overlaps() {
    loom::model(|| {
        let lock = Arc::new(EvenOddLock::new(()));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (lock, inside) = (Arc::clone(&lock), Arc::clone(&inside));
                thread::spawn(move || {
                    if let Some(_guard) = lock.try_acquire() {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(!lock.is_locked());
        assert_eq!(lock.version() % 2, 0);
    });
}

#[test]
fn loom_test_03_acquire_with_aborts_once_served() {
    loom::model(|| {
        let lock = Arc::new(EvenOddLock::new(0u32));
        let served = Arc::new(AtomicUsize::new(0));

        let holder = {
            let (lock, served) = (Arc::clone(&lock), Arc::clone(&served));
            thread::spawn(move || {
                *lock.acquire() += 1;
                served.store(1, Ordering::Release);
            })
        };

        let waiter = {
            let (lock, served) = (Arc::clone(&lock), Arc::clone(&served));
            thread::spawn(move || {
                let held = lock.acquire_with(|| {
                    if served.load(Ordering::Acquire) == 1 {
                        Spin::Abort
                    } else {
                        Spin::Continue
                    }
                });
                match held {
                    Some(mut guard) => {
                        *guard += 1;
                        true
                    }
                    None => {
                        assert_eq!(served.load(Ordering::Acquire), 1);
                        false
                    }
                }
            })
        };

        holder.join().unwrap();
        let acquired = waiter.join().unwrap();
        assert_eq!(*lock.acquire(), if acquired { 2 } else { 1 });
        assert!(!lock.is_locked());
    });
}

// ============================================================================
// Announce handshake
// ============================================================================

#[test]
fn loom_test_04_served_result_is_visible() {
    loom::model(|| {
        let slot = Arc::new(AnnounceSlot::<u32>::new());
        slot.publish();

        let server = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                // SAFETY: only server
                unsafe { slot.serve(Some(entry(7))) };
            })
        };

        while slot.is_pending() {
            thread::yield_now();
        }
        // SAFETY: requester, slot no longer pending
        let result = unsafe { slot.take() };
        assert_eq!(result.map(|e| e.key), Some(7));

        server.join().unwrap();
    });
}

/// Two requesters compete for one lock; the holder serves every pending
/// slot, and a loser that finds itself served gives up waiting.
#[test]
fn loom_test_05_coordinator_serves_each_request_once() {
    loom::model(|| {
        let lock = Arc::new(EvenOddLock::new(0i64));
        let slots = Arc::new([AnnounceSlot::<u32>::new(), AnnounceSlot::<u32>::new()]);

        let handles: Vec<_> = (0..2)
            .map(|me| {
                let (lock, slots) = (Arc::clone(&lock), Arc::clone(&slots));
                thread::spawn(move || {
                    slots[me].publish();

                    let held = lock.acquire_with(|| {
                        if slots[me].is_pending() {
                            Spin::Continue
                        } else {
                            Spin::Abort
                        }
                    });
                    if let Some(mut next) = held {
                        if slots[me].is_pending() {
                            for slot in slots.iter() {
                                if slot.is_pending() {
                                    *next += 1;
                                    // SAFETY: the lock serializes servers
                                    unsafe { slot.serve(Some(entry(*next))) };
                                }
                            }
                        }
                    }

                    assert!(!slots[me].is_pending());
                    // SAFETY: requester, slot no longer pending
                    unsafe { slots[me].take() }.map(|e| e.key)
                })
            })
            .collect();

        let mut keys: Vec<i64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2]);
    });
}
