//! Concurrent stress of the leader set on its own: racing inserts, racing
//! delete-mins, and evictions interleaved with delete-min.

#![cfg(not(loom))]

use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

use pipq::epoch::Collector;
use pipq::leader::MoveOutcome;
use pipq::{LeaderSet, Owner};

#[test]
fn test_concurrent_inserts_stay_sorted() {
    const THREADS: usize = 4;
    const PER_THREAD: i64 = 1_000;

    let mut collector = Collector::new(THREADS);
    let set = LeaderSet::<u64>::new(8);
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for tid in 0..THREADS {
            let (collector, set, barrier) = (&collector, &set, &barrier);
            s.spawn(move || {
                let handle = collector.register().unwrap();
                barrier.wait();
                for i in 0..PER_THREAD {
                    let guard = handle.pin();
                    let key = i * THREADS as i64 + tid as i64;
                    assert!(set.insert(key, 0, Owner::new(0, tid), &guard));
                }
            });
        }
    });

    let guard = collector.quiescent();
    let total = THREADS as i64 * PER_THREAD;
    assert_eq!(set.len(&guard), total as usize);
    assert_eq!(set.order_violations(&guard), 0);
    assert_eq!(set.key_sum(&guard), (0..total).sum::<i64>());
}

#[test]
fn test_racing_duplicate_inserts_admit_one() {
    const THREADS: usize = 4;

    let collector = Collector::new(THREADS);
    let set = LeaderSet::<u64>::new(8);
    let barrier = Barrier::new(THREADS);

    let wins: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|tid| {
                let (collector, set, barrier) = (&collector, &set, &barrier);
                s.spawn(move || {
                    let handle = collector.register().unwrap();
                    barrier.wait();
                    (0..200)
                        .filter(|&k| set.insert(k, 1, Owner::new(0, tid), &handle.pin()))
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(wins, 200);
}

#[test]
fn test_concurrent_delete_min_claims_each_once() {
    const THREADS: usize = 4;
    const KEYS: i64 = 5_000;

    let mut collector = Collector::new(THREADS);
    let set = LeaderSet::<u64>::new(4);
    {
        let guard = collector.quiescent();
        for k in 0..KEYS {
            set.insert(k, 0, Owner::default(), &guard);
        }
    }

    let barrier = Barrier::new(THREADS);
    let claimed: Vec<i64> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (collector, set, barrier) = (&collector, &set, &barrier);
                s.spawn(move || {
                    let handle = collector.register().unwrap();
                    barrier.wait();
                    let mut got = Vec::new();
                    loop {
                        let guard = handle.pin();
                        match set.delete_min(&guard) {
                            Some(e) => got.push(e.key),
                            None => break,
                        }
                    }
                    // Claims by one thread come out in order.
                    assert!(got.windows(2).all(|w| w[0] < w[1]));
                    got
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let unique: HashSet<i64> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), KEYS as usize);
    assert_eq!(unique.len(), KEYS as usize);

    let guard = collector.quiescent();
    assert!(set.is_empty(&guard));
}

#[test]
fn test_moves_race_with_delete_min() {
    const ROUNDS: i64 = 2_000;

    let mut collector = Collector::new(2);
    let set = LeaderSet::<u64>::new(6);
    let owner = Owner::new(0, 0);
    {
        let guard = collector.quiescent();
        for k in 1..=8 {
            set.insert(-k * 10, 0, owner, &guard);
        }
    }

    let (evicted, deleted) = thread::scope(|s| {
        let mover = s.spawn(|| {
            let handle = collector.register().unwrap();
            let mut evicted = Vec::new();
            for i in 0..ROUNDS {
                let guard = handle.pin();
                if let MoveOutcome::Moved { evicted: e, .. } =
                    set.insert_and_move(i * 3 + 1, 0, owner, &guard)
                {
                    evicted.push(e.key);
                }
            }
            evicted
        });
        let deleter = s.spawn(|| {
            let handle = collector.register().unwrap();
            let mut deleted = Vec::new();
            for _ in 0..ROUNDS {
                let guard = handle.pin();
                if let Some(e) = set.delete_min(&guard) {
                    deleted.push(e.key);
                }
            }
            deleted
        });
        (mover.join().unwrap(), deleter.join().unwrap())
    });

    // Nothing is both evicted and deleted, and nothing is lost.
    let evicted: HashSet<i64> = evicted.into_iter().collect();
    let deleted_set: HashSet<i64> = deleted.iter().copied().collect();
    assert_eq!(deleted_set.len(), deleted.len());
    assert!(evicted.is_disjoint(&deleted_set));

    let guard = collector.quiescent();
    let live: HashSet<i64> = set.iter(&guard).map(|e| e.key).collect();
    assert!(live.is_disjoint(&evicted));
    assert!(live.is_disjoint(&deleted_set));
    assert_eq!(set.order_violations(&guard), 0);

    let initial = (1..=8).map(|k| -k * 10);
    let inserted = (0..ROUNDS).map(|i| i * 3 + 1);
    for key in initial.chain(inserted) {
        assert!(
            live.contains(&key) || evicted.contains(&key) || deleted_set.contains(&key),
            "key {} lost",
            key
        );
    }
}
