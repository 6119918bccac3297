//! Model checks of the worker heap and the single-threaded queue against
//! `BinaryHeap`.

#![cfg(not(loom))]

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use pipq::numa::AllocationPolicy;
use pipq::{HeapEntry, NumaTopology, Pipq, PqConfig, WorkerHeap};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Push(i64, u8),
    Pop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (-1_000i64..1_000, any::<u8>()).prop_map(|(k, v)| Op::Push(k, v)),
        2 => Just(Op::Pop),
    ]
}

proptest! {
    #[test]
    fn test_worker_heap_matches_model(
        chunk in 1usize..9,
        ops in proptest::collection::vec(op(), 0..400),
    ) {
        let mut heap = WorkerHeap::new(chunk, AllocationPolicy::Local).unwrap();
        let mut model = BinaryHeap::new();

        for op in ops {
            match op {
                Op::Push(k, v) => {
                    heap.push(HeapEntry::new(k, v));
                    model.push(Reverse((k, v)));
                }
                Op::Pop => {
                    let got = heap.pop().map(<(i64, u8)>::from);
                    prop_assert_eq!(got, model.pop().map(|Reverse(e)| e));
                }
            }
            prop_assert!(heap.is_heap());
            prop_assert_eq!(heap.len(), model.len());
        }

        let model_sum: i64 = model.iter().map(|Reverse((k, _))| *k).sum();
        prop_assert_eq!(heap.key_sum(), model_sum);
        prop_assert!(heap.capacity() >= heap.len());
    }

    #[test]
    fn test_single_thread_queue_matches_model(
        limits in (1i64..6).prop_flat_map(|t| (Just(t), t..12)),
        ops in proptest::collection::vec(op(), 0..300),
    ) {
        let (threshold, max) = limits;
        let config = PqConfig::new(1)
            .with_topology(NumaTopology::uniform(1, 1, 1).unwrap())
            .with_heap_list_size(8)
            .with_counter_limits(threshold, max);
        let mut pq = Pipq::<u8>::new(config).unwrap();
        let mut model = BinaryHeap::new();

        {
            let ctx = pq.thread_init(0).unwrap();
            for op in ops {
                match op {
                    Op::Push(k, v) => {
                        // An identical live entry may be rejected or folded
                        // into repeat keys; keep the model free of them.
                        if model.iter().any(|&Reverse(e)| e == (k, v)) {
                            continue;
                        }
                        prop_assert!(ctx.insert(k, v));
                        model.push(Reverse((k, v)));
                    }
                    Op::Pop => {
                        prop_assert_eq!(ctx.delete_min(), model.pop().map(|Reverse(e)| e));
                    }
                }
            }
        }

        prop_assert_eq!(pq.size(), model.len());
        prop_assert_eq!(pq.validate_insertion_ordering(), 0);
        let model_sum: i64 = model.iter().map(|Reverse((k, _))| *k).sum();
        prop_assert_eq!(pq.key_sum(), model_sum);
    }
}
