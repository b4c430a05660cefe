#![allow(missing_docs)]
#![cfg(feature = "loom")]

use ctg::{handle::HandlePool, queue::BoundedQueue};
use loom::{sync::Arc, thread};

struct Slot;

#[test]
fn loom_two_producers_one_consumer_no_loss_no_duplication() {
    loom::model(|| {
        // Two producers race on a capacity-2 ring while the main thread
        // consumes. Every value pushed successfully must come out exactly once.
        let queue = Arc::new(BoundedQueue::new(2).unwrap());
        let producers: Vec<_> = [1_u32, 2]
            .into_iter()
            .map(|value| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.enqueue(value).is_ok())
            })
            .collect();

        let mut seen = Vec::new();
        if let Some(value) = queue.dequeue() {
            seen.push(value);
        }
        let pushed = producers
            .into_iter()
            .map(|producer| producer.join().unwrap())
            .filter(|&ok| ok)
            .count();
        while let Some(value) = queue.dequeue() {
            seen.push(value);
        }

        // Capacity 2 always fits both values.
        assert_eq!(pushed, 2);
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    });
}

#[test]
fn loom_producer_consumer_preserve_order() {
    loom::model(|| {
        let queue = Arc::new(BoundedQueue::new(2).unwrap());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for value in 0..3_u32 {
                    while queue.enqueue(value).is_err() {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 3 {
            match queue.dequeue() {
                Some(value) => received.push(value),
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();

        // Single producer, single consumer: FIFO.
        assert_eq!(received, vec![0, 1, 2]);
        assert!(queue.is_empty());
    });
}

#[test]
fn loom_single_slot_is_claimed_once() {
    loom::model(|| {
        let pool = Arc::new(HandlePool::<Slot>::with_capacity(1).unwrap());
        let contenders: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.allocate())
            })
            .collect();
        let winners: Vec<_> = contenders
            .into_iter()
            .filter_map(|contender| contender.join().unwrap())
            .collect();

        assert_eq!(winners.len(), 1);
        assert!(pool.is_alive(winners[0]));
    });
}

#[test]
fn loom_concurrent_allocations_get_distinct_slots() {
    loom::model(|| {
        let pool = Arc::new(HandlePool::<Slot>::with_capacity(2).unwrap());
        let other = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.allocate().unwrap())
        };
        let mine = pool.allocate().unwrap();
        let theirs = other.join().unwrap();

        assert_ne!(mine.index(), theirs.index());
        assert!(pool.is_alive(mine));
        assert!(pool.is_alive(theirs));
        assert_eq!(pool.allocate(), None);
    });
}

#[test]
fn loom_stale_free_cannot_release_reallocated_slot() {
    loom::model(|| {
        // One thread frees a handle while another frees the same handle and
        // reallocates. Exactly one free wins and the reallocated slot survives.
        let pool = Arc::new(HandlePool::<Slot>::with_capacity(1).unwrap());
        let handle = pool.allocate().unwrap();

        let racer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.free(handle))
        };
        let freed_here = pool.free(handle);
        let fresh = pool.allocate();
        let freed_there = racer.join().unwrap();

        assert!(freed_here ^ freed_there);
        assert!(!pool.is_alive(handle));
        if let Some(fresh) = fresh {
            assert!(fresh.generation() > handle.generation());
            assert!(pool.is_alive(fresh));
        }
    });
}
