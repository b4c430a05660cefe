use crate::{
    config::{ConfigError, validate_queue_capacity},
    sync::*,
    types::SyncUnsafeCell,
};
use core::{fmt, mem::MaybeUninit};
use crossbeam_utils::CachePadded;

/// Fixed-capacity lock-free multi-producer/multi-consumer ring buffer.
///
/// Every slot carries a sequence number that encodes which lap of the ring
/// it is ready for (Vyukov's bounded MPMC queue):
/// - a producer at position `pos` may write the slot when its sequence equals
///   `pos`, and publishes `pos + 1` once the payload is written;
/// - a consumer at position `pos` may read the slot when its sequence equals
///   `pos + 1`, and publishes `pos + capacity` once the payload is taken,
///   handing the slot to the producer of the next lap.
///
/// Positions are claimed by CAS on the shared `tail`/`head` counters, so the
/// only contention is a retry on a lost CAS. Neither operation ever blocks:
/// a full queue rejects the item and an empty queue returns `None`.
pub struct BoundedQueue<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[Slot<T>]>,
}

struct Slot<T> {
    sequence: AtomicUsize,
    value: SyncUnsafeCell<MaybeUninit<T>>,
}

impl<T> BoundedQueue<T> {
    /// Creates an empty queue.
    ///
    /// # Errors
    /// If `capacity` is not a power of two or is smaller than 2.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        validate_queue_capacity(capacity)?;
        let slots = (0..capacity)
            .map(|pos| Slot {
                sequence: AtomicUsize::new(pos),
                value: SyncUnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Ok(Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
            slots,
        })
    }

    /// Maximum number of items the queue can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Appends `item` at the tail.
    ///
    /// # Errors
    /// Gives the item back if the queue is full.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let lag = sequence.wrapping_sub(pos) as isize;
            if lag == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: Winning the CAS at `pos` while the slot's sequence is `pos`
                        // makes this thread the only writer of the slot for this lap; no
                        // consumer reads it until the sequence below is published.
                        unsafe {
                            slot.value
                                .get_mut()
                                .with(|ptr| ptr.write(MaybeUninit::new(item)));
                        }
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                // The slot still holds an item from the previous lap.
                return Err(item);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Removes the item at the head, if any.
    pub fn dequeue(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let lag = sequence.wrapping_sub(pos.wrapping_add(1)) as isize;
            if lag == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: The sequence `pos + 1` was published by the producer after
                        // initializing the slot, and winning the CAS makes this thread its
                        // only reader for this lap.
                        let item = unsafe {
                            slot.value
                                .get_mut()
                                .with(|ptr| ptr.read().assume_init())
                        };
                        slot.sequence
                            .store(pos.wrapping_add(self.capacity()), Ordering::Release);
                        return Some(item);
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Number of items in the queue at some recent instant.
    ///
    /// Only a snapshot: concurrent operations may change it before the caller
    /// looks at the result.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    /// Whether the queue looked empty at some recent instant.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rejects_invalid_capacity() {
        assert!(matches!(
            BoundedQueue::<u8>::new(6),
            Err(ConfigError::QueueCapacity { capacity: 6 })
        ));
        assert!(BoundedQueue::<u8>::new(1).is_err());
        assert_eq!(BoundedQueue::<u8>::new(8).unwrap().capacity(), 8);
    }

    #[test]
    fn preserves_fifo_order_across_laps() {
        let queue = BoundedQueue::new(4).unwrap();
        let mut next_out = 0;
        for value in 0..100 {
            queue.enqueue(value).unwrap();
            if value % 3 == 2 {
                while let Some(out) = queue.dequeue() {
                    assert_eq!(out, next_out);
                    next_out += 1;
                }
            }
        }
        while let Some(out) = queue.dequeue() {
            assert_eq!(out, next_out);
            next_out += 1;
        }
        assert_eq!(next_out, 100);
    }

    #[test]
    fn full_and_empty_leave_queue_unchanged() {
        let queue = BoundedQueue::new(2).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);

        queue.enqueue('a').unwrap();
        queue.enqueue('b').unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.enqueue('c'), Err('c'));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue(), Some('a'));
        assert_eq!(queue.dequeue(), Some('b'));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn drops_items_left_in_queue() {
        let marker = Arc::new(());
        {
            let queue = BoundedQueue::new(4).unwrap();
            for _ in 0..3 {
                queue.enqueue(Arc::clone(&marker)).unwrap();
            }
            drop(queue.dequeue());
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
