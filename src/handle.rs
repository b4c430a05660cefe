use crate::{
    config::{ConfigError, validate_pool_capacity},
    graph::{Offload, Spawner},
    sync::*,
};
use core::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
};
use derive_more::Debug;
use std::sync::Arc;

/// Low bit of a slot word: the slot is handed out.
const USED: u64 = 1;

/// Slot word layout: generation in the high half, used flag in the low bit.
/// Keeping both in one word lets `free` and `is_alive` check them together.
const fn pack(generation: u32, used: bool) -> u64 {
    ((generation as u64) << 32) | used as u64
}

const fn generation_of(word: u64) -> u32 {
    (word >> 32) as u32
}

/// Revocable reference to a slot of a [`HandlePool`].
///
/// Freely copyable. Once the slot is freed the handle is dead for good: the
/// slot's generation moved on, so even if the slot is handed out again this
/// handle never matches it.
#[derive(Debug)]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    #[debug(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index inside the pool.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

/// Fixed-capacity arena of generational slots for resources of kind `T`.
///
/// `T` only tags the handles so that handles of different pools don't mix;
/// the pool stores no `T` values. Slots are claimed with a CAS on their word,
/// starting the search at a shared cursor that moves past every successful
/// claim, so concurrent allocations spread over the pool instead of all
/// fighting over slot zero.
///
/// Re-sizing and resetting take `&mut self`, so they cannot race with
/// `allocate`/`free`.
pub struct HandlePool<T> {
    slots: Box<[AtomicU64]>,
    cursor: AtomicUsize,
    spawner: Option<Spawner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HandlePool<T> {
    /// An uninitialized pool. Call [`initialize`](Self::initialize) before use.
    pub fn new() -> Self {
        Self {
            slots: Box::default(),
            cursor: AtomicUsize::new(0),
            spawner: None,
            _marker: PhantomData,
        }
    }

    /// A pool of `capacity` free slots.
    ///
    /// # Errors
    /// If `capacity` is zero or exceeds `u32::MAX`.
    pub fn with_capacity(capacity: usize) -> Result<Self, ConfigError> {
        let mut pool = Self::new();
        pool.initialize(capacity)?;
        Ok(pool)
    }

    /// Re-sizes the pool to `capacity` free slots with zeroed generations.
    ///
    /// # Errors
    /// If `capacity` is zero or exceeds `u32::MAX`. The pool is left untouched.
    pub fn initialize(&mut self, capacity: usize) -> Result<(), ConfigError> {
        validate_pool_capacity(capacity)?;
        self.slots = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        self.cursor = AtomicUsize::new(0);
        Ok(())
    }

    /// Frees every slot. Outstanding handles die, as with [`free`](Self::free).
    pub fn reset(&mut self) {
        for slot in self.slots.iter() {
            let word = slot.load(Ordering::Relaxed);
            if word & USED != 0 {
                slot.store(pack(generation_of(word).wrapping_add(1), false), Ordering::Relaxed);
            }
        }
        self.cursor = AtomicUsize::new(0);
    }

    /// Zeroes every slot, generations included.
    ///
    /// Unlike [`reset`](Self::reset), handles issued before the call may come
    /// back to life once their slot is reallocated.
    pub fn clear(&mut self) {
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        self.cursor = AtomicUsize::new(0);
    }

    /// Routes [`allocate_async`](Self::allocate_async) through a task graph.
    pub fn attach(&mut self, spawner: Spawner) {
        self.spawner = Some(spawner);
    }

    /// Makes [`allocate_async`](Self::allocate_async) allocate inline again.
    pub fn detach(&mut self) -> Option<Spawner> {
        self.spawner.take()
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has slots.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Number of used slots at some recent instant.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) & USED != 0)
            .count()
    }

    /// Claims a free slot.
    ///
    /// Returns `None` when a full lap over the pool found no free slot.
    ///
    /// # Panics
    /// If the pool was never initialized.
    pub fn allocate(&self) -> Option<Handle<T>> {
        let capacity = self.slots.len();
        assert!(capacity > 0, "HandlePool::allocate: pool is not initialized");
        let start = self.cursor.load(Ordering::Relaxed) % capacity;
        for step in 0..capacity {
            let index = (start + step) % capacity;
            let slot = &self.slots[index];
            let word = slot.load(Ordering::Relaxed);
            if word & USED != 0 {
                continue;
            }
            if slot
                .compare_exchange(word, word | USED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.cursor.store((index + 1) % capacity, Ordering::Relaxed);
                let index = index.try_into().expect("HandlePool::allocate");
                return Some(Handle::new(index, generation_of(word)));
            }
        }
        None
    }

    /// Releases the slot of `handle` and bumps its generation.
    ///
    /// Returns `false`, changing nothing, if the handle is out of range or
    /// already dead.
    pub fn free(&self, handle: Handle<T>) -> bool {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return false;
        };
        slot.compare_exchange(
            pack(handle.generation, true),
            pack(handle.generation.wrapping_add(1), false),
            Ordering::Release,
            Ordering::Relaxed,
        )
        .is_ok()
    }

    /// Whether the slot is in use and still at the handle's generation.
    #[must_use]
    pub fn is_alive(&self, handle: Handle<T>) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.load(Ordering::Acquire) == pack(handle.generation, true))
    }
}

impl<T: 'static> HandlePool<T> {
    /// Awaitable allocation.
    ///
    /// With an attached spawner the search runs on a graph worker and the
    /// awaiting task is resumed there; otherwise it runs inline on first poll.
    pub fn allocate_async(self: &Arc<Self>) -> Offload<Option<Handle<T>>> {
        let pool = Arc::clone(self);
        Offload::new(self.spawner.clone(), move || pool.allocate())
    }
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HandlePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePool")
            .field("capacity", &self.capacity())
            .field("live", &self.live_count())
            .field("attached", &self.spawner.is_some())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{config::TaskGraphConfig, graph::TaskGraph};
    use core::{
        pin::pin,
        task::{Context, Poll, Waker},
    };
    use std::{collections::HashSet, future::Future};

    struct Sprite;

    #[test]
    fn freed_handles_stay_dead() {
        let pool = HandlePool::<Sprite>::with_capacity(1).unwrap();
        let first = pool.allocate().unwrap();
        assert!(pool.is_alive(first));

        assert!(pool.free(first));
        assert!(!pool.is_alive(first));

        let second = pool.allocate().unwrap();
        assert_eq!(second.index(), first.index());
        assert!(second.generation() > first.generation());
        assert!(pool.is_alive(second));
        assert!(!pool.is_alive(first));

        // Freeing through the stale copy must not release the new owner's slot.
        assert!(!pool.free(first));
        assert!(pool.is_alive(second));
    }

    #[test]
    fn exhaustion_and_recovery() {
        let pool = HandlePool::<Sprite>::with_capacity(4).unwrap();
        let handles: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.live_count(), 4);

        assert!(pool.free(handles[2]));
        let again = pool.allocate().unwrap();
        assert_eq!(again.index(), 2);
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn cursor_walks_the_whole_pool() {
        let pool = HandlePool::<Sprite>::with_capacity(5).unwrap();
        let indices: HashSet<_> = (0..5).map(|_| pool.allocate().unwrap().index()).collect();
        assert_eq!(indices, (0..5).collect());

        // Allocate/free cycles keep moving forward instead of reusing slot 0.
        let pool = HandlePool::<Sprite>::with_capacity(3).unwrap();
        let mut seen = Vec::new();
        for _ in 0..6 {
            let handle = pool.allocate().unwrap();
            seen.push(handle.index());
            assert!(pool.free(handle));
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn out_of_range_handles_are_ignored() {
        let big = HandlePool::<Sprite>::with_capacity(8).unwrap();
        let small = HandlePool::<Sprite>::with_capacity(2).unwrap();
        let mut far = big.allocate().unwrap();
        for _ in 0..6 {
            far = big.allocate().unwrap();
        }
        assert_eq!(far.index(), 6);
        assert!(!small.is_alive(far));
        assert!(!small.free(far));
    }

    #[test]
    fn reset_kills_outstanding_handles() {
        let mut pool = HandlePool::<Sprite>::with_capacity(2).unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.reset();
        assert_eq!(pool.live_count(), 0);
        assert!(!pool.is_alive(a));
        assert!(!pool.is_alive(b));

        let c = pool.allocate().unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(c.generation(), 1);
    }

    #[test]
    fn clear_and_initialize_zero_generations() {
        let mut pool = HandlePool::<Sprite>::with_capacity(1).unwrap();
        let first = pool.allocate().unwrap();
        pool.free(first);
        pool.clear();
        assert_eq!(pool.allocate().unwrap().generation(), 0);

        pool.initialize(3).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(
            pool.initialize(0),
            Err(ConfigError::PoolCapacity { capacity: 0 })
        );
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    #[should_panic(expected = "pool is not initialized")]
    fn uninitialized_pool_fails_fast() {
        let pool = HandlePool::<Sprite>::new();
        assert!(!pool.is_initialized());
        let _ = pool.allocate();
    }

    #[test]
    fn allocate_async_without_graph_is_inline() {
        let pool = Arc::new(HandlePool::<Sprite>::with_capacity(1).unwrap());
        let mut cx = Context::from_waker(Waker::noop());

        let mut first = pin!(pool.allocate_async());
        let Poll::Ready(Some(handle)) = first.as_mut().poll(&mut cx) else {
            panic!("inline allocation must complete on first poll");
        };
        assert!(pool.is_alive(handle));

        let mut second = pin!(pool.allocate_async());
        assert_eq!(second.as_mut().poll(&mut cx), Poll::Ready(None));
    }

    #[test]
    fn detach_restores_inline_allocation() {
        let graph = TaskGraph::new(TaskGraphConfig::default().with_workers(1)).unwrap();
        let mut pool = HandlePool::<Sprite>::with_capacity(1).unwrap();
        pool.attach(graph.spawner());
        assert!(format!("{pool:?}").contains("attached: true"));
        assert!(pool.detach().is_some());
        assert!(pool.detach().is_none());

        let pool = Arc::new(pool);
        let mut allocation = pin!(pool.allocate_async());
        let mut cx = Context::from_waker(Waker::noop());
        assert!(matches!(
            allocation.as_mut().poll(&mut cx),
            Poll::Ready(Some(_))
        ));
    }
}
