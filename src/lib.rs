//! Cooperative task-graph scheduler with lock-free supporting primitives.
//!
//! This crate runs dependency-ordered units of suspendable work on a fixed
//! pool of worker threads. It:
//! - Lets callers build a DAG of nodes and rejects edges that would close a
//!   cycle.
//! - Schedules ready nodes through a lock-free bounded MPMC ring, so the hot
//!   path never takes a global lock.
//! - Hands each dependent to exactly one worker: whoever brings its
//!   prerequisite counter from one to zero.
//! - Resumes tasks that suspended on an awaitable from whichever thread
//!   completes the awaited work.
//! - Provides a generational handle pool that detects stale references
//!   without reference counting.
//!
//! Key modules:
//! - `queue`: the bounded lock-free ring buffer (Vyukov MPMC).
//! - `task`: `SuspendableTask`, a lazily started, explicitly resumed future.
//! - `graph`: `TaskGraph`, its `Node`s, `Spawner` and the `Offload` awaitable.
//! - `handle`: `HandlePool` and its `{index, generation}` handles.
//! - `global`: an optional process-wide scheduler wrapper.
//! - `config`: constructor-time parameters and their validation.
//!
//! Quick start:
//! 1. Create a `TaskGraph` from a `TaskGraphConfig`.
//! 2. Add nodes with `add_node` and wire them with `add_dependency`.
//! 3. Call `execute`, then `wait_all`.
//!
//! Failure policy: a panic inside a task aborts the process. Capacity limits
//! (full queue, exhausted pool) are reported as values, never as panics.
//!
//! With the `loom` feature the queue and the handle pool are built on `loom`
//! atomics so they can be model-checked; the graph is not usable in that
//! configuration.

/// Constructor-time parameters and their validation errors.
pub mod config;
/// Optional process-wide scheduler singleton.
pub mod global;
/// The task graph and its worker pool.
///
/// Contains node-set construction (cycle rejection, arena ids), the worker
/// loop with its ready queue and semaphore, node wakers, and the `Spawner`
/// and `Offload` used to hand work to the pool from anywhere.
pub mod graph;
/// Generational handle pool.
pub mod handle;
/// Lock-free bounded multi-producer/multi-consumer queue.
pub mod queue;
mod sync;
/// Suspendable tasks and the `yield_now` awaitable.
pub mod task;
/// Shared identifier types and the `SyncUnsafeCell` used internally.
pub mod types;
mod utils;
