use crate::{
    config::ConfigError,
    graph::{build::PendingNode, offload::Rejected, semaphore::Semaphore},
    queue::BoundedQueue,
    sync::*,
    task::{Resumed, SuspendableTask},
    types::{NodeId, SyncUnsafeCell},
};
use core::{
    sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize as StdAtomicUsize},
    task::Waker,
};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{collections::VecDeque, sync::Arc, task::Wake};
use tracing::{debug, trace, warn};

/// `prereq` value of a node whose task ran to completion.
pub(super) const COMPLETED: i32 = -1;

// Scheduling states of a node.
/// Waiting for prerequisites.
const WAITING: u8 = 0;
/// In the ready queue (or its overflow list).
const QUEUED: u8 = 1;
/// Being resumed by a worker.
const RUNNING: u8 = 2;
/// Woken while being resumed; must be queued again once the resume returns.
const NOTIFIED: u8 = 3;
/// Suspended, waiting for its waker.
const PARKED: u8 = 4;
/// Completed.
const DONE: u8 = 5;
/// Dropped because it was scheduled after every worker retired.
const ABANDONED: u8 = 6;

/// A node frozen for execution.
#[must_use]
#[repr(align(128))]
pub(super) struct NodeSlot {
    pub(super) label: String,
    /// Accessed only by the thread that moved the node into `RUNNING`.
    task: SyncUnsafeCell<SuspendableTask>,
    /// Number of predecessors that haven't finished yet, or [`COMPLETED`].
    prereq: AtomicI32,
    state: AtomicU8,
    pub(super) dependents: Box<[NodeId]>,
}

/// A node set handed to the workers.
///
/// Nodes refer to each other by index, and every ready-queue entry keeps the
/// whole set alive.
pub(super) struct Batch {
    nodes: Box<[NodeSlot]>,
}

impl Batch {
    pub(super) fn new(nodes: Vec<PendingNode>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|node| {
                let PendingNode {
                    label,
                    task,
                    prereq,
                    dependents,
                } = node;
                NodeSlot {
                    label,
                    task: SyncUnsafeCell::new(task),
                    prereq: AtomicI32::new(prereq.try_into().expect("Batch::new")),
                    state: AtomicU8::new(WAITING),
                    dependents: dependents.into_iter().collect(),
                }
            })
            .collect();
        Self { nodes }
    }

    /// A single node with no edges, used for tasks submitted on the fly.
    fn detached(task: SuspendableTask) -> Self {
        Self {
            nodes: Box::new([NodeSlot {
                label: String::from("detached"),
                task: SyncUnsafeCell::new(task),
                prereq: AtomicI32::new(0),
                state: AtomicU8::new(WAITING),
                dependents: Box::default(),
            }]),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(super) fn nodes(&self) -> &[NodeSlot] {
        &self.nodes
    }

    pub(super) fn is_complete(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.index())
            .is_some_and(|node| node.prereq.load(Ordering::Acquire) == COMPLETED)
    }

    fn node(&self, id: NodeId) -> &NodeSlot {
        &self.nodes[id.index()]
    }

    fn roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len())
            .filter(|&index| self.nodes[index].prereq.load(Ordering::Relaxed) == 0)
            .map(|index| NodeId(index.try_into().expect("Batch::roots")))
    }
}

/// Entry of the ready queue.
pub(super) struct Ready {
    batch: Arc<Batch>,
    id: NodeId,
}

/// State shared between a graph, its workers, its spawners and node wakers.
pub(super) struct Shared {
    ready: BoundedQueue<Ready>,
    /// Entries that did not fit into `ready`. Touched only while it is full.
    ///
    /// Workers look at the ring first, so entries pushed after a spill may run
    /// before the spilled ones: the ready order is FIFO only while the ring
    /// has room.
    overflow: Mutex<VecDeque<Ready>>,
    /// One permit per entry in `ready` plus `overflow`.
    permits: Semaphore,
    /// Cleared by `stop`, under the write side of `workers`.
    running: AtomicBool,
    /// Workers that have not retired.
    ///
    /// Every push holds the read side and workers retire under the write side,
    /// so an entry is either pushed while some worker will still drain it, or
    /// seen with no worker left and abandoned.
    workers: RwLock<usize>,
    /// Nodes scheduled through `start` that haven't completed or been
    /// abandoned yet.
    outstanding: StdAtomicUsize,
    idle: Mutex<()>,
    all_done: Condvar,
}

impl Shared {
    pub(super) fn new(queue_capacity: usize) -> Result<Self, ConfigError> {
        Ok(Self {
            ready: BoundedQueue::new(queue_capacity)?,
            overflow: Mutex::new(VecDeque::new()),
            permits: Semaphore::default(),
            running: AtomicBool::new(true),
            workers: RwLock::new(0),
            outstanding: StdAtomicUsize::new(0),
            idle: Mutex::new(()),
            all_done: Condvar::new(),
        })
    }

    pub(super) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Counts a freshly spawned worker.
    pub(super) fn enlist(&self) {
        *self.workers.write() += 1;
    }

    /// Counts every node of `batch` as outstanding and schedules its roots.
    pub(super) fn start(&self, batch: &Arc<Batch>) {
        let stranded = {
            let workers = self.workers.read();
            self.start_with(*workers, batch)
        };
        stranded.into_iter().for_each(|ready| self.abandon(ready));
    }

    /// Starts a detached one-node batch, unless the graph is stopping.
    ///
    /// The running check and the push happen under one read guard, so `stop`
    /// cannot slip in between.
    pub(super) fn submit(&self, task: SuspendableTask) -> Result<(), Rejected> {
        let stranded = {
            let workers = self.workers.read();
            if !self.is_running() {
                return Err(Rejected(task));
            }
            self.start_with(*workers, &Arc::new(Batch::detached(task)))
        };
        stranded.into_iter().for_each(|ready| self.abandon(ready));
        Ok(())
    }

    /// Returns the roots that found no worker left.
    fn start_with(&self, workers: usize, batch: &Arc<Batch>) -> Vec<Ready> {
        self.outstanding.fetch_add(batch.len(), Ordering::AcqRel);
        batch
            .roots()
            .filter_map(|id| {
                batch.node(id).state.store(QUEUED, Ordering::Relaxed);
                self.push(
                    workers,
                    Ready {
                        batch: Arc::clone(batch),
                        id,
                    },
                )
                .err()
            })
            .collect()
    }

    /// Blocks until no outstanding node is left.
    pub(super) fn wait_idle(&self) {
        let mut guard = self.idle.lock();
        while self.outstanding.load(Ordering::Acquire) != 0 {
            self.all_done.wait(&mut guard);
        }
    }

    /// Clears the running flag and unblocks every worker.
    ///
    /// Returns `false` if the graph was already stopping.
    pub(super) fn stop(&self, workers: usize) -> bool {
        {
            let _workers = self.workers.write();
            if !self.running.swap(false, Ordering::AcqRel) {
                return false;
            }
        }
        self.permits.release(workers);
        true
    }

    fn schedule(&self, ready: Ready) {
        let pushed = {
            let workers = self.workers.read();
            self.push(*workers, ready)
        };
        // Abandoning may drop the batch, so do it without the guard.
        if let Err(ready) = pushed {
            self.abandon(ready);
        }
    }

    /// Must be called under the read side of `workers`, with the guarded
    /// count. Hands the entry back if every worker retired.
    fn push(&self, workers: usize, ready: Ready) -> Result<(), Ready> {
        if workers == 0 {
            return Err(ready);
        }
        if let Err(ready) = self.ready.enqueue(ready) {
            warn!(
                capacity = self.ready.capacity(),
                "ready queue is full, spilling to overflow list"
            );
            self.overflow.lock().push_back(ready);
        }
        self.permits.release(1);
        Ok(())
    }

    /// Gives up on a node scheduled after every worker retired, together with
    /// every node downstream of it, which can no longer run either.
    fn abandon(&self, ready: Ready) {
        let Ready { batch, id } = ready;
        batch.node(id).state.store(ABANDONED, Ordering::Release);
        let mut abandoned = 1;
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            for &dependent in batch.node(id).dependents.iter() {
                // Another abandoned ancestor may have claimed it already.
                if batch
                    .node(dependent)
                    .state
                    .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    abandoned += 1;
                    stack.push(dependent);
                }
            }
        }
        warn!(
            node = %id,
            abandoned,
            "node scheduled after every worker stopped, dropping it"
        );
        self.settle(abandoned);
    }

    /// Takes `count` nodes off the outstanding counter.
    fn settle(&self, count: usize) {
        if self.outstanding.fetch_sub(count, Ordering::AcqRel) == count {
            let _guard = self.idle.lock();
            self.all_done.notify_all();
        }
    }

    fn take(&self) -> Option<Ready> {
        self.ready
            .dequeue()
            .or_else(|| self.overflow.lock().pop_front())
    }

    /// Leaves the pool if nothing is queued. No push can be in flight while
    /// the write guard is held, so the last worker to retire leaves nothing
    /// behind.
    fn retire(&self) -> bool {
        let mut workers = self.workers.write();
        if !self.ready.is_empty() || !self.overflow.lock().is_empty() {
            return false;
        }
        *workers -= 1;
        true
    }

    /// Waits for a permit and returns the matching entry, or `None` once the
    /// graph is stopping.
    fn next_ready(&self) -> Option<Ready> {
        self.permits.acquire();
        let backoff = Backoff::new();
        loop {
            if !self.is_running() {
                return None;
            }
            // The permit is released right after the enqueue, so a miss here
            // is either another consumer taking the entry first, or a producer
            // that claimed an earlier slot and has not published it yet. Both
            // resolve shortly, so retry.
            if let Some(ready) = self.take() {
                return Some(ready);
            }
            backoff.snooze();
        }
    }
    fn dispatch(self: &Arc<Self>, ready: Ready) {
        let Ready { batch, id } = ready;
        let node = batch.node(id);
        node.state.store(RUNNING, Ordering::Relaxed);
        trace!(node = %id, label = %node.label, "resuming node");
        let waker = Waker::from(Arc::new(NodeWaker {
            shared: Arc::clone(self),
            batch: Arc::clone(&batch),
            id,
        }));
        // SAFETY: The node is in `RUNNING`, which only the thread that dequeued its
        // single ready entry can set. Wakers never touch the task, they only move
        // the state, so this is the only access until the state changes again.
        let resumed = unsafe {
            node.task
                .get_mut()
                .with(|ptr| (&mut *ptr).resume_with(&waker))
        };
        match resumed {
            Resumed::Completed => self.complete(&batch, id),
            Resumed::Suspended => {
                if node
                    .state
                    .compare_exchange(RUNNING, PARKED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Woken while running.
                    node.state.store(QUEUED, Ordering::Relaxed);
                    self.schedule(Ready { batch, id });
                }
            }
        }
    }

    /// Fans out to dependents: the thread that takes a dependent's counter from
    /// one to zero is the one that schedules it.
    fn complete(&self, batch: &Arc<Batch>, id: NodeId) {
        let node = batch.node(id);
        node.state.store(DONE, Ordering::Release);
        for &dependent in node.dependents.iter() {
            let next = batch.node(dependent);
            if next.prereq.fetch_sub(1, Ordering::AcqRel) == 1 {
                next.state.store(QUEUED, Ordering::Relaxed);
                self.schedule(Ready {
                    batch: Arc::clone(batch),
                    id: dependent,
                });
            }
        }
        node.prereq.store(COMPLETED, Ordering::Release);
        self.settle(1);
    }
}

/// Worker thread body.
pub(super) fn run_worker(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "worker started");
    while let Some(ready) = shared.next_ready() {
        shared.dispatch(ready);
    }
    let mut drained = 0_usize;
    loop {
        while let Some(ready) = shared.take() {
            shared.dispatch(ready);
            drained += 1;
        }
        if shared.retire() {
            break;
        }
    }
    debug!(worker = index, drained, "worker stopped");
}

/// Re-queues a parked node when the awaitable it suspended on is ready.
struct NodeWaker {
    shared: Arc<Shared>,
    batch: Arc<Batch>,
    id: NodeId,
}

impl Wake for NodeWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let node = self.batch.node(self.id);
        let mut state = node.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                PARKED => QUEUED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match node
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if next == QUEUED => {
                    self.shared.schedule(Ready {
                        batch: Arc::clone(&self.batch),
                        id: self.id,
                    });
                    return;
                }
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }
}
