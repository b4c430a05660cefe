mod build;
mod dot;
mod execute;
mod offload;
mod semaphore;

/// Error returned by graph construction, execution and the process-wide
/// scheduler.
pub use crate::graph::build::GraphError;
pub use crate::graph::offload::{Offload, Rejected, Spawner};
use crate::{
    config::TaskGraphConfig,
    graph::{
        build::NodeSetBuilder,
        execute::{Batch, Shared, run_worker},
    },
    task::SuspendableTask,
    types::NodeId,
};
use core::{fmt, future::Future, mem};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, error};

/// A unit of work to be placed in a [`TaskGraph`].
///
/// The label only shows up in logs and in DOT dumps.
#[derive(Debug)]
pub struct Node {
    label: String,
    task: SuspendableTask,
}

impl Node {
    /// Wraps an existing task.
    pub fn new(label: impl Into<String>, task: SuspendableTask) -> Self {
        Self {
            label: label.into(),
            task,
        }
    }

    /// A node whose task runs `f` to completion.
    pub fn from_fn<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(label, SuspendableTask::from_fn(f))
    }

    /// A node whose task drives `body`, suspending at each pending `.await`.
    pub fn from_future<F>(label: impl Into<String>, body: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::new(label, SuspendableTask::new(body))
    }

    /// Human-readable name of the node.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Dependency-ordered scheduler running nodes on a fixed pool of workers.
///
/// Life cycle of a node set:
/// 1. [`add_node`](Self::add_node) and [`add_dependency`](Self::add_dependency)
///    build a DAG. Edges that would close a cycle are rejected.
/// 2. [`execute`](Self::execute) freezes the set and pushes every node without
///    prerequisites onto the lock-free ready queue.
/// 3. Workers resume ready nodes. When a node completes, each dependent's
///    counter is decremented, and the worker that brings it to zero schedules
///    that dependent, so every node runs exactly once.
/// 4. [`wait_all`](Self::wait_all) blocks until every node has completed, and
///    [`clear`](Self::clear) drops the set so a new one can be built.
///
/// A node whose task suspends on an awaitable is parked and queued again by
/// its waker, possibly on another worker.
///
/// Dropping the graph stops the workers: they finish whatever is queued and
/// are joined. Submissions racing the stop are either rejected or run before
/// the last worker exits.
#[must_use]
pub struct TaskGraph {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    phase: Phase,
}

enum Phase {
    Building(NodeSetBuilder),
    Executing(Arc<Batch>),
}

impl TaskGraph {
    /// Validates `config` and spawns the workers.
    ///
    /// # Errors
    /// If the configuration is invalid or a worker thread cannot be spawned.
    pub fn new(config: TaskGraphConfig) -> Result<Self, GraphError> {
        config.validate()?;
        let mut graph = Self {
            shared: Arc::new(Shared::new(config.queue_capacity)?),
            workers: Vec::with_capacity(config.workers),
            phase: Phase::Building(NodeSetBuilder::default()),
        };
        for index in 0..config.workers {
            let shared = Arc::clone(&graph.shared);
            let worker = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || run_worker(shared, index))
                .map_err(GraphError::Spawn)?;
            graph.shared.enlist();
            graph.workers.push(worker);
        }
        debug!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "task graph started"
        );
        Ok(graph)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Number of nodes in the current node set.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.phase {
            Phase::Building(builder) => builder.len(),
            Phase::Executing(batch) => batch.len(),
        }
    }

    /// Whether the current node set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes ownership of `node` and returns its id.
    ///
    /// # Errors
    /// If the current node set was already executed, or is full.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        self.builder_mut()?.add(node)
    }

    /// Makes `downstream` wait for `upstream`.
    ///
    /// Adding the same edge twice has no effect.
    ///
    /// # Errors
    /// - [`GraphError::UnknownNode`] if either id is not in the current node set.
    /// - [`GraphError::Cycle`] if `upstream` is reachable from `downstream`.
    /// - [`GraphError::AlreadyExecuted`] after [`execute`](Self::execute).
    pub fn add_dependency(&mut self, upstream: NodeId, downstream: NodeId) -> Result<(), GraphError> {
        self.builder_mut()?.connect(upstream, downstream)
    }

    /// Starts the current node set.
    ///
    /// # Errors
    /// If the current node set was already executed.
    pub fn execute(&mut self) -> Result<(), GraphError> {
        let builder = mem::take(self.builder_mut()?);
        let batch = Arc::new(Batch::new(builder.into_nodes()));
        debug!(nodes = batch.len(), "executing node set");
        self.shared.start(&batch);
        self.phase = Phase::Executing(batch);
        Ok(())
    }

    /// Blocks until every executed node and every submitted task completed.
    ///
    /// Must not be called from inside a node: the calling worker would wait
    /// for itself.
    pub fn wait_all(&self) {
        self.shared.wait_idle();
    }

    /// Whether the node ran to completion.
    #[must_use]
    pub fn is_complete(&self, id: NodeId) -> bool {
        match &self.phase {
            Phase::Building(_) => false,
            Phase::Executing(batch) => batch.is_complete(id),
        }
    }

    /// Waits for outstanding work, then drops the current node set.
    ///
    /// Ids handed out for the dropped set must not be reused.
    pub fn clear(&mut self) {
        self.wait_all();
        self.phase = Phase::Building(NodeSetBuilder::default());
    }

    /// Handle for submitting work from other threads or from inside nodes.
    pub fn spawner(&self) -> Spawner {
        Spawner {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs `task` as a detached node, see [`Spawner::submit`].
    ///
    /// # Errors
    /// Never fails while the graph is alive; the signature mirrors
    /// [`Spawner::submit`].
    pub fn submit(&self, task: SuspendableTask) -> Result<(), Rejected> {
        self.shared.submit(task)
    }

    /// Writes the current node set as a DOT digraph.
    ///
    /// # Errors
    /// On write failure.
    pub fn write_dot(&self, out: impl Write) -> io::Result<()> {
        match &self.phase {
            Phase::Building(builder) => dot::write_dot(
                out,
                builder
                    .nodes()
                    .iter()
                    .map(|node| (node.label.as_str(), node.dependents.iter().copied())),
            ),
            Phase::Executing(batch) => dot::write_dot(
                out,
                batch
                    .nodes()
                    .iter()
                    .map(|node| (node.label.as_str(), node.dependents.iter().copied())),
            ),
        }
    }

    /// Writes the current node set as a DOT file at `path`.
    ///
    /// # Errors
    /// If the file cannot be created or written.
    pub fn dump_dot(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let file = File::create(path)?;
        self.write_dot(BufWriter::new(file))?;
        Ok(())
    }

    /// Stops the workers after they drain the ready queue, and joins them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn builder_mut(&mut self) -> Result<&mut NodeSetBuilder, GraphError> {
        match &mut self.phase {
            Phase::Building(builder) => Ok(builder),
            Phase::Executing(_) => Err(GraphError::AlreadyExecuted),
        }
    }

    fn stop(&mut self) {
        if self.shared.stop(self.workers.len()) {
            debug!(workers = self.workers.len(), "stopping task graph");
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("task graph worker panicked");
            }
        }
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            Phase::Building(_) => "Building",
            Phase::Executing(_) => "Executing",
        };
        f.debug_struct("TaskGraph")
            .field("workers", &self.workers.len())
            .field("phase", &phase)
            .field("nodes", &self.len())
            .finish_non_exhaustive()
    }
}
