//! Optional process-wide scheduler.
//!
//! A thin singleton around one [`TaskGraph`] for code that has no natural
//! place to keep a graph instance. The core types never consult it.

use crate::{
    config::TaskGraphConfig,
    graph::{GraphError, Rejected, Spawner, TaskGraph},
    task::SuspendableTask,
};
use parking_lot::{Mutex, const_mutex};
use tracing::info;

static SCHEDULER: Mutex<Option<TaskGraph>> = const_mutex(None);

/// Starts the process-wide scheduler.
///
/// # Errors
/// [`GraphError::AlreadyRunning`] if it is already running, or any error of
/// [`TaskGraph::new`].
pub fn scheduler_start(config: TaskGraphConfig) -> Result<(), GraphError> {
    let mut scheduler = SCHEDULER.lock();
    if scheduler.is_some() {
        return Err(GraphError::AlreadyRunning);
    }
    let workers = config.workers;
    *scheduler = Some(TaskGraph::new(config)?);
    info!(workers, "process-wide scheduler started");
    Ok(())
}

/// Stops the process-wide scheduler, draining queued work and joining its
/// workers. Returns `false` if it was not running.
pub fn scheduler_stop() -> bool {
    // Take the graph out first so joining the workers happens without the lock.
    let Some(graph) = SCHEDULER.lock().take() else {
        return false;
    };
    graph.shutdown();
    info!("process-wide scheduler stopped");
    true
}

/// Runs `task` on the process-wide scheduler.
///
/// # Errors
/// [`GraphError::NotRunning`] if the scheduler was not started, or
/// [`GraphError::ShutDown`] if it is stopping.
pub fn enqueue(task: SuspendableTask) -> Result<(), GraphError> {
    let spawner = spawner().ok_or(GraphError::NotRunning)?;
    spawner
        .submit(task)
        .map_err(|Rejected(_)| GraphError::ShutDown)
}

/// Submission handle of the process-wide scheduler, if it is running.
pub fn spawner() -> Option<Spawner> {
    SCHEDULER.lock().as_ref().map(TaskGraph::spawner)
}

/// Blocks until everything enqueued so far has completed.
///
/// Returns `false` if the scheduler is not running.
pub fn wait_idle() -> bool {
    let Some(spawner) = spawner() else {
        return false;
    };
    spawner.wait_idle();
    true
}
