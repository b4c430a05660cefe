use crate::{graph::execute::Shared, task::SuspendableTask};
use core::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Error returned by [`Spawner::submit`] once the graph has shut down.
///
/// Hands the task back to the caller.
#[derive(Debug, Error)]
#[error("scheduler has shut down")]
pub struct Rejected(pub SuspendableTask);

/// Cloneable handle for submitting work to a running [`TaskGraph`].
///
/// A spawner may outlive its graph; submissions made after the graph shut
/// down are rejected.
///
/// [`TaskGraph`]: crate::graph::TaskGraph
#[derive(Clone)]
pub struct Spawner {
    pub(super) shared: Arc<Shared>,
}

impl Spawner {
    /// Runs `task` as a detached node with no edges.
    ///
    /// The node counts towards [`TaskGraph::wait_all`].
    ///
    /// # Errors
    /// Gives the task back if the graph has shut down.
    ///
    /// [`TaskGraph::wait_all`]: crate::graph::TaskGraph::wait_all
    pub fn submit(&self, task: SuspendableTask) -> Result<(), Rejected> {
        self.shared.submit(task)
    }

    /// Returns an awaitable that runs `job` on a worker and resumes the
    /// awaiting task with its result.
    pub fn offload<R, F>(&self, job: F) -> Offload<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        Offload::new(Some(self.clone()), job)
    }

    /// Whether the graph still accepts work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Blocks until every node and submitted task of the graph completed.
    ///
    /// Same caveat as [`TaskGraph::wait_all`]: never call it from a node.
    ///
    /// [`TaskGraph::wait_all`]: crate::graph::TaskGraph::wait_all
    pub fn wait_idle(&self) {
        self.shared.wait_idle();
    }
}

impl fmt::Debug for Spawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawner")
            .field("running", &self.is_running())
            .finish()
    }
}

type Job<R> = Box<dyn FnOnce() -> R + Send>;

/// Awaitable that hands a closure to a worker and completes with its result.
///
/// Nothing happens until the first poll. Without a spawner, or if the graph
/// has shut down, the closure runs inline on the polling thread. Otherwise the
/// caller is resumed on whichever thread finished the closure.
#[must_use = "futures do nothing unless awaited"]
pub struct Offload<R> {
    stage: Stage<R>,
}

enum Stage<R> {
    Idle {
        spawner: Option<Spawner>,
        job: Job<R>,
    },
    Waiting(Arc<Mutex<Rendezvous<R>>>),
    Finished,
}

struct Rendezvous<R> {
    result: Option<R>,
    waker: Option<Waker>,
}

impl<R: Send + 'static> Offload<R> {
    pub(crate) fn new<F>(spawner: Option<Spawner>, job: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
    {
        Self {
            stage: Stage::Idle {
                spawner,
                job: Box::new(job),
            },
        }
    }

    fn hand_off(spawner: &Spawner, job: Job<R>, waker: &Waker) -> Arc<Mutex<Rendezvous<R>>> {
        let rendezvous = Arc::new(Mutex::new(Rendezvous {
            result: None,
            waker: Some(waker.clone()),
        }));
        let handoff = Arc::clone(&rendezvous);
        let task = SuspendableTask::from_fn(move || {
            let result = job();
            let waker = {
                let mut slot = handoff.lock();
                slot.result = Some(result);
                slot.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        if let Err(Rejected(mut task)) = spawner.submit(task) {
            debug!("scheduler has shut down, running offloaded job inline");
            rendezvous.lock().waker = None;
            task.resume();
        }
        rendezvous
    }
}

impl<R: Send + 'static> Future for Offload<R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();
        loop {
            match mem::replace(&mut this.stage, Stage::Finished) {
                Stage::Idle { spawner: None, job } => return Poll::Ready(job()),
                Stage::Idle {
                    spawner: Some(spawner),
                    job,
                } => {
                    this.stage = Stage::Waiting(Self::hand_off(&spawner, job, cx.waker()));
                }
                Stage::Waiting(rendezvous) => {
                    let mut slot = rendezvous.lock();
                    if let Some(result) = slot.result.take() {
                        return Poll::Ready(result);
                    }
                    slot.waker = Some(cx.waker().clone());
                    drop(slot);
                    this.stage = Stage::Waiting(rendezvous);
                    return Poll::Pending;
                }
                Stage::Finished => panic!("`Offload` polled after completion"),
            }
        }
    }
}

impl<R> fmt::Debug for Offload<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Idle { .. } => "Idle",
            Stage::Waiting(_) => "Waiting",
            Stage::Finished => "Finished",
        };
        f.debug_struct("Offload").field("stage", &stage).finish()
    }
}
