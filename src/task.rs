use crate::utils::panic_message;
use core::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

type Body = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A lazily-started unit of cooperative work.
///
/// The task wraps a future and only makes progress when its owner calls
/// [`resume`](Self::resume) (or [`resume_with`](Self::resume_with)). Each call
/// runs the body until it either completes or reaches an `.await` that is not
/// ready yet. The task is moved, never copied, and `&mut self` on resumption
/// rules out two concurrent resumptions of the same instance.
///
/// A panic escaping the body is fatal: it is logged and the process aborts.
pub struct SuspendableTask {
    state: State,
}

enum State {
    NotStarted(Body),
    Suspended(Body),
    Done,
}

/// Outcome of a single resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    /// The body reached a suspension point and must be resumed again.
    Suspended,
    /// The body ran to completion.
    Completed,
}

impl SuspendableTask {
    /// Wraps a future. Nothing runs until the first resumption.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            state: State::NotStarted(Box::pin(body)),
        }
    }

    /// Wraps a closure that runs to completion on its first resumption.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(async move { f() })
    }

    /// Resumes with a waker that ignores wake-ups.
    ///
    /// Suitable when the owner drives the task by calling `resume` in a loop
    /// rather than waiting for a notification.
    pub fn resume(&mut self) -> Resumed {
        self.resume_with(Waker::noop())
    }

    /// Resumes with `waker`, which the body may use to ask for another
    /// resumption after it suspends.
    ///
    /// Resuming a completed task does nothing.
    pub fn resume_with(&mut self, waker: &Waker) -> Resumed {
        let mut body = match mem::replace(&mut self.state, State::Done) {
            State::NotStarted(body) | State::Suspended(body) => body,
            State::Done => return Resumed::Completed,
        };
        let mut cx = Context::from_waker(waker);
        match panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => Resumed::Completed,
            Ok(Poll::Pending) => {
                self.state = State::Suspended(body);
                Resumed::Suspended
            }
            Err(payload) => {
                error!(
                    panic = panic_message(payload.as_ref()),
                    "task failed during resumption, aborting"
                );
                std::process::abort()
            }
        }
    }

    /// Whether the body ran to completion.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Whether the task was resumed at least once.
    #[must_use]
    pub fn is_started(&self) -> bool {
        !matches!(self.state, State::NotStarted(_))
    }
}

impl fmt::Debug for SuspendableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::NotStarted(_) => "NotStarted",
            State::Suspended(_) => "Suspended",
            State::Done => "Done",
        };
        f.debug_struct("SuspendableTask")
            .field("state", &state)
            .finish()
    }
}

/// Suspends the current task once, asking to be resumed right away.
///
/// Inside a [`TaskGraph`](crate::graph::TaskGraph) this puts the node at the
/// back of the ready queue so other ready nodes get a turn.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn does_not_run_until_resumed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut task = SuspendableTask::from_fn(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert!(!task.is_started());
        assert_eq!(runs.load(Ordering::Relaxed), 0);

        assert_eq!(task.resume(), Resumed::Completed);
        assert!(task.is_done());
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // Completed tasks stay completed.
        assert_eq!(task.resume(), Resumed::Completed);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn suspends_at_each_yield() {
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&steps);
        let mut task = SuspendableTask::new(async move {
            for _ in 0..3 {
                counter.fetch_add(1, Ordering::Relaxed);
                yield_now().await;
            }
        });

        for expected in 1..=3 {
            assert_eq!(task.resume(), Resumed::Suspended);
            assert!(task.is_started());
            assert!(!task.is_done());
            assert_eq!(steps.load(Ordering::Relaxed), expected);
        }
        assert_eq!(task.resume(), Resumed::Completed);
        assert!(task.is_done());
    }

    #[test]
    fn panic_in_task_aborts_the_process() {
        const CHILD: &str = "CTG_TASK_ABORT_CHILD";
        if std::env::var_os(CHILD).is_some() {
            let mut task = SuspendableTask::from_fn(|| panic!("task failed"));
            task.resume();
            unreachable!("resuming a panicking task must abort");
        }

        let status = std::process::Command::new(std::env::current_exe().unwrap())
            .args(["--exact", "task::tests::panic_in_task_aborts_the_process"])
            .arg("--nocapture")
            .env(CHILD, "1")
            .status()
            .unwrap();
        assert!(!status.success());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            const SIGABRT: i32 = 6;
            assert_eq!(status.signal(), Some(SIGABRT));
        }
    }

    #[test]
    fn debug_reports_state() {
        let mut task = SuspendableTask::from_fn(|| {});
        assert!(format!("{task:?}").contains("NotStarted"));
        task.resume();
        assert!(format!("{task:?}").contains("Done"));
    }
}
