use std::cell::Cell;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Weak};

use async_task::{Runnable, Task};
use concurrent_queue::ConcurrentQueue;
use tracing::{debug, error, trace, warn};

use crate::config::ExecutorConfig;
use crate::error::{ConstructionError, LostWakeupError};
use crate::looper::{Dispatch, EventLoopHandle};
use crate::wakeup::WakeupFd;

/// A unit of work for a [`SerialExecutor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// The executor whose drain is running on this thread, if any.
    static DRAINING: Cell<*const Shared> = const { Cell::new(ptr::null()) };
}

/// Marks the current thread as draining `shared` until dropped.
struct DrainGuard {
    previous: *const Shared,
}

impl DrainGuard {
    fn enter(shared: &Shared) -> Self {
        let previous = DRAINING.with(|current| current.replace(shared as *const Shared));
        Self { previous }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        DRAINING.with(|current| current.set(self.previous));
    }
}

/// State reachable from the looper callback and from task schedulers.
struct Shared {
    label: String,
    wakeup: WakeupFd,
    /// Ready queue. Push and pop are each atomic; nothing is locked while a job runs.
    queue: ConcurrentQueue<Job>,
}

impl Shared {
    fn enqueue(&self, job: Job) -> Result<(), LostWakeupError> {
        if let Err(err) = self.queue.push(job) {
            // Closed: the owning executor has been dropped.
            drop(err.into_inner());
            debug!(executor = %self.label, "executor shut down; job dropped");
            return Ok(());
        }

        self.wakeup.signal(1).map_err(|source| {
            error!(executor = %self.label, %source, "failed to signal wakeup for queued job");
            LostWakeupError { source }
        })
    }

    /// Run exactly as many jobs as the wakeup counter says are pending.
    ///
    /// Only called from the looper callback, on the looper's thread.
    fn drain(&self) {
        let pending = match self.wakeup.take() {
            Ok(pending) => pending,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                trace!(executor = %self.label, "spurious wakeup");
                return;
            }
            Err(err) => {
                warn!(executor = %self.label, %err, "failed to read wakeup counter");
                return;
            }
        };
        trace!(executor = %self.label, pending, "draining");

        let _guard = DrainGuard::enter(self);
        for ran in 0..pending {
            let Ok(job) = self.queue.pop() else {
                debug!(executor = %self.label, ran, pending, "queue emptied before wakeup count");
                break;
            };
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!(executor = %self.label, "job panicked");
            }
        }
    }
}

/// Runs jobs one at a time, in enqueue order, on the thread that polls its looper.
///
/// Any thread may [`enqueue`](Self::enqueue). The looper's thread runs the
/// jobs when its poll step sees the wakeup descriptor become readable.
pub struct SerialExecutor {
    looper: EventLoopHandle,
    shared: Arc<Shared>,
}

impl SerialExecutor {
    /// Bind a new executor to `looper` with the default config.
    pub fn create(looper: EventLoopHandle) -> Result<Arc<Self>, ConstructionError> {
        Self::with_config(looper, ExecutorConfig::default())
    }

    /// Bind a new executor to `looper`.
    ///
    /// On failure the wakeup descriptor is closed and the looper reference
    /// released before returning.
    pub fn with_config(
        looper: EventLoopHandle,
        config: ExecutorConfig,
    ) -> Result<Arc<Self>, ConstructionError> {
        let wakeup = WakeupFd::new().map_err(ConstructionError::Wakeup)?;
        Self::bind(looper, wakeup, config)
    }

    /// Register `wakeup` on `looper`. Both are dropped on failure.
    fn bind(
        looper: EventLoopHandle,
        wakeup: WakeupFd,
        config: ExecutorConfig,
    ) -> Result<Arc<Self>, ConstructionError> {
        let shared = Arc::new(Shared {
            label: config.label,
            wakeup,
            queue: ConcurrentQueue::unbounded(),
        });

        let fd = shared.wakeup.as_raw_fd();
        let weak = Arc::downgrade(&shared);
        looper.register_fd(
            fd,
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.drain();
                }
            },
            Dispatch::Repeat,
        )?;

        debug!(executor = %shared.label, looper = ?looper, fd, "created serial executor");
        Ok(Arc::new(Self { looper, shared }))
    }

    /// Queue `job` to run on the looper's thread. Never waits for it.
    ///
    /// A job may enqueue more work on the same executor; it runs in a later
    /// drain.
    pub fn enqueue<F>(&self, job: F) -> Result<(), LostWakeupError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.enqueue(Box::new(job))
    }

    /// Run `future` on the looper's thread.
    ///
    /// Each wake of the task queues one job that polls it. If the executor
    /// has been dropped by the time the task is woken, the task is cancelled.
    ///
    /// # Panics
    ///
    /// Scheduling panics if the wakeup cannot be signalled, since the task
    /// would otherwise never be polled again.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (runnable, task) = async_task::spawn(future, scheduler(Arc::downgrade(&self.shared)));
        runnable.schedule();
        task
    }

    /// True while called from a job (or task) running on this executor.
    pub fn is_current_thread(&self) -> bool {
        let shared = Arc::as_ptr(&self.shared);
        DRAINING.with(|current| current.get() == shared)
    }

    pub fn looper(&self) -> &EventLoopHandle {
        &self.looper
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// The wakeup descriptor registered with the looper.
    pub fn wakeup_fd(&self) -> RawFd {
        self.shared.wakeup.as_raw_fd()
    }
}

/// Schedule function for async-task: wraps each runnable as a job.
fn scheduler(shared: Weak<Shared>) -> impl Fn(Runnable) + Send + Sync + 'static {
    move |runnable: Runnable| {
        let Some(shared) = shared.upgrade() else {
            trace!("executor gone; cancelling task");
            return;
        };
        if let Err(err) = shared.enqueue(Box::new(move || {
            runnable.run();
        })) {
            panic!("{err}");
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        let fd = self.shared.wakeup.as_raw_fd();
        match self.looper.unregister_fd(fd) {
            Ok(true) => {}
            Ok(false) => debug!(executor = %self.shared.label, fd, "wakeup fd was not registered"),
            Err(err) => warn!(executor = %self.shared.label, %err, "failed to unregister wakeup fd"),
        }

        self.shared.queue.close();
        let mut dropped = 0usize;
        while let Ok(job) = self.shared.queue.pop() {
            drop(job);
            dropped += 1;
        }
        debug!(executor = %self.shared.label, dropped, "serial executor shut down");
        // The descriptor closes when the last `Shared` reference goes, which
        // is after the unregister above.
    }
}
