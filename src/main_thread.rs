//! Binding to the application's main (UI) thread looper.
//!
//! The host application owns one [`MainThread`] for the life of the process,
//! calls [`MainThread::initialize`] from the main thread at startup and
//! [`MainThread::deinitialize`] at shutdown, and hands it to code that needs to
//! run work on the main thread.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::config::ExecutorConfig;
use crate::error::BindingError;
use crate::executor::SerialExecutor;
use crate::looper::EventLoopHandle;

struct State {
    looper: Option<EventLoopHandle>,
    executor: Option<Arc<SerialExecutor>>,
}

/// The main thread's looper and its shared executor.
///
/// `initialize` and `deinitialize` are not sequenced against each other or
/// against concurrent use; the host calls them once each, from the main thread.
pub struct MainThread {
    state: Mutex<State>,
}

impl MainThread {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                looper: None,
                executor: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the calling thread's looper as the main looper.
    ///
    /// Releases anything bound by an earlier call first, so this can be called
    /// again after a runtime restart. Fails if the calling thread has no looper,
    /// leaving any existing binding in place.
    pub fn initialize(&self) -> Result<(), BindingError> {
        let Some(looper) = EventLoopHandle::for_thread() else {
            error!("main thread initialize called on a thread without a looper");
            return Err(BindingError::NoLooper);
        };
        debug!(looper = ?looper, "main thread looper bound");

        let (previous_executor, previous_looper) = {
            let mut state = self.state();
            let previous = (state.executor.take(), state.looper.take());
            state.looper = Some(looper);
            previous
        };
        drop(previous_executor);
        drop(previous_looper);
        Ok(())
    }

    /// Release the main looper and the shared executor.
    pub fn deinitialize(&self) {
        let (executor, looper) = {
            let mut state = self.state();
            (state.executor.take(), state.looper.take())
        };
        // Executor first: it unregisters from the looper it holds.
        drop(executor);
        if looper.is_some() {
            debug!("main thread looper released");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state().looper.is_some()
    }

    /// A new reference to the main looper.
    pub fn looper(&self) -> Result<EventLoopHandle, BindingError> {
        self.state().looper.clone().ok_or_else(not_initialized)
    }

    /// The executor that runs jobs on the main thread.
    ///
    /// Built on first use and shared by every caller until `deinitialize`.
    pub fn executor(&self) -> Result<Arc<SerialExecutor>, BindingError> {
        let mut state = self.state();
        if let Some(executor) = &state.executor {
            return Ok(Arc::clone(executor));
        }

        let looper = state.looper.clone().ok_or_else(not_initialized)?;
        let executor = SerialExecutor::with_config(looper, ExecutorConfig::labeled("main"))?;
        state.executor = Some(Arc::clone(&executor));
        Ok(executor)
    }
}

impl Default for MainThread {
    fn default() -> Self {
        Self::new()
    }
}

fn not_initialized() -> BindingError {
    error!("main thread binding used before initialize");
    BindingError::NotInitialized
}
