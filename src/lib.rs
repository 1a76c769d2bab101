//! looper-bridge: run work in order on the thread that owns a native looper.
//!
//! Platform UI threads already sit in an event loop (`ALooper` on Android).
//! This crate lets any thread hand work to such a loop and have it executed
//! there, one job at a time, in the order it was queued.
//!
//! # Architecture
//!
//! - **EventLoopHandle**: counted reference to a native looper; registers fd
//!   callbacks and wakes the loop.
//! - **WakeupFd**: eventfd used as a counting semaphore between producers and
//!   the loop thread.
//! - **SerialExecutor**: job queue plus wakeup fd registered on a looper.
//!   Producers `enqueue`; the loop thread drains when the fd is readable.
//! - **MainThread**: the application's main looper and its shared executor.
//!
//! # Example
//!
//! ```no_run
//! use looper_bridge::{poll_once, EventLoopHandle, PrepareOptions, SerialExecutor};
//!
//! let looper = EventLoopHandle::prepare(PrepareOptions::default()).unwrap();
//! let executor = SerialExecutor::create(looper).unwrap();
//!
//! let remote = executor.clone();
//! std::thread::spawn(move || {
//!     remote.enqueue(|| println!("runs on the looper thread")).unwrap();
//! });
//!
//! loop {
//!     let _ = poll_once(None);
//! }
//! ```

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("looper-bridge needs eventfd and only builds for Linux and Android");

mod config;
mod error;
mod executor;
mod looper;
mod main_thread;
mod sys;
mod wakeup;

pub use config::{ExecutorConfig, PrepareOptions};
pub use error::{
    BindingError, ConstructionError, LostWakeupError, PollError, PrepareError, RegistrationError,
};
pub use executor::{Job, SerialExecutor};
pub use looper::{poll_once, Dispatch, EventLoopHandle, PollEvent};
pub use main_thread::MainThread;
pub use wakeup::WakeupFd;

/// The native looper type behind [`EventLoopHandle::as_ptr`].
pub use sys::ALooper;
