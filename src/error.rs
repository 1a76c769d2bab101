//! Error types for looper handles, executors and the main-thread binding.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// The native looper refused to add or remove an fd.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("fd {fd} already has a callback on this looper")]
    AlreadyRegistered { fd: RawFd },

    #[error("looper rejected fd {fd}")]
    AddFailed { fd: RawFd },

    #[error("looper failed to remove fd {fd}")]
    RemoveFailed { fd: RawFd },
}

/// A [`SerialExecutor`](crate::SerialExecutor) could not be set up.
///
/// Anything acquired before the failure has already been released.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("failed to allocate wakeup descriptor: {0}")]
    Wakeup(#[source] io::Error),

    #[error("failed to register wakeup descriptor: {0}")]
    Registration(#[from] RegistrationError),
}

/// A job was queued but its wakeup could not be signalled, so it would never run.
#[derive(Debug, Error)]
#[error("wakeup lost for a queued job: {source}")]
pub struct LostWakeupError {
    #[source]
    pub source: io::Error,
}

/// The poll step of the calling thread's looper did not dispatch anything.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("poll timed out")]
    Timeout,

    #[error("looper poll failed")]
    Failed,

    #[error("no looper is prepared on this thread")]
    NoLooper,
}

impl PollError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout)
    }
}

/// The native layer could not prepare a looper for the calling thread.
#[derive(Debug, Error)]
#[error("failed to prepare a looper for this thread")]
pub struct PrepareError;

/// Errors from [`MainThread`](crate::MainThread).
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("main thread binding used before initialize")]
    NotInitialized,

    #[error("calling thread has no looper to bind as the main thread")]
    NoLooper,

    #[error(transparent)]
    Construction(#[from] ConstructionError),
}
