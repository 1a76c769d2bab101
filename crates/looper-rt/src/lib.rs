//! looper-rt: host-side stand-in for the platform `ALooper` service.
//!
//! Android ships its event loop in `libandroid`. On every other target this
//! crate provides the same C surface (see `ffi.rs`) so code written against
//! `<android/looper.h>` can be built and tested on a desktop. Readiness is
//! delegated to the `polling` crate; this crate only keeps the fd table, the
//! per-thread looper, the reference count and callback dispatch.
//!
//! A [`Looper`] belongs to the thread that prepared it. Any thread may add or
//! remove fds and wake it, but only the owning thread polls.

pub mod ffi;
mod looper;

pub use looper::{Callback, Looper, LooperConfig, PollResult};
