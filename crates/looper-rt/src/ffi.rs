//! C ABI exports mirroring `<android/looper.h>`.
//!
//! Names, signatures and constant values match the NDK so callers can be
//! written once and linked against either `libandroid` or this crate.

#![allow(non_snake_case, non_camel_case_types)]

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::looper::{Callback, Looper, LooperConfig, PollResult};

/// Opaque looper type. Pointers to it are `Arc<Looper>` allocations.
pub type ALooper = Looper;

pub type ALooper_callbackFunc = Option<Callback>;

pub const ALOOPER_PREPARE_ALLOW_NON_CALLBACKS: c_int = 1 << 0;

pub const ALOOPER_POLL_WAKE: c_int = -1;
pub const ALOOPER_POLL_CALLBACK: c_int = -2;
pub const ALOOPER_POLL_TIMEOUT: c_int = -3;
pub const ALOOPER_POLL_ERROR: c_int = -4;

pub const ALOOPER_EVENT_INPUT: c_int = 1 << 0;
pub const ALOOPER_EVENT_OUTPUT: c_int = 1 << 1;
pub const ALOOPER_EVENT_ERROR: c_int = 1 << 2;
pub const ALOOPER_EVENT_HANGUP: c_int = 1 << 3;
pub const ALOOPER_EVENT_INVALID: c_int = 1 << 4;

// ── Lifetime ────────────────────────────────────────────────────────

/// The calling thread's looper, or null. Does not acquire a reference.
///
/// # Safety
///
/// The pointer is kept alive by the calling thread only. Acquire it before
/// handing it to another thread.
#[no_mangle]
pub unsafe extern "C" fn ALooper_forThread() -> *mut ALooper {
    Looper::for_thread().map_or(ptr::null_mut(), |looper| Arc::as_ptr(&looper) as *mut ALooper)
}

/// The calling thread's looper, created if needed. Does not acquire a reference.
///
/// # Safety
///
/// Same as [`ALooper_forThread`].
#[no_mangle]
pub unsafe extern "C" fn ALooper_prepare(opts: c_int) -> *mut ALooper {
    let config = LooperConfig {
        allow_non_callbacks: opts & ALOOPER_PREPARE_ALLOW_NON_CALLBACKS != 0,
        ..LooperConfig::default()
    };
    match Looper::prepare(config) {
        Ok(looper) => Arc::as_ptr(&looper) as *mut ALooper,
        Err(err) => {
            warn!(%err, "ALooper_prepare failed");
            ptr::null_mut()
        }
    }
}

/// # Safety
///
/// `looper` must have been returned by this crate and still be alive.
#[no_mangle]
pub unsafe extern "C" fn ALooper_acquire(looper: *mut ALooper) {
    Arc::increment_strong_count(looper as *const Looper);
}

/// # Safety
///
/// Every call must balance an earlier `ALooper_acquire`.
#[no_mangle]
pub unsafe extern "C" fn ALooper_release(looper: *mut ALooper) {
    Arc::decrement_strong_count(looper as *const Looper);
}

// ── Poll / wake ─────────────────────────────────────────────────────

/// Poll the calling thread's looper once. `timeout_millis < 0` waits forever.
///
/// # Safety
///
/// Each out pointer must be null or valid for a write.
#[no_mangle]
pub unsafe extern "C" fn ALooper_pollOnce(
    timeout_millis: c_int,
    out_fd: *mut c_int,
    out_events: *mut c_int,
    out_data: *mut *mut c_void,
) -> c_int {
    let Some(looper) = Looper::for_thread() else {
        warn!("ALooper_pollOnce called on a thread without a looper");
        return ALOOPER_POLL_ERROR;
    };
    let timeout = u64::try_from(timeout_millis).ok().map(Duration::from_millis);

    match looper.poll_once(timeout) {
        Ok(PollResult::Wake) => ALOOPER_POLL_WAKE,
        Ok(PollResult::Callback) => ALOOPER_POLL_CALLBACK,
        Ok(PollResult::Timeout) => ALOOPER_POLL_TIMEOUT,
        Ok(PollResult::Ident {
            ident,
            fd,
            events,
            data,
        }) => {
            if !out_fd.is_null() {
                *out_fd = fd;
            }
            if !out_events.is_null() {
                *out_events = events;
            }
            if !out_data.is_null() {
                *out_data = data;
            }
            ident
        }
        Err(err) => {
            warn!(%err, "looper poll failed");
            ALOOPER_POLL_ERROR
        }
    }
}

/// # Safety
///
/// `looper` must be a live looper pointer.
#[no_mangle]
pub unsafe extern "C" fn ALooper_wake(looper: *mut ALooper) {
    if let Some(looper) = looper.as_ref() {
        looper.wake();
    }
}

// ── Fds ─────────────────────────────────────────────────────────────

/// Returns 1 on success, -1 on error.
///
/// # Safety
///
/// `looper` must be a live looper pointer; see [`Looper::add_fd`] for `fd`
/// and `data`.
#[no_mangle]
pub unsafe extern "C" fn ALooper_addFd(
    looper: *mut ALooper,
    fd: c_int,
    ident: c_int,
    events: c_int,
    callback: ALooper_callbackFunc,
    data: *mut c_void,
) -> c_int {
    let Some(looper) = looper.as_ref() else {
        return -1;
    };
    match looper.add_fd(fd, ident, events, callback, data) {
        Ok(()) => 1,
        Err(err) => {
            warn!(fd, %err, "ALooper_addFd failed");
            -1
        }
    }
}

/// Returns 1 if removed, 0 if `fd` was not registered, -1 on error.
///
/// # Safety
///
/// `looper` must be a live looper pointer.
#[no_mangle]
pub unsafe extern "C" fn ALooper_removeFd(looper: *mut ALooper, fd: c_int) -> c_int {
    let Some(looper) = looper.as_ref() else {
        return -1;
    };
    match looper.remove_fd(fd) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(err) => {
            warn!(fd, %err, "ALooper_removeFd failed");
            -1
        }
    }
}
