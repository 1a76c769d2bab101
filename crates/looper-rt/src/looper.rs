use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_int, c_void};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use polling::{Event, Events, PollMode, Poller};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::ffi::{ALOOPER_EVENT_INPUT, ALOOPER_EVENT_OUTPUT, ALOOPER_POLL_CALLBACK};

/// Native callback, identical to `ALooper_callbackFunc` minus the `Option`.
///
/// Returning 0 unregisters the fd; any other value keeps it.
pub type Callback = unsafe extern "C" fn(fd: c_int, events: c_int, data: *mut c_void) -> c_int;

/// Settings fixed when a looper is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LooperConfig {
    /// Accept fds registered without a callback. Their readiness is reported
    /// from [`Looper::poll_once`] as [`PollResult::Ident`].
    pub allow_non_callbacks: bool,
    /// How many OS events a single poll step can collect.
    pub event_capacity: NonZeroUsize,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            allow_non_callbacks: false,
            event_capacity: NonZeroUsize::new(64).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// Outcome of one [`Looper::poll_once`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Woken by [`Looper::wake`] (or interrupted) before anything was dispatched.
    Wake,
    /// At least one callback ran.
    Callback,
    /// The timeout elapsed with nothing ready.
    Timeout,
    /// An fd registered without a callback is ready.
    Ident {
        ident: c_int,
        fd: RawFd,
        events: c_int,
        data: *mut c_void,
    },
}

/// Opaque user data handed back to the callback on the polling thread.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

// SAFETY: the looper never dereferences the pointer. It is only passed back to
// the registered callback, whose contract is set by `Looper::add_fd`.
unsafe impl Send for UserData {}

/// One registered fd.
struct Source {
    fd: RawFd,
    ident: c_int,
    events: c_int,
    callback: Option<Callback>,
    data: UserData,
    /// Distinguishes re-registrations of the same fd.
    seq: u64,
}

#[derive(Default)]
struct Registry {
    sources: Slab<Source>,
    by_fd: HashMap<RawFd, usize>,
}

/// A non-callback readiness report waiting to be returned by `poll_once`.
struct Response {
    ident: c_int,
    fd: RawFd,
    events: c_int,
    data: UserData,
}

/// A callback collected under the registry lock and invoked after it is released.
struct Dispatch {
    fd: RawFd,
    events: c_int,
    callback: Callback,
    data: UserData,
    seq: u64,
}

/// Per-thread event loop: an fd table with callbacks, driven by `poll_once`.
pub struct Looper {
    poller: Poller,
    allow_non_callbacks: bool,
    registry: Mutex<Registry>,
    events: Mutex<Events>,
    responses: Mutex<VecDeque<Response>>,
    woken: AtomicBool,
    next_seq: AtomicU64,
}

thread_local! {
    /// The looper prepared on this thread. Holds one reference for the thread's lifetime.
    static CURRENT: RefCell<Option<Arc<Looper>>> = const { RefCell::new(None) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn interest(key: usize, events: c_int) -> Event {
    Event::new(
        key,
        events & ALOOPER_EVENT_INPUT != 0,
        events & ALOOPER_EVENT_OUTPUT != 0,
    )
}

impl Looper {
    /// Create a looper that is not bound to any thread.
    pub fn new(config: LooperConfig) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            allow_non_callbacks: config.allow_non_callbacks,
            registry: Mutex::new(Registry::default()),
            events: Mutex::new(Events::with_capacity(config.event_capacity)),
            responses: Mutex::new(VecDeque::new()),
            woken: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Return the calling thread's looper, creating it on first use.
    pub fn prepare(config: LooperConfig) -> io::Result<Arc<Looper>> {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if let Some(looper) = current.as_ref() {
                if looper.allow_non_callbacks != config.allow_non_callbacks {
                    warn!(
                        allow_non_callbacks = looper.allow_non_callbacks,
                        "looper already prepared on this thread with different options"
                    );
                }
                return Ok(Arc::clone(looper));
            }

            let looper = Arc::new(Looper::new(config)?);
            debug!(looper = ?Arc::as_ptr(&looper), "prepared looper for thread");
            *current = Some(Arc::clone(&looper));
            Ok(looper)
        })
    }

    /// The calling thread's looper, if one was prepared.
    pub fn for_thread() -> Option<Arc<Looper>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn allows_non_callbacks(&self) -> bool {
        self.allow_non_callbacks
    }

    /// Number of fds currently registered.
    pub fn registered_fds(&self) -> usize {
        lock(&self.registry).sources.len()
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register `fd`, replacing any existing registration for it.
    ///
    /// With a callback, `ident` is ignored and the callback runs on the
    /// polling thread. Without one, the looper must allow non-callback fds and
    /// `ident` must be non-negative.
    ///
    /// # Safety
    ///
    /// `fd` must stay open until it is removed, and `data` must remain valid
    /// for `callback` for as long as the registration exists.
    pub unsafe fn add_fd(
        &self,
        fd: RawFd,
        ident: c_int,
        events: c_int,
        callback: Option<Callback>,
        data: *mut c_void,
    ) -> io::Result<()> {
        let ident = match callback {
            Some(_) => ALOOPER_POLL_CALLBACK,
            None if !self.allow_non_callbacks => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "looper does not allow fds without a callback",
                ));
            }
            None if ident < 0 => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "ident must be non-negative for fds without a callback",
                ));
            }
            None => ident,
        };

        let source = Source {
            fd,
            ident,
            events,
            callback,
            data: UserData(data),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };

        let mut registry = lock(&self.registry);
        let registry = &mut *registry;
        match registry.by_fd.get(&fd).copied() {
            Some(key) => {
                let borrowed = BorrowedFd::borrow_raw(fd);
                self.poller
                    .modify_with_mode(borrowed, interest(key, events), PollMode::Level)?;
                registry.sources[key] = source;
                debug!(fd, key, "replaced fd registration");
            }
            None => {
                let entry = registry.sources.vacant_entry();
                let key = entry.key();
                self.poller
                    .add_with_mode(fd, interest(key, events), PollMode::Level)?;
                entry.insert(source);
                registry.by_fd.insert(fd, key);
                debug!(fd, key, "added fd");
            }
        }
        Ok(())
    }

    /// Remove `fd`. Returns `Ok(false)` when it was not registered.
    pub fn remove_fd(&self, fd: RawFd) -> io::Result<bool> {
        let mut registry = lock(&self.registry);
        let Some(key) = registry.by_fd.remove(&fd) else {
            return Ok(false);
        };
        registry.sources.remove(key);
        lock(&self.responses).retain(|response| response.fd != fd);
        self.forget(fd)?;
        debug!(fd, key, "removed fd");
        Ok(true)
    }

    /// Remove `fd` only if it still carries registration `seq`.
    fn remove_registration(&self, fd: RawFd, seq: u64) {
        let mut registry = lock(&self.registry);
        let Some(&key) = registry.by_fd.get(&fd) else {
            return;
        };
        if registry.sources[key].seq != seq {
            return;
        }
        registry.by_fd.remove(&fd);
        registry.sources.remove(key);
        if let Err(err) = self.forget(fd) {
            warn!(fd, %err, "failed to drop fd after its callback asked for removal");
        }
    }

    fn is_registered(&self, fd: RawFd, seq: u64) -> bool {
        let registry = lock(&self.registry);
        registry
            .by_fd
            .get(&fd)
            .is_some_and(|&key| registry.sources[key].seq == seq)
    }

    /// Drop `fd` from the OS poller. An fd the caller already closed is not an error.
    fn forget(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: only used for the duration of the delete call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.poller.delete(borrowed) {
            Ok(()) => Ok(()),
            Err(err) if matches!(err.raw_os_error(), Some(libc::EBADF | libc::ENOENT)) => {
                trace!(fd, "fd already gone from poller");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // ── Wake / poll ─────────────────────────────────────────────────

    /// Make a blocked or upcoming `poll_once` return early. Safe from any thread.
    pub fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        if let Err(err) = self.poller.notify() {
            warn!(%err, "failed to notify poller");
        }
    }

    /// Wait up to `timeout` (forever for `None`) and dispatch whatever is ready.
    ///
    /// Callbacks run on the calling thread with no looper lock held, so they
    /// may add or remove fds, including their own.
    pub fn poll_once(&self, timeout: Option<Duration>) -> io::Result<PollResult> {
        if let Some(response) = lock(&self.responses).pop_front() {
            return Ok(response.into_result());
        }

        let ready: Vec<(usize, bool, bool)> = {
            let mut events = lock(&self.events);
            events.clear();
            match self.poller.wait(&mut events, timeout) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    return Ok(PollResult::Wake);
                }
                Err(err) => return Err(err),
            }
            events
                .iter()
                .map(|ev| (ev.key, ev.readable, ev.writable))
                .collect()
        };
        let woken = self.woken.swap(false, Ordering::AcqRel);

        let mut dispatch = Vec::new();
        {
            let registry = lock(&self.registry);
            let mut responses = lock(&self.responses);
            for &(key, readable, writable) in &ready {
                let Some(source) = registry.sources.get(key) else {
                    continue;
                };
                let mut events = 0;
                if readable {
                    events |= ALOOPER_EVENT_INPUT;
                }
                if writable {
                    events |= ALOOPER_EVENT_OUTPUT;
                }
                match source.callback {
                    Some(callback) => dispatch.push(Dispatch {
                        fd: source.fd,
                        events,
                        callback,
                        data: source.data,
                        seq: source.seq,
                    }),
                    None => responses.push_back(Response {
                        ident: source.ident,
                        fd: source.fd,
                        events,
                        data: source.data,
                    }),
                }
            }
        }
        trace!(events = ready.len(), callbacks = dispatch.len(), woken, "poll step");

        let mut invoked = 0;
        for entry in dispatch {
            // An earlier callback in this batch may have removed it.
            if !self.is_registered(entry.fd, entry.seq) {
                continue;
            }
            invoked += 1;
            // SAFETY: `add_fd` requires `data` to stay valid while registered.
            let keep = unsafe { (entry.callback)(entry.fd, entry.events, entry.data.0) };
            if keep == 0 {
                self.remove_registration(entry.fd, entry.seq);
            }
        }

        if let Some(response) = lock(&self.responses).pop_front() {
            return Ok(response.into_result());
        }
        Ok(if invoked > 0 {
            PollResult::Callback
        } else if woken || !ready.is_empty() {
            PollResult::Wake
        } else {
            PollResult::Timeout
        })
    }
}

impl Response {
    fn into_result(self) -> PollResult {
        PollResult::Ident {
            ident: self.ident,
            fd: self.fd,
            events: self.events,
            data: self.data.0,
        }
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !registry.sources.is_empty() {
            debug!(fds = registry.sources.len(), "looper dropped with fds still registered");
        }
    }
}
