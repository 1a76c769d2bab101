//! Owned references to a native looper and the callbacks registered on it.
//!
//! Callbacks are not passed to the native layer as user data. Every fd is
//! registered with the same trampoline, which looks the closure up by
//! (looper, fd) when the fd becomes ready.
//!
//! The callbacks of one looper live as long as some [`EventLoopHandle`] to it
//! does. Dropping the last handle unregisters whatever is left.

use std::collections::hash_map::{Entry, HashMap};
use std::ffi::{c_int, c_void};
use std::fmt;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::config::PrepareOptions;
use crate::error::{PollError, PrepareError, RegistrationError};
use crate::sys;

/// How often a registered callback fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dispatch {
    /// Every time the fd is readable, until unregistered.
    #[default]
    Repeat,
    /// Once; the registration is dropped after the first dispatch.
    Once,
}

type Handler = Arc<dyn Fn() + Send + Sync>;

struct Registered {
    handler: Handler,
    dispatch: Dispatch,
}

/// Bookkeeping for one native looper, keyed by its address.
///
/// The entry exists while `handles > 0`. Every handle holds a native
/// reference, so the address cannot be reused by another looper meanwhile.
#[derive(Default)]
struct LooperEntry {
    handles: usize,
    handlers: HashMap<RawFd, Registered>,
}

static LOOPERS: OnceLock<Mutex<HashMap<usize, LooperEntry>>> = OnceLock::new();

fn loopers() -> MutexGuard<'static, HashMap<usize, LooperEntry>> {
    LOOPERS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Trampoline handed to the native looper for every fd registered here.
///
/// Runs on the polling thread, which is also the thread whose looper is
/// dispatching, so `ALooper_forThread` identifies the registration.
unsafe extern "C" fn dispatch_fd(fd: c_int, events: c_int, _data: *mut c_void) -> c_int {
    let looper = unsafe { sys::ALooper_forThread() } as usize;

    let (handler, dispatch) = {
        let mut loopers = loopers();
        let entry = loopers.get_mut(&looper).map(|entry| entry.handlers.entry(fd));
        match entry {
            Some(Entry::Occupied(entry)) if entry.get().dispatch == Dispatch::Once => {
                (entry.remove().handler, Dispatch::Once)
            }
            Some(Entry::Occupied(entry)) => (Arc::clone(&entry.get().handler), Dispatch::Repeat),
            Some(Entry::Vacant(_)) | None => {
                trace!(fd, "ready fd has no handler; dropping registration");
                return 0;
            }
        }
    };

    trace!(fd, events, "dispatching fd callback");
    if panic::catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
        error!(fd, "fd callback panicked");
    }

    match dispatch {
        Dispatch::Repeat => 1,
        Dispatch::Once => 0,
    }
}

/// One counted reference to a native looper.
///
/// Acquired on construction and released on drop. `Clone` acquires another
/// reference, so every value releases exactly once.
pub struct EventLoopHandle {
    raw: NonNull<sys::ALooper>,
}

// SAFETY: the native looper is internally synchronized. Acquire, release,
// addFd, removeFd and wake may be called from any thread.
unsafe impl Send for EventLoopHandle {}
unsafe impl Sync for EventLoopHandle {}

impl EventLoopHandle {
    /// Take a new reference to `raw`. Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `raw` must be null or point to a live native looper.
    pub unsafe fn from_raw(raw: *mut sys::ALooper) -> Option<Self> {
        let raw = NonNull::new(raw)?;
        sys::ALooper_acquire(raw.as_ptr());
        trace!(looper = ?raw, "acquired looper");
        Some(Self::track(raw))
    }

    /// Count a handle whose native reference is already held.
    fn track(raw: NonNull<sys::ALooper>) -> Self {
        loopers().entry(raw.as_ptr() as usize).or_default().handles += 1;
        Self { raw }
    }

    /// The calling thread's looper, if it has one.
    pub fn for_thread() -> Option<Self> {
        // SAFETY: a non-null pointer from forThread is kept alive by the thread.
        unsafe { Self::from_raw(sys::ALooper_forThread()) }
    }

    /// The calling thread's looper, created if it does not exist yet.
    pub fn prepare(options: PrepareOptions) -> Result<Self, PrepareError> {
        // SAFETY: as above; prepare returns null only on failure.
        unsafe { Self::from_raw(sys::ALooper_prepare(options.bits())) }.ok_or(PrepareError)
    }

    pub fn as_ptr(&self) -> *mut sys::ALooper {
        self.raw.as_ptr()
    }

    fn addr(&self) -> usize {
        self.raw.as_ptr() as usize
    }

    /// Run `callback` on the looper's thread whenever `fd` is readable.
    ///
    /// At most one callback per fd: registering an fd that already has one
    /// fails with [`RegistrationError::AlreadyRegistered`]. The registration
    /// lasts until `unregister_fd`, or until the last handle to this looper is
    /// dropped.
    pub fn register_fd<F>(
        &self,
        fd: RawFd,
        callback: F,
        dispatch: Dispatch,
    ) -> Result<(), RegistrationError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut loopers = loopers();
        let handlers = &mut loopers.entry(self.addr()).or_default().handlers;
        let Entry::Vacant(slot) = handlers.entry(fd) else {
            return Err(RegistrationError::AlreadyRegistered { fd });
        };
        slot.insert(Registered {
            handler: Arc::new(callback),
            dispatch,
        });

        let status = unsafe {
            sys::ALooper_addFd(
                self.raw.as_ptr(),
                fd,
                sys::ALOOPER_POLL_CALLBACK,
                sys::ALOOPER_EVENT_INPUT,
                Some(dispatch_fd),
                ptr::null_mut(),
            )
        };
        if status < 0 {
            let rejected = handlers.remove(&fd);
            drop(loopers);
            drop(rejected);
            return Err(RegistrationError::AddFailed { fd });
        }

        debug!(looper = ?self.raw, fd, ?dispatch, "registered fd callback");
        Ok(())
    }

    /// Remove the callback for `fd`. `Ok(false)` means nothing was registered.
    pub fn unregister_fd(&self, fd: RawFd) -> Result<bool, RegistrationError> {
        let status = unsafe { sys::ALooper_removeFd(self.raw.as_ptr(), fd) };
        if status < 0 {
            return Err(RegistrationError::RemoveFailed { fd });
        }
        let handler = loopers()
            .get_mut(&self.addr())
            .and_then(|entry| entry.handlers.remove(&fd));
        drop(handler);

        let removed = status == 1;
        debug!(looper = ?self.raw, fd, removed, "unregistered fd callback");
        Ok(removed)
    }

    /// Make a blocked poll on the looper's thread return early.
    pub fn wake(&self) {
        unsafe { sys::ALooper_wake(self.raw.as_ptr()) }
    }

    #[cfg(test)]
    pub(crate) fn callback_count(&self) -> usize {
        loopers().get(&self.addr()).map_or(0, |entry| entry.handlers.len())
    }
}

impl Clone for EventLoopHandle {
    fn clone(&self) -> Self {
        unsafe { sys::ALooper_acquire(self.raw.as_ptr()) };
        Self::track(self.raw)
    }
}

impl Drop for EventLoopHandle {
    fn drop(&mut self) {
        let orphaned = {
            let mut loopers = loopers();
            let entry = loopers.entry(self.addr()).or_default();
            if entry.handles > 1 {
                entry.handles -= 1;
                None
            } else {
                loopers.remove(&self.addr()).map(|entry| entry.handlers)
            }
        };

        if let Some(handlers) = orphaned.filter(|handlers| !handlers.is_empty()) {
            for &fd in handlers.keys() {
                // Still holding this handle's reference, so the looper is alive.
                if unsafe { sys::ALooper_removeFd(self.raw.as_ptr(), fd) } < 0 {
                    warn!(looper = ?self.raw, fd, "failed to remove leftover fd callback");
                }
            }
            debug!(looper = ?self.raw, count = handlers.len(), "dropped leftover fd callbacks");
        }

        unsafe { sys::ALooper_release(self.raw.as_ptr()) };
        trace!(looper = ?self.raw, "released looper");
    }
}

impl PartialEq for EventLoopHandle {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for EventLoopHandle {}

impl fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventLoopHandle").field(&self.raw).finish()
    }
}

/// What one poll step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// The looper was woken before anything was dispatched.
    Woken,
    /// One or more fd callbacks ran.
    Callbacks,
    /// An fd registered without a callback is ready.
    Ready { ident: c_int, fd: RawFd, events: c_int },
}

/// Run one poll step of the calling thread's looper.
///
/// `None` waits until something happens. Callbacks registered on this
/// thread's looper run inside this call.
pub fn poll_once(timeout: Option<Duration>) -> Result<PollEvent, PollError> {
    let current = unsafe { sys::ALooper_forThread() };
    if current.is_null() {
        return Err(PollError::NoLooper);
    }

    let timeout_millis = match timeout {
        Some(timeout) => c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX),
        None => -1,
    };
    let mut fd: c_int = -1;
    let mut events: c_int = 0;
    let mut data: *mut c_void = ptr::null_mut();

    let result = unsafe { sys::ALooper_pollOnce(timeout_millis, &mut fd, &mut events, &mut data) };
    match result {
        sys::ALOOPER_POLL_WAKE => Ok(PollEvent::Woken),
        sys::ALOOPER_POLL_CALLBACK => Ok(PollEvent::Callbacks),
        sys::ALOOPER_POLL_TIMEOUT => Err(PollError::Timeout),
        sys::ALOOPER_POLL_ERROR => Err(PollError::Failed),
        ident if ident >= 0 => Ok(PollEvent::Ready { ident, fd, events }),
        other => {
            warn!(result = other, "unexpected looper poll result");
            Err(PollError::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::wakeup::WakeupFd;

    fn looper() -> EventLoopHandle {
        EventLoopHandle::prepare(PrepareOptions::default()).unwrap()
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn prepare_matches_for_thread() {
        let prepared = looper();
        let current = EventLoopHandle::for_thread().unwrap();
        assert_eq!(prepared, current);
        assert_eq!(prepared.clone(), prepared);
    }

    #[test]
    fn thread_without_looper_has_no_handle() {
        let found = std::thread::spawn(|| EventLoopHandle::for_thread().is_some())
            .join()
            .unwrap();
        assert!(!found);
    }

    #[test]
    fn poll_without_looper_reports_no_looper() {
        let result = std::thread::spawn(|| poll_once(Some(Duration::ZERO)))
            .join()
            .unwrap();
        assert_eq!(result, Err(PollError::NoLooper));
    }

    #[test]
    fn registered_callback_runs_on_poll() {
        let looper = looper();
        let wakeup = WakeupFd::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        looper
            .register_fd(wakeup.as_raw_fd(), counting_callback(&counter), Dispatch::Repeat)
            .unwrap();
        wakeup.signal(1).unwrap();

        assert_eq!(poll_once(Some(Duration::from_millis(500))), Ok(PollEvent::Callbacks));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(looper.unregister_fd(wakeup.as_raw_fd()).unwrap());
    }

    #[test]
    fn second_registration_is_rejected() {
        let looper = looper();
        let wakeup = WakeupFd::new().unwrap();
        let fd = wakeup.as_raw_fd();

        looper.register_fd(fd, || {}, Dispatch::Repeat).unwrap();
        let err = looper.register_fd(fd, || {}, Dispatch::Repeat).unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadyRegistered { fd: f } if f == fd));
        looper.unregister_fd(fd).unwrap();
    }

    #[test]
    fn redundant_unregister_is_not_an_error() {
        let looper = looper();
        let wakeup = WakeupFd::new().unwrap();
        let fd = wakeup.as_raw_fd();

        looper.register_fd(fd, || {}, Dispatch::Repeat).unwrap();
        assert!(looper.unregister_fd(fd).unwrap());
        assert!(!looper.unregister_fd(fd).unwrap());
    }

    #[test]
    fn once_dispatch_fires_a_single_time() {
        let looper = looper();
        let wakeup = WakeupFd::new().unwrap();
        let fd = wakeup.as_raw_fd();
        let counter = Arc::new(AtomicUsize::new(0));

        looper
            .register_fd(fd, counting_callback(&counter), Dispatch::Once)
            .unwrap();
        wakeup.signal(1).unwrap();
        poll_once(Some(Duration::from_millis(500))).unwrap();

        // The counter is still readable, but the registration is gone.
        assert_eq!(
            poll_once(Some(Duration::from_millis(20))),
            Err(PollError::Timeout)
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!looper.unregister_fd(fd).unwrap());

        // The fd can be registered again.
        looper.register_fd(fd, || {}, Dispatch::Repeat).unwrap();
        looper.unregister_fd(fd).unwrap();
    }

    #[test]
    fn panicking_callback_is_contained() {
        let looper = looper();
        let wakeup = WakeupFd::new().unwrap();
        let fd = wakeup.as_raw_fd();

        looper
            .register_fd(fd, || panic!("callback failure"), Dispatch::Repeat)
            .unwrap();
        wakeup.signal(1).unwrap();

        assert_eq!(poll_once(Some(Duration::from_millis(500))), Ok(PollEvent::Callbacks));
        assert!(looper.unregister_fd(fd).unwrap());
    }

    #[test]
    fn wake_from_another_thread() {
        let looper = looper();
        let remote = looper.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.wake();
        });

        assert_eq!(poll_once(Some(Duration::from_secs(5))), Ok(PollEvent::Woken));
        waker.join().unwrap();
    }

    #[test]
    fn non_callback_fds_are_reported_by_ident() {
        std::thread::spawn(|| {
            let looper = EventLoopHandle::prepare(PrepareOptions {
                allow_non_callbacks: true,
            })
            .unwrap();
            let wakeup = WakeupFd::new().unwrap();
            let fd = wakeup.as_raw_fd();
            let status = unsafe {
                sys::ALooper_addFd(
                    looper.as_ptr(),
                    fd,
                    3,
                    sys::ALOOPER_EVENT_INPUT,
                    None,
                    ptr::null_mut(),
                )
            };
            assert_eq!(status, 1);
            wakeup.signal(1).unwrap();

            match poll_once(Some(Duration::from_millis(500))).unwrap() {
                PollEvent::Ready { ident, fd: ready, .. } => {
                    assert_eq!(ident, 3);
                    assert_eq!(ready, fd);
                }
                other => panic!("expected a ready ident, got {other:?}"),
            }
            assert!(looper.unregister_fd(fd).unwrap());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn callbacks_outlive_dropped_clones() {
        let looper = looper();
        let wakeup = WakeupFd::new().unwrap();
        let fd = wakeup.as_raw_fd();
        let counter = Arc::new(AtomicUsize::new(0));

        let clone = looper.clone();
        clone
            .register_fd(fd, counting_callback(&counter), Dispatch::Repeat)
            .unwrap();
        drop(clone);
        assert_eq!(looper.callback_count(), 1);

        wakeup.signal(1).unwrap();
        assert_eq!(poll_once(Some(Duration::from_millis(500))), Ok(PollEvent::Callbacks));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(looper.unregister_fd(fd).unwrap());
        assert_eq!(looper.callback_count(), 0);
    }

    #[test]
    fn last_handle_drops_leftover_callbacks() {
        std::thread::spawn(|| {
            let looper = looper();
            let addr = looper.addr();
            let wakeup = WakeupFd::new().unwrap();
            let fd = wakeup.as_raw_fd();
            let captured = Arc::new(AtomicUsize::new(0));

            looper
                .register_fd(fd, counting_callback(&captured), Dispatch::Repeat)
                .unwrap();
            assert_eq!(Arc::strong_count(&captured), 2);

            drop(looper);
            assert!(!loopers().contains_key(&addr));
            assert_eq!(Arc::strong_count(&captured), 1);

            // The native side forgot the fd as well.
            let looper = EventLoopHandle::for_thread().unwrap();
            assert!(!looper.unregister_fd(fd).unwrap());
            looper.register_fd(fd, || {}, Dispatch::Repeat).unwrap();
            assert!(looper.unregister_fd(fd).unwrap());
        })
        .join()
        .unwrap();
    }
}
