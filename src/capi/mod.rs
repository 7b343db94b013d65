//! Flat C interface.
//!
//! Every entry point is a panic barrier: a panic inside the library is
//! logged and reported as [`Status::Failure`], never unwound into C.
//!
//! Functions ending in `_async` copy every pointer argument into owned
//! storage, hand the work to a shared bounded [`Dispatcher`] and return at
//! once. The callback runs on a worker thread. If the queue is full the
//! function returns [`Status::Failure`] and the callback is never invoked.
//! No ordering is guaranteed between async calls; wait for one callback
//! before issuing a call that depends on it.

use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::DispatchConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Status};
use crate::log::{LogCallback, LogLevel, Logger, LoggerFactory};

#[cfg(feature = "imaging")]
pub mod image;
pub mod session;
#[cfg(feature = "tokenizer")]
pub mod tokenizer;

static LOGGER: LoggerFactory = LoggerFactory::new();
static DISPATCHER: SharedDispatcher = SharedDispatcher::new();

/// The process-wide logger, created with the default sink on first use.
pub(crate) fn logger() -> Arc<Logger> {
    LOGGER
        .get()
        .unwrap_or_else(|| LOGGER.get_or_init(None, LogLevel::Error))
}

/// Lazily started dispatcher whose sizing may be chosen before first use.
pub(crate) struct SharedDispatcher {
    pending: Mutex<Option<DispatchConfig>>,
    pool: OnceLock<Option<Dispatcher>>,
}

impl SharedDispatcher {
    pub(crate) const fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            pool: OnceLock::new(),
        }
    }

    /// Size the pool. An explicit configuration replaces any earlier one;
    /// otherwise only the first configuration is kept. Fails once the pool
    /// has started.
    pub(crate) fn configure(&self, config: DispatchConfig, explicit: bool) -> Result<(), Error> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if self.pool.get().is_some() {
            return Err(Error::InvalidState("async dispatcher already started"));
        }
        if explicit || pending.is_none() {
            *pending = Some(config);
        }
        Ok(())
    }

    pub(crate) fn get(&self) -> Option<&Dispatcher> {
        self.pool
            .get_or_init(|| {
                let pending = *self.pending.lock().unwrap_or_else(|p| p.into_inner());
                let config = pending.unwrap_or_default();
                match Dispatcher::new(config) {
                    Ok(d) => {
                        accel_debug!(
                            logger(),
                            "async dispatcher started: {} workers, {} slots",
                            config.workers,
                            d.capacity()
                        );
                        Some(d)
                    }
                    Err(e) => {
                        accel_error!(logger(), "async dispatcher unavailable: {e}");
                        None
                    }
                }
            })
            .as_ref()
    }
}

/// Record the pool size from the first session configuration seen, unless
/// one was set explicitly or the pool already runs.
pub(crate) fn seed_dispatcher(config: DispatchConfig) {
    let _ = DISPATCHER.configure(config, false);
}

/// Caller-provided context pointer, passed back untouched to callbacks.
#[derive(Clone, Copy)]
pub(crate) struct UserData(*mut c_void);

// The pointer is opaque to us; the caller guarantees it may be used from the
// callback thread.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    pub(crate) fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub(crate) fn get(self) -> *mut c_void {
        self.0
    }
}

/// Run `f`, turning a panic into `on_panic`.
pub(crate) fn guard<T>(name: &str, on_panic: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        accel_error!(logger(), "{name}: panic caught at the C boundary");
        on_panic
    })
}

/// Log `result`'s error under `name` and convert it to a status.
pub(crate) fn status_of<T>(name: &str, result: &Result<T, Error>) -> Status {
    if let Err(e) = result {
        accel_debug!(logger(), "{name}: {e}");
    }
    Status::from(result)
}

/// Queue `job` on the shared dispatcher. The job itself is a panic barrier.
pub(crate) fn submit(name: &'static str, job: impl FnOnce() + Send + 'static) -> Status {
    submit_to(DISPATCHER.get(), name, job)
}

pub(crate) fn submit_to(
    dispatcher: Option<&Dispatcher>,
    name: &'static str,
    job: impl FnOnce() + Send + 'static,
) -> Status {
    let Some(dispatcher) = dispatcher else {
        return Status::Failure;
    };
    match dispatcher.submit(move |_| guard(name, (), job)) {
        Ok(_) => Status::Success,
        Err(e) => {
            accel_error!(logger(), "{name}: {e}");
            Status::Failure
        }
    }
}

/// Copy a C string. Null and non-UTF-8 input are invalid arguments.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
pub(crate) unsafe fn owned_str(ptr: *const c_char, what: &str) -> Result<String, Error> {
    if ptr.is_null() {
        return Err(Error::InvalidArgument(format!("{what} is null")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_owned)
        .map_err(|_| Error::InvalidArgument(format!("{what} is not valid UTF-8")))
}

/// Like [`owned_str`] but null maps to `None`.
///
/// # Safety
///
/// Same as [`owned_str`].
pub(crate) unsafe fn optional_str(ptr: *const c_char, what: &str) -> Result<Option<String>, Error> {
    if ptr.is_null() {
        Ok(None)
    } else {
        owned_str(ptr, what).map(Some)
    }
}

/// Hand a Rust string to C. Interior NULs cannot be represented and yield
/// an error.
pub(crate) fn into_c_string(s: String) -> Result<*mut c_char, Error> {
    CString::new(s)
        .map(CString::into_raw)
        .map_err(|_| Error::InvalidArgument("string contains a NUL byte".into()))
}

/// Signature of a caller-supplied log sink: level, milliseconds since the
/// logger was created, message, user data.
pub type AccelLogCallback =
    Option<unsafe extern "C" fn(level: u32, elapsed_ms: u64, message: *const c_char, user_data: *mut c_void)>;

/// Install the process-wide logger. Only the first call chooses the sink;
/// later calls just change the level. A null callback selects the default
/// sink.
#[no_mangle]
pub extern "C" fn accel_log_init(
    level: u32,
    callback: AccelLogCallback,
    user_data: *mut c_void,
) -> Status {
    guard("accel_log_init", Status::Failure, || {
        let level = match LogLevel::from_raw(level) {
            Ok(l) => l,
            Err(e) => return status_of::<()>("accel_log_init", &Err(e)),
        };
        let sink: Option<LogCallback> = callback.map(|cb| {
            let user_data = UserData::new(user_data);
            let sink: LogCallback = Arc::new(move |level: LogLevel, elapsed: u64, msg: &str| {
                if let Ok(msg) = CString::new(msg.replace('\0', " ")) {
                    // SAFETY: the caller registered `cb` for exactly this use.
                    unsafe { cb(level as u32, elapsed, msg.as_ptr(), user_data.get()) };
                }
            });
            sink
        });
        LOGGER.get_or_init(sink, level);
        Status::Success
    })
}

/// Change the log threshold (1 = error ... 5 = debug).
#[no_mangle]
pub extern "C" fn accel_set_log_level(level: u32) -> Status {
    guard("accel_set_log_level", Status::Failure, || {
        match LogLevel::from_raw(level) {
            Ok(l) => {
                logger().set_max_level(l);
                Status::Success
            }
            Err(e) => status_of::<()>("accel_set_log_level", &Err(e)),
        }
    })
}

/// Size the worker pool used by the `_async` functions. Must be called
/// before the first asynchronous call; afterwards it fails and the running
/// pool is kept. Without it the pool takes its size from the first session
/// configuration, or the library defaults.
#[no_mangle]
pub extern "C" fn accel_dispatch_configure(workers: usize, queue_depth: usize) -> Status {
    const NAME: &str = "accel_dispatch_configure";
    guard(NAME, Status::Failure, || {
        if workers == 0 {
            return status_of::<()>(NAME, &Err(Error::InvalidArgument("workers must be at least 1".into())));
        }
        let config = DispatchConfig {
            workers,
            queue_depth,
        };
        status_of(NAME, &DISPATCHER.configure(config, true))
    })
}

/// Release a string returned by this library.
///
/// # Safety
///
/// `s` must be null or a pointer previously returned by this library and
/// not yet freed.
#[no_mangle]
pub unsafe extern "C" fn accel_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_converts_panics() {
        let s = guard("test", Status::Failure, || -> Status { panic!("boom") });
        assert_eq!(s, Status::Failure);
        assert_eq!(guard("test", Status::Failure, || Status::Success), Status::Success);
    }

    #[test]
    fn strings_cross_the_boundary() {
        let c = CString::new("hello").unwrap();
        assert_eq!(unsafe { owned_str(c.as_ptr(), "x") }.unwrap(), "hello");
        assert!(unsafe { owned_str(std::ptr::null(), "x") }.is_err());
        assert_eq!(unsafe { optional_str(std::ptr::null(), "x") }.unwrap(), None);

        let raw = into_c_string("back".into()).unwrap();
        assert_eq!(unsafe { CStr::from_ptr(raw) }.to_str().unwrap(), "back");
        unsafe { accel_string_free(raw) };
        unsafe { accel_string_free(std::ptr::null_mut()) };
        assert!(into_c_string("a\0b".into()).is_err());
    }

    #[test]
    fn dispatcher_sizing_is_fixed_at_start() {
        let shared = SharedDispatcher::new();
        shared
            .configure(DispatchConfig { workers: 2, queue_depth: 1 }, false)
            .unwrap();
        // a later session config does not override the first one
        shared
            .configure(DispatchConfig { workers: 8, queue_depth: 8 }, false)
            .unwrap();
        shared
            .configure(DispatchConfig { workers: 3, queue_depth: 2 }, true)
            .unwrap();
        assert_eq!(shared.get().map(Dispatcher::capacity), Some(5));
        assert!(matches!(
            shared.configure(DispatchConfig::default(), true),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(shared.get().map(Dispatcher::capacity), Some(5));
    }

    #[test]
    fn unconfigured_dispatcher_uses_defaults() {
        let shared = SharedDispatcher::new();
        let defaults = DispatchConfig::default();
        assert_eq!(
            shared.get().map(Dispatcher::capacity),
            Some(defaults.workers + defaults.queue_depth)
        );
    }

    #[test]
    fn configure_after_start_fails() {
        assert_eq!(accel_dispatch_configure(0, 4), Status::Failure);
        assert_eq!(submit("test", || ()), Status::Success);
        assert_eq!(accel_dispatch_configure(2, 4), Status::Failure);
    }

    #[test]
    fn log_level_validation() {
        assert_eq!(accel_set_log_level(9), Status::Failure);
        assert_eq!(accel_set_log_level(1), Status::Success);
        assert_eq!(accel_log_init(0, None, std::ptr::null_mut()), Status::Failure);
    }
}
