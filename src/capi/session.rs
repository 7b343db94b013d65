//! `accel_session_*`: the session lifecycle over the C ABI.

use std::ffi::{c_char, c_void, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    guard, into_c_string, logger, optional_str, owned_str, seed_dispatcher, status_of, submit, submit_to,
    UserData, DISPATCHER,
};
use crate::backend::BackendLoader;
use crate::config::{InputDataType, OutputDataType, PrecisionMode, SessionConfig};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Status};
use crate::loader::default_loader;
use crate::session::Session;

/// Opaque session handle. Created by `accel_session_create`, released by
/// `accel_session_free`.
pub struct AccelSession {
    session: Mutex<Session>,
}

impl AccelSession {
    fn into_raw(session: Session) -> *mut AccelSession {
        Arc::into_raw(Arc::new(AccelSession {
            session: Mutex::new(session),
        })) as *mut AccelSession
    }

    /// A new strong reference, so queued work keeps the session alive even
    /// if the caller frees its handle meanwhile.
    unsafe fn retain(ptr: *const AccelSession) -> Option<Arc<AccelSession>> {
        if ptr.is_null() {
            return None;
        }
        Arc::increment_strong_count(ptr);
        Some(Arc::from_raw(ptr))
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// NPU tuning knobs accepted at creation time.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelTuning {
    /// 0..=3, higher is faster to run and slower to prepare.
    pub optimization_level: u32,
    /// 0 = fp32, 1 = fp16, anything else = backend default.
    pub precision_mode: u32,
}

pub type AccelStatusCallback = Option<unsafe extern "C" fn(status: Status, user_data: *mut c_void)>;
pub type AccelSessionCallback =
    Option<unsafe extern "C" fn(session: *mut AccelSession, user_data: *mut c_void)>;
/// `result` is only valid for the duration of the callback.
pub type AccelStringCallback =
    Option<unsafe extern "C" fn(status: Status, result: *const c_char, user_data: *mut c_void)>;
/// Buffers belong to the callee and are released with `accel_float_outputs_free`.
pub type AccelFloatOutputsCallback = Option<
    unsafe extern "C" fn(
        status: Status,
        outputs: *mut *mut f32,
        sizes: *mut usize,
        count: usize,
        user_data: *mut c_void,
    ),
>;
/// Buffers belong to the callee and are released with `accel_native_outputs_free`.
pub type AccelNativeOutputsCallback = Option<
    unsafe extern "C" fn(
        status: Status,
        outputs: *mut *mut u8,
        sizes: *mut usize,
        count: usize,
        user_data: *mut c_void,
    ),
>;
pub type AccelArchCallback = Option<unsafe extern "C" fn(version: i32, user_data: *mut c_void)>;

fn invalid(what: &str) -> Error {
    Error::InvalidArgument(what.to_string())
}

unsafe fn with_session<T>(
    session: *const AccelSession,
    f: impl FnOnce(&mut Session) -> Result<T, Error>,
) -> Result<T, Error> {
    let handle = session.as_ref().ok_or_else(|| invalid("session is null"))?;
    let mut guard = handle.lock();
    f(&mut *guard)
}

unsafe fn run(
    name: &'static str,
    session: *const AccelSession,
    f: impl FnOnce(&mut Session) -> Result<(), Error>,
) -> Status {
    guard(name, Status::Failure, || {
        let r = with_session(session, f);
        status_of(name, &r)
    })
}

/// Queue `f` against a retained session and report through `callback`.
unsafe fn run_async(
    name: &'static str,
    session: *const AccelSession,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
    f: impl FnOnce(&mut Session) -> Result<(), Error> + Send + 'static,
) -> Status {
    guard(name, Status::Failure, || {
        let Some(cb) = callback else {
            return status_of::<()>(name, &Err(invalid("callback is null")));
        };
        let Some(handle) = AccelSession::retain(session) else {
            return status_of::<()>(name, &Err(invalid("session is null")));
        };
        let user_data = UserData::new(user_data);
        submit(name, move || {
            let status = guard(name, Status::Failure, || {
                let mut s = handle.lock();
                let r = f(&mut *s);
                status_of(name, &r)
            });
            cb(status, user_data.get());
        })
    })
}

fn graph_index(index: i32) -> Result<usize, Error> {
    usize::try_from(index).map_err(|_| Error::InvalidArgument(format!("graph index {index}")))
}

unsafe fn config_from_args(
    backend_path: *const c_char,
    model_path: *const c_char,
    output_data_type: u32,
    input_data_type: u32,
    data_dir: *const c_char,
    tuning: *const AccelTuning,
) -> Result<SessionConfig, Error> {
    let mut config = SessionConfig::new(
        owned_str(backend_path, "backend path")?,
        owned_str(model_path, "model path")?,
    );
    config.output_data_type = OutputDataType::from_raw(output_data_type)?;
    config.input_data_type = InputDataType::from_raw(input_data_type)?;
    config.data_dir = optional_str(data_dir, "data dir")?.map(PathBuf::from);
    if let Some(t) = tuning.as_ref() {
        config.tuning.optimization_level = t.optimization_level;
        config.tuning.precision = PrecisionMode::from_raw(t.precision_mode);
    }
    config.log_level = logger().max_level();
    Ok(config)
}

/// Load the libraries for a session. Null on failure.
pub(crate) fn open_session(config: SessionConfig, loader: &dyn BackendLoader) -> *mut AccelSession {
    match Session::load(config, loader, logger()) {
        Ok(s) => AccelSession::into_raw(s),
        Err(_) => ptr::null_mut(),
    }
}

/// Load the backend and model (or system) libraries.
///
/// `data_dir` and `tuning` may be null. Returns null on failure. The session
/// still has to be initialized with `accel_session_initialize` or the
/// discrete steps.
///
/// # Safety
///
/// String arguments must be null or NUL-terminated; `tuning` must be null or
/// point to a valid `AccelTuning`.
#[no_mangle]
pub unsafe extern "C" fn accel_session_create(
    backend_path: *const c_char,
    model_path: *const c_char,
    output_data_type: u32,
    input_data_type: u32,
    data_dir: *const c_char,
    tuning: *const AccelTuning,
) -> *mut AccelSession {
    guard("accel_session_create", ptr::null_mut(), || {
        match config_from_args(
            backend_path,
            model_path,
            output_data_type,
            input_data_type,
            data_dir,
            tuning,
        ) {
            Ok(config) => open_session(config, default_loader().as_ref()),
            Err(e) => {
                accel_error!(logger(), "accel_session_create: {e}");
                ptr::null_mut()
            }
        }
    })
}

pub(crate) fn create_from_config_with(path: &Path, loader: &dyn BackendLoader) -> *mut AccelSession {
    match SessionConfig::from_file(path) {
        Ok(config) => {
            seed_dispatcher(config.dispatch);
            open_session(config, loader)
        }
        Err(e) => {
            accel_error!(logger(), "accel_session_create_from_config: {e}");
            ptr::null_mut()
        }
    }
}

/// Load a session described by a TOML file. Its `[dispatch]` table sizes the
/// async worker pool unless `accel_dispatch_configure` ran first or the pool
/// already started. Returns null on failure.
///
/// # Safety
///
/// `config_path` must be null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn accel_session_create_from_config(config_path: *const c_char) -> *mut AccelSession {
    const NAME: &str = "accel_session_create_from_config";
    guard(NAME, ptr::null_mut(), || match owned_str(config_path, "config path") {
        Ok(path) => create_from_config_with(Path::new(&path), default_loader().as_ref()),
        Err(e) => {
            accel_error!(logger(), "{NAME}: {e}");
            ptr::null_mut()
        }
    })
}

pub(crate) fn create_async_with(
    config: SessionConfig,
    loader: Arc<dyn BackendLoader>,
    callback: unsafe extern "C" fn(*mut AccelSession, *mut c_void),
    user_data: UserData,
) -> Status {
    submit("accel_session_create_async", move || {
        let handle = guard("accel_session_create_async", ptr::null_mut(), || {
            open_session(config, loader.as_ref())
        });
        // SAFETY: the caller registered `callback` for this result.
        unsafe { callback(handle, user_data.get()) };
    })
}

/// # Safety
///
/// Same as [`accel_session_create`].
#[no_mangle]
pub unsafe extern "C" fn accel_session_create_async(
    backend_path: *const c_char,
    model_path: *const c_char,
    output_data_type: u32,
    input_data_type: u32,
    data_dir: *const c_char,
    tuning: *const AccelTuning,
    callback: AccelSessionCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_create_async";
    guard(NAME, Status::Failure, || {
        let Some(cb) = callback else {
            return status_of::<()>(NAME, &Err(invalid("callback is null")));
        };
        match config_from_args(
            backend_path,
            model_path,
            output_data_type,
            input_data_type,
            data_dir,
            tuning,
        ) {
            Ok(config) => create_async_with(config, default_loader(), cb, UserData::new(user_data)),
            Err(e) => status_of::<()>(NAME, &Err(e)),
        }
    })
}

/// Tear down and release a session. Null is ignored.
///
/// # Safety
///
/// `session` must be null or a live handle; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn accel_session_free(session: *mut AccelSession) {
    guard("accel_session_free", (), || {
        if !session.is_null() {
            drop(Arc::from_raw(session as *const AccelSession));
        }
    })
}

/// # Safety
///
/// Same as [`accel_session_free`]. The handle is invalid as soon as this
/// returns [`Status::Success`]; on any other status it is still owned by the
/// caller.
#[no_mangle]
pub unsafe extern "C" fn accel_session_free_async(
    session: *mut AccelSession,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
) -> Status {
    free_async_on(DISPATCHER.get(), session, callback, user_data)
}

unsafe fn free_async_on(
    dispatcher: Option<&Dispatcher>,
    session: *mut AccelSession,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_free_async";
    guard(NAME, Status::Failure, || {
        let Some(cb) = callback else {
            return status_of::<()>(NAME, &Err(invalid("callback is null")));
        };
        let Some(handle) = AccelSession::retain(session) else {
            return status_of::<()>(NAME, &Err(invalid("session is null")));
        };
        let user_data = UserData::new(user_data);
        let addr = session as usize;
        // A job rejected by a full queue is dropped unrun, releasing only
        // `handle`; the caller's reference is consumed once the job runs.
        submit_to(dispatcher, NAME, move || {
            guard(NAME, (), || {
                drop(handle);
                drop(Arc::from_raw(addr as *const AccelSession));
            });
            cb(Status::Success, user_data.get());
        })
    })
}

macro_rules! session_steps {
    ($($(#[$meta:meta])* $sync:ident, $async:ident => $method:ident;)+) => {
        $(
            $(#[$meta])*
            ///
            /// # Safety
            ///
            /// `session` must be null or a live handle.
            #[no_mangle]
            pub unsafe extern "C" fn $sync(session: *mut AccelSession) -> Status {
                run(stringify!($sync), session, |s| s.$method())
            }

            /// Asynchronous twin; `callback` receives the status.
            ///
            /// # Safety
            ///
            /// `session` must be null or a live handle.
            #[no_mangle]
            pub unsafe extern "C" fn $async(
                session: *mut AccelSession,
                callback: AccelStatusCallback,
                user_data: *mut c_void,
            ) -> Status {
                run_async(stringify!($async), session, callback, user_data, |s| s.$method())
            }
        )+
    };
}

session_steps! {
    /// Composite initialization: backend, device, op packages, profiling,
    /// then context and graphs.
    accel_session_initialize, accel_session_initialize_async => initialize;
    accel_session_initialize_backend, accel_session_initialize_backend_async => initialize_backend;
    accel_session_initialize_profiling, accel_session_initialize_profiling_async => initialize_profiling;
    accel_session_create_device, accel_session_create_device_async => create_device;
    accel_session_free_device, accel_session_free_device_async => free_device;
    accel_session_create_context, accel_session_create_context_async => create_context;
    accel_session_compose_graphs, accel_session_compose_graphs_async => compose_graphs;
    accel_session_finalize_graphs, accel_session_finalize_graphs_async => finalize_graphs;
    /// Build the context from the `.bin` file given as model path.
    accel_session_create_from_binary, accel_session_create_from_binary_async => create_from_binary;
    accel_session_free_context, accel_session_free_context_async => free_context;
    accel_session_terminate_backend, accel_session_terminate_backend_async => terminate_backend;
    /// Run the session's single graph on the loaded inputs.
    accel_session_execute_graphs, accel_session_execute_graphs_async => execute_graphs;
}

fn free_graphs(s: &mut Session) -> Result<(), Error> {
    s.free_graphs();
    Ok(())
}

/// # Safety
///
/// `session` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn accel_session_free_graphs(session: *mut AccelSession) -> Status {
    run("accel_session_free_graphs", session, free_graphs)
}

/// # Safety
///
/// `session` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn accel_session_free_graphs_async(
    session: *mut AccelSession,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
) -> Status {
    run_async("accel_session_free_graphs_async", session, callback, user_data, free_graphs)
}

fn device_property(s: &mut Session) -> Result<(), Error> {
    if s.is_device_property_supported()? {
        Ok(())
    } else {
        Err(Error::Vendor {
            call: "accel_property_has_capability",
            code: crate::ffi::ACCEL_ERROR_NOT_SUPPORTED,
        })
    }
}

/// [`Status::Success`] if devices are supported,
/// [`Status::FeatureUnsupported`] if not.
///
/// # Safety
///
/// `session` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn accel_session_is_device_property_supported(
    session: *mut AccelSession,
) -> Status {
    run("accel_session_is_device_property_supported", session, device_property)
}

/// # Safety
///
/// `session` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn accel_session_is_device_property_supported_async(
    session: *mut AccelSession,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
) -> Status {
    run_async(
        "accel_session_is_device_property_supported_async",
        session,
        callback,
        user_data,
        device_property,
    )
}

fn split_packages(list: Option<String>) -> Option<Vec<String>> {
    list.map(|l| {
        l.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
}

fn register_packages(s: &mut Session, packages: Option<Vec<String>>) -> Result<(), Error> {
    if let Some(p) = packages {
        s.set_op_packages(p);
    }
    s.register_op_packages()
}

/// Register op packages. `packages` is a comma-separated list of
/// `path:interface_provider[:target]`; null keeps the configured list.
///
/// # Safety
///
/// `session` must be null or a live handle; `packages` null or
/// NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn accel_session_register_op_packages(
    session: *mut AccelSession,
    packages: *const c_char,
) -> Status {
    const NAME: &str = "accel_session_register_op_packages";
    guard(NAME, Status::Failure, || {
        let r = optional_str(packages, "op packages")
            .and_then(|p| with_session(session, |s| register_packages(s, split_packages(p))));
        status_of(NAME, &r)
    })
}

/// # Safety
///
/// Same as [`accel_session_register_op_packages`].
#[no_mangle]
pub unsafe extern "C" fn accel_session_register_op_packages_async(
    session: *mut AccelSession,
    packages: *const c_char,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_register_op_packages_async";
    let packages = match optional_str(packages, "op packages") {
        Ok(p) => split_packages(p),
        Err(e) => return status_of::<()>(NAME, &Err(e)),
    };
    run_async(NAME, session, callback, user_data, move |s| {
        register_packages(s, packages)
    })
}

/// Serialize the context to `<dir>/<name>.bin`.
///
/// # Safety
///
/// `session` must be null or a live handle; strings NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn accel_session_save_binary(
    session: *mut AccelSession,
    dir: *const c_char,
    name: *const c_char,
) -> Status {
    const NAME: &str = "accel_session_save_binary";
    guard(NAME, Status::Failure, || {
        let r = owned_str(dir, "output dir").and_then(|dir| {
            let name = owned_str(name, "binary name")?;
            with_session(session, |s| s.save_binary(Path::new(&dir), &name).map(drop))
        });
        status_of(NAME, &r)
    })
}

/// # Safety
///
/// Same as [`accel_session_save_binary`].
#[no_mangle]
pub unsafe extern "C" fn accel_session_save_binary_async(
    session: *mut AccelSession,
    dir: *const c_char,
    name: *const c_char,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_save_binary_async";
    let args = owned_str(dir, "output dir").and_then(|d| Ok((d, owned_str(name, "binary name")?)));
    let (dir, name) = match args {
        Ok(a) => a,
        Err(e) => return status_of::<()>(NAME, &Err(e)),
    };
    run_async(NAME, session, callback, user_data, move |s| {
        s.save_binary(Path::new(&dir), &name).map(drop)
    })
}

/// Backend build id in `*out`, released with `accel_string_free`.
///
/// # Safety
///
/// `session` must be null or a live handle; `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn accel_session_get_backend_build_id(
    session: *mut AccelSession,
    out: *mut *mut c_char,
) -> Status {
    const NAME: &str = "accel_session_get_backend_build_id";
    guard(NAME, Status::Failure, || {
        if out.is_null() {
            return status_of::<()>(NAME, &Err(invalid("out is null")));
        }
        let r = with_session(session, |s| s.backend_build_id()).and_then(into_c_string);
        match r {
            Ok(s) => {
                *out = s;
                Status::Success
            }
            Err(e) => status_of::<()>(NAME, &Err(e)),
        }
    })
}

/// # Safety
///
/// `session` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn accel_session_get_backend_build_id_async(
    session: *mut AccelSession,
    callback: AccelStringCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_get_backend_build_id_async";
    guard(NAME, Status::Failure, || {
        let Some(cb) = callback else {
            return status_of::<()>(NAME, &Err(invalid("callback is null")));
        };
        let Some(handle) = AccelSession::retain(session) else {
            return status_of::<()>(NAME, &Err(invalid("session is null")));
        };
        let user_data = UserData::new(user_data);
        submit(NAME, move || {
            let r = guard(NAME, Err(Error::InvalidState("panic")), || {
                handle.lock().backend_build_id()
            })
            .and_then(|id| {
                CString::new(id).map_err(|_| invalid("build id contains a NUL byte"))
            });
            let status = status_of(NAME, &r);
            let text = r.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null());
            cb(status, text, user_data.get());
        })
    })
}

unsafe fn borrow_batch<'a, T>(
    buffers: *const *const T,
    sizes: *const usize,
    count: usize,
) -> Result<Vec<&'a [T]>, Error> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if buffers.is_null() || sizes.is_null() {
        return Err(invalid("input arrays are null"));
    }
    let buffers = slice::from_raw_parts(buffers, count);
    let sizes = slice::from_raw_parts(sizes, count);
    buffers
        .iter()
        .zip(sizes)
        .enumerate()
        .map(|(i, (&p, &len))| match (p.is_null(), len) {
            (true, 0) => Ok(&[][..]),
            (true, _) => Err(Error::InvalidArgument(format!("input {i} is null"))),
            (false, _) => Ok(slice::from_raw_parts(p, len)),
        })
        .collect()
}

fn export_batch<T>(arrays: Vec<Vec<T>>) -> (*mut *mut T, *mut usize, usize) {
    let count = arrays.len();
    let sizes: Box<[usize]> = arrays.iter().map(Vec::len).collect();
    let buffers: Box<[*mut T]> = arrays
        .into_iter()
        .map(|v| Box::into_raw(v.into_boxed_slice()) as *mut T)
        .collect();
    (
        Box::into_raw(buffers) as *mut *mut T,
        Box::into_raw(sizes) as *mut usize,
        count,
    )
}

unsafe fn free_batch<T>(buffers: *mut *mut T, sizes: *mut usize, count: usize) {
    if buffers.is_null() || sizes.is_null() {
        return;
    }
    let sizes = Box::from_raw(ptr::slice_from_raw_parts_mut(sizes, count));
    let buffers = Box::from_raw(ptr::slice_from_raw_parts_mut(buffers, count));
    for (&p, &len) in buffers.iter().zip(sizes.iter()) {
        if !p.is_null() {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(p, len)));
        }
    }
}

/// Copy one float array per graph input into the session.
///
/// # Safety
///
/// `inputs` and `sizes` must each hold `count` entries; `inputs[i]` must
/// point to `sizes[i]` floats.
#[no_mangle]
pub unsafe extern "C" fn accel_session_load_float_inputs(
    session: *mut AccelSession,
    inputs: *const *const f32,
    sizes: *const usize,
    count: usize,
    graph: i32,
) -> Status {
    const NAME: &str = "accel_session_load_float_inputs";
    guard(NAME, Status::Failure, || {
        let r = graph_index(graph).and_then(|idx| {
            let arrays = borrow_batch(inputs, sizes, count)?;
            with_session(session, |s| s.load_float_inputs(&arrays, idx))
        });
        status_of(NAME, &r)
    })
}

/// The input arrays are copied before this returns; the caller may reuse
/// or free them immediately.
///
/// # Safety
///
/// Same as [`accel_session_load_float_inputs`].
#[no_mangle]
pub unsafe extern "C" fn accel_session_load_float_inputs_async(
    session: *mut AccelSession,
    inputs: *const *const f32,
    sizes: *const usize,
    count: usize,
    graph: i32,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_load_float_inputs_async";
    let args = graph_index(graph).and_then(|idx| {
        let owned: Vec<Vec<f32>> = borrow_batch(inputs, sizes, count)?
            .into_iter()
            .map(<[f32]>::to_vec)
            .collect();
        Ok((idx, owned))
    });
    let (idx, arrays) = match args {
        Ok(a) => a,
        Err(e) => return status_of::<()>(NAME, &Err(e)),
    };
    run_async(NAME, session, callback, user_data, move |s| {
        s.load_float_inputs(&arrays, idx)
    })
}

/// Native-format counterpart of `accel_session_load_float_inputs`; sizes are
/// in bytes.
///
/// # Safety
///
/// `inputs` and `sizes` must each hold `count` entries; `inputs[i]` must
/// point to `sizes[i]` bytes.
#[no_mangle]
pub unsafe extern "C" fn accel_session_load_native_inputs(
    session: *mut AccelSession,
    inputs: *const *const u8,
    sizes: *const usize,
    count: usize,
    graph: i32,
) -> Status {
    const NAME: &str = "accel_session_load_native_inputs";
    guard(NAME, Status::Failure, || {
        let r = graph_index(graph).and_then(|idx| {
            let arrays = borrow_batch(inputs, sizes, count)?;
            with_session(session, |s| s.load_native_inputs(&arrays, idx))
        });
        status_of(NAME, &r)
    })
}

/// # Safety
///
/// Same as [`accel_session_load_native_inputs`].
#[no_mangle]
pub unsafe extern "C" fn accel_session_load_native_inputs_async(
    session: *mut AccelSession,
    inputs: *const *const u8,
    sizes: *const usize,
    count: usize,
    graph: i32,
    callback: AccelStatusCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_load_native_inputs_async";
    let args = graph_index(graph).and_then(|idx| {
        let owned: Vec<Vec<u8>> = borrow_batch(inputs, sizes, count)?
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        Ok((idx, owned))
    });
    let (idx, arrays) = match args {
        Ok(a) => a,
        Err(e) => return status_of::<()>(NAME, &Err(e)),
    };
    run_async(NAME, session, callback, user_data, move |s| {
        s.load_native_inputs(&arrays, idx)
    })
}

unsafe fn write_batch<T>(
    name: &str,
    result: Result<Vec<Vec<T>>, Error>,
    outputs: *mut *mut *mut T,
    sizes: *mut *mut usize,
    count: *mut usize,
) -> Status {
    match result {
        Ok(arrays) => {
            let (b, z, n) = export_batch(arrays);
            *outputs = b;
            *sizes = z;
            *count = n;
            Status::Success
        }
        Err(e) => status_of::<()>(name, &Err(e)),
    }
}

/// Float copies of every output of `graph`. On success `*outputs`,
/// `*sizes` and `*count` describe the arrays; release them with
/// `accel_float_outputs_free`.
///
/// # Safety
///
/// `session` must be null or a live handle; the out pointers must be
/// writable.
#[no_mangle]
pub unsafe extern "C" fn accel_session_get_float_outputs(
    session: *mut AccelSession,
    outputs: *mut *mut *mut f32,
    sizes: *mut *mut usize,
    count: *mut usize,
    graph: i32,
) -> Status {
    const NAME: &str = "accel_session_get_float_outputs";
    guard(NAME, Status::Failure, || {
        if outputs.is_null() || sizes.is_null() || count.is_null() {
            return status_of::<()>(NAME, &Err(invalid("output pointers are null")));
        }
        let r = graph_index(graph).and_then(|idx| with_session(session, |s| s.get_float_outputs(idx)));
        write_batch(NAME, r, outputs, sizes, count)
    })
}

/// # Safety
///
/// `session` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn accel_session_get_float_outputs_async(
    session: *mut AccelSession,
    graph: i32,
    callback: AccelFloatOutputsCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_get_float_outputs_async";
    guard(NAME, Status::Failure, || {
        let Some(cb) = callback else {
            return status_of::<()>(NAME, &Err(invalid("callback is null")));
        };
        let idx = match graph_index(graph) {
            Ok(i) => i,
            Err(e) => return status_of::<()>(NAME, &Err(e)),
        };
        let Some(handle) = AccelSession::retain(session) else {
            return status_of::<()>(NAME, &Err(invalid("session is null")));
        };
        let user_data = UserData::new(user_data);
        submit(NAME, move || {
            let r = guard(NAME, Err(Error::InvalidState("panic")), || {
                handle.lock().get_float_outputs(idx)
            });
            let status = status_of(NAME, &r);
            let (b, z, n) = export_batch(r.unwrap_or_default());
            cb(status, b, z, n, user_data.get());
        })
    })
}

/// Raw native-format copies of every output of `graph`; release with
/// `accel_native_outputs_free`.
///
/// # Safety
///
/// Same as [`accel_session_get_float_outputs`].
#[no_mangle]
pub unsafe extern "C" fn accel_session_get_native_outputs(
    session: *mut AccelSession,
    outputs: *mut *mut *mut u8,
    sizes: *mut *mut usize,
    count: *mut usize,
    graph: i32,
) -> Status {
    const NAME: &str = "accel_session_get_native_outputs";
    guard(NAME, Status::Failure, || {
        if outputs.is_null() || sizes.is_null() || count.is_null() {
            return status_of::<()>(NAME, &Err(invalid("output pointers are null")));
        }
        let r = graph_index(graph).and_then(|idx| with_session(session, |s| s.get_native_outputs(idx)));
        write_batch(NAME, r, outputs, sizes, count)
    })
}

/// # Safety
///
/// `session` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn accel_session_get_native_outputs_async(
    session: *mut AccelSession,
    graph: i32,
    callback: AccelNativeOutputsCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_session_get_native_outputs_async";
    guard(NAME, Status::Failure, || {
        let Some(cb) = callback else {
            return status_of::<()>(NAME, &Err(invalid("callback is null")));
        };
        let idx = match graph_index(graph) {
            Ok(i) => i,
            Err(e) => return status_of::<()>(NAME, &Err(e)),
        };
        let Some(handle) = AccelSession::retain(session) else {
            return status_of::<()>(NAME, &Err(invalid("session is null")));
        };
        let user_data = UserData::new(user_data);
        submit(NAME, move || {
            let r = guard(NAME, Err(Error::InvalidState("panic")), || {
                handle.lock().get_native_outputs(idx)
            });
            let status = status_of(NAME, &r);
            let (b, z, n) = export_batch(r.unwrap_or_default());
            cb(status, b, z, n, user_data.get());
        })
    })
}

/// Release arrays returned by `accel_session_get_float_outputs`.
///
/// # Safety
///
/// The arguments must be exactly what the library returned, freed once.
#[no_mangle]
pub unsafe extern "C" fn accel_float_outputs_free(outputs: *mut *mut f32, sizes: *mut usize, count: usize) {
    free_batch(outputs, sizes, count)
}

/// Release arrays returned by `accel_session_get_native_outputs`.
///
/// # Safety
///
/// The arguments must be exactly what the library returned, freed once.
#[no_mangle]
pub unsafe extern "C" fn accel_native_outputs_free(outputs: *mut *mut u8, sizes: *mut usize, count: usize) {
    free_batch(outputs, sizes, count)
}

pub(crate) fn arch_version_with(backend_path: &str, loader: &dyn BackendLoader) -> i32 {
    match Session::accelerator_arch(loader, Path::new(backend_path), &logger()) {
        Ok(v) => i32::try_from(v).unwrap_or(-1),
        Err(e) => {
            accel_error!(logger(), "arch version of {backend_path}: {e}");
            -1
        }
    }
}

/// Accelerator architecture version reported by the backend at
/// `backend_path`, or -1.
///
/// # Safety
///
/// `backend_path` must be null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn accel_get_arch_version(backend_path: *const c_char) -> i32 {
    guard("accel_get_arch_version", -1, || match owned_str(backend_path, "backend path") {
        Ok(path) => arch_version_with(&path, default_loader().as_ref()),
        Err(_) => -1,
    })
}

pub(crate) fn arch_version_async_with(
    backend_path: String,
    loader: Arc<dyn BackendLoader>,
    callback: unsafe extern "C" fn(i32, *mut c_void),
    user_data: UserData,
) -> Status {
    submit("accel_get_arch_version_async", move || {
        let version = guard("accel_get_arch_version_async", -1, || {
            arch_version_with(&backend_path, loader.as_ref())
        });
        // SAFETY: the caller registered `callback` for this result.
        unsafe { callback(version, user_data.get()) };
    })
}

/// # Safety
///
/// `backend_path` must be null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn accel_get_arch_version_async(
    backend_path: *const c_char,
    callback: AccelArchCallback,
    user_data: *mut c_void,
) -> Status {
    const NAME: &str = "accel_get_arch_version_async";
    guard(NAME, Status::Failure, || {
        let Some(cb) = callback else {
            return status_of::<()>(NAME, &Err(invalid("callback is null")));
        };
        match owned_str(backend_path, "backend path") {
            Ok(path) => arch_version_async_with(path, default_loader(), cb, UserData::new(user_data)),
            Err(e) => status_of::<()>(NAME, &Err(e)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PropertySupport;
    use crate::capi::testing::Inbox;
    use crate::mock::MockLoader;

    unsafe extern "C" fn on_status(status: Status, user_data: *mut c_void) {
        Inbox::<Status>::post(user_data, status);
    }

    unsafe extern "C" fn on_session(session: *mut AccelSession, user_data: *mut c_void) {
        Inbox::<usize>::post(user_data, session as usize);
    }

    unsafe extern "C" fn on_string(status: Status, text: *const c_char, user_data: *mut c_void) {
        let text = (!text.is_null()).then(|| std::ffi::CStr::from_ptr(text).to_string_lossy().into_owned());
        Inbox::<(Status, Option<String>)>::post(user_data, (status, text));
    }

    unsafe extern "C" fn on_floats(
        status: Status,
        outputs: *mut *mut f32,
        sizes: *mut usize,
        count: usize,
        user_data: *mut c_void,
    ) {
        let mut copied = Vec::new();
        if count > 0 {
            let bufs = slice::from_raw_parts(outputs, count);
            let lens = slice::from_raw_parts(sizes, count);
            for (&p, &n) in bufs.iter().zip(lens) {
                copied.push(slice::from_raw_parts(p, n).to_vec());
            }
        }
        accel_float_outputs_free(outputs, sizes, count);
        Inbox::<(Status, Vec<Vec<f32>>)>::post(user_data, (status, copied));
    }

    unsafe extern "C" fn on_arch(version: i32, user_data: *mut c_void) {
        Inbox::<i32>::post(user_data, version);
    }

    fn open(loader: &MockLoader) -> *mut AccelSession {
        let handle = open_session(SessionConfig::new("libAccelHtp.so", "libmodel.so"), loader);
        assert!(!handle.is_null());
        handle
    }

    unsafe fn float_outputs(session: *mut AccelSession, graph: i32) -> Result<Vec<Vec<f32>>, Status> {
        let mut outputs = ptr::null_mut();
        let mut sizes = ptr::null_mut();
        let mut count = 0usize;
        let status = accel_session_get_float_outputs(session, &mut outputs, &mut sizes, &mut count, graph);
        if status != Status::Success {
            return Err(status);
        }
        let bufs = slice::from_raw_parts(outputs, count);
        let lens = slice::from_raw_parts(sizes, count);
        let copied = bufs
            .iter()
            .zip(lens)
            .map(|(&p, &n)| slice::from_raw_parts(p, n).to_vec())
            .collect();
        accel_float_outputs_free(outputs, sizes, count);
        Ok(copied)
    }

    #[test]
    fn synchronous_lifecycle() {
        let loader = MockLoader::new();
        let s = open(&loader);
        unsafe {
            assert_eq!(accel_session_initialize(s), Status::Success);
            assert_eq!(float_outputs(s, 0), Err(Status::Failure));

            let input = [1.0f32, 1.0, 1.0, 1.0];
            let ptrs = [input.as_ptr()];
            let sizes = [input.len()];
            assert_eq!(
                accel_session_load_float_inputs(s, ptrs.as_ptr(), sizes.as_ptr(), 1, 0),
                Status::Success
            );
            assert_eq!(accel_session_execute_graphs(s), Status::Success);
            assert_eq!(
                float_outputs(s, 0).unwrap(),
                vec![vec![4.0, 5.0], vec![4.0, 5.0, 6.0]]
            );
            assert_eq!(float_outputs(s, -1), Err(Status::Failure));

            let mut id = ptr::null_mut();
            assert_eq!(accel_session_get_backend_build_id(s, &mut id), Status::Success);
            assert_eq!(std::ffi::CStr::from_ptr(id).to_str().unwrap(), "mock-2.0.0");
            crate::capi::accel_string_free(id);

            accel_session_free(s);
        }
        assert_eq!(loader.calls().last().map(String::as_str), Some("unload"));
    }

    #[test]
    fn discrete_steps_and_status_mapping() {
        let loader = MockLoader::new();
        let s = open(&loader);
        unsafe {
            assert_eq!(accel_session_create_context(s), Status::Failure);
            assert_eq!(accel_session_initialize_backend(s), Status::Success);
            assert_eq!(accel_session_is_device_property_supported(s), Status::Success);
            loader.state().property = PropertySupport::NotSupported;
            assert_eq!(
                accel_session_is_device_property_supported(s),
                Status::FeatureUnsupported
            );
            loader.fail("accel_context_create", crate::ffi::ACCEL_ERROR_SYSTEM_COMMUNICATION);
            assert_eq!(
                accel_session_create_context(s),
                Status::SystemCommunicationError
            );
            assert_eq!(accel_session_free_graphs(s), Status::Success);
            assert_eq!(accel_session_terminate_backend(s), Status::Success);
            accel_session_free(s);
        }
    }

    #[test]
    fn null_handles_fail() {
        unsafe {
            assert_eq!(accel_session_initialize(ptr::null_mut()), Status::Failure);
            assert_eq!(accel_session_execute_graphs(ptr::null_mut()), Status::Failure);
            assert_eq!(
                accel_session_execute_graphs_async(ptr::null_mut(), Some(on_status), ptr::null_mut()),
                Status::Failure
            );
            accel_session_free(ptr::null_mut());
            assert!(accel_session_create(ptr::null(), ptr::null(), 0, 0, ptr::null(), ptr::null()).is_null());
            let backend = CString::new("libAccelHtp.so").unwrap();
            let model = CString::new("libmodel.so").unwrap();
            assert!(accel_session_create(backend.as_ptr(), model.as_ptr(), 7, 0, ptr::null(), ptr::null()).is_null());
        }
    }

    #[test]
    fn op_packages_from_c_list() {
        let loader = MockLoader::new();
        let s = open(&loader);
        unsafe {
            assert_eq!(accel_session_initialize_backend(s), Status::Success);
            let list = CString::new("libA.so:ProvA, libB.so:ProvB:CPU").unwrap();
            assert_eq!(accel_session_register_op_packages(s, list.as_ptr()), Status::Success);
            let bad = CString::new("libA.so").unwrap();
            assert_eq!(accel_session_register_op_packages(s, bad.as_ptr()), Status::Failure);
            accel_session_free(s);
        }
        assert_eq!(loader.state().op_packages.len(), 2);
    }

    #[test]
    fn async_inputs_are_copied_before_return() {
        let loader = MockLoader::new();
        let s = open(&loader);
        let inbox = Inbox::<Status>::new();
        unsafe {
            assert_eq!(
                accel_session_initialize_async(s, Some(on_status), inbox.user_data()),
                Status::Success
            );
            assert_eq!(inbox.recv(), Status::Success);

            {
                let input = vec![2.0f32, 2.0, 2.0, 2.0];
                let ptrs = vec![input.as_ptr()];
                let sizes = vec![input.len()];
                let status = accel_session_load_float_inputs_async(
                    s,
                    ptrs.as_ptr(),
                    sizes.as_ptr(),
                    1,
                    0,
                    Some(on_status),
                    inbox.user_data(),
                );
                assert_eq!(status, Status::Success);
                drop((input, ptrs, sizes));
            }
            assert_eq!(inbox.recv(), Status::Success);

            assert_eq!(
                accel_session_execute_graphs_async(s, Some(on_status), inbox.user_data()),
                Status::Success
            );
            assert_eq!(inbox.recv(), Status::Success);

            let outputs = Inbox::<(Status, Vec<Vec<f32>>)>::new();
            assert_eq!(
                accel_session_get_float_outputs_async(s, 0, Some(on_floats), outputs.user_data()),
                Status::Success
            );
            let (status, data) = outputs.recv();
            assert_eq!(status, Status::Success);
            assert_eq!(data[0], vec![8.0, 9.0]);

            let dir = tempfile::tempdir().unwrap();
            let dir_c = CString::new(dir.path().to_str().unwrap()).unwrap();
            let name_c = CString::new("cache").unwrap();
            let status = accel_session_save_binary_async(
                s,
                dir_c.as_ptr(),
                name_c.as_ptr(),
                Some(on_status),
                inbox.user_data(),
            );
            drop((dir_c, name_c));
            assert_eq!(status, Status::Success);
            assert_eq!(inbox.recv(), Status::Success);
            assert!(dir.path().join("cache.bin").exists());

            assert_eq!(
                accel_session_free_async(s, Some(on_status), inbox.user_data()),
                Status::Success
            );
            assert_eq!(inbox.recv(), Status::Success);
        }
        assert_eq!(loader.calls().last().map(String::as_str), Some("unload"));
    }

    #[test]
    fn async_failures_reach_the_callback() {
        let loader = MockLoader::new();
        let s = open(&loader);
        let inbox = Inbox::<Status>::new();
        unsafe {
            assert_eq!(
                accel_session_execute_graphs_async(s, Some(on_status), inbox.user_data()),
                Status::Success
            );
            assert_eq!(inbox.recv(), Status::Failure);

            let outputs = Inbox::<(Status, Vec<Vec<f32>>)>::new();
            accel_session_get_float_outputs_async(s, 0, Some(on_floats), outputs.user_data());
            let (status, data) = outputs.recv();
            assert_eq!(status, Status::Failure);
            assert!(data.is_empty());

            assert_eq!(accel_session_execute_graphs_async(s, None, ptr::null_mut()), Status::Failure);
            accel_session_free(s);
        }
    }

    #[test]
    fn free_async_on_a_full_queue_keeps_the_handle() {
        use crate::config::DispatchConfig;
        use std::sync::mpsc;

        let loader = MockLoader::new();
        let s = open(&loader);
        let pool = Dispatcher::new(DispatchConfig {
            workers: 1,
            queue_depth: 0,
        })
        .unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let busy = pool
            .submit(move |_| {
                release_rx.recv().ok();
            })
            .unwrap();

        let inbox = Inbox::<Status>::new();
        unsafe {
            assert_eq!(
                free_async_on(Some(&pool), s, Some(on_status), inbox.user_data()),
                Status::Failure
            );
            assert_ne!(loader.calls().last().map(String::as_str), Some("unload"));
            assert_eq!(accel_session_initialize(s), Status::Success);

            release_tx.send(()).unwrap();
            busy.wait().unwrap();
            let idle = Dispatcher::new(DispatchConfig::default()).unwrap();
            assert_eq!(
                free_async_on(Some(&idle), s, Some(on_status), inbox.user_data()),
                Status::Success
            );
        }
        assert_eq!(inbox.recv(), Status::Success);
        assert_eq!(loader.calls().last().map(String::as_str), Some("unload"));
    }

    #[test]
    fn session_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(
            &path,
            r#"
backend_path = "libAccelHtp.so"
model_path = "libmodel.so"

[dispatch]
workers = 2
queue_depth = 8
"#,
        )
        .unwrap();
        let loader = MockLoader::new();
        let s = create_from_config_with(&path, &loader);
        assert!(!s.is_null());
        unsafe {
            assert_eq!(accel_session_initialize(s), Status::Success);
            accel_session_free(s);
        }
        assert!(create_from_config_with(&dir.path().join("missing.toml"), &loader).is_null());
        assert!(unsafe { accel_session_create_from_config(ptr::null()) }.is_null());
    }

    #[test]
    fn async_build_id_and_create() {
        let loader = MockLoader::new();
        let sessions = Inbox::<usize>::new();
        let config = SessionConfig::new("libAccelHtp.so", "libmodel.so");
        let status = create_async_with(
            config,
            Arc::new(loader.clone()),
            on_session,
            UserData::new(sessions.user_data()),
        );
        assert_eq!(status, Status::Success);
        let s = sessions.recv() as *mut AccelSession;
        assert!(!s.is_null());

        let strings = Inbox::<(Status, Option<String>)>::new();
        unsafe {
            assert_eq!(
                accel_session_get_backend_build_id_async(s, Some(on_string), strings.user_data()),
                Status::Success
            );
            assert_eq!(strings.recv(), (Status::Success, Some("mock-2.0.0".to_string())));
            accel_session_free(s);
        }
    }

    #[test]
    fn arch_version_queries() {
        let loader = MockLoader::new();
        assert_eq!(arch_version_with("libAccelHtp.so", &loader), 75);

        let inbox = Inbox::<i32>::new();
        let status = arch_version_async_with(
            "libAccelHtp.so".into(),
            Arc::new(loader.clone()),
            on_arch,
            UserData::new(inbox.user_data()),
        );
        assert_eq!(status, Status::Success);
        assert_eq!(inbox.recv(), 75);

        loader.state().devices.clear();
        assert_eq!(arch_version_with("libAccelHtp.so", &loader), -1);
        assert_eq!(unsafe { accel_get_arch_version(ptr::null()) }, -1);
    }

    #[test]
    fn batch_helpers() {
        let (b, z, n) = export_batch(vec![vec![1u8, 2], vec![], vec![3]]);
        assert_eq!(n, 3);
        unsafe {
            assert_eq!(slice::from_raw_parts(z, n), &[2, 0, 1]);
            free_batch(b, z, n);
            free_batch::<u8>(ptr::null_mut(), ptr::null_mut(), 0);

            let a = [1.0f32];
            let ptrs = [a.as_ptr(), ptr::null()];
            let lens = [1, 0];
            let got = borrow_batch(ptrs.as_ptr(), lens.as_ptr(), 2).unwrap();
            assert_eq!(got, vec![&[1.0f32][..], &[][..]]);
            let lens = [1, 3];
            assert!(borrow_batch(ptrs.as_ptr(), lens.as_ptr(), 2).is_err());
            assert!(borrow_batch::<f32>(ptr::null(), ptr::null(), 1).is_err());
        }
    }
}
