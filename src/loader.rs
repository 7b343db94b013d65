// Native backend: vendor entry points resolved from shared libraries
// (feature `dynamic`) or linked at build time (feature `static-link`).
// Internal - sessions only see the `AcceleratorBackend` trait.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::Arc;

use crate::backend::{
    check, AcceleratorBackend, BackendHandle, BackendLoader, ContextHandle, DeviceHandle,
    GraphHandle, GraphInfo, HardwareDevice, LoadRequest, LogHandle, ModelSource, PowerConfigId,
    ProfileEvent, ProfileHandle, PropertySupport, VendorError, VendorResult,
};
use crate::bindings::NativeTensor;
use crate::error::Error;
use crate::ffi::*;
use crate::log::{LogLevel, Logger};
use crate::options::{
    BackendOption, DeviceOption, GraphOption, OptionList, PowerOption, RawConfigList,
};
use crate::tensor::{QuantParams, TensorInfo};

/// Entry points of the backend library. The first block is mandatory, the
/// rest may be missing from a given runtime build.
pub(crate) struct VendorFunctions {
    pub backend_create: FnBackendCreate,
    pub backend_free: FnBackendFree,
    pub context_create: FnContextCreate,
    pub context_free: FnContextFree,
    pub graph_finalize: FnGraphFinalize,
    pub graph_execute: FnGraphExecute,

    pub log_create: Option<FnLogCreate>,
    pub log_free: Option<FnLogFree>,
    pub backend_set_config: Option<FnBackendSetConfig>,
    pub backend_get_build_id: Option<FnBackendGetBuildId>,
    pub backend_register_op_package: Option<FnBackendRegisterOpPackage>,
    pub property_has_capability: Option<FnPropertyHasCapability>,
    pub device_create: Option<FnDeviceCreate>,
    pub device_free: Option<FnDeviceFree>,
    pub device_get_platform_info: Option<FnDeviceGetPlatformInfo>,
    pub device_free_platform_info: Option<FnDeviceFreePlatformInfo>,
    pub perf_create_power_config_id: Option<FnPerfCreatePowerConfigId>,
    pub perf_set_power_config: Option<FnPerfSetPowerConfig>,
    pub perf_destroy_power_config_id: Option<FnPerfDestroyPowerConfigId>,
    pub context_create_from_binary: Option<FnContextCreateFromBinary>,
    pub context_get_binary_size: Option<FnContextGetBinarySize>,
    pub context_get_binary: Option<FnContextGetBinary>,
    pub graph_set_config: Option<FnGraphSetConfig>,
    pub graph_retrieve: Option<FnGraphRetrieve>,
    pub profile_create: Option<FnProfileCreate>,
    pub profile_free: Option<FnProfileFree>,
    pub profile_get_events: Option<FnProfileGetEvents>,
    pub profile_get_sub_events: Option<FnProfileGetSubEvents>,
    pub profile_get_event_data: Option<FnProfileGetEventData>,
}

/// Entry points of a model library.
pub(crate) struct ModelFunctions {
    pub compose_graphs: FnComposeGraphs,
    pub free_graphs_info: FnFreeGraphsInfo,
}

/// Entry points of the system (introspection) library.
pub(crate) struct SystemFunctions {
    pub context_create: FnSystemContextCreate,
    pub get_binary_info: FnSystemContextGetBinaryInfo,
    pub context_free: FnSystemContextFree,
}

/// Loaded libraries, unloaded in reverse load order.
#[derive(Default)]
pub(crate) struct LibrarySet {
    #[cfg(feature = "dynamic")]
    libs: Vec<libloading::Library>,
}

impl LibrarySet {
    #[cfg(feature = "dynamic")]
    fn push(&mut self, lib: libloading::Library) {
        self.libs.push(lib);
    }
}

impl Drop for LibrarySet {
    fn drop(&mut self) {
        #[cfg(feature = "dynamic")]
        while let Some(lib) = self.libs.pop() {
            drop(lib);
        }
    }
}

/// [`AcceleratorBackend`] backed by real vendor entry points.
///
/// Field order matters: the function tables must not outlive the libraries,
/// so `_libraries` is declared (and dropped) last.
pub(crate) struct NativeBackend {
    funcs: VendorFunctions,
    model: Option<ModelFunctions>,
    system: Option<SystemFunctions>,
    _log_sink: Option<Arc<Logger>>,
    _libraries: LibrarySet,
}

// The vendor handles are plain pointers owned by the session; the runtime
// allows them to be used from any single thread at a time.
unsafe impl Send for NativeBackend {}

fn raw(h: usize) -> AccelHandle {
    h as AccelHandle
}

fn raw_opt(h: Option<usize>) -> AccelHandle {
    h.map(raw).unwrap_or(ptr::null_mut())
}

fn list_ptr(list: &RawConfigList) -> AccelConfigList {
    if list.is_empty() {
        ptr::null()
    } else {
        list.as_ptr()
    }
}

unsafe fn c_string(p: *const c_char) -> String {
    if p.is_null() {
        String::new()
    } else {
        CStr::from_ptr(p).to_string_lossy().into_owned()
    }
}

unsafe fn tensor_slice<'a>(p: *const AccelTensor, n: u32) -> &'a [AccelTensor] {
    if p.is_null() || n == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(p, n as usize)
    }
}

/// Copy vendor graph descriptors into owned values.
unsafe fn copy_graph_infos(infos: *const AccelGraphInfo, count: u32) -> Vec<GraphInfo> {
    if infos.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(infos, count as usize)
        .iter()
        .map(|g| GraphInfo {
            name: c_string(g.graph_name),
            handle: (!g.graph.is_null()).then(|| GraphHandle(g.graph as usize)),
            inputs: tensor_slice(g.input_tensors, g.num_input_tensors)
                .iter()
                .map(|t| TensorInfo::from_raw(t))
                .collect(),
            outputs: tensor_slice(g.output_tensors, g.num_output_tensors)
                .iter()
                .map(|t| TensorInfo::from_raw(t))
                .collect(),
        })
        .collect()
}

unsafe extern "C" fn log_trampoline(
    user_data: *mut c_void,
    level: u32,
    _timestamp: u64,
    message: *const c_char,
) {
    if user_data.is_null() || message.is_null() {
        return;
    }
    let logger = &*(user_data as *const Logger);
    let level = LogLevel::from_raw(level).unwrap_or(LogLevel::Debug);
    if logger.enabled(level) {
        logger.log_str(level, &CStr::from_ptr(message).to_string_lossy());
    }
}

/// Vendor tensor records for one execute call. Owns the names and
/// dimension arrays the records point at.
struct RawTensors {
    _names: Vec<CString>,
    _dims: Vec<Vec<u32>>,
    records: Vec<AccelTensor>,
}

impl RawTensors {
    fn new<'a>(
        tensors: impl Iterator<Item = (&'a TensorInfo, *mut c_void, usize)>,
        tensor_type: u32,
    ) -> VendorResult<Self> {
        let mut names = Vec::new();
        let mut dims = Vec::new();
        let mut records = Vec::new();
        for (info, data, size) in tensors {
            let name = CString::new(info.name.as_str()).unwrap_or_default();
            let mut d = info.dims.clone();
            // client buffers carry a 32-bit length
            let data_size = u32::try_from(size).map_err(|_| VendorError::Code {
                call: "accel_graph_execute",
                code: ACCEL_ERROR_INVALID_ARGUMENT,
            })?;
            records.push(AccelTensor {
                id: info.id,
                name: name.as_ptr(),
                tensor_type,
                data_type: info.data_type.code(),
                quantize_params: QuantParams::to_raw(info.quant),
                rank: d.len() as u32,
                dimensions: d.as_mut_ptr(),
                client_buf: AccelClientBuffer {
                    data,
                    data_size,
                },
            });
            names.push(name);
            dims.push(d);
        }
        Ok(Self {
            _names: names,
            _dims: dims,
            records,
        })
    }
}

impl NativeBackend {
    fn model(&self) -> VendorResult<&ModelFunctions> {
        self.model
            .as_ref()
            .ok_or(VendorError::Unavailable("accel_compose_graphs"))
    }

    fn system(&self) -> VendorResult<&SystemFunctions> {
        self.system
            .as_ref()
            .ok_or(VendorError::Unavailable("accel_system_context_create"))
    }

    fn event(&self, id: AccelProfileEventId) -> VendorResult<ProfileEvent> {
        let get_data = self
            .funcs
            .profile_get_event_data
            .ok_or(VendorError::Unavailable("accel_profile_get_event_data"))?;
        let mut data = AccelProfileEventData::zeroed();
        check("accel_profile_get_event_data", unsafe { get_data(id, &mut data) })?;

        let mut children = Vec::new();
        if let Some(get_sub) = self.funcs.profile_get_sub_events {
            let mut subs: *const AccelProfileEventId = ptr::null();
            let mut n = 0u32;
            check("accel_profile_get_sub_events", unsafe {
                get_sub(id, &mut subs, &mut n)
            })?;
            if !subs.is_null() {
                for &sub in unsafe { std::slice::from_raw_parts(subs, n as usize) } {
                    children.push(self.event(sub)?);
                }
            }
        }

        Ok(ProfileEvent {
            identifier: unsafe { c_string(data.identifier) },
            event_type: data.event_type,
            value: data.value,
            unit: data.unit,
            children,
        })
    }
}

impl AcceleratorBackend for NativeBackend {
    fn log_create(&mut self, logger: &Arc<Logger>, level: LogLevel) -> VendorResult<LogHandle> {
        let f = self
            .funcs
            .log_create
            .ok_or(VendorError::Unavailable("accel_log_create"))?;
        let mut handle: AccelHandle = ptr::null_mut();
        let user_data = Arc::as_ptr(logger) as *mut c_void;
        check("accel_log_create", unsafe {
            f(Some(log_trampoline), level as u32, user_data, &mut handle)
        })?;
        self._log_sink = Some(Arc::clone(logger));
        Ok(LogHandle(handle as usize))
    }

    fn log_free(&mut self, log: LogHandle) -> VendorResult<()> {
        let f = self
            .funcs
            .log_free
            .ok_or(VendorError::Unavailable("accel_log_free"))?;
        check("accel_log_free", unsafe { f(raw(log.0)) })?;
        self._log_sink = None;
        Ok(())
    }

    fn backend_create(
        &mut self,
        log: Option<LogHandle>,
        options: &OptionList<BackendOption>,
    ) -> VendorResult<BackendHandle> {
        let list = RawConfigList::from_backend(options).map_err(|_| VendorError::Code {
            call: "accel_backend_create",
            code: ACCEL_ERROR_INVALID_ARGUMENT,
        })?;
        let mut handle: AccelHandle = ptr::null_mut();
        check("accel_backend_create", unsafe {
            (self.funcs.backend_create)(raw_opt(log.map(|l| l.0)), list_ptr(&list), &mut handle)
        })?;
        Ok(BackendHandle(handle as usize))
    }

    fn backend_set_config(
        &mut self,
        backend: BackendHandle,
        options: &OptionList<BackendOption>,
    ) -> VendorResult<()> {
        let f = self
            .funcs
            .backend_set_config
            .ok_or(VendorError::Unavailable("accel_backend_set_config"))?;
        let list = RawConfigList::from_backend(options).map_err(|_| VendorError::Code {
            call: "accel_backend_set_config",
            code: ACCEL_ERROR_INVALID_ARGUMENT,
        })?;
        check("accel_backend_set_config", unsafe {
            f(raw(backend.0), list.as_ptr())
        })
    }

    fn backend_free(&mut self, backend: BackendHandle) -> VendorResult<()> {
        check("accel_backend_free", unsafe {
            (self.funcs.backend_free)(raw(backend.0))
        })
    }

    fn backend_build_id(&self) -> VendorResult<String> {
        let f = self
            .funcs
            .backend_get_build_id
            .ok_or(VendorError::Unavailable("accel_backend_get_build_id"))?;
        let mut id: *const c_char = ptr::null();
        check("accel_backend_get_build_id", unsafe { f(&mut id) })?;
        Ok(unsafe { c_string(id) })
    }

    fn register_op_package(
        &mut self,
        backend: BackendHandle,
        path: &str,
        provider: &str,
        target: Option<&str>,
    ) -> VendorResult<()> {
        let f = self
            .funcs
            .backend_register_op_package
            .ok_or(VendorError::Unavailable("accel_backend_register_op_package"))?;
        let bad = || VendorError::Code {
            call: "accel_backend_register_op_package",
            code: ACCEL_ERROR_INVALID_ARGUMENT,
        };
        let path = CString::new(path).map_err(|_| bad())?;
        let provider = CString::new(provider).map_err(|_| bad())?;
        let target = target.map(CString::new).transpose().map_err(|_| bad())?;
        check("accel_backend_register_op_package", unsafe {
            f(
                raw(backend.0),
                path.as_ptr(),
                provider.as_ptr(),
                target.as_ref().map(|t| t.as_ptr()).unwrap_or(ptr::null()),
            )
        })
    }

    fn property_has_capability(&self, key: u32) -> VendorResult<PropertySupport> {
        let f = self
            .funcs
            .property_has_capability
            .ok_or(VendorError::Unavailable("accel_property_has_capability"))?;
        match unsafe { f(key) } {
            ACCEL_SUCCESS => Ok(PropertySupport::Supported),
            ACCEL_PROPERTY_NOT_SUPPORTED => Ok(PropertySupport::NotSupported),
            ACCEL_PROPERTY_ERROR_UNKNOWN_KEY => Ok(PropertySupport::UnknownKey),
            code => Err(VendorError::Code {
                call: "accel_property_has_capability",
                code,
            }),
        }
    }

    fn platform_info(&mut self, log: Option<LogHandle>) -> VendorResult<Vec<HardwareDevice>> {
        let f = self
            .funcs
            .device_get_platform_info
            .ok_or(VendorError::Unavailable("accel_device_get_platform_info"))?;
        let log = raw_opt(log.map(|l| l.0));
        let mut info: *const AccelPlatformInfo = ptr::null();
        check("accel_device_get_platform_info", unsafe { f(log, &mut info) })?;
        if info.is_null() {
            return Ok(Vec::new());
        }
        let devices = unsafe {
            let info = &*info;
            if info.hw_devices.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts(info.hw_devices, info.num_hw_devices as usize)
                    .iter()
                    .map(HardwareDevice::from)
                    .collect()
            }
        };
        if let Some(free) = self.funcs.device_free_platform_info {
            check("accel_device_free_platform_info", unsafe { free(log, info) })?;
        }
        Ok(devices)
    }

    fn device_create(
        &mut self,
        log: Option<LogHandle>,
        options: &OptionList<DeviceOption>,
    ) -> VendorResult<DeviceHandle> {
        let f = self
            .funcs
            .device_create
            .ok_or(VendorError::Unavailable("accel_device_create"))?;
        let list = RawConfigList::from_device(options);
        let mut handle: AccelHandle = ptr::null_mut();
        check("accel_device_create", unsafe {
            f(raw_opt(log.map(|l| l.0)), list_ptr(&list), &mut handle)
        })?;
        Ok(DeviceHandle(handle as usize))
    }

    fn device_free(&mut self, device: DeviceHandle) -> VendorResult<()> {
        let f = self
            .funcs
            .device_free
            .ok_or(VendorError::Unavailable("accel_device_free"))?;
        check("accel_device_free", unsafe { f(raw(device.0)) })
    }

    fn power_config_create(&mut self, device_id: u32, core_id: u32) -> VendorResult<PowerConfigId> {
        let f = self
            .funcs
            .perf_create_power_config_id
            .ok_or(VendorError::Unavailable("accel_perf_create_power_config_id"))?;
        let mut id: AccelPowerConfigId = 0;
        check("accel_perf_create_power_config_id", unsafe {
            f(device_id, core_id, &mut id)
        })?;
        Ok(PowerConfigId(id))
    }

    fn power_config_set(
        &mut self,
        id: PowerConfigId,
        options: &OptionList<PowerOption>,
    ) -> VendorResult<()> {
        let f = self
            .funcs
            .perf_set_power_config
            .ok_or(VendorError::Unavailable("accel_perf_set_power_config"))?;
        let list = RawConfigList::from_power(options);
        check("accel_perf_set_power_config", unsafe { f(id.0, list.as_ptr()) })
    }

    fn power_config_destroy(&mut self, id: PowerConfigId) -> VendorResult<()> {
        let f = self
            .funcs
            .perf_destroy_power_config_id
            .ok_or(VendorError::Unavailable("accel_perf_destroy_power_config_id"))?;
        check("accel_perf_destroy_power_config_id", unsafe { f(id.0) })
    }

    fn context_create(
        &mut self,
        backend: BackendHandle,
        device: Option<DeviceHandle>,
    ) -> VendorResult<ContextHandle> {
        let mut handle: AccelHandle = ptr::null_mut();
        check("accel_context_create", unsafe {
            (self.funcs.context_create)(
                raw(backend.0),
                raw_opt(device.map(|d| d.0)),
                ptr::null(),
                &mut handle,
            )
        })?;
        Ok(ContextHandle(handle as usize))
    }

    fn context_create_from_binary(
        &mut self,
        backend: BackendHandle,
        device: Option<DeviceHandle>,
        binary: &[u8],
        profile: Option<ProfileHandle>,
    ) -> VendorResult<ContextHandle> {
        let f = self
            .funcs
            .context_create_from_binary
            .ok_or(VendorError::Unavailable("accel_context_create_from_binary"))?;
        let mut handle: AccelHandle = ptr::null_mut();
        check("accel_context_create_from_binary", unsafe {
            f(
                raw(backend.0),
                raw_opt(device.map(|d| d.0)),
                ptr::null(),
                binary.as_ptr() as *const c_void,
                binary.len() as u64,
                &mut handle,
                raw_opt(profile.map(|p| p.0)),
            )
        })?;
        Ok(ContextHandle(handle as usize))
    }

    fn context_binary_size(&mut self, context: ContextHandle) -> VendorResult<u64> {
        let f = self
            .funcs
            .context_get_binary_size
            .ok_or(VendorError::Unavailable("accel_context_get_binary_size"))?;
        let mut size = 0u64;
        check("accel_context_get_binary_size", unsafe {
            f(raw(context.0), &mut size)
        })?;
        Ok(size)
    }

    fn context_get_binary(&mut self, context: ContextHandle, buffer: &mut [u8]) -> VendorResult<u64> {
        let f = self
            .funcs
            .context_get_binary
            .ok_or(VendorError::Unavailable("accel_context_get_binary"))?;
        let mut written = 0u64;
        check("accel_context_get_binary", unsafe {
            f(
                raw(context.0),
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len() as u64,
                &mut written,
            )
        })?;
        Ok(written)
    }

    fn context_free(&mut self, context: ContextHandle, profile: Option<ProfileHandle>) -> VendorResult<()> {
        check("accel_context_free", unsafe {
            (self.funcs.context_free)(raw(context.0), raw_opt(profile.map(|p| p.0)))
        })
    }

    fn compose_graphs(
        &mut self,
        backend: BackendHandle,
        context: ContextHandle,
        debug: bool,
    ) -> VendorResult<Vec<GraphInfo>> {
        let model = self.model()?;
        let mut infos: *mut AccelGraphInfo = ptr::null_mut();
        let mut count = 0u32;
        let rc = unsafe {
            (model.compose_graphs)(
                raw(backend.0),
                raw(context.0),
                debug as u8,
                &mut infos,
                &mut count,
            )
        };
        if rc != 0 {
            return Err(VendorError::Code {
                call: "accel_compose_graphs",
                code: rc as u64,
            });
        }
        let graphs = unsafe { copy_graph_infos(infos, count) };
        let rc = unsafe { (model.free_graphs_info)(infos, count) };
        if rc != 0 {
            return Err(VendorError::Code {
                call: "accel_free_graphs_info",
                code: rc as u64,
            });
        }
        Ok(graphs)
    }

    fn binary_graph_info(&mut self, binary: &[u8]) -> VendorResult<Vec<GraphInfo>> {
        let sys = self.system()?;
        let mut sys_ctx: AccelHandle = ptr::null_mut();
        check("accel_system_context_create", unsafe {
            (sys.context_create)(&mut sys_ctx)
        })?;

        let mut info: *const AccelBinaryInfo = ptr::null();
        let rc = unsafe {
            (sys.get_binary_info)(
                sys_ctx,
                binary.as_ptr() as *const c_void,
                binary.len() as u64,
                &mut info,
            )
        };
        // The metadata belongs to the system context; copy before freeing it.
        let result = check("accel_system_context_get_binary_info", rc).and_then(|()| {
            if info.is_null() {
                return Err(VendorError::Code {
                    call: "accel_system_context_get_binary_info",
                    code: ACCEL_ERROR_INVALID_ARGUMENT,
                });
            }
            let mut graphs = unsafe { copy_graph_infos((*info).graphs, (*info).num_graphs) };
            for g in &mut graphs {
                g.handle = None;
            }
            Ok(graphs)
        });
        let freed = check("accel_system_context_free", unsafe {
            (sys.context_free)(sys_ctx)
        });
        let graphs = result?;
        freed?;
        Ok(graphs)
    }

    fn graph_retrieve(&mut self, context: ContextHandle, name: &str) -> VendorResult<GraphHandle> {
        let f = self
            .funcs
            .graph_retrieve
            .ok_or(VendorError::Unavailable("accel_graph_retrieve"))?;
        let name = CString::new(name).map_err(|_| VendorError::Code {
            call: "accel_graph_retrieve",
            code: ACCEL_ERROR_INVALID_ARGUMENT,
        })?;
        let mut handle: AccelHandle = ptr::null_mut();
        check("accel_graph_retrieve", unsafe {
            f(raw(context.0), name.as_ptr(), &mut handle)
        })?;
        Ok(GraphHandle(handle as usize))
    }

    fn graph_set_config(
        &mut self,
        graph: GraphHandle,
        options: &OptionList<GraphOption>,
    ) -> VendorResult<()> {
        let f = self
            .funcs
            .graph_set_config
            .ok_or(VendorError::Unavailable("accel_graph_set_config"))?;
        let list = RawConfigList::from_graph(options);
        check("accel_graph_set_config", unsafe { f(raw(graph.0), list.as_ptr()) })
    }

    fn graph_finalize(&mut self, graph: GraphHandle, profile: Option<ProfileHandle>) -> VendorResult<()> {
        check("accel_graph_finalize", unsafe {
            (self.funcs.graph_finalize)(raw(graph.0), raw_opt(profile.map(|p| p.0)))
        })
    }

    fn graph_execute(
        &mut self,
        graph: GraphHandle,
        inputs: &[NativeTensor],
        outputs: &mut [NativeTensor],
        profile: Option<ProfileHandle>,
    ) -> VendorResult<()> {
        let ins = RawTensors::new(
            inputs
                .iter()
                .map(|t| (t.info(), t.data().as_ptr() as *mut c_void, t.data().len())),
            ACCEL_TENSOR_TYPE_APP_WRITE,
        )?;
        let buffers: Vec<(*mut c_void, usize)> = outputs
            .iter_mut()
            .map(|t| (t.data_mut().as_mut_ptr() as *mut c_void, t.data().len()))
            .collect();
        let mut outs = RawTensors::new(
            outputs
                .iter()
                .zip(buffers)
                .map(|(t, (data, len))| (t.info(), data, len)),
            ACCEL_TENSOR_TYPE_APP_READ,
        )?;
        check("accel_graph_execute", unsafe {
            (self.funcs.graph_execute)(
                raw(graph.0),
                ins.records.as_ptr(),
                ins.records.len() as u32,
                outs.records.as_mut_ptr(),
                outs.records.len() as u32,
                raw_opt(profile.map(|p| p.0)),
            )
        })
    }

    fn profile_create(&mut self, backend: BackendHandle, level: u32) -> VendorResult<ProfileHandle> {
        let f = self
            .funcs
            .profile_create
            .ok_or(VendorError::Unavailable("accel_profile_create"))?;
        let mut handle: AccelHandle = ptr::null_mut();
        check("accel_profile_create", unsafe {
            f(raw(backend.0), level, &mut handle)
        })?;
        Ok(ProfileHandle(handle as usize))
    }

    fn profile_events(&mut self, profile: ProfileHandle) -> VendorResult<Vec<ProfileEvent>> {
        let f = self
            .funcs
            .profile_get_events
            .ok_or(VendorError::Unavailable("accel_profile_get_events"))?;
        let mut ids: *const AccelProfileEventId = ptr::null();
        let mut n = 0u32;
        check("accel_profile_get_events", unsafe {
            f(raw(profile.0), &mut ids, &mut n)
        })?;
        if ids.is_null() {
            return Ok(Vec::new());
        }
        let ids = unsafe { std::slice::from_raw_parts(ids, n as usize) }.to_vec();
        ids.into_iter().map(|id| self.event(id)).collect()
    }

    fn profile_free(&mut self, profile: ProfileHandle) -> VendorResult<()> {
        let f = self
            .funcs
            .profile_free
            .ok_or(VendorError::Unavailable("accel_profile_free"))?;
        check("accel_profile_free", unsafe { f(raw(profile.0)) })
    }
}

#[cfg(feature = "dynamic")]
mod dynamic {
    use super::*;
    use libloading::Library;
    use std::path::Path;

    fn open(path: &Path) -> Result<Library, Error> {
        unsafe { Library::new(path) }.map_err(|e| Error::LibraryNotFound {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    unsafe fn required<T: Copy>(lib: &Library, name: &str) -> Result<T, Error> {
        lib.get::<T>(name.as_bytes())
            .map(|sym| *sym)
            .map_err(|_| Error::SymbolNotFound(name.to_string()))
    }

    unsafe fn optional<T: Copy>(lib: &Library, name: &str) -> Option<T> {
        lib.get::<T>(name.as_bytes()).ok().map(|sym| *sym)
    }

    impl VendorFunctions {
        unsafe fn resolve(lib: &Library) -> Result<Self, Error> {
            Ok(Self {
                backend_create: required(lib, "accel_backend_create")?,
                backend_free: required(lib, "accel_backend_free")?,
                context_create: required(lib, "accel_context_create")?,
                context_free: required(lib, "accel_context_free")?,
                graph_finalize: required(lib, "accel_graph_finalize")?,
                graph_execute: required(lib, "accel_graph_execute")?,

                log_create: optional(lib, "accel_log_create"),
                log_free: optional(lib, "accel_log_free"),
                backend_set_config: optional(lib, "accel_backend_set_config"),
                backend_get_build_id: optional(lib, "accel_backend_get_build_id"),
                backend_register_op_package: optional(lib, "accel_backend_register_op_package"),
                property_has_capability: optional(lib, "accel_property_has_capability"),
                device_create: optional(lib, "accel_device_create"),
                device_free: optional(lib, "accel_device_free"),
                device_get_platform_info: optional(lib, "accel_device_get_platform_info"),
                device_free_platform_info: optional(lib, "accel_device_free_platform_info"),
                perf_create_power_config_id: optional(lib, "accel_perf_create_power_config_id"),
                perf_set_power_config: optional(lib, "accel_perf_set_power_config"),
                perf_destroy_power_config_id: optional(lib, "accel_perf_destroy_power_config_id"),
                context_create_from_binary: optional(lib, "accel_context_create_from_binary"),
                context_get_binary_size: optional(lib, "accel_context_get_binary_size"),
                context_get_binary: optional(lib, "accel_context_get_binary"),
                graph_set_config: optional(lib, "accel_graph_set_config"),
                graph_retrieve: optional(lib, "accel_graph_retrieve"),
                profile_create: optional(lib, "accel_profile_create"),
                profile_free: optional(lib, "accel_profile_free"),
                profile_get_events: optional(lib, "accel_profile_get_events"),
                profile_get_sub_events: optional(lib, "accel_profile_get_sub_events"),
                profile_get_event_data: optional(lib, "accel_profile_get_event_data"),
            })
        }
    }

    /// Loads the backend, model and system libraries with `dlopen`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct DynamicLoader;

    impl BackendLoader for DynamicLoader {
        fn load(
            &self,
            request: &LoadRequest,
            logger: &Arc<Logger>,
        ) -> Result<Box<dyn AcceleratorBackend>, Error> {
            let mut libraries = LibrarySet::default();

            let backend_lib = open(&request.backend_path)?;
            let funcs = unsafe { VendorFunctions::resolve(&backend_lib)? };
            libraries.push(backend_lib);
            accel_info!(logger, "loaded backend {}", request.backend_path.display());

            let mut model = None;
            let mut system = None;
            match &request.model {
                None => {}
                Some(ModelSource::Library(path)) => {
                    let lib = open(path)?;
                    model = Some(unsafe {
                        ModelFunctions {
                            compose_graphs: required(&lib, "accel_compose_graphs")?,
                            free_graphs_info: required(&lib, "accel_free_graphs_info")?,
                        }
                    });
                    libraries.push(lib);
                    accel_info!(logger, "loaded model library {}", path.display());
                }
                Some(ModelSource::CachedBinary(_)) => {
                    let path = request
                        .system_library
                        .as_deref()
                        .ok_or_else(|| Error::InvalidArgument("no system library for cached binary".into()))?;
                    let lib = open(path)?;
                    system = Some(unsafe {
                        SystemFunctions {
                            context_create: required(&lib, "accel_system_context_create")?,
                            get_binary_info: required(&lib, "accel_system_context_get_binary_info")?,
                            context_free: required(&lib, "accel_system_context_free")?,
                        }
                    });
                    libraries.push(lib);
                    accel_info!(logger, "loaded system library {}", path.display());
                }
            }

            Ok(Box::new(NativeBackend {
                funcs,
                model,
                system,
                _log_sink: None,
                _libraries: libraries,
            }))
        }
    }
}

#[cfg(feature = "dynamic")]
pub use dynamic::DynamicLoader;

#[cfg(feature = "static-link")]
mod linked {
    use super::*;

    extern "C" {
        fn accel_log_create(
            callback: Option<AccelLogCallback>,
            max_level: u32,
            user_data: *mut c_void,
            log: *mut AccelHandle,
        ) -> AccelErrorCode;
        fn accel_log_free(log: AccelHandle) -> AccelErrorCode;
        fn accel_backend_create(
            log: AccelHandle,
            config: AccelConfigList,
            backend: *mut AccelHandle,
        ) -> AccelErrorCode;
        fn accel_backend_set_config(backend: AccelHandle, config: AccelConfigList) -> AccelErrorCode;
        fn accel_backend_free(backend: AccelHandle) -> AccelErrorCode;
        fn accel_backend_get_build_id(id: *mut *const c_char) -> AccelErrorCode;
        fn accel_backend_register_op_package(
            backend: AccelHandle,
            path: *const c_char,
            provider: *const c_char,
            target: *const c_char,
        ) -> AccelErrorCode;
        fn accel_property_has_capability(key: u32) -> AccelErrorCode;
        fn accel_device_create(
            log: AccelHandle,
            config: AccelConfigList,
            device: *mut AccelHandle,
        ) -> AccelErrorCode;
        fn accel_device_free(device: AccelHandle) -> AccelErrorCode;
        fn accel_device_get_platform_info(
            log: AccelHandle,
            info: *mut *const AccelPlatformInfo,
        ) -> AccelErrorCode;
        fn accel_device_free_platform_info(
            log: AccelHandle,
            info: *const AccelPlatformInfo,
        ) -> AccelErrorCode;
        fn accel_perf_create_power_config_id(
            device_id: u32,
            core_id: u32,
            id: *mut AccelPowerConfigId,
        ) -> AccelErrorCode;
        fn accel_perf_set_power_config(id: AccelPowerConfigId, config: AccelConfigList) -> AccelErrorCode;
        fn accel_perf_destroy_power_config_id(id: AccelPowerConfigId) -> AccelErrorCode;
        fn accel_context_create(
            backend: AccelHandle,
            device: AccelHandle,
            config: AccelConfigList,
            context: *mut AccelHandle,
        ) -> AccelErrorCode;
        fn accel_context_create_from_binary(
            backend: AccelHandle,
            device: AccelHandle,
            config: AccelConfigList,
            buffer: *const c_void,
            size: u64,
            context: *mut AccelHandle,
            profile: AccelHandle,
        ) -> AccelErrorCode;
        fn accel_context_get_binary_size(context: AccelHandle, size: *mut u64) -> AccelErrorCode;
        fn accel_context_get_binary(
            context: AccelHandle,
            buffer: *mut c_void,
            size: u64,
            written: *mut u64,
        ) -> AccelErrorCode;
        fn accel_context_free(context: AccelHandle, profile: AccelHandle) -> AccelErrorCode;
        fn accel_graph_set_config(graph: AccelHandle, config: AccelConfigList) -> AccelErrorCode;
        fn accel_graph_finalize(graph: AccelHandle, profile: AccelHandle) -> AccelErrorCode;
        fn accel_graph_retrieve(
            context: AccelHandle,
            name: *const c_char,
            graph: *mut AccelHandle,
        ) -> AccelErrorCode;
        fn accel_graph_execute(
            graph: AccelHandle,
            inputs: *const AccelTensor,
            num_inputs: u32,
            outputs: *mut AccelTensor,
            num_outputs: u32,
            profile: AccelHandle,
        ) -> AccelErrorCode;
        fn accel_profile_create(backend: AccelHandle, level: u32, profile: *mut AccelHandle) -> AccelErrorCode;
        fn accel_profile_free(profile: AccelHandle) -> AccelErrorCode;
        fn accel_profile_get_events(
            profile: AccelHandle,
            events: *mut *const AccelProfileEventId,
            count: *mut u32,
        ) -> AccelErrorCode;
        fn accel_profile_get_sub_events(
            event: AccelProfileEventId,
            events: *mut *const AccelProfileEventId,
            count: *mut u32,
        ) -> AccelErrorCode;
        fn accel_profile_get_event_data(
            event: AccelProfileEventId,
            data: *mut AccelProfileEventData,
        ) -> AccelErrorCode;

        fn accel_compose_graphs(
            backend: AccelHandle,
            context: AccelHandle,
            debug: u8,
            graphs: *mut *mut AccelGraphInfo,
            count: *mut u32,
        ) -> u32;
        fn accel_free_graphs_info(graphs: *mut AccelGraphInfo, count: u32) -> u32;

        fn accel_system_context_create(context: *mut AccelHandle) -> AccelErrorCode;
        fn accel_system_context_get_binary_info(
            context: AccelHandle,
            buffer: *const c_void,
            size: u64,
            info: *mut *const AccelBinaryInfo,
        ) -> AccelErrorCode;
        fn accel_system_context_free(context: AccelHandle) -> AccelErrorCode;
    }

    /// Uses runtime symbols linked into the final binary. Library paths in
    /// the request are ignored.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct StaticLoader;

    impl BackendLoader for StaticLoader {
        fn load(
            &self,
            request: &LoadRequest,
            logger: &Arc<Logger>,
        ) -> Result<Box<dyn AcceleratorBackend>, Error> {
            let funcs = VendorFunctions {
                backend_create: accel_backend_create,
                backend_free: accel_backend_free,
                context_create: accel_context_create,
                context_free: accel_context_free,
                graph_finalize: accel_graph_finalize,
                graph_execute: accel_graph_execute,
                log_create: Some(accel_log_create),
                log_free: Some(accel_log_free),
                backend_set_config: Some(accel_backend_set_config),
                backend_get_build_id: Some(accel_backend_get_build_id),
                backend_register_op_package: Some(accel_backend_register_op_package),
                property_has_capability: Some(accel_property_has_capability),
                device_create: Some(accel_device_create),
                device_free: Some(accel_device_free),
                device_get_platform_info: Some(accel_device_get_platform_info),
                device_free_platform_info: Some(accel_device_free_platform_info),
                perf_create_power_config_id: Some(accel_perf_create_power_config_id),
                perf_set_power_config: Some(accel_perf_set_power_config),
                perf_destroy_power_config_id: Some(accel_perf_destroy_power_config_id),
                context_create_from_binary: Some(accel_context_create_from_binary),
                context_get_binary_size: Some(accel_context_get_binary_size),
                context_get_binary: Some(accel_context_get_binary),
                graph_set_config: Some(accel_graph_set_config),
                graph_retrieve: Some(accel_graph_retrieve),
                profile_create: Some(accel_profile_create),
                profile_free: Some(accel_profile_free),
                profile_get_events: Some(accel_profile_get_events),
                profile_get_sub_events: Some(accel_profile_get_sub_events),
                profile_get_event_data: Some(accel_profile_get_event_data),
            };
            let (model, system) = match &request.model {
                None => (None, None),
                Some(ModelSource::CachedBinary(_)) => {
                    let system = SystemFunctions {
                        context_create: accel_system_context_create,
                        get_binary_info: accel_system_context_get_binary_info,
                        context_free: accel_system_context_free,
                    };
                    (None, Some(system))
                }
                Some(ModelSource::Library(_)) => {
                    let model = ModelFunctions {
                        compose_graphs: accel_compose_graphs,
                        free_graphs_info: accel_free_graphs_info,
                    };
                    (Some(model), None)
                }
            };
            accel_info!(
                logger,
                "using linked runtime in place of {}",
                request.backend_path.display()
            );
            Ok(Box::new(NativeBackend {
                funcs,
                model,
                system,
                _log_sink: None,
                _libraries: LibrarySet::default(),
            }))
        }
    }
}

#[cfg(feature = "static-link")]
pub use linked::StaticLoader;

/// Loader selected by the enabled features. `static-link` takes precedence.
#[cfg(feature = "static-link")]
pub fn default_loader() -> Arc<dyn BackendLoader> {
    Arc::new(StaticLoader)
}

/// Loader selected by the enabled features. `static-link` takes precedence.
#[cfg(all(feature = "dynamic", not(feature = "static-link")))]
pub fn default_loader() -> Arc<dyn BackendLoader> {
    Arc::new(DynamicLoader)
}
