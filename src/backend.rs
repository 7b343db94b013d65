//! Capability interface over a vendor accelerator runtime.
//!
//! [`Session`](crate::Session) only talks to an [`AcceleratorBackend`]. How
//! the vendor code gets into the process is the job of a [`BackendLoader`]:
//! `dlopen` for the `dynamic` feature, link-time symbols for `static-link`,
//! or the in-process mock used by tests.
//!
//! Only the entry points every runtime must provide are required. Everything
//! else defaults to [`VendorError::Unavailable`], which the session reports
//! as a failure instead of crashing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bindings::NativeTensor;
use crate::error::Error;
use crate::ffi;
use crate::log::{LogLevel, Logger};
use crate::options::{BackendOption, DeviceOption, GraphOption, OptionList, PowerOption};
use crate::tensor::TensorInfo;

macro_rules! vendor_handle {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub usize);
        )+
    };
}

vendor_handle!(
    /// Vendor log object receiving runtime messages.
    LogHandle,
    BackendHandle,
    DeviceHandle,
    ContextHandle,
    GraphHandle,
    ProfileHandle,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PowerConfigId(pub u32);

/// Failure reported by a single vendor call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VendorError {
    #[error("vendor function {0} is not available")]
    Unavailable(&'static str),
    #[error("{call} failed (code {code})")]
    Code { call: &'static str, code: u64 },
}

pub type VendorResult<T> = Result<T, VendorError>;

pub(crate) fn check(call: &'static str, code: ffi::AccelErrorCode) -> VendorResult<()> {
    if code == ffi::ACCEL_SUCCESS {
        Ok(())
    } else {
        Err(VendorError::Code { call, code })
    }
}

/// A graph and the tensors it reads and writes.
///
/// The handle is only meaningful inside the context that produced it and is
/// not part of the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInfo {
    pub name: String,
    #[serde(skip)]
    pub handle: Option<GraphHandle>,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareDevice {
    pub device_id: u32,
    pub device_type: u32,
    pub soc_model: u32,
    pub arch_version: u32,
    pub vtcm_size_mb: u32,
    pub num_cores: u32,
}

impl From<&ffi::AccelHwDeviceInfo> for HardwareDevice {
    fn from(raw: &ffi::AccelHwDeviceInfo) -> Self {
        Self {
            device_id: raw.device_id,
            device_type: raw.device_type,
            soc_model: raw.soc_model,
            arch_version: raw.arch_version,
            vtcm_size_mb: raw.vtcm_size_mb,
            num_cores: raw.num_cores,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEvent {
    pub identifier: String,
    pub event_type: u32,
    pub value: u64,
    pub unit: u32,
    pub children: Vec<ProfileEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertySupport {
    Supported,
    NotSupported,
    UnknownKey,
}

/// One loaded accelerator runtime.
pub trait AcceleratorBackend: Send {
    fn log_create(&mut self, _logger: &Arc<Logger>, _level: LogLevel) -> VendorResult<LogHandle> {
        Err(VendorError::Unavailable("accel_log_create"))
    }

    fn log_free(&mut self, _log: LogHandle) -> VendorResult<()> {
        Err(VendorError::Unavailable("accel_log_free"))
    }

    fn backend_create(
        &mut self,
        log: Option<LogHandle>,
        options: &OptionList<BackendOption>,
    ) -> VendorResult<BackendHandle>;

    fn backend_set_config(
        &mut self,
        _backend: BackendHandle,
        _options: &OptionList<BackendOption>,
    ) -> VendorResult<()> {
        Err(VendorError::Unavailable("accel_backend_set_config"))
    }

    fn backend_free(&mut self, backend: BackendHandle) -> VendorResult<()>;

    fn backend_build_id(&self) -> VendorResult<String> {
        Err(VendorError::Unavailable("accel_backend_get_build_id"))
    }

    fn register_op_package(
        &mut self,
        _backend: BackendHandle,
        _path: &str,
        _provider: &str,
        _target: Option<&str>,
    ) -> VendorResult<()> {
        Err(VendorError::Unavailable("accel_backend_register_op_package"))
    }

    fn property_has_capability(&self, _key: u32) -> VendorResult<PropertySupport> {
        Err(VendorError::Unavailable("accel_property_has_capability"))
    }

    /// Hardware devices visible to the runtime.
    fn platform_info(&mut self, _log: Option<LogHandle>) -> VendorResult<Vec<HardwareDevice>> {
        Err(VendorError::Unavailable("accel_device_get_platform_info"))
    }

    fn device_create(
        &mut self,
        _log: Option<LogHandle>,
        _options: &OptionList<DeviceOption>,
    ) -> VendorResult<DeviceHandle> {
        Err(VendorError::Unavailable("accel_device_create"))
    }

    fn device_free(&mut self, _device: DeviceHandle) -> VendorResult<()> {
        Err(VendorError::Unavailable("accel_device_free"))
    }

    fn power_config_create(&mut self, _device_id: u32, _core_id: u32) -> VendorResult<PowerConfigId> {
        Err(VendorError::Unavailable("accel_perf_create_power_config_id"))
    }

    fn power_config_set(
        &mut self,
        _id: PowerConfigId,
        _options: &OptionList<PowerOption>,
    ) -> VendorResult<()> {
        Err(VendorError::Unavailable("accel_perf_set_power_config"))
    }

    fn power_config_destroy(&mut self, _id: PowerConfigId) -> VendorResult<()> {
        Err(VendorError::Unavailable("accel_perf_destroy_power_config_id"))
    }

    fn context_create(
        &mut self,
        backend: BackendHandle,
        device: Option<DeviceHandle>,
    ) -> VendorResult<ContextHandle>;

    fn context_create_from_binary(
        &mut self,
        _backend: BackendHandle,
        _device: Option<DeviceHandle>,
        _binary: &[u8],
        _profile: Option<ProfileHandle>,
    ) -> VendorResult<ContextHandle> {
        Err(VendorError::Unavailable("accel_context_create_from_binary"))
    }

    fn context_binary_size(&mut self, _context: ContextHandle) -> VendorResult<u64> {
        Err(VendorError::Unavailable("accel_context_get_binary_size"))
    }

    /// Serializes the context into `buffer`, returning the bytes written.
    fn context_get_binary(&mut self, _context: ContextHandle, _buffer: &mut [u8]) -> VendorResult<u64> {
        Err(VendorError::Unavailable("accel_context_get_binary"))
    }

    fn context_free(&mut self, context: ContextHandle, profile: Option<ProfileHandle>) -> VendorResult<()>;

    /// Builds the model's graphs inside `context`. Descriptors are copied out
    /// and the vendor's allocation is released before returning.
    fn compose_graphs(
        &mut self,
        backend: BackendHandle,
        context: ContextHandle,
        debug: bool,
    ) -> VendorResult<Vec<GraphInfo>>;

    /// Graph metadata stored in a serialized context, read through the
    /// system library. Returned graphs have no handle yet.
    fn binary_graph_info(&mut self, _binary: &[u8]) -> VendorResult<Vec<GraphInfo>> {
        Err(VendorError::Unavailable("accel_system_context_get_binary_info"))
    }

    fn graph_retrieve(&mut self, _context: ContextHandle, _name: &str) -> VendorResult<GraphHandle> {
        Err(VendorError::Unavailable("accel_graph_retrieve"))
    }

    fn graph_set_config(
        &mut self,
        _graph: GraphHandle,
        _options: &OptionList<GraphOption>,
    ) -> VendorResult<()> {
        Err(VendorError::Unavailable("accel_graph_set_config"))
    }

    fn graph_finalize(&mut self, graph: GraphHandle, profile: Option<ProfileHandle>) -> VendorResult<()>;

    fn graph_execute(
        &mut self,
        graph: GraphHandle,
        inputs: &[NativeTensor],
        outputs: &mut [NativeTensor],
        profile: Option<ProfileHandle>,
    ) -> VendorResult<()>;

    fn profile_create(&mut self, _backend: BackendHandle, _level: u32) -> VendorResult<ProfileHandle> {
        Err(VendorError::Unavailable("accel_profile_create"))
    }

    fn profile_events(&mut self, _profile: ProfileHandle) -> VendorResult<Vec<ProfileEvent>> {
        Err(VendorError::Unavailable("accel_profile_get_events"))
    }

    fn profile_free(&mut self, _profile: ProfileHandle) -> VendorResult<()> {
        Err(VendorError::Unavailable("accel_profile_free"))
    }
}

/// How the model argument of a session is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A shared library whose graphs are composed at startup.
    Library(PathBuf),
    /// A serialized context previously written by `save_binary`.
    CachedBinary(PathBuf),
}

impl ModelSource {
    /// A `.bin` suffix selects the cached-binary path.
    pub fn detect(path: &Path) -> Self {
        let is_binary = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(".bin"))
            .unwrap_or(false);
        if is_binary {
            ModelSource::CachedBinary(path.to_path_buf())
        } else {
            ModelSource::Library(path.to_path_buf())
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ModelSource::Library(p) | ModelSource::CachedBinary(p) => p,
        }
    }

    pub fn is_cached_binary(&self) -> bool {
        matches!(self, ModelSource::CachedBinary(_))
    }
}

/// File name of the introspection library shipped next to every backend.
pub const SYSTEM_LIBRARY_NAME: &str = "libAccelSystem.so";

/// What a loader has to bring into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub backend_path: PathBuf,
    /// `None` when only the backend itself is needed, e.g. for platform
    /// queries.
    pub model: Option<ModelSource>,
    /// Only set for cached binaries.
    pub system_library: Option<PathBuf>,
}

impl LoadRequest {
    pub fn new(backend_path: &Path, model_path: &Path) -> Self {
        let model = ModelSource::detect(model_path);
        let system_library = model.is_cached_binary().then(|| {
            backend_path
                .parent()
                .map(|dir| dir.join(SYSTEM_LIBRARY_NAME))
                .unwrap_or_else(|| PathBuf::from(SYSTEM_LIBRARY_NAME))
        });
        Self {
            backend_path: backend_path.to_path_buf(),
            model: Some(model),
            system_library,
        }
    }

    pub fn backend_only(backend_path: &Path) -> Self {
        Self {
            backend_path: backend_path.to_path_buf(),
            model: None,
            system_library: None,
        }
    }
}

/// Produces backends. Implementations decide where the symbols come from.
pub trait BackendLoader: Send + Sync {
    fn load(
        &self,
        request: &LoadRequest,
        logger: &Arc<Logger>,
    ) -> Result<Box<dyn AcceleratorBackend>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_model_source() {
        assert!(ModelSource::detect(Path::new("model.bin")).is_cached_binary());
        assert!(ModelSource::detect(Path::new("/data/ctx/model.bin")).is_cached_binary());
        assert!(!ModelSource::detect(Path::new("libmodel.so")).is_cached_binary());
        assert!(!ModelSource::detect(Path::new("model.bin.so")).is_cached_binary());
    }

    #[test]
    fn system_library_sits_next_to_backend() {
        let req = LoadRequest::new(Path::new("/opt/accel/libAccelHtp.so"), Path::new("m.bin"));
        assert_eq!(
            req.system_library,
            Some(PathBuf::from("/opt/accel/libAccelSystem.so"))
        );

        let req = LoadRequest::new(Path::new("libAccelGpu.so"), Path::new("model.bin"));
        assert_eq!(req.system_library, Some(PathBuf::from("libAccelSystem.so")));

        let req = LoadRequest::new(Path::new("libAccelGpu.so"), Path::new("libmodel.so"));
        assert_eq!(req.system_library, None);

        let req = LoadRequest::backend_only(Path::new("libAccelHtp.so"));
        assert!(req.model.is_none());
    }

    #[test]
    fn check_maps_codes() {
        assert_eq!(check("x", ffi::ACCEL_SUCCESS), Ok(()));
        assert_eq!(
            check("x", ffi::ACCEL_ERROR_SYSTEM),
            Err(VendorError::Code { call: "x", code: 1003 })
        );
    }
}
