//! The accelerator session.
//!
//! [`Session`] drives one model through the vendor lifecycle:
//!
//! ```text
//! Uninitialized -> BackendLoaded -> DeviceCreated? -> ContextReady -> Executable -> TornDown
//! ```
//!
//! [`Session::create`] runs the whole sequence. [`Session::load`] stops after
//! the libraries are in memory so every step can be driven by hand, which is
//! what the C API's discrete entry points do.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use accel_session::{default_loader, Logger, LogLevel, Session, SessionConfig};
//!
//! let config = SessionConfig::new("libAccelHtp.so", "libmobilenet.so");
//! let logger = Arc::new(Logger::with_tracing(LogLevel::Warn));
//! let mut session = Session::create(config, default_loader().as_ref(), logger)?;
//!
//! session.load_float_inputs(&[vec![0.0f32; 224 * 224 * 3]], 0)?;
//! session.execute_graphs()?;
//! let scores = session.get_float_outputs(0)?;
//! println!("{} outputs", scores.len());
//! # Ok::<(), accel_session::Error>(())
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::backend::{
    AcceleratorBackend, BackendHandle, BackendLoader, ContextHandle, DeviceHandle, GraphInfo,
    LoadRequest, LogHandle, ModelSource, PowerConfigId, ProfileEvent, ProfileHandle,
    PropertySupport, VendorError, VendorResult,
};
use crate::bindings::TensorBindings;
use crate::config::{InputDataType, SessionConfig};
use crate::error::Error;
use crate::ffi;
use crate::log::Logger;
use crate::options::{self, BackendFamily};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    BackendLoaded,
    DeviceCreated,
    ContextReady,
    Executable,
    TornDown,
}

/// An op package entry, written `path:interface_provider[:target]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpPackage {
    pub path: String,
    pub interface_provider: String,
    pub target: Option<String>,
}

impl FromStr for OpPackage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split(':').collect();
        let malformed = || Error::InvalidArgument(format!("malformed op package '{s}'"));
        match parts.as_slice() {
            [path, provider] if !path.is_empty() && !provider.is_empty() => Ok(Self {
                path: path.to_string(),
                interface_provider: provider.to_string(),
                target: None,
            }),
            [path, provider, target]
                if !path.is_empty() && !provider.is_empty() && !target.is_empty() =>
            {
                Ok(Self {
                    path: path.to_string(),
                    interface_provider: provider.to_string(),
                    target: Some(target.to_string()),
                })
            }
            _ => Err(malformed()),
        }
    }
}

/// A loaded accelerator runtime with one model.
///
/// Fields are declared in teardown order, so even without an explicit
/// [`teardown`](Self::teardown) the Rust-owned parts go away in the right
/// sequence. The backend (and with it every loaded library) is dropped last.
pub struct Session {
    bindings: Option<TensorBindings>,
    profile: Option<ProfileHandle>,
    context: Option<ContextHandle>,
    graphs: Vec<GraphInfo>,
    graphs_ready: bool,
    power_config: Option<PowerConfigId>,
    device: Option<DeviceHandle>,
    backend_handle: Option<BackendHandle>,
    log_handle: Option<LogHandle>,
    last_profile: Vec<ProfileEvent>,
    torn_down: bool,
    family: BackendFamily,
    model: ModelSource,
    config: SessionConfig,
    logger: Arc<Logger>,
    backend: Box<dyn AcceleratorBackend>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("family", &self.family)
            .field("model", &self.model)
            .field("graphs", &self.graphs.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Load the libraries and run the full [`initialize`](Self::initialize).
    ///
    /// # Errors
    ///
    /// - [`Error::LibraryNotFound`] / [`Error::SymbolNotFound`] if loading fails.
    /// - Whatever the first failing lifecycle step reports. Anything created
    ///   up to that point is torn down before returning.
    pub fn create(
        config: SessionConfig,
        loader: &dyn BackendLoader,
        logger: Arc<Logger>,
    ) -> Result<Self, Error> {
        let mut session = Self::load(config, loader, logger)?;
        session.initialize()?;
        Ok(session)
    }

    /// Bring the backend (and model or system library) into the process
    /// without creating any vendor objects.
    pub fn load(
        config: SessionConfig,
        loader: &dyn BackendLoader,
        logger: Arc<Logger>,
    ) -> Result<Self, Error> {
        config.enter_data_dir(&logger);
        let request = LoadRequest::new(&config.backend_path, &config.model_path);
        let model = ModelSource::detect(&config.model_path);
        let family = BackendFamily::detect(&config.backend_path.to_string_lossy());

        let backend = loader.load(&request, &logger).map_err(|e| {
            accel_error!(logger, "loading {}: {e}", config.backend_path.display());
            e
        })?;
        accel_info!(
            logger,
            "loaded {} ({:?} backend, {})",
            config.backend_path.display(),
            family,
            if model.is_cached_binary() { "cached binary" } else { "model library" }
        );

        Ok(Self {
            bindings: None,
            profile: None,
            context: None,
            graphs: Vec::new(),
            graphs_ready: false,
            power_config: None,
            device: None,
            backend_handle: None,
            log_handle: None,
            last_profile: Vec::new(),
            torn_down: false,
            family,
            model,
            config,
            logger,
            backend,
        })
    }

    /// Architecture version of the first accelerator the backend at
    /// `backend_path` reports. The backend is loaded on its own and unloaded
    /// again before returning.
    pub fn accelerator_arch(
        loader: &dyn BackendLoader,
        backend_path: &Path,
        logger: &Arc<Logger>,
    ) -> Result<u32, Error> {
        let mut backend = loader.load(&LoadRequest::backend_only(backend_path), logger)?;
        let devices = backend.platform_info(None).map_err(|e| {
            accel_error!(logger, "platform info: {e}");
            Error::from(e)
        })?;
        match devices.first() {
            Some(hw) => {
                accel_info!(logger, "soc model {} arch v{}", hw.soc_model, hw.arch_version);
                Ok(hw.arch_version)
            }
            None => Err(Error::Vendor {
                call: "accel_device_get_platform_info",
                code: ffi::ACCEL_ERROR_NOT_SUPPORTED,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        if self.torn_down {
            LifecycleState::TornDown
        } else if self.context.is_some() && self.graphs_ready {
            LifecycleState::Executable
        } else if self.context.is_some() {
            LifecycleState::ContextReady
        } else if self.device.is_some() {
            LifecycleState::DeviceCreated
        } else if self.backend_handle.is_some() {
            LifecycleState::BackendLoaded
        } else {
            LifecycleState::Uninitialized
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn family(&self) -> BackendFamily {
        self.family
    }

    pub fn model(&self) -> &ModelSource {
        &self.model
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    /// Replace the op package list used by
    /// [`register_op_packages`](Self::register_op_packages).
    pub fn set_op_packages(&mut self, packages: Vec<String>) {
        self.config.op_packages = packages;
    }

    pub fn graphs(&self) -> &[GraphInfo] {
        &self.graphs
    }

    /// Events collected by the most recent profiled step.
    pub fn last_profile(&self) -> &[ProfileEvent] {
        &self.last_profile
    }

    fn failed(&self, step: &str, e: impl Into<Error>) -> Error {
        let e = e.into();
        accel_error!(self.logger, "{step}: {e}");
        e
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.torn_down {
            Err(Error::InvalidState("session has been torn down"))
        } else {
            Ok(())
        }
    }

    fn backend_handle(&self) -> Result<BackendHandle, Error> {
        self.ensure_live()?;
        self.backend_handle
            .ok_or(Error::InvalidState("backend is not initialized"))
    }

    fn context_handle(&self) -> Result<ContextHandle, Error> {
        self.ensure_live()?;
        self.context.ok_or(Error::InvalidState("context is not created"))
    }

    /// The composite initialization run by [`create`](Self::create).
    ///
    /// Aborts at the first failing step; the error is logged by that step.
    /// NPU backends finish by voting for the configured power profile, which
    /// is best-effort: a failure there is logged and ignored.
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.create_log_handle();
        self.initialize_backend()?;
        if self.family == BackendFamily::Gpu {
            self.apply_backend_tuning();
        }
        if self.family == BackendFamily::Npu {
            self.create_device()?;
        }
        self.register_op_packages()?;
        self.initialize_profiling()?;
        if self.model.is_cached_binary() {
            self.create_from_binary()?;
        } else {
            self.create_context()?;
            self.compose_graphs()?;
            if self.family == BackendFamily::Npu {
                self.apply_graph_tuning();
            }
            self.finalize_graphs()?;
        }
        if self.family == BackendFamily::Npu && self.apply_power_profile().is_err() {
            accel_warn!(self.logger, "continuing without power profile");
        }
        accel_info!(self.logger, "session ready with {} graph(s)", self.graphs.len());
        Ok(())
    }

    /// Route vendor log messages to the session logger. Runtimes without a
    /// log entry point simply stay quiet.
    fn create_log_handle(&mut self) {
        if self.log_handle.is_some() {
            return;
        }
        match self.backend.log_create(&self.logger, self.config.log_level) {
            Ok(h) => self.log_handle = Some(h),
            Err(e) => accel_warn!(self.logger, "vendor logging disabled: {e}"),
        }
    }

    pub fn initialize_backend(&mut self) -> Result<(), Error> {
        self.ensure_live()?;
        if self.backend_handle.is_some() {
            return Err(Error::InvalidState("backend is already initialized"));
        }
        let handle = self
            .backend
            .backend_create(self.log_handle, &options::OptionList::empty())
            .map_err(|e| self.failed("backend create", e))?;
        self.backend_handle = Some(handle);
        if let Ok(id) = self.backend.backend_build_id() {
            accel_info!(self.logger, "backend build id: {id}");
        }
        Ok(())
    }

    fn apply_backend_tuning(&mut self) {
        let Some(backend) = self.backend_handle else {
            return;
        };
        let list = options::backend_options(self.family, &self.config.tuning);
        if list.is_empty() {
            return;
        }
        if let Err(e) = self.backend.backend_set_config(backend, &list) {
            accel_warn!(self.logger, "backend tuning not applied: {e}");
        }
    }

    pub fn terminate_backend(&mut self) -> Result<(), Error> {
        if self.context.is_some() {
            return Err(self.failed(
                "backend terminate",
                Error::InvalidState("context must be freed before the backend"),
            ));
        }
        let Some(handle) = self.backend_handle.take() else {
            return Ok(());
        };
        self.backend
            .backend_free(handle)
            .map_err(|e| self.failed("backend terminate", e))
    }

    pub fn backend_build_id(&self) -> Result<String, Error> {
        self.ensure_live()?;
        self.backend
            .backend_build_id()
            .map_err(|e| self.failed("backend build id", e))
    }

    /// Register every op package from the configuration.
    pub fn register_op_packages(&mut self) -> Result<(), Error> {
        let backend = self.backend_handle()?;
        let packages = self
            .config
            .op_packages
            .iter()
            .map(|s| s.parse::<OpPackage>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.failed("op package", e))?;
        for pkg in &packages {
            self.backend
                .register_op_package(
                    backend,
                    &pkg.path,
                    &pkg.interface_provider,
                    pkg.target.as_deref(),
                )
                .map_err(|e| self.failed("op package registration", e))?;
            accel_info!(
                self.logger,
                "registered op package {} ({})",
                pkg.path,
                pkg.interface_provider
            );
        }
        Ok(())
    }

    /// Whether the backend supports device objects.
    ///
    /// A runtime without the capability query is assumed to support them.
    pub fn is_device_property_supported(&self) -> Result<bool, Error> {
        self.ensure_live()?;
        match self
            .backend
            .property_has_capability(ffi::ACCEL_PROPERTY_GROUP_DEVICE)
        {
            Ok(PropertySupport::Supported) | Err(VendorError::Unavailable(_)) => Ok(true),
            Ok(PropertySupport::NotSupported) => {
                accel_warn!(self.logger, "device property is not supported");
                Ok(false)
            }
            Ok(PropertySupport::UnknownKey) => Err(self.failed(
                "device property",
                Error::Vendor {
                    call: "accel_property_has_capability",
                    code: ffi::ACCEL_PROPERTY_ERROR_UNKNOWN_KEY,
                },
            )),
            Err(e) => Err(self.failed("device property", e)),
        }
    }

    /// Create the device, tagged with the SoC model and arch of the first
    /// accelerator the platform reports.
    pub fn create_device(&mut self) -> Result<(), Error> {
        self.ensure_live()?;
        if self.device.is_some() {
            return Err(Error::InvalidState("device is already created"));
        }
        if !self.is_device_property_supported()? {
            return Ok(());
        }
        let devices = match self.backend.platform_info(self.log_handle) {
            Ok(d) => d,
            Err(e) => {
                accel_warn!(self.logger, "no platform info: {e}");
                Vec::new()
            }
        };
        for hw in &devices {
            accel_debug!(
                self.logger,
                "device {}: soc {} arch v{} vtcm {}MB cores {}",
                hw.device_id,
                hw.soc_model,
                hw.arch_version,
                hw.vtcm_size_mb,
                hw.num_cores
            );
        }
        let list = options::device_options(&devices);
        match self.backend.device_create(self.log_handle, &list) {
            Ok(h) => {
                self.device = Some(h);
                Ok(())
            }
            Err(e) if device_feature_missing(&e) => {
                accel_warn!(self.logger, "device create: {e}");
                Ok(())
            }
            Err(e) => Err(self.failed("device create", e)),
        }
    }

    /// Destroy the power configuration and the device.
    pub fn free_device(&mut self) -> Result<(), Error> {
        if self.context.is_some() {
            return Err(self.failed(
                "device free",
                Error::InvalidState("context must be freed before the device"),
            ));
        }
        if let Some(id) = self.power_config.take() {
            let r = self.backend.power_config_destroy(id);
            self.report_release("power config", r);
        }
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        match self.backend.device_free(device) {
            Ok(()) => Ok(()),
            Err(e) if device_feature_missing(&e) => {
                accel_warn!(self.logger, "device free: {e}");
                Ok(())
            }
            Err(e) => Err(self.failed("device free", e)),
        }
    }

    /// Create the configured power profile and vote for it.
    pub fn apply_power_profile(&mut self) -> Result<(), Error> {
        self.ensure_live()?;
        let id = match self.power_config {
            Some(id) => id,
            None => {
                let id = self
                    .backend
                    .power_config_create(0, 0)
                    .map_err(|e| self.failed("power config create", e))?;
                self.power_config = Some(id);
                id
            }
        };
        let list = options::power_options(id, &self.config.tuning.power);
        self.backend
            .power_config_set(id, &list)
            .map_err(|e| self.failed("power config set", e))
    }

    pub fn initialize_profiling(&mut self) -> Result<(), Error> {
        let backend = self.backend_handle()?;
        let Some(level) = self.config.profiling.code() else {
            return Ok(());
        };
        if self.profile.is_some() {
            return Ok(());
        }
        let handle = self
            .backend
            .profile_create(backend, level)
            .map_err(|e| self.failed("profiling", e))?;
        self.profile = Some(handle);
        Ok(())
    }

    fn collect_profile(&mut self, stage: &str) {
        let Some(profile) = self.profile else {
            return;
        };
        match self.backend.profile_events(profile) {
            Ok(events) => {
                log_events(&self.logger, stage, &events, 0);
                self.last_profile = events;
            }
            Err(e) => accel_warn!(self.logger, "profile events after {stage}: {e}"),
        }
    }

    pub fn create_context(&mut self) -> Result<(), Error> {
        let backend = self.backend_handle()?;
        if self.context.is_some() {
            return Err(Error::InvalidState("context is already created"));
        }
        let ctx = self
            .backend
            .context_create(backend, self.device)
            .map_err(|e| self.failed("context create", e))?;
        self.context = Some(ctx);
        Ok(())
    }

    pub fn compose_graphs(&mut self) -> Result<(), Error> {
        if self.model.is_cached_binary() {
            return Err(self.failed(
                "graph compose",
                Error::InvalidState("cached binaries are loaded with create_from_binary"),
            ));
        }
        let backend = self.backend_handle()?;
        let ctx = self.context_handle()?;
        let graphs = self
            .backend
            .compose_graphs(backend, ctx, self.config.debug)
            .map_err(|e| self.failed("graph compose", e))?;
        for g in &graphs {
            accel_debug!(
                self.logger,
                "graph '{}': {} input(s), {} output(s)",
                g.name,
                g.inputs.len(),
                g.outputs.len()
            );
        }
        self.bindings = None;
        self.graphs = graphs;
        self.graphs_ready = false;
        Ok(())
    }

    fn apply_graph_tuning(&mut self) {
        let list = options::graph_options(&self.config.tuning);
        for graph in &self.graphs {
            let Some(handle) = graph.handle else { continue };
            if let Err(e) = self.backend.graph_set_config(handle, &list) {
                accel_warn!(self.logger, "graph '{}' tuning not applied: {e}", graph.name);
            }
        }
    }

    pub fn finalize_graphs(&mut self) -> Result<(), Error> {
        self.context_handle()?;
        for graph in &self.graphs {
            let handle = graph
                .handle
                .ok_or(Error::InvalidState("graph has no handle"))?;
            if let Err(e) = self.backend.graph_finalize(handle, self.profile) {
                let e = Error::from(e);
                accel_error!(self.logger, "graph '{}' finalize: {e}", graph.name);
                return Err(e);
            }
        }
        self.graphs_ready = true;
        self.collect_profile("finalize");
        Ok(())
    }

    /// Build the context from the cached binary at the model path.
    ///
    /// Graph descriptors are read from the blob through the system library,
    /// then each graph is retrieved from the new context by name. If a step
    /// fails, the descriptors collected so far are discarded; a context that
    /// was already created stays owned by the session and is released on
    /// teardown.
    pub fn create_from_binary(&mut self) -> Result<(), Error> {
        let backend = self.backend_handle()?;
        if self.context.is_some() {
            return Err(Error::InvalidState("context is already created"));
        }
        let path = self.model.path().to_path_buf();
        let buffer = std::fs::read(&path).map_err(|e| self.failed("binary read", e))?;
        if buffer.is_empty() {
            return Err(self.failed("binary read", Error::EmptyBinary(path)));
        }

        let mut graphs = self
            .backend
            .binary_graph_info(&buffer)
            .map_err(|e| self.failed("binary graph info", e))?;
        let ctx = self
            .backend
            .context_create_from_binary(backend, self.device, &buffer, self.profile)
            .map_err(|e| self.failed("context from binary", e))?;
        self.context = Some(ctx);

        for graph in &mut graphs {
            let handle = self
                .backend
                .graph_retrieve(ctx, &graph.name)
                .map_err(|e| {
                    let e = Error::from(e);
                    accel_error!(self.logger, "graph '{}' retrieve: {e}", graph.name);
                    e
                })?;
            graph.handle = Some(handle);
        }

        accel_info!(
            self.logger,
            "restored {} graph(s) from {}",
            graphs.len(),
            path.display()
        );
        self.bindings = None;
        self.graphs = graphs;
        self.graphs_ready = true;
        self.collect_profile("binary load");
        Ok(())
    }

    /// Serialize the context to `<dir>/<name>.bin` and return the path.
    pub fn save_binary(&mut self, dir: &Path, name: &str) -> Result<PathBuf, Error> {
        let ctx = self.context_handle()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument("binary name is empty".into()));
        }
        let size = self
            .backend
            .context_binary_size(ctx)
            .map_err(|e| self.failed("binary size", e))?;
        let allocated = usize::try_from(size).map_err(|_| Error::OutOfMemory)?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(allocated)
            .map_err(|_| Error::OutOfMemory)?;
        buffer.resize(allocated, 0);

        let written = self
            .backend
            .context_get_binary(ctx, &mut buffer)
            .map_err(|e| self.failed("binary serialize", e))?;
        if written > size {
            return Err(self.failed(
                "binary serialize",
                Error::BinaryOverflow {
                    written,
                    allocated: size,
                },
            ));
        }
        buffer.truncate(written as usize);

        std::fs::create_dir_all(dir).map_err(|e| self.failed("binary write", e))?;
        let path = dir.join(format!("{name}.bin"));
        std::fs::write(&path, &buffer).map_err(|e| self.failed("binary write", e))?;
        accel_info!(self.logger, "wrote {} bytes to {}", buffer.len(), path.display());
        Ok(path)
    }

    /// Release the context along with the tensor bindings that refer to it.
    pub fn free_context(&mut self) -> Result<(), Error> {
        self.bindings = None;
        self.graphs_ready = false;
        let Some(ctx) = self.context.take() else {
            return Ok(());
        };
        self.backend
            .context_free(ctx, self.profile)
            .map_err(|e| self.failed("context free", e))
    }

    /// Drop the graph descriptors. Handles become meaningless once the
    /// context is gone, so this is mostly useful after `free_context`.
    pub fn free_graphs(&mut self) {
        self.bindings = None;
        self.graphs.clear();
        self.graphs_ready = false;
    }

    fn graph(&self, index: usize) -> Result<&GraphInfo, Error> {
        self.graphs.get(index).ok_or(Error::InvalidIndex {
            requested: index,
            available: self.graphs.len(),
        })
    }

    /// Make sure the persistent tensors belong to `index`, replacing the
    /// previous graph's tensors if needed.
    fn bind(&mut self, index: usize) -> Result<&mut TensorBindings, Error> {
        if self.bindings.as_ref().map(TensorBindings::graph_index) != Some(index) {
            self.bindings = None;
            let bound = TensorBindings::for_graph(index, self.graph(index)?)?;
            accel_debug!(self.logger, "bound tensors for graph {index}");
            self.bindings = Some(bound);
        }
        self.bindings
            .as_mut()
            .ok_or(Error::TensorsNotBound(index))
    }

    fn check_inputs(&self, count: usize, index: usize) -> Result<(), Error> {
        self.ensure_live()?;
        let required = self.graph(index)?.inputs.len();
        if !self.graphs_ready {
            return Err(Error::InvalidState("graphs are not finalized"));
        }
        if count < required {
            return Err(Error::InvalidArgument(format!(
                "graph {index} needs {required} input(s), got {count}"
            )));
        }
        Ok(())
    }

    /// Copy one float array per input tensor of graph `index` into the
    /// persistent tensors, converting to each tensor's native type.
    ///
    /// The argument count is checked before any tensor is touched. A failure
    /// on a later tensor leaves the earlier ones already written.
    pub fn load_float_inputs<I: AsRef<[f32]>>(
        &mut self,
        inputs: &[I],
        index: usize,
    ) -> Result<(), Error> {
        if self.config.input_data_type != InputDataType::Float {
            return Err(self.failed(
                "load inputs",
                Error::InvalidArgument("session is configured for native inputs".into()),
            ));
        }
        self.check_inputs(inputs.len(), index)
            .map_err(|e| self.failed("load inputs", e))?;
        let result = self.bind(index).and_then(|b| {
            b.inputs
                .iter_mut()
                .zip(inputs)
                .try_for_each(|(tensor, values)| tensor.load_f32(values.as_ref()))
        });
        result.map_err(|e| self.failed("load inputs", e))
    }

    /// Like [`load_float_inputs`](Self::load_float_inputs) for buffers that
    /// are already in the native format.
    pub fn load_native_inputs<I: AsRef<[u8]>>(
        &mut self,
        inputs: &[I],
        index: usize,
    ) -> Result<(), Error> {
        if self.config.input_data_type != InputDataType::Native {
            return Err(self.failed(
                "load inputs",
                Error::InvalidArgument("session is configured for float inputs".into()),
            ));
        }
        self.check_inputs(inputs.len(), index)
            .map_err(|e| self.failed("load inputs", e))?;
        let result = self.bind(index).and_then(|b| {
            b.inputs
                .iter_mut()
                .zip(inputs)
                .try_for_each(|(tensor, bytes)| tensor.load_bytes(bytes.as_ref()))
        });
        result.map_err(|e| self.failed("load inputs", e))
    }

    fn bound(&self, index: usize) -> Result<&TensorBindings, Error> {
        self.ensure_live()?;
        self.graph(index)?;
        self.bindings
            .as_ref()
            .filter(|b| b.graph_index() == index)
            .ok_or(Error::TensorsNotBound(index))
    }

    /// Fresh float copies of every output of graph `index`.
    ///
    /// Requires that inputs were loaded for the same index; outputs are never
    /// bound implicitly.
    pub fn get_float_outputs(&self, index: usize) -> Result<Vec<Vec<f32>>, Error> {
        if !self.config.output_data_type.allows_float() {
            return Err(self.failed(
                "get outputs",
                Error::InvalidArgument("session does not produce float outputs".into()),
            ));
        }
        self.bound(index)
            .and_then(|b| b.outputs().iter().map(|t| t.to_f32()).collect())
            .map_err(|e| self.failed("get outputs", e))
    }

    pub fn get_native_outputs(&self, index: usize) -> Result<Vec<Vec<u8>>, Error> {
        if !self.config.output_data_type.allows_native() {
            return Err(self.failed(
                "get outputs",
                Error::InvalidArgument("session does not produce native outputs".into()),
            ));
        }
        self.bound(index)
            .map(|b| b.outputs().iter().map(|t| t.data().to_vec()).collect())
            .map_err(|e| self.failed("get outputs", e))
    }

    /// Run the session's graph once on the bound tensors.
    ///
    /// Only single-graph models are supported.
    pub fn execute_graphs(&mut self) -> Result<(), Error> {
        self.ensure_live()?;
        if self.graphs.len() != 1 {
            return Err(self.failed("execute", Error::UnsupportedGraphCount(self.graphs.len())));
        }
        let handle = self.graphs[0]
            .handle
            .ok_or(Error::InvalidState("graph has no handle"))?;
        if self.bindings.as_ref().map(TensorBindings::graph_index) != Some(0) {
            return Err(self.failed("execute", Error::TensorsNotBound(0)));
        }
        let Some(bindings) = self.bindings.as_mut() else {
            return Err(Error::TensorsNotBound(0));
        };
        let result = self.backend.graph_execute(
            handle,
            &bindings.inputs,
            &mut bindings.outputs,
            self.profile,
        );
        result.map_err(|e| self.failed("execute", e))?;
        self.collect_profile("execute");
        Ok(())
    }

    fn report_release(&self, what: &str, result: VendorResult<()>) {
        match result {
            Ok(()) => {}
            Err(VendorError::Unavailable(call)) => {
                accel_debug!(self.logger, "{what}: {call} not available, skipped")
            }
            Err(e) => accel_error!(self.logger, "{what} release: {e}"),
        }
    }

    /// Release every vendor object in reverse dependency order: tensors,
    /// profile, context, power config, device, backend, log.
    ///
    /// Failures are logged and do not stop the sequence. Calling this twice
    /// is a no-op. Libraries stay mapped until the session is dropped.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.bindings = None;
        self.graphs_ready = false;
        if let Some(p) = self.profile.take() {
            let r = self.backend.profile_free(p);
            self.report_release("profile", r);
        }
        if let Some(ctx) = self.context.take() {
            let r = self.backend.context_free(ctx, None);
            self.report_release("context", r);
        }
        self.graphs.clear();
        if let Some(id) = self.power_config.take() {
            let r = self.backend.power_config_destroy(id);
            self.report_release("power config", r);
        }
        if let Some(dev) = self.device.take() {
            match self.backend.device_free(dev) {
                Err(e) if device_feature_missing(&e) => {}
                r => self.report_release("device", r),
            }
        }
        if let Some(b) = self.backend_handle.take() {
            let r = self.backend.backend_free(b);
            self.report_release("backend", r);
        }
        if let Some(l) = self.log_handle.take() {
            let r = self.backend.log_free(l);
            self.report_release("log", r);
        }
        self.torn_down = true;
        accel_debug!(self.logger, "session torn down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn device_feature_missing(e: &VendorError) -> bool {
    matches!(
        e,
        VendorError::Unavailable(_)
            | VendorError::Code {
                code: ffi::ACCEL_DEVICE_ERROR_UNSUPPORTED_FEATURE,
                ..
            }
    )
}

fn log_events(logger: &Logger, stage: &str, events: &[ProfileEvent], depth: usize) {
    for ev in events {
        accel_debug!(
            logger,
            "[{stage}] {:indent$}{}: {} (type {}, unit {})",
            "",
            ev.identifier,
            ev.value,
            ev.event_type,
            ev.unit,
            indent = depth * 2
        );
        log_events(logger, stage, &ev.children, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{OutputDataType, ProfilingLevel};
    use crate::error::Status;
    use crate::log::LogLevel;
    use crate::mock::MockLoader;

    fn capture() -> (Arc<Logger>, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let logger = Logger::new(
            Arc::new(move |level: LogLevel, _: u64, msg: &str| {
                sink.lock().unwrap().push(format!("{level}: {msg}"));
            }),
            LogLevel::Debug,
        );
        (Arc::new(logger), lines)
    }

    fn quiet() -> Arc<Logger> {
        Arc::new(Logger::with_tracing(LogLevel::Error))
    }

    fn npu() -> SessionConfig {
        SessionConfig::new("libAccelHtp.so", "libmodel.so")
    }

    #[test]
    fn op_package_parsing() {
        let p: OpPackage = "libOps.so:OpsProvider".parse().unwrap();
        assert_eq!(p.path, "libOps.so");
        assert_eq!(p.interface_provider, "OpsProvider");
        assert_eq!(p.target, None);
        let p: OpPackage = "libOps.so:OpsProvider:CPU".parse().unwrap();
        assert_eq!(p.target.as_deref(), Some("CPU"));
        assert!("libOps.so".parse::<OpPackage>().is_err());
        assert!("a:b:c:d".parse::<OpPackage>().is_err());
        assert!(":b".parse::<OpPackage>().is_err());
    }

    #[test]
    fn create_runs_npu_lifecycle() {
        let loader = MockLoader::new();
        let session = Session::create(npu(), &loader, quiet()).unwrap();
        assert_eq!(session.state(), LifecycleState::Executable);
        assert_eq!(session.family(), BackendFamily::Npu);
        assert_eq!(session.graphs().len(), 1);

        let calls = loader.calls();
        let expected = [
            "load libAccelHtp.so",
            "load libmodel.so",
            "accel_log_create",
            "accel_backend_create",
            "accel_backend_get_build_id",
            "accel_property_has_capability",
            "accel_device_get_platform_info",
            "accel_device_create",
            "accel_context_create",
            "accel_compose_graphs",
            "accel_graph_set_config",
            "accel_graph_finalize",
            "accel_perf_create_power_config_id",
            "accel_perf_set_power_config",
        ];
        assert_eq!(calls, expected);

        let state = loader.state();
        assert_eq!(state.device_options[0].len(), 2);
        assert_eq!(state.graph_options[0].len(), 5);
        assert_eq!(state.power_options[0].len(), 4);
    }

    #[test]
    fn gpu_gets_backend_tuning_and_no_device() {
        let loader = MockLoader::new();
        let config = SessionConfig::new("libAccelGpu.so", "libmodel.so");
        let session = Session::create(config, &loader, quiet()).unwrap();
        assert_eq!(session.state(), LifecycleState::Executable);
        let calls = loader.calls();
        assert!(calls.iter().any(|c| c == "accel_backend_set_config"));
        assert!(!calls.iter().any(|c| c == "accel_device_create"));
        assert!(!calls.iter().any(|c| c == "accel_graph_set_config"));
        assert!(!calls.iter().any(|c| c.starts_with("accel_perf")));
    }

    #[test]
    fn teardown_order_and_idempotence() {
        let loader = MockLoader::new();
        let mut config = npu();
        config.profiling = ProfilingLevel::Basic;
        let mut session = Session::create(config, &loader, quiet()).unwrap();
        session.load_float_inputs(&[vec![0.0f32; 4]], 0).unwrap();
        let before = loader.calls().len();

        session.teardown();
        session.teardown();
        assert_eq!(session.state(), LifecycleState::TornDown);
        let calls = loader.calls();
        assert_eq!(
            &calls[before..],
            [
                "accel_profile_free",
                "accel_context_free",
                "accel_perf_destroy_power_config_id",
                "accel_device_free",
                "accel_backend_free",
                "accel_log_free",
            ]
        );

        drop(session);
        assert_eq!(loader.calls().last().map(String::as_str), Some("unload"));
    }

    #[test]
    fn teardown_after_partial_session() {
        let loader = MockLoader::new();
        let mut session = Session::load(npu(), &loader, quiet()).unwrap();
        assert_eq!(session.state(), LifecycleState::Uninitialized);
        session.initialize_backend().unwrap();
        assert_eq!(session.state(), LifecycleState::BackendLoaded);
        session.teardown();
        drop(session);
        let calls = loader.calls();
        assert_eq!(&calls[calls.len() - 2..], ["accel_backend_free", "unload"]);
    }

    #[test]
    fn teardown_keeps_going_after_failures() {
        let loader = MockLoader::new();
        loader.fail("accel_context_free", 1003);
        loader.fail("accel_backend_free", 1003);
        let (logger, lines) = capture();
        let mut session = Session::create(npu(), &loader, logger).unwrap();
        session.teardown();
        let calls = loader.calls();
        assert!(calls.iter().any(|c| c == "accel_log_free"));
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("context release")));
        assert!(lines.iter().any(|l| l.contains("backend release")));
    }

    #[test]
    fn failing_step_aborts_and_logs() {
        let loader = MockLoader::new();
        loader.fail("accel_graph_finalize", 1000);
        let (logger, lines) = capture();
        let err = Session::create(npu(), &loader, logger).unwrap_err();
        assert_eq!(Status::from(&err), Status::FeatureUnsupported);
        assert!(lines
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("ERROR") && l.contains("finalize")));
        // the partially built session was torn down on the way out
        let calls = loader.calls();
        assert!(calls.iter().any(|c| c == "accel_context_free"));
        assert_eq!(calls.last().map(String::as_str), Some("unload"));
    }

    #[test]
    fn missing_symbol_is_system_error() {
        let loader = MockLoader::new();
        loader.state().missing_symbol = Some("accel_graph_execute".into());
        let err = Session::create(npu(), &loader, quiet()).unwrap_err();
        assert_eq!(Status::from(&err), Status::SystemError);
    }

    #[test]
    fn missing_optional_function_is_failure() {
        let loader = MockLoader::new();
        loader.remove("accel_profile_create");
        let mut config = npu();
        config.profiling = ProfilingLevel::Detailed;
        let err = Session::create(config, &loader, quiet()).unwrap_err();
        assert!(matches!(err, Error::FunctionUnavailable("accel_profile_create")));
        assert_eq!(Status::from(&err), Status::Failure);
    }

    #[test]
    fn device_unsupported_is_tolerated() {
        let loader = MockLoader::new();
        loader.fail("accel_device_create", ffi::ACCEL_DEVICE_ERROR_UNSUPPORTED_FEATURE);
        let session = Session::create(npu(), &loader, quiet()).unwrap();
        assert_eq!(session.state(), LifecycleState::Executable);
    }

    #[test]
    fn device_property_answers() {
        let loader = MockLoader::new();
        let session = Session::load(npu(), &loader, quiet()).unwrap();
        assert!(session.is_device_property_supported().unwrap());

        loader.state().property = PropertySupport::NotSupported;
        assert!(!session.is_device_property_supported().unwrap());

        loader.state().property = PropertySupport::UnknownKey;
        assert!(session.is_device_property_supported().is_err());

        loader.remove("accel_property_has_capability");
        assert!(session.is_device_property_supported().unwrap());
    }

    #[test]
    fn ordering_rules_for_discrete_steps() {
        let loader = MockLoader::new();
        let mut session = Session::load(npu(), &loader, quiet()).unwrap();
        assert!(session.create_context().is_err());
        session.initialize_backend().unwrap();
        assert!(session.initialize_backend().is_err());
        session.create_device().unwrap();
        assert_eq!(session.state(), LifecycleState::DeviceCreated);
        session.create_context().unwrap();
        assert_eq!(session.state(), LifecycleState::ContextReady);
        assert!(session.terminate_backend().is_err());
        assert!(session.free_device().is_err());
        session.compose_graphs().unwrap();
        session.finalize_graphs().unwrap();
        assert_eq!(session.state(), LifecycleState::Executable);
        session.free_context().unwrap();
        session.free_graphs();
        session.free_device().unwrap();
        session.terminate_backend().unwrap();
        assert_eq!(session.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn op_packages_are_registered() {
        let loader = MockLoader::new();
        let mut config = npu();
        config.op_packages = vec!["libA.so:ProvA".into(), "libB.so:ProvB:HTP".into()];
        Session::create(config, &loader, quiet()).unwrap();
        let state = loader.state();
        assert_eq!(state.op_packages.len(), 2);
        assert_eq!(state.op_packages[1].2.as_deref(), Some("HTP"));
    }

    #[test]
    fn malformed_op_package_fails() {
        let loader = MockLoader::new();
        let mut config = npu();
        config.op_packages = vec!["libA.so".into()];
        let err = Session::create(config, &loader, quiet()).unwrap_err();
        assert_eq!(Status::from(&err), Status::Failure);
    }

    #[test]
    fn inference_round() {
        let loader = MockLoader::new();
        let mut config = npu();
        config.output_data_type = OutputDataType::FloatAndNative;
        let mut session = Session::create(config, &loader, quiet()).unwrap();

        session.load_float_inputs(&[[1.0f32, 2.0, 3.0, 4.0]], 0).unwrap();
        session.execute_graphs().unwrap();
        let out = session.get_float_outputs(0).unwrap();
        assert_eq!(out, vec![vec![10.0, 11.0], vec![10.0, 11.0, 12.0]]);

        let native = session.get_native_outputs(0).unwrap();
        assert_eq!(native[1], vec![20, 22, 24]);
        assert_eq!(loader.state().executions, 1);
    }

    #[test]
    fn outputs_before_inputs_fail() {
        let loader = MockLoader::new();
        let session = Session::create(npu(), &loader, quiet()).unwrap();
        let err = session.get_float_outputs(0).unwrap_err();
        assert!(matches!(err, Error::TensorsNotBound(0)));
        assert_eq!(Status::from(&err), Status::Failure);
        assert!(matches!(
            session.get_float_outputs(3),
            Err(Error::InvalidIndex { requested: 3, available: 1 })
        ));
    }

    #[test]
    fn too_few_inputs_touch_nothing() {
        let loader = MockLoader::new();
        let mut session = Session::create(npu(), &loader, quiet()).unwrap();
        let none: [Vec<f32>; 0] = [];
        assert!(session.load_float_inputs(&none, 0).is_err());
        assert!(matches!(
            session.get_float_outputs(0),
            Err(Error::TensorsNotBound(0))
        ));
    }

    #[test]
    fn native_inputs_follow_configuration() {
        let loader = MockLoader::new();
        let mut session = Session::create(npu(), &loader, quiet()).unwrap();
        assert!(session.load_native_inputs(&[[0u8; 16]], 0).is_err());

        let mut config = npu();
        config.input_data_type = InputDataType::Native;
        let mut session = Session::create(config, &MockLoader::new(), quiet()).unwrap();
        let bytes: Vec<u8> = [1.0f32, 1.0, 1.0, 1.0]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        session.load_native_inputs(&[bytes], 0).unwrap();
        session.execute_graphs().unwrap();
        assert_eq!(session.get_float_outputs(0).unwrap()[0], vec![4.0, 5.0]);
        assert!(session.get_native_outputs(0).is_err());
    }

    #[test]
    fn multi_graph_execute_is_rejected() {
        let loader = MockLoader::new();
        loader.state().graphs.push(MockLoader::sample_graph("second"));
        let mut session = Session::create(npu(), &loader, quiet()).unwrap();
        session.load_float_inputs(&[vec![0.0f32; 4]], 1).unwrap();
        assert!(matches!(
            session.execute_graphs(),
            Err(Error::UnsupportedGraphCount(2))
        ));
    }

    #[test]
    fn loading_another_graph_replaces_bindings() {
        let loader = MockLoader::new();
        loader.state().graphs = vec![MockLoader::sample_graph("a"), MockLoader::sample_graph("b")];
        let mut session = Session::create(npu(), &loader, quiet()).unwrap();

        session.load_float_inputs(&[vec![0.0f32; 4]], 0).unwrap();
        assert!(session.get_float_outputs(0).is_ok());
        session.load_float_inputs(&[vec![0.0f32; 4]], 1).unwrap();
        assert!(matches!(
            session.get_float_outputs(0),
            Err(Error::TensorsNotBound(0))
        ));
        assert_eq!(session.get_float_outputs(1).unwrap().len(), 2);

        session.load_float_inputs(&[vec![0.0f32; 4]], 0).unwrap();
        assert!(matches!(
            session.get_float_outputs(1),
            Err(Error::TensorsNotBound(1))
        ));
    }

    #[test]
    fn binary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let loader = MockLoader::new();
        loader.state().graphs = vec![MockLoader::sample_graph("alpha")];
        let mut session = Session::create(npu(), &loader, quiet()).unwrap();
        let path = session.save_binary(dir.path(), "cache").unwrap();
        assert_eq!(path, dir.path().join("cache.bin"));
        drop(session);

        let config = SessionConfig::new("libAccelHtp.so", &path);
        let restored = Session::create(config, &MockLoader::new(), quiet()).unwrap();
        assert!(restored.model().is_cached_binary());
        assert_eq!(restored.state(), LifecycleState::Executable);
        let names: Vec<_> = restored.graphs().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["alpha"]);
        assert!(restored.graphs()[0].handle.is_some());
    }

    #[test]
    fn binary_path_skips_compose() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, MockLoader::encode_binary(&[MockLoader::sample_graph("g")])).unwrap();

        let loader = MockLoader::new();
        let mut config = SessionConfig::new("libAccelGpu.so", &path);
        config.output_data_type = OutputDataType::FloatOnly;
        let mut session = Session::create(config, &loader, quiet()).unwrap();
        let calls = loader.calls();
        assert!(calls.iter().any(|c| c == "load libAccelSystem.so"));
        assert!(!calls.iter().any(|c| c == "accel_compose_graphs"));
        assert!(session.compose_graphs().is_err());

        let err = session.execute_graphs().unwrap_err();
        assert!(err
            .to_string()
            .contains("persistent tensors are not initialized"));
    }

    #[test]
    fn empty_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        let config = SessionConfig::new("libAccelHtp.so", &path);
        let err = Session::create(config, &MockLoader::new(), quiet()).unwrap_err();
        assert!(matches!(err, Error::EmptyBinary(_)));
        assert_eq!(Status::from(&err), Status::Failure);

        let config = SessionConfig::new("libAccelHtp.so", dir.path().join("absent.bin"));
        assert!(Session::create(config, &MockLoader::new(), quiet()).is_err());
    }

    #[test]
    fn binary_overflow_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let loader = MockLoader::new();
        let mut session = Session::create(npu(), &loader, quiet()).unwrap();
        loader.state().binary_overrun = 8;
        assert!(matches!(
            session.save_binary(dir.path(), "cache"),
            Err(Error::BinaryOverflow { .. })
        ));
        assert!(!dir.path().join("cache.bin").exists());
    }

    #[test]
    fn profiling_collects_events() {
        let loader = MockLoader::new();
        let mut config = npu();
        config.profiling = ProfilingLevel::Basic;
        let mut session = Session::create(config, &loader, quiet()).unwrap();
        assert_eq!(session.last_profile().len(), 1);
        assert_eq!(session.last_profile()[0].children[0].identifier, "mock.node");
        session.load_float_inputs(&[vec![0.0f32; 4]], 0).unwrap();
        session.execute_graphs().unwrap();
        let fetches = loader
            .calls()
            .iter()
            .filter(|c| *c == "accel_profile_get_events")
            .count();
        assert_eq!(fetches, 2);
    }

    #[test]
    fn arch_discovery() {
        let loader = MockLoader::new();
        let arch = Session::accelerator_arch(&loader, Path::new("libAccelHtp.so"), &quiet()).unwrap();
        assert_eq!(arch, 75);
        assert_eq!(loader.calls().last().map(String::as_str), Some("unload"));

        loader.state().devices.clear();
        let err = Session::accelerator_arch(&loader, Path::new("libAccelHtp.so"), &quiet()).unwrap_err();
        assert_eq!(Status::from(&err), Status::FeatureUnsupported);
    }

    #[test]
    fn operations_after_teardown_fail() {
        let loader = MockLoader::new();
        let mut session = Session::create(npu(), &loader, quiet()).unwrap();
        session.teardown();
        assert!(session.load_float_inputs(&[vec![0.0f32; 4]], 0).is_err());
        assert!(session.execute_graphs().is_err());
        assert!(session.backend_build_id().is_err());
    }
}
