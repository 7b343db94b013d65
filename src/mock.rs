//! In-process backend for tests.
//!
//! [`MockLoader`] hands out [`MockBackend`]s that share one [`MockState`], so
//! a test can inject failures, remove entry points and read back the exact
//! sequence of vendor calls a session made. Serialized contexts are the
//! graph list encoded as JSON.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{
    AcceleratorBackend, BackendHandle, BackendLoader, ContextHandle, DeviceHandle, GraphHandle,
    GraphInfo, HardwareDevice, LoadRequest, LogHandle, ModelSource, PowerConfigId, ProfileEvent,
    ProfileHandle, PropertySupport, VendorError, VendorResult,
};
use crate::bindings::NativeTensor;
use crate::error::Error;
use crate::ffi;
use crate::log::{LogLevel, Logger};
use crate::options::{BackendOption, DeviceOption, GraphOption, OptionList, PowerOption};
use crate::tensor::{DataType, TensorInfo};

#[derive(Debug)]
pub struct MockState {
    /// Vendor calls in the order they were made, plus `load`/`unload`.
    pub calls: Vec<String>,
    /// Calls that fail with the given vendor code.
    pub failures: HashMap<&'static str, u64>,
    /// Calls reported as missing from the runtime.
    pub missing: HashSet<&'static str>,
    /// Symbol the loader pretends it could not resolve.
    pub missing_symbol: Option<String>,
    /// Graphs produced by `accel_compose_graphs`.
    pub graphs: Vec<GraphInfo>,
    pub devices: Vec<HardwareDevice>,
    pub property: PropertySupport,
    pub build_id: String,
    /// Added to the size reported by `accel_context_get_binary`.
    pub binary_overrun: u64,
    pub op_packages: Vec<(String, String, Option<String>)>,
    pub backend_options: Vec<OptionList<BackendOption>>,
    pub graph_options: Vec<OptionList<GraphOption>>,
    pub device_options: Vec<OptionList<DeviceOption>>,
    pub power_options: Vec<OptionList<PowerOption>>,
    pub executions: usize,
    /// Inputs seen by the last execute, as floats.
    pub last_inputs: Vec<Vec<f32>>,
    pub log_sink: Option<Arc<Logger>>,
    next_handle: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            failures: HashMap::new(),
            missing: HashSet::new(),
            missing_symbol: None,
            graphs: vec![MockLoader::sample_graph("classifier")],
            devices: vec![HardwareDevice {
                device_id: 0,
                device_type: 0,
                soc_model: 57,
                arch_version: 75,
                vtcm_size_mb: 8,
                num_cores: 1,
            }],
            property: PropertySupport::Supported,
            build_id: "mock-2.0.0".into(),
            binary_overrun: 0,
            op_packages: Vec::new(),
            backend_options: Vec::new(),
            graph_options: Vec::new(),
            device_options: Vec::new(),
            power_options: Vec::new(),
            executions: 0,
            last_inputs: Vec::new(),
            log_sink: None,
            next_handle: 1,
        }
    }
}

impl MockState {
    fn handle(&mut self) -> usize {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn enter(&mut self, call: &'static str) -> VendorResult<()> {
        self.calls.push(call.to_string());
        if self.missing.contains(call) {
            return Err(VendorError::Unavailable(call));
        }
        match self.failures.get(call) {
            Some(&code) => Err(VendorError::Code { call, code }),
            None => Ok(()),
        }
    }
}

/// Produces [`MockBackend`]s sharing one state.
#[derive(Debug, Clone, Default)]
pub struct MockLoader {
    state: Arc<Mutex<MockState>>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make `call` fail with `code`.
    pub fn fail(&self, call: &'static str, code: u64) -> &Self {
        self.state().failures.insert(call, code);
        self
    }

    /// Make `call` look absent from the runtime.
    pub fn remove(&self, call: &'static str) -> &Self {
        self.state().missing.insert(call);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// One float input of four elements, one float output of two and a
    /// fixed-point output of three.
    pub fn sample_graph(name: &str) -> GraphInfo {
        let tensor = |id: u32, name: &str, data_type: DataType, dims: Vec<u32>| TensorInfo {
            id,
            name: name.to_string(),
            data_type,
            dims,
            quant: (data_type == DataType::UFixed8).then_some(crate::tensor::QuantParams {
                scale: 0.5,
                offset: 0,
            }),
        };
        GraphInfo {
            name: name.to_string(),
            handle: None,
            inputs: vec![tensor(0, "input", DataType::Float32, vec![1, 4])],
            outputs: vec![
                tensor(1, "scores", DataType::Float32, vec![1, 2]),
                tensor(2, "scores_q", DataType::UFixed8, vec![1, 3]),
            ],
        }
    }

    /// The serialized form written by `save_binary` for `graphs`.
    pub fn encode_binary(graphs: &[GraphInfo]) -> Vec<u8> {
        serde_json::to_vec(graphs).unwrap_or_default()
    }
}

impl BackendLoader for MockLoader {
    fn load(
        &self,
        request: &LoadRequest,
        logger: &Arc<Logger>,
    ) -> Result<Box<dyn AcceleratorBackend>, Error> {
        let mut state = self.state();
        state
            .calls
            .push(format!("load {}", request.backend_path.display()));
        if let Some(symbol) = state.missing_symbol.clone() {
            return Err(Error::SymbolNotFound(symbol));
        }
        match &request.model {
            Some(ModelSource::Library(p)) => state.calls.push(format!("load {}", p.display())),
            Some(ModelSource::CachedBinary(_)) => {
                if let Some(sys) = &request.system_library {
                    state.calls.push(format!("load {}", sys.display()));
                }
            }
            None => {}
        }
        accel_debug!(logger, "mock backend loaded");
        Ok(Box::new(MockBackend {
            state: Arc::clone(&self.state),
            is_binary: request
                .model
                .as_ref()
                .map(ModelSource::is_cached_binary)
                .unwrap_or(false),
        }))
    }
}

pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    is_binary: bool,
}

impl MockBackend {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.state().calls.push("unload".to_string());
    }
}

impl AcceleratorBackend for MockBackend {
    fn log_create(&mut self, logger: &Arc<Logger>, _level: LogLevel) -> VendorResult<LogHandle> {
        let mut s = self.state();
        s.enter("accel_log_create")?;
        s.log_sink = Some(Arc::clone(logger));
        Ok(LogHandle(s.handle()))
    }

    fn log_free(&mut self, _log: LogHandle) -> VendorResult<()> {
        let mut s = self.state();
        s.enter("accel_log_free")?;
        s.log_sink = None;
        Ok(())
    }

    fn backend_create(
        &mut self,
        _log: Option<LogHandle>,
        options: &OptionList<BackendOption>,
    ) -> VendorResult<BackendHandle> {
        let mut s = self.state();
        s.enter("accel_backend_create")?;
        s.backend_options.push(options.clone());
        Ok(BackendHandle(s.handle()))
    }

    fn backend_set_config(
        &mut self,
        _backend: BackendHandle,
        options: &OptionList<BackendOption>,
    ) -> VendorResult<()> {
        let mut s = self.state();
        s.enter("accel_backend_set_config")?;
        s.backend_options.push(options.clone());
        Ok(())
    }

    fn backend_free(&mut self, _backend: BackendHandle) -> VendorResult<()> {
        self.state().enter("accel_backend_free")
    }

    fn backend_build_id(&self) -> VendorResult<String> {
        let mut s = self.state();
        s.enter("accel_backend_get_build_id")?;
        Ok(s.build_id.clone())
    }

    fn register_op_package(
        &mut self,
        _backend: BackendHandle,
        path: &str,
        provider: &str,
        target: Option<&str>,
    ) -> VendorResult<()> {
        let mut s = self.state();
        s.enter("accel_backend_register_op_package")?;
        s.op_packages
            .push((path.to_string(), provider.to_string(), target.map(str::to_string)));
        Ok(())
    }

    fn property_has_capability(&self, _key: u32) -> VendorResult<PropertySupport> {
        let mut s = self.state();
        s.enter("accel_property_has_capability")?;
        Ok(s.property)
    }

    fn platform_info(&mut self, _log: Option<LogHandle>) -> VendorResult<Vec<HardwareDevice>> {
        let mut s = self.state();
        s.enter("accel_device_get_platform_info")?;
        Ok(s.devices.clone())
    }

    fn device_create(
        &mut self,
        _log: Option<LogHandle>,
        options: &OptionList<DeviceOption>,
    ) -> VendorResult<DeviceHandle> {
        let mut s = self.state();
        s.enter("accel_device_create")?;
        s.device_options.push(options.clone());
        Ok(DeviceHandle(s.handle()))
    }

    fn device_free(&mut self, _device: DeviceHandle) -> VendorResult<()> {
        self.state().enter("accel_device_free")
    }

    fn power_config_create(&mut self, _device_id: u32, _core_id: u32) -> VendorResult<PowerConfigId> {
        let mut s = self.state();
        s.enter("accel_perf_create_power_config_id")?;
        Ok(PowerConfigId(s.handle() as u32))
    }

    fn power_config_set(
        &mut self,
        _id: PowerConfigId,
        options: &OptionList<PowerOption>,
    ) -> VendorResult<()> {
        let mut s = self.state();
        s.enter("accel_perf_set_power_config")?;
        s.power_options.push(options.clone());
        Ok(())
    }

    fn power_config_destroy(&mut self, _id: PowerConfigId) -> VendorResult<()> {
        self.state().enter("accel_perf_destroy_power_config_id")
    }

    fn context_create(
        &mut self,
        _backend: BackendHandle,
        _device: Option<DeviceHandle>,
    ) -> VendorResult<ContextHandle> {
        let mut s = self.state();
        s.enter("accel_context_create")?;
        Ok(ContextHandle(s.handle()))
    }

    fn context_create_from_binary(
        &mut self,
        _backend: BackendHandle,
        _device: Option<DeviceHandle>,
        binary: &[u8],
        _profile: Option<ProfileHandle>,
    ) -> VendorResult<ContextHandle> {
        let mut s = self.state();
        s.enter("accel_context_create_from_binary")?;
        let graphs: Vec<GraphInfo> =
            serde_json::from_slice(binary).map_err(|_| VendorError::Code {
                call: "accel_context_create_from_binary",
                code: ffi::ACCEL_ERROR_INVALID_ARGUMENT,
            })?;
        s.graphs = graphs;
        Ok(ContextHandle(s.handle()))
    }

    fn context_binary_size(&mut self, _context: ContextHandle) -> VendorResult<u64> {
        let mut s = self.state();
        s.enter("accel_context_get_binary_size")?;
        Ok(MockLoader::encode_binary(&s.graphs).len() as u64)
    }

    fn context_get_binary(&mut self, _context: ContextHandle, buffer: &mut [u8]) -> VendorResult<u64> {
        let mut s = self.state();
        s.enter("accel_context_get_binary")?;
        let bytes = MockLoader::encode_binary(&s.graphs);
        let n = bytes.len().min(buffer.len());
        buffer[..n].copy_from_slice(&bytes[..n]);
        Ok(bytes.len() as u64 + s.binary_overrun)
    }

    fn context_free(&mut self, _context: ContextHandle, _profile: Option<ProfileHandle>) -> VendorResult<()> {
        self.state().enter("accel_context_free")
    }

    fn compose_graphs(
        &mut self,
        _backend: BackendHandle,
        _context: ContextHandle,
        _debug: bool,
    ) -> VendorResult<Vec<GraphInfo>> {
        if self.is_binary {
            return Err(VendorError::Unavailable("accel_compose_graphs"));
        }
        let mut s = self.state();
        s.enter("accel_compose_graphs")?;
        let mut graphs = s.graphs.clone();
        for g in &mut graphs {
            g.handle = Some(GraphHandle(s.handle()));
        }
        Ok(graphs)
    }

    fn binary_graph_info(&mut self, binary: &[u8]) -> VendorResult<Vec<GraphInfo>> {
        let mut s = self.state();
        s.enter("accel_system_context_get_binary_info")?;
        serde_json::from_slice(binary).map_err(|_| VendorError::Code {
            call: "accel_system_context_get_binary_info",
            code: ffi::ACCEL_ERROR_INVALID_ARGUMENT,
        })
    }

    fn graph_retrieve(&mut self, _context: ContextHandle, name: &str) -> VendorResult<GraphHandle> {
        let mut s = self.state();
        s.enter("accel_graph_retrieve")?;
        if s.graphs.iter().any(|g| g.name == name) {
            Ok(GraphHandle(s.handle()))
        } else {
            Err(VendorError::Code {
                call: "accel_graph_retrieve",
                code: ffi::ACCEL_ERROR_INVALID_ARGUMENT,
            })
        }
    }

    fn graph_set_config(
        &mut self,
        _graph: GraphHandle,
        options: &OptionList<GraphOption>,
    ) -> VendorResult<()> {
        let mut s = self.state();
        s.enter("accel_graph_set_config")?;
        s.graph_options.push(options.clone());
        Ok(())
    }

    fn graph_finalize(&mut self, _graph: GraphHandle, _profile: Option<ProfileHandle>) -> VendorResult<()> {
        self.state().enter("accel_graph_finalize")
    }

    /// Every output element becomes the sum of the first input plus its own
    /// position.
    fn graph_execute(
        &mut self,
        _graph: GraphHandle,
        inputs: &[NativeTensor],
        outputs: &mut [NativeTensor],
        _profile: Option<ProfileHandle>,
    ) -> VendorResult<()> {
        let mut s = self.state();
        s.enter("accel_graph_execute")?;
        let bad = |_| VendorError::Code {
            call: "accel_graph_execute",
            code: ffi::ACCEL_ERROR_INVALID_ARGUMENT,
        };
        let floats = inputs
            .iter()
            .map(|t| t.to_f32())
            .collect::<Result<Vec<_>, _>>()
            .map_err(bad)?;
        let sum: f32 = floats.first().map(|v| v.iter().sum()).unwrap_or(0.0);
        for out in outputs.iter_mut() {
            let values: Vec<f32> = (0..out.info().element_count().map_err(bad)?)
                .map(|i| sum + i as f32)
                .collect();
            out.load_f32(&values).map_err(bad)?;
        }
        s.executions += 1;
        s.last_inputs = floats;
        Ok(())
    }

    fn profile_create(&mut self, _backend: BackendHandle, _level: u32) -> VendorResult<ProfileHandle> {
        let mut s = self.state();
        s.enter("accel_profile_create")?;
        Ok(ProfileHandle(s.handle()))
    }

    fn profile_events(&mut self, _profile: ProfileHandle) -> VendorResult<Vec<ProfileEvent>> {
        let mut s = self.state();
        s.enter("accel_profile_get_events")?;
        Ok(vec![ProfileEvent {
            identifier: "mock.total".into(),
            event_type: 1,
            value: 42,
            unit: 1,
            children: vec![ProfileEvent {
                identifier: "mock.node".into(),
                event_type: 2,
                value: 40,
                unit: 1,
                children: Vec::new(),
            }],
        }])
    }

    fn profile_free(&mut self, _profile: ProfileHandle) -> VendorResult<()> {
        self.state().enter("accel_profile_free")
    }
}
