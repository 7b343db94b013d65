//! Vendor configuration options.
//!
//! Options are built as owned, typed values ([`OptionList`]) and only turned
//! into the vendor's null-terminated `*const *const AccelConfigOption` shape
//! at the call boundary, through [`RawConfigList`]. The raw list owns every
//! record, nested struct and string it points at and frees them on drop.

use std::ffi::{c_void, CString};
use std::path::PathBuf;

use crate::backend::{HardwareDevice, PowerConfigId};
use crate::config::{PowerProfile, PrecisionMode, TuningConfig, VoltageCorner};
use crate::error::Error;
use crate::ffi::{self, AccelConfigOption, AccelConfigValue};

/// Which family of backend a library path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    Gpu,
    Npu,
    Other,
}

impl BackendFamily {
    /// Substring match on the backend library path.
    pub fn detect(backend_path: &str) -> Self {
        if backend_path.contains("Gpu") {
            BackendFamily::Gpu
        } else if backend_path.contains("Htp") || backend_path.contains("Npu") {
            BackendFamily::Npu
        } else {
            BackendFamily::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendOption {
    GpuTuningMode(bool),
    GpuPerfCacheDir(PathBuf),
    GpuInvalidateCache(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GraphOption {
    /// VTCM size in MB, `None` for the maximum.
    VtcmSize(Option<u32>),
    Precision(PrecisionMode),
    /// Optimization level, passed through unchecked as a float.
    FinalizeOptimization(u32),
    /// HVX thread count, `None` for as many as the device allows.
    HvxThreads(Option<u64>),
    Dlbc(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceOption {
    SocModel(u32),
    Arch(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcvsV3 {
    pub dcvs_enable: bool,
    pub performance_mode: bool,
    pub sleep_latency: u32,
    pub sleep_disable: bool,
    pub bus: [VoltageCorner; 3],
    pub core: [VoltageCorner; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HmxV2 {
    pub pick_default: bool,
    pub corners: [VoltageCorner; 3],
    pub high_performance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerOption {
    DcvsV3 { id: PowerConfigId, config: DcvsV3 },
    HmxV2 { id: PowerConfigId, config: HmxV2 },
    RpcControlLatency(u32),
    RpcPollingTime(u32),
}

/// Immutable, owned list of options of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionList<T> {
    items: Vec<T>,
}

impl<T> OptionList<T> {
    pub fn builder() -> OptionListBuilder<T> {
        OptionListBuilder { items: Vec::new() }
    }

    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

pub struct OptionListBuilder<T> {
    items: Vec<T>,
}

impl<T> OptionListBuilder<T> {
    pub fn push(mut self, option: T) -> Self {
        self.items.push(option);
        self
    }

    pub fn push_if(self, cond: bool, option: T) -> Self {
        if cond {
            self.push(option)
        } else {
            self
        }
    }

    pub fn build(self) -> OptionList<T> {
        OptionList { items: self.items }
    }
}

/// Backend options for the given family. Only the GPU family has any.
pub fn backend_options(family: BackendFamily, tuning: &TuningConfig) -> OptionList<BackendOption> {
    if family != BackendFamily::Gpu {
        return OptionList::empty();
    }
    OptionList::builder()
        .push(BackendOption::GpuTuningMode(tuning.gpu_tuning_mode))
        .push(BackendOption::GpuPerfCacheDir(tuning.gpu_cache_dir.clone()))
        .push_if(
            tuning.gpu_invalidate_cache,
            BackendOption::GpuInvalidateCache(true),
        )
        .build()
}

/// Per-graph options applied to every composed graph before finalize.
pub fn graph_options(tuning: &TuningConfig) -> OptionList<GraphOption> {
    OptionList::builder()
        .push(GraphOption::VtcmSize(tuning.vtcm_mb))
        .push(GraphOption::Precision(tuning.precision))
        .push(GraphOption::FinalizeOptimization(tuning.optimization_level))
        .push(GraphOption::HvxThreads(tuning.hvx_threads))
        .push(GraphOption::Dlbc(tuning.dlbc))
        .build()
}

/// SoC model and arch of the first hardware device, if any was reported.
pub fn device_options(devices: &[HardwareDevice]) -> OptionList<DeviceOption> {
    match devices.first() {
        Some(hw) => OptionList::builder()
            .push(DeviceOption::SocModel(hw.soc_model))
            .push(DeviceOption::Arch(hw.arch_version))
            .build(),
        None => OptionList::empty(),
    }
}

pub fn power_options(id: PowerConfigId, profile: &PowerProfile) -> OptionList<PowerOption> {
    let corners = [profile.min_corner, profile.target_corner, profile.max_corner];
    OptionList::builder()
        .push(PowerOption::DcvsV3 {
            id,
            config: DcvsV3 {
                dcvs_enable: profile.dcvs_enable,
                performance_mode: profile.performance_mode,
                sleep_latency: profile.sleep_latency,
                sleep_disable: profile.sleep_disable,
                bus: corners,
                core: corners,
            },
        })
        .push(PowerOption::HmxV2 {
            id,
            config: HmxV2 {
                pick_default: false,
                corners,
                high_performance: profile.performance_mode,
            },
        })
        .push(PowerOption::RpcControlLatency(profile.rpc_control_latency_us))
        .push(PowerOption::RpcPollingTime(profile.rpc_polling_time_us))
        .build()
}

/// Null-terminated option array in the vendor's wire shape.
///
/// The pointers returned by [`as_ptr`](Self::as_ptr) stay valid as long as
/// this value is alive.
pub struct RawConfigList {
    // Boxed so record addresses survive pushes.
    records: Vec<Box<AccelConfigOption>>,
    pointers: Vec<*const AccelConfigOption>,
    strings: Vec<CString>,
    dcvs: Vec<Box<ffi::AccelDcvsV3>>,
    hmx: Vec<Box<ffi::AccelHmxV2>>,
}

// The raw pointers only reference heap data owned by the same value.
unsafe impl Send for RawConfigList {}

impl RawConfigList {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            pointers: vec![std::ptr::null()],
            strings: Vec::new(),
            dcvs: Vec::new(),
            hmx: Vec::new(),
        }
    }

    fn push(&mut self, option: u32, value: AccelConfigValue) {
        let record = Box::new(AccelConfigOption { option, value });
        let ptr: *const AccelConfigOption = &*record;
        self.records.push(record);
        // Keep the trailing null in place.
        let end = self.pointers.len() - 1;
        self.pointers.insert(end, ptr);
    }

    fn push_string(&mut self, option: u32, s: &str) -> Result<(), Error> {
        let c = CString::new(s)
            .map_err(|_| Error::InvalidArgument(format!("option string contains NUL: {s:?}")))?;
        let value = AccelConfigValue { string: c.as_ptr() };
        self.strings.push(c);
        self.push(option, value);
        Ok(())
    }

    /// Pointer to pass to the vendor. Never null; an empty list is a lone
    /// null terminator.
    pub fn as_ptr(&self) -> ffi::AccelConfigList {
        self.pointers.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pointer array including the terminator.
    pub fn pointers(&self) -> &[*const AccelConfigOption] {
        &self.pointers
    }

    pub fn from_backend(list: &OptionList<BackendOption>) -> Result<Self, Error> {
        let mut raw = Self::new();
        for opt in list.iter() {
            match opt {
                BackendOption::GpuTuningMode(on) => raw.push(
                    ffi::ACCEL_GPU_OPTION_TUNING_MODE,
                    AccelConfigValue { bool_value: *on as u8 },
                ),
                BackendOption::GpuPerfCacheDir(dir) => raw.push_string(
                    ffi::ACCEL_GPU_OPTION_PERF_CACHE_DIR,
                    &dir.to_string_lossy(),
                )?,
                BackendOption::GpuInvalidateCache(on) => raw.push(
                    ffi::ACCEL_GPU_OPTION_INVALIDATE_CACHE,
                    AccelConfigValue { bool_value: *on as u8 },
                ),
            }
        }
        Ok(raw)
    }

    pub fn from_graph(list: &OptionList<GraphOption>) -> Self {
        let mut raw = Self::new();
        for opt in list.iter() {
            let (tag, value) = match *opt {
                GraphOption::VtcmSize(mb) => (
                    ffi::ACCEL_GRAPH_OPTION_VTCM_SIZE,
                    AccelConfigValue {
                        u32_value: mb.unwrap_or(ffi::ACCEL_VTCM_SIZE_MAX),
                    },
                ),
                GraphOption::Precision(p) => (
                    ffi::ACCEL_GRAPH_OPTION_PRECISION,
                    AccelConfigValue { u32_value: p.code() },
                ),
                GraphOption::FinalizeOptimization(level) => (
                    ffi::ACCEL_GRAPH_OPTION_FINALIZE_OPTIMIZATION,
                    AccelConfigValue { f32_value: level as f32 },
                ),
                GraphOption::HvxThreads(n) => (
                    ffi::ACCEL_GRAPH_OPTION_HVX_THREADS,
                    AccelConfigValue {
                        u64_value: n.unwrap_or(u64::MAX),
                    },
                ),
                GraphOption::Dlbc(on) => (
                    ffi::ACCEL_GRAPH_OPTION_DLBC,
                    AccelConfigValue { bool_value: on as u8 },
                ),
            };
            raw.push(tag, value);
        }
        raw
    }

    pub fn from_device(list: &OptionList<DeviceOption>) -> Self {
        let mut raw = Self::new();
        for opt in list.iter() {
            let (tag, v) = match *opt {
                DeviceOption::SocModel(v) => (ffi::ACCEL_DEVICE_OPTION_SOC_MODEL, v),
                DeviceOption::Arch(v) => (ffi::ACCEL_DEVICE_OPTION_ARCH, v),
            };
            raw.push(tag, AccelConfigValue { u32_value: v });
        }
        raw
    }

    pub fn from_power(list: &OptionList<PowerOption>) -> Self {
        let mut raw = Self::new();
        for opt in list.iter() {
            match *opt {
                PowerOption::DcvsV3 { id, config } => {
                    let record = Box::new(ffi::AccelDcvsV3 {
                        power_config_id: id.0,
                        set_dcvs_enable: 1,
                        dcvs_enable: config.dcvs_enable as u8,
                        power_mode: if config.performance_mode {
                            ffi::ACCEL_POWER_MODE_PERFORMANCE
                        } else {
                            ffi::ACCEL_POWER_MODE_POWER_SAVER
                        },
                        set_sleep_latency: 1,
                        sleep_latency: config.sleep_latency,
                        set_sleep_disable: 1,
                        sleep_disable: config.sleep_disable as u8,
                        set_bus_params: 1,
                        bus_voltage_corner_min: config.bus[0].code(),
                        bus_voltage_corner_target: config.bus[1].code(),
                        bus_voltage_corner_max: config.bus[2].code(),
                        set_core_params: 1,
                        core_voltage_corner_min: config.core[0].code(),
                        core_voltage_corner_target: config.core[1].code(),
                        core_voltage_corner_max: config.core[2].code(),
                    });
                    let value = AccelConfigValue {
                        pointer: &*record as *const ffi::AccelDcvsV3 as *const c_void,
                    };
                    raw.dcvs.push(record);
                    raw.push(ffi::ACCEL_POWER_OPTION_DCVS_V3, value);
                }
                PowerOption::HmxV2 { id, config } => {
                    let record = Box::new(ffi::AccelHmxV2 {
                        power_config_id: id.0,
                        hmx_pick_default: config.pick_default as u8,
                        hmx_voltage_corner_min: config.corners[0].code(),
                        hmx_voltage_corner_target: config.corners[1].code(),
                        hmx_voltage_corner_max: config.corners[2].code(),
                        hmx_perf_mode: if config.high_performance {
                            ffi::ACCEL_HMX_PERF_MODE_HIGH
                        } else {
                            ffi::ACCEL_HMX_PERF_MODE_LOW
                        },
                    });
                    let value = AccelConfigValue {
                        pointer: &*record as *const ffi::AccelHmxV2 as *const c_void,
                    };
                    raw.hmx.push(record);
                    raw.push(ffi::ACCEL_POWER_OPTION_HMX_V2, value);
                }
                PowerOption::RpcControlLatency(us) => raw.push(
                    ffi::ACCEL_POWER_OPTION_RPC_CONTROL_LATENCY,
                    AccelConfigValue { u32_value: us },
                ),
                PowerOption::RpcPollingTime(us) => raw.push(
                    ffi::ACCEL_POWER_OPTION_RPC_POLLING_TIME,
                    AccelConfigValue { u32_value: us },
                ),
            }
        }
        raw
    }
}

impl std::fmt::Debug for RawConfigList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<u32> = self.records.iter().map(|r| r.option).collect();
        f.debug_struct("RawConfigList").field("options", &tags).finish()
    }
}
