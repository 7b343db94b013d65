// Raw C ABI of the vendor accelerator runtime. Everything here mirrors the
// vendor headers; safe wrappers live in loader.rs.

use std::ffi::{c_char, c_void};

pub type AccelErrorCode = u64;
pub type AccelHandle = *mut c_void;
pub type AccelPowerConfigId = u32;
pub type AccelProfileEventId = u64;

// Error codes
pub const ACCEL_SUCCESS: AccelErrorCode = 0;
pub const ACCEL_ERROR_NOT_SUPPORTED: AccelErrorCode = 1000;
pub const ACCEL_ERROR_MEM_ALLOC: AccelErrorCode = 1002;
pub const ACCEL_ERROR_SYSTEM: AccelErrorCode = 1003;
pub const ACCEL_ERROR_INVALID_ARGUMENT: AccelErrorCode = 1004;
pub const ACCEL_ERROR_SYSTEM_COMMUNICATION: AccelErrorCode = 1007;
pub const ACCEL_PROPERTY_NOT_SUPPORTED: AccelErrorCode = 4001;
pub const ACCEL_PROPERTY_ERROR_UNKNOWN_KEY: AccelErrorCode = 4002;
pub const ACCEL_DEVICE_ERROR_UNSUPPORTED_FEATURE: AccelErrorCode = 14001;

// Property keys
pub const ACCEL_PROPERTY_GROUP_DEVICE: u32 = 0x0000_0100;

// Log levels understood by accel_log_create
pub const ACCEL_LOG_LEVEL_ERROR: u32 = 1;
pub const ACCEL_LOG_LEVEL_WARN: u32 = 2;
pub const ACCEL_LOG_LEVEL_INFO: u32 = 3;
pub const ACCEL_LOG_LEVEL_VERBOSE: u32 = 4;
pub const ACCEL_LOG_LEVEL_DEBUG: u32 = 5;

// Profiling levels
pub const ACCEL_PROFILE_LEVEL_BASIC: u32 = 1;
pub const ACCEL_PROFILE_LEVEL_DETAILED: u32 = 2;

// Tensor data types
pub const ACCEL_DATATYPE_INT_8: u32 = 0x0008;
pub const ACCEL_DATATYPE_INT_16: u32 = 0x0016;
pub const ACCEL_DATATYPE_INT_32: u32 = 0x0032;
pub const ACCEL_DATATYPE_INT_64: u32 = 0x0064;
pub const ACCEL_DATATYPE_UINT_8: u32 = 0x0108;
pub const ACCEL_DATATYPE_UINT_16: u32 = 0x0116;
pub const ACCEL_DATATYPE_UINT_32: u32 = 0x0132;
pub const ACCEL_DATATYPE_FLOAT_16: u32 = 0x0216;
pub const ACCEL_DATATYPE_FLOAT_32: u32 = 0x0232;
pub const ACCEL_DATATYPE_SFIXED_POINT_8: u32 = 0x0308;
pub const ACCEL_DATATYPE_SFIXED_POINT_16: u32 = 0x0316;
pub const ACCEL_DATATYPE_UFIXED_POINT_8: u32 = 0x0408;
pub const ACCEL_DATATYPE_UFIXED_POINT_16: u32 = 0x0416;
pub const ACCEL_DATATYPE_BOOL_8: u32 = 0x0508;

// Tensor types
pub const ACCEL_TENSOR_TYPE_APP_WRITE: u32 = 0;
pub const ACCEL_TENSOR_TYPE_APP_READ: u32 = 1;

// Quantization encodings
pub const ACCEL_QUANTIZATION_ENCODING_SCALE_OFFSET: u32 = 0;
pub const ACCEL_QUANTIZATION_ENCODING_UNDEFINED: u32 = 0x7FFF_FFFF;

// GPU backend options
pub const ACCEL_GPU_OPTION_TUNING_MODE: u32 = 1;
pub const ACCEL_GPU_OPTION_PERF_CACHE_DIR: u32 = 2;
pub const ACCEL_GPU_OPTION_INVALIDATE_CACHE: u32 = 3;

// NPU graph options
pub const ACCEL_GRAPH_OPTION_VTCM_SIZE: u32 = 1;
pub const ACCEL_GRAPH_OPTION_PRECISION: u32 = 2;
pub const ACCEL_GRAPH_OPTION_FINALIZE_OPTIMIZATION: u32 = 3;
pub const ACCEL_GRAPH_OPTION_HVX_THREADS: u32 = 4;
pub const ACCEL_GRAPH_OPTION_DLBC: u32 = 5;

/// Request the largest VTCM the device offers.
pub const ACCEL_VTCM_SIZE_MAX: u32 = 0;
pub const ACCEL_PRECISION_FLOAT32: u32 = 0;
pub const ACCEL_PRECISION_FLOAT16: u32 = 1;
pub const ACCEL_PRECISION_UNDEFINED: u32 = 0x7FFF_FFFF;

// NPU device options
pub const ACCEL_DEVICE_OPTION_SOC_MODEL: u32 = 1;
pub const ACCEL_DEVICE_OPTION_ARCH: u32 = 2;

// NPU power options
pub const ACCEL_POWER_OPTION_DCVS_V3: u32 = 1;
pub const ACCEL_POWER_OPTION_HMX_V2: u32 = 2;
pub const ACCEL_POWER_OPTION_RPC_CONTROL_LATENCY: u32 = 3;
pub const ACCEL_POWER_OPTION_RPC_POLLING_TIME: u32 = 4;

pub const ACCEL_POWER_MODE_PERFORMANCE: u32 = 1;
pub const ACCEL_POWER_MODE_POWER_SAVER: u32 = 2;
pub const ACCEL_HMX_PERF_MODE_HIGH: u32 = 1;
pub const ACCEL_HMX_PERF_MODE_LOW: u32 = 2;

// Voltage corners
pub const ACCEL_VCORNER_DISABLE: u32 = 0x10;
pub const ACCEL_VCORNER_SVS2: u32 = 0x20;
pub const ACCEL_VCORNER_SVS: u32 = 0x30;
pub const ACCEL_VCORNER_SVS_PLUS: u32 = 0x40;
pub const ACCEL_VCORNER_NOM: u32 = 0x50;
pub const ACCEL_VCORNER_NOM_PLUS: u32 = 0x60;
pub const ACCEL_VCORNER_TURBO: u32 = 0x70;
pub const ACCEL_VCORNER_TURBO_PLUS: u32 = 0x80;
pub const ACCEL_VCORNER_MAX: u32 = 0x90;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelQuantizeParams {
    pub encoding: u32,
    pub scale: f32,
    pub offset: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelClientBuffer {
    pub data: *mut c_void,
    pub data_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelTensor {
    pub id: u32,
    pub name: *const c_char,
    pub tensor_type: u32,
    pub data_type: u32,
    pub quantize_params: AccelQuantizeParams,
    pub rank: u32,
    pub dimensions: *mut u32,
    pub client_buf: AccelClientBuffer,
}

#[repr(C)]
pub struct AccelGraphInfo {
    pub graph: AccelHandle,
    pub graph_name: *const c_char,
    pub input_tensors: *const AccelTensor,
    pub num_input_tensors: u32,
    pub output_tensors: *const AccelTensor,
    pub num_output_tensors: u32,
}

#[repr(C)]
pub struct AccelBinaryInfo {
    pub num_graphs: u32,
    pub graphs: *const AccelGraphInfo,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union AccelConfigValue {
    pub u32_value: u32,
    pub u64_value: u64,
    pub f32_value: f32,
    pub bool_value: u8,
    pub string: *const c_char,
    pub pointer: *const c_void,
}

/// One tagged-union record; arrays of these are passed as
/// `*const *const AccelConfigOption` terminated by a null pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AccelConfigOption {
    pub option: u32,
    pub value: AccelConfigValue,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AccelDcvsV3 {
    pub power_config_id: u32,
    pub set_dcvs_enable: u8,
    pub dcvs_enable: u8,
    pub power_mode: u32,
    pub set_sleep_latency: u8,
    pub sleep_latency: u32,
    pub set_sleep_disable: u8,
    pub sleep_disable: u8,
    pub set_bus_params: u8,
    pub bus_voltage_corner_min: u32,
    pub bus_voltage_corner_target: u32,
    pub bus_voltage_corner_max: u32,
    pub set_core_params: u8,
    pub core_voltage_corner_min: u32,
    pub core_voltage_corner_target: u32,
    pub core_voltage_corner_max: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AccelHmxV2 {
    pub power_config_id: u32,
    pub hmx_pick_default: u8,
    pub hmx_voltage_corner_min: u32,
    pub hmx_voltage_corner_target: u32,
    pub hmx_voltage_corner_max: u32,
    pub hmx_perf_mode: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AccelHwDeviceInfo {
    pub device_id: u32,
    pub device_type: u32,
    pub soc_model: u32,
    pub arch_version: u32,
    pub vtcm_size_mb: u32,
    pub num_cores: u32,
}

#[repr(C)]
pub struct AccelPlatformInfo {
    pub num_hw_devices: u32,
    pub hw_devices: *const AccelHwDeviceInfo,
}

#[repr(C)]
pub struct AccelProfileEventData {
    pub event_type: u32,
    pub value: u64,
    pub identifier: *const c_char,
    pub unit: u32,
}

impl AccelProfileEventData {
    pub fn zeroed() -> Self {
        Self {
            event_type: 0,
            value: 0,
            identifier: std::ptr::null(),
            unit: 0,
        }
    }
}

pub type AccelConfigList = *const *const AccelConfigOption;

pub type AccelLogCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    level: u32,
    timestamp: u64,
    message: *const c_char,
);

// Backend library
pub type FnLogCreate = unsafe extern "C" fn(
    Option<AccelLogCallback>,
    u32,
    *mut c_void,
    *mut AccelHandle,
) -> AccelErrorCode;
pub type FnLogFree = unsafe extern "C" fn(AccelHandle) -> AccelErrorCode;

pub type FnBackendCreate =
    unsafe extern "C" fn(AccelHandle, AccelConfigList, *mut AccelHandle) -> AccelErrorCode;
pub type FnBackendSetConfig = unsafe extern "C" fn(AccelHandle, AccelConfigList) -> AccelErrorCode;
pub type FnBackendFree = unsafe extern "C" fn(AccelHandle) -> AccelErrorCode;
pub type FnBackendGetBuildId = unsafe extern "C" fn(*mut *const c_char) -> AccelErrorCode;
pub type FnBackendRegisterOpPackage = unsafe extern "C" fn(
    AccelHandle,
    *const c_char,
    *const c_char,
    *const c_char,
) -> AccelErrorCode;

pub type FnPropertyHasCapability = unsafe extern "C" fn(u32) -> AccelErrorCode;

pub type FnDeviceCreate =
    unsafe extern "C" fn(AccelHandle, AccelConfigList, *mut AccelHandle) -> AccelErrorCode;
pub type FnDeviceFree = unsafe extern "C" fn(AccelHandle) -> AccelErrorCode;
pub type FnDeviceGetPlatformInfo =
    unsafe extern "C" fn(AccelHandle, *mut *const AccelPlatformInfo) -> AccelErrorCode;
pub type FnDeviceFreePlatformInfo =
    unsafe extern "C" fn(AccelHandle, *const AccelPlatformInfo) -> AccelErrorCode;

pub type FnPerfCreatePowerConfigId =
    unsafe extern "C" fn(u32, u32, *mut AccelPowerConfigId) -> AccelErrorCode;
pub type FnPerfSetPowerConfig =
    unsafe extern "C" fn(AccelPowerConfigId, AccelConfigList) -> AccelErrorCode;
pub type FnPerfDestroyPowerConfigId = unsafe extern "C" fn(AccelPowerConfigId) -> AccelErrorCode;

pub type FnContextCreate = unsafe extern "C" fn(
    AccelHandle,
    AccelHandle,
    AccelConfigList,
    *mut AccelHandle,
) -> AccelErrorCode;
pub type FnContextCreateFromBinary = unsafe extern "C" fn(
    AccelHandle,
    AccelHandle,
    AccelConfigList,
    *const c_void,
    u64,
    *mut AccelHandle,
    AccelHandle,
) -> AccelErrorCode;
pub type FnContextGetBinarySize = unsafe extern "C" fn(AccelHandle, *mut u64) -> AccelErrorCode;
pub type FnContextGetBinary =
    unsafe extern "C" fn(AccelHandle, *mut c_void, u64, *mut u64) -> AccelErrorCode;
pub type FnContextFree = unsafe extern "C" fn(AccelHandle, AccelHandle) -> AccelErrorCode;

pub type FnGraphSetConfig = unsafe extern "C" fn(AccelHandle, AccelConfigList) -> AccelErrorCode;
pub type FnGraphFinalize = unsafe extern "C" fn(AccelHandle, AccelHandle) -> AccelErrorCode;
pub type FnGraphRetrieve =
    unsafe extern "C" fn(AccelHandle, *const c_char, *mut AccelHandle) -> AccelErrorCode;
pub type FnGraphExecute = unsafe extern "C" fn(
    AccelHandle,
    *const AccelTensor,
    u32,
    *mut AccelTensor,
    u32,
    AccelHandle,
) -> AccelErrorCode;

pub type FnProfileCreate =
    unsafe extern "C" fn(AccelHandle, u32, *mut AccelHandle) -> AccelErrorCode;
pub type FnProfileFree = unsafe extern "C" fn(AccelHandle) -> AccelErrorCode;
pub type FnProfileGetEvents = unsafe extern "C" fn(
    AccelHandle,
    *mut *const AccelProfileEventId,
    *mut u32,
) -> AccelErrorCode;
pub type FnProfileGetSubEvents = unsafe extern "C" fn(
    AccelProfileEventId,
    *mut *const AccelProfileEventId,
    *mut u32,
) -> AccelErrorCode;
pub type FnProfileGetEventData =
    unsafe extern "C" fn(AccelProfileEventId, *mut AccelProfileEventData) -> AccelErrorCode;

// Model library. Returns 0 on success.
pub type FnComposeGraphs = unsafe extern "C" fn(
    AccelHandle,
    AccelHandle,
    u8,
    *mut *mut AccelGraphInfo,
    *mut u32,
) -> u32;
pub type FnFreeGraphsInfo = unsafe extern "C" fn(*mut AccelGraphInfo, u32) -> u32;

// System library
pub type FnSystemContextCreate = unsafe extern "C" fn(*mut AccelHandle) -> AccelErrorCode;
pub type FnSystemContextGetBinaryInfo = unsafe extern "C" fn(
    AccelHandle,
    *const c_void,
    u64,
    *mut *const AccelBinaryInfo,
) -> AccelErrorCode;
pub type FnSystemContextFree = unsafe extern "C" fn(AccelHandle) -> AccelErrorCode;
