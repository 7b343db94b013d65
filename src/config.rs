//! Session configuration, loaded from TOML or built in code.
//!
//! # TOML format
//! ```toml
//! backend_path = "libAccelHtp.so"
//! model_path = "model.bin"
//! output_data_type = "float-only"
//! input_data_type = "float"
//! data_dir = "/data/local/tmp/accel"
//! op_packages = ["libCustomOps.so:CustomOpsInterfaceProvider"]
//! profiling = "off"
//! log_level = "info"
//!
//! [tuning]
//! precision = "float16"
//! optimization_level = 2
//!
//! [tuning.power]
//! sleep_latency = 40
//!
//! [dispatch]
//! workers = 4
//! queue_depth = 64
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ffi;
use crate::log::{LogLevel, Logger};

/// Which output representations a session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum OutputDataType {
    #[default]
    FloatOnly = 0,
    NativeOnly = 1,
    FloatAndNative = 2,
}

impl OutputDataType {
    pub fn from_raw(v: u32) -> Result<Self, Error> {
        match v {
            0 => Ok(OutputDataType::FloatOnly),
            1 => Ok(OutputDataType::NativeOnly),
            2 => Ok(OutputDataType::FloatAndNative),
            other => Err(Error::InvalidArgument(format!("output data type {other}"))),
        }
    }

    pub fn allows_float(self) -> bool {
        self != OutputDataType::NativeOnly
    }

    pub fn allows_native(self) -> bool {
        self != OutputDataType::FloatOnly
    }
}

/// Representation callers use to feed inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum InputDataType {
    #[default]
    Float = 0,
    Native = 1,
}

impl InputDataType {
    pub fn from_raw(v: u32) -> Result<Self, Error> {
        match v {
            0 => Ok(InputDataType::Float),
            1 => Ok(InputDataType::Native),
            other => Err(Error::InvalidArgument(format!("input data type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfilingLevel {
    #[default]
    Off,
    Basic,
    Detailed,
}

impl ProfilingLevel {
    pub fn code(self) -> Option<u32> {
        match self {
            ProfilingLevel::Off => None,
            ProfilingLevel::Basic => Some(ffi::ACCEL_PROFILE_LEVEL_BASIC),
            ProfilingLevel::Detailed => Some(ffi::ACCEL_PROFILE_LEVEL_DETAILED),
        }
    }
}

/// Numeric precision requested for graph execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrecisionMode {
    Float32,
    #[default]
    Float16,
    /// Let the backend decide.
    Default,
}

impl PrecisionMode {
    /// C ABI value: 0 = fp32, 1 = fp16, anything else = backend default.
    pub fn from_raw(v: u32) -> Self {
        match v {
            0 => PrecisionMode::Float32,
            1 => PrecisionMode::Float16,
            _ => PrecisionMode::Default,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            PrecisionMode::Float32 => ffi::ACCEL_PRECISION_FLOAT32,
            PrecisionMode::Float16 => ffi::ACCEL_PRECISION_FLOAT16,
            PrecisionMode::Default => ffi::ACCEL_PRECISION_UNDEFINED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoltageCorner {
    Disable,
    Svs2,
    Svs,
    SvsPlus,
    Nom,
    NomPlus,
    Turbo,
    TurboPlus,
    Max,
}

impl VoltageCorner {
    pub fn code(self) -> u32 {
        match self {
            VoltageCorner::Disable => ffi::ACCEL_VCORNER_DISABLE,
            VoltageCorner::Svs2 => ffi::ACCEL_VCORNER_SVS2,
            VoltageCorner::Svs => ffi::ACCEL_VCORNER_SVS,
            VoltageCorner::SvsPlus => ffi::ACCEL_VCORNER_SVS_PLUS,
            VoltageCorner::Nom => ffi::ACCEL_VCORNER_NOM,
            VoltageCorner::NomPlus => ffi::ACCEL_VCORNER_NOM_PLUS,
            VoltageCorner::Turbo => ffi::ACCEL_VCORNER_TURBO,
            VoltageCorner::TurboPlus => ffi::ACCEL_VCORNER_TURBO_PLUS,
            VoltageCorner::Max => ffi::ACCEL_VCORNER_MAX,
        }
    }
}

/// NPU power/performance profile. Defaults are a sustained burst profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerProfile {
    pub dcvs_enable: bool,
    pub performance_mode: bool,
    pub sleep_latency: u32,
    pub sleep_disable: bool,
    pub min_corner: VoltageCorner,
    pub target_corner: VoltageCorner,
    pub max_corner: VoltageCorner,
    pub rpc_control_latency_us: u32,
    pub rpc_polling_time_us: u32,
}

impl Default for PowerProfile {
    fn default() -> Self {
        Self {
            dcvs_enable: false,
            performance_mode: true,
            sleep_latency: 40,
            sleep_disable: false,
            min_corner: VoltageCorner::Turbo,
            target_corner: VoltageCorner::Turbo,
            max_corner: VoltageCorner::Turbo,
            rpc_control_latency_us: 100,
            rpc_polling_time_us: 1000,
        }
    }
}

/// Backend-family tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub precision: PrecisionMode,
    /// Graph optimization level, nominally 0..=3. Not range-checked here;
    /// the backend decides what it accepts.
    pub optimization_level: u32,
    /// VTCM size in MB, `None` for the maximum.
    pub vtcm_mb: Option<u32>,
    /// HVX threads, `None` for as many as the device allows.
    pub hvx_threads: Option<u64>,
    pub dlbc: bool,
    pub gpu_tuning_mode: bool,
    pub gpu_cache_dir: PathBuf,
    pub gpu_invalidate_cache: bool,
    pub power: PowerProfile,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            precision: PrecisionMode::Float16,
            optimization_level: 2,
            vtcm_mb: None,
            hvx_threads: None,
            dlbc: true,
            gpu_tuning_mode: true,
            gpu_cache_dir: PathBuf::from("."),
            gpu_invalidate_cache: false,
            power: PowerProfile::default(),
        }
    }
}

/// Bounded worker pool used by the asynchronous C entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Jobs allowed to wait for a worker before submissions are rejected.
    pub queue_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
        }
    }
}

/// Everything needed to create a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path of the backend library, e.g. `libAccelHtp.so`.
    pub backend_path: PathBuf,
    /// Model library to compose graphs from, or a `.bin` context cache.
    pub model_path: PathBuf,
    #[serde(default)]
    pub output_data_type: OutputDataType,
    #[serde(default)]
    pub input_data_type: InputDataType,
    /// Directory to `chdir` into before loading libraries.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Op packages as `path:interface_provider[:target]`.
    #[serde(default)]
    pub op_packages: Vec<String>,
    #[serde(default)]
    pub profiling: ProfilingLevel,
    /// Ask the model library to emit debug outputs while composing.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub tuning: TuningConfig,
    /// Sizes the C interface's async pool when the session is created with
    /// `accel_session_create_from_config` before the pool starts.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

fn default_log_level() -> LogLevel {
    LogLevel::Error
}

impl SessionConfig {
    pub fn new(backend_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            backend_path: backend_path.into(),
            model_path: model_path.into(),
            output_data_type: OutputDataType::default(),
            input_data_type: InputDataType::default(),
            data_dir: None,
            op_packages: Vec::new(),
            profiling: ProfilingLevel::Off,
            debug: false,
            log_level: default_log_level(),
            tuning: TuningConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, Error> {
        toml::from_str(toml_str).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("TOML serialise error: {e}")))
    }

    /// Switch into `data_dir`, if set. Failure is logged and ignored so the
    /// library paths can still resolve on their own.
    pub fn enter_data_dir(&self, logger: &Logger) {
        let Some(dir) = self.data_dir.as_ref() else {
            return;
        };
        match std::env::set_current_dir(dir) {
            Ok(()) => accel_info!(logger, "changed working directory to {}", dir.display()),
            Err(e) => accel_warn!(
                logger,
                "could not change working directory to {}: {e}",
                dir.display()
            ),
        }
    }
}
