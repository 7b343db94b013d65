#[cfg(not(any(feature = "dynamic", feature = "static-link")))]
compile_error!("enable either the `dynamic` or the `static-link` feature");

#[macro_use]
pub mod log;
pub mod ffi;
pub mod error;
pub mod tensor;
pub mod options;
pub mod config;
pub mod backend;
pub mod bindings;
mod loader;
pub mod session;
pub mod dispatch;
pub mod capi;
#[cfg(feature = "imaging")]
pub mod preprocess;
#[cfg(feature = "tokenizer")]
pub mod tokenizer;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use backend::{AcceleratorBackend, BackendLoader, GraphInfo, LoadRequest, ModelSource};
pub use bindings::{NativeTensor, TensorBindings};
pub use config::{
    DispatchConfig, InputDataType, OutputDataType, PowerProfile, PrecisionMode, SessionConfig,
    TuningConfig,
};
pub use dispatch::{Dispatcher, TaskHandle};
pub use error::{Error, ErrorKind, Status};
#[cfg(feature = "dynamic")]
pub use loader::DynamicLoader;
#[cfg(feature = "static-link")]
pub use loader::StaticLoader;
pub use loader::default_loader;
pub use log::{LogLevel, Logger, LoggerFactory};
pub use options::BackendFamily;
pub use session::{LifecycleState, OpPackage, Session};
pub use tensor::{DataType, QuantParams, TensorInfo};
