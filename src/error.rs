use std::path::PathBuf;

use crate::backend::VendorError;
use crate::ffi;

/// Everything that can go wrong between the caller and the vendor runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load library {path}: {reason}")]
    LibraryNotFound { path: String, reason: String },

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// The loaded runtime does not export the entry point this step needs.
    #[error("vendor function {0} is not available")]
    FunctionUnavailable(&'static str),

    #[error("{call} failed (code {code})")]
    Vendor { call: &'static str, code: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("graph index {requested} out of range (have {available})")]
    InvalidIndex { requested: usize, available: usize },

    #[error("persistent tensors are not initialized for graph index {0}")]
    TensorsNotBound(usize),

    #[error("only one graph per session can be executed, found {0}")]
    UnsupportedGraphCount(usize),

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("context binary {0} is empty")]
    EmptyBinary(PathBuf),

    #[error("context binary overflow: vendor wrote {written} bytes into {allocated}")]
    BinaryOverflow { written: u64, allocated: u64 },

    #[error("tensor '{tensor}': {detail}")]
    Tensor { tensor: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("dispatch queue is full")]
    QueueFull,

    #[error("task cancelled before completion")]
    Cancelled,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error taxonomy shared by the Rust API and the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    /// Missing library, symbol or vendor entry point.
    ResourceUnavailable,
    SystemError,
    SystemCommunicationError,
    FeatureUnsupported,
    OutOfMemory,
    Failure,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_)
            | Error::InvalidIndex { .. }
            | Error::Config(_)
            | Error::Image(_)
            | Error::Tokenizer(_) => ErrorKind::InvalidArgument,
            Error::LibraryNotFound { .. }
            | Error::SymbolNotFound(_)
            | Error::FunctionUnavailable(_) => ErrorKind::ResourceUnavailable,
            Error::Vendor { code, .. } => match Status::classify(*code) {
                Status::SystemError => ErrorKind::SystemError,
                Status::SystemCommunicationError => ErrorKind::SystemCommunicationError,
                Status::FeatureUnsupported => ErrorKind::FeatureUnsupported,
                _ if *code == ffi::ACCEL_ERROR_MEM_ALLOC => ErrorKind::OutOfMemory,
                _ => ErrorKind::Failure,
            },
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            _ => ErrorKind::Failure,
        }
    }
}

impl From<VendorError> for Error {
    fn from(e: VendorError) -> Self {
        match e {
            VendorError::Unavailable(name) => Error::FunctionUnavailable(name),
            VendorError::Code { call, code } => Error::Vendor { call, code },
        }
    }
}

/// Outcome of a session operation as seen across the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    Failure = 1,
    InputExhausted = 2,
    SystemError = 3,
    SystemCommunicationError = 4,
    FeatureUnsupported = 5,
}

impl Status {
    /// Map a raw vendor error code. Only three codes are distinguished,
    /// everything else is a generic failure.
    pub fn classify(code: u64) -> Status {
        match code {
            ffi::ACCEL_SUCCESS => Status::Success,
            ffi::ACCEL_ERROR_SYSTEM_COMMUNICATION => Status::SystemCommunicationError,
            ffi::ACCEL_ERROR_SYSTEM => Status::SystemError,
            ffi::ACCEL_ERROR_NOT_SUPPORTED => Status::FeatureUnsupported,
            _ => Status::Failure,
        }
    }
}

impl From<&Error> for Status {
    fn from(e: &Error) -> Self {
        match e {
            // Loading failures surface as a system error at creation time.
            Error::LibraryNotFound { .. } | Error::SymbolNotFound(_) => Status::SystemError,
            Error::Vendor { code, .. } => Status::classify(*code),
            _ => Status::Failure,
        }
    }
}

impl<T> From<&Result<T, Error>> for Status {
    fn from(r: &Result<T, Error>) -> Self {
        match r {
            Ok(_) => Status::Success,
            Err(e) => Status::from(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_three_codes() {
        assert_eq!(
            Status::classify(ffi::ACCEL_ERROR_SYSTEM_COMMUNICATION),
            Status::SystemCommunicationError
        );
        assert_eq!(Status::classify(ffi::ACCEL_ERROR_SYSTEM), Status::SystemError);
        assert_eq!(
            Status::classify(ffi::ACCEL_ERROR_NOT_SUPPORTED),
            Status::FeatureUnsupported
        );
        assert_eq!(Status::classify(ffi::ACCEL_ERROR_INVALID_ARGUMENT), Status::Failure);
        assert_eq!(Status::classify(42), Status::Failure);
    }

    #[test]
    fn missing_symbols_are_system_errors() {
        let e = Error::SymbolNotFound("accel_backend_create".into());
        assert_eq!(Status::from(&e), Status::SystemError);
        assert_eq!(e.kind(), ErrorKind::ResourceUnavailable);
    }

    #[test]
    fn vendor_error_conversion() {
        let e: Error = VendorError::Unavailable("accel_graph_execute").into();
        assert!(matches!(e, Error::FunctionUnavailable("accel_graph_execute")));
        assert_eq!(Status::from(&e), Status::Failure);

        let e: Error = VendorError::Code {
            call: "accel_context_create",
            code: ffi::ACCEL_ERROR_MEM_ALLOC,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::OutOfMemory);
        assert_eq!(e.to_string(), "accel_context_create failed (code 1002)");
    }

    #[test]
    fn tensors_not_bound_message() {
        let e = Error::TensorsNotBound(0);
        assert!(e.to_string().contains("persistent tensors are not initialized"));
    }
}
