//! Error types
//!
//! One taxonomy for the allocator, the resource cache and the worker, plus the
//! serializable reason that travels inside a rejected `ExecuteResponse`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pdfium::NativeErrorCode;

/// Engine-layer error type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The allocation would push the tracked total over the ceiling
    #[error("Total memory usage would exceed limit: {requested} > {limit}")]
    OutOfMemory { requested: usize, limit: usize },

    /// The native heap returned a null pointer
    #[error("Failed to allocate {0} bytes")]
    AllocationFailed(usize),

    /// A call on a page context that has already been torn down
    #[error("PageContext already disposed (page {0})")]
    UseAfterDispose(usize),

    /// Unknown document id, page index or other lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document id registered twice
    #[error("Document already open: {0}")]
    AlreadyOpen(String),

    /// Task aborted before it started running
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Host-initiated abort of a running call
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Request named a method the engine does not expose
    #[error("engine method {0} is not supported")]
    UnknownMethod(String),

    /// Request args did not match the method's positional tuple
    #[error("Invalid arguments for {method}: {message}")]
    InvalidArgs { method: String, message: String },

    /// Request arrived before the engine finished initializing
    #[error("engine has not started yet")]
    NotReady,

    /// Native engine call failed and reported its last error
    #[error("{call} failed with {code:?}")]
    Native {
        call: &'static str,
        code: NativeErrorCode,
    },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error code carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PdfErrorCode {
    Unknown,
    OutOfMemory,
    AllocationFailed,
    UseAfterDispose,
    NotFound,
    DocNotOpen,
    AlreadyOpen,
    Aborted,
    Cancelled,
    NotSupport,
    InvalidArgs,
    NotReady,
    File,
    Format,
    Password,
    Security,
}

/// Rejection reason carried by a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfErrorReason {
    pub code: PdfErrorCode,
    pub message: String,
}

impl PdfErrorReason {
    pub fn new(code: PdfErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Reason used when the host aborts an in-flight request
    pub fn cancelled() -> Self {
        Self::new(PdfErrorCode::Cancelled, "aborted by client")
    }

    /// Reason used when a request is aborted before it starts
    pub fn pre_cancelled() -> Self {
        Self::new(PdfErrorCode::Aborted, "aborted by client (pre-cancelled)")
    }
}

impl std::fmt::Display for PdfErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<EngineError> for PdfErrorReason {
    fn from(err: EngineError) -> Self {
        let code = match &err {
            EngineError::OutOfMemory { .. } => PdfErrorCode::OutOfMemory,
            EngineError::AllocationFailed(_) => PdfErrorCode::AllocationFailed,
            EngineError::UseAfterDispose(_) => PdfErrorCode::UseAfterDispose,
            EngineError::NotFound(_) => PdfErrorCode::NotFound,
            EngineError::AlreadyOpen(_) => PdfErrorCode::AlreadyOpen,
            EngineError::Aborted(_) => PdfErrorCode::Aborted,
            EngineError::Cancelled(_) => PdfErrorCode::Cancelled,
            EngineError::UnknownMethod(_) => PdfErrorCode::NotSupport,
            EngineError::InvalidArgs { .. } => PdfErrorCode::InvalidArgs,
            EngineError::NotReady => PdfErrorCode::NotReady,
            EngineError::Native { code, .. } => match code {
                NativeErrorCode::File => PdfErrorCode::File,
                NativeErrorCode::Format => PdfErrorCode::Format,
                NativeErrorCode::Password => PdfErrorCode::Password,
                NativeErrorCode::Security => PdfErrorCode::Security,
                NativeErrorCode::Success | NativeErrorCode::Unknown | NativeErrorCode::Page => {
                    PdfErrorCode::Unknown
                }
            },
        };
        PdfErrorReason::new(code, err.to_string())
    }
}
