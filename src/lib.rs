//! PDFium Worker Library
//!
//! Resource management and a message-driven worker around a PDFium-style
//! native engine.
//!
//! # Modules
//!
//! - `pdfium`: Native module boundary, tracked allocator, simulated engine
//! - `cache`: Document and page handle cache (TTL, LRU, ref counts)
//! - `task`: Cancellable task with progress events
//! - `engine`: Engine surface and the in-process implementation
//! - `worker`: Message protocol, runner and host-side client
//! - `config`: Environment-driven configuration

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod pdfium;
pub mod task;
pub mod worker;

pub use config::Config;
pub use engine::{PdfEngine, PdfiumEngine};
pub use error::{EngineError, PdfErrorCode, PdfErrorReason, Result};
pub use task::{Task, TaskOutcome};
pub use worker::{EngineRunner, WorkerEngine};
