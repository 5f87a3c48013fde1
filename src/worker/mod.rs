//! Worker boundary
//!
//! The engine runs in an execution unit of its own and is driven by
//! messages. Both halves live here:
//!
//! ```text
//!   host                                   worker
//! ┌──────────────┐  ExecuteRequest    ┌──────────────┐
//! │ WorkerEngine │ ─────────────────▶ │ EngineRunner │ ──▶ PdfEngine
//! │ (PdfEngine)  │  AbortRequest      │              │
//! │              │ ◀───────────────── │              │
//! └──────────────┘  ExecuteProgress*  └──────────────┘
//!                   ExecuteResponse
//!                   ReadyResponse (once)
//! ```

pub mod client;
pub mod protocol;
pub mod runner;

pub use client::WorkerEngine;
pub use protocol::{MethodCall, Request, Response, READY_ID};
pub use runner::EngineRunner;
