//! Worker message envelopes
//!
//! Every message is a JSON object with `id` and `type`; most carry `data`.
//! Requests flow host → worker, responses flow worker → host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PdfErrorReason;
use crate::task::TaskOutcome;

/// Id carried by the one `ReadyResponse`
pub const READY_ID: &str = "0";

/// Engine method invocation: wire name plus positional arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    ExecuteRequest { id: String, data: MethodCall },
    /// Targets the `ExecuteRequest` with the same id
    AbortRequest { id: String },
}

impl Request {
    pub fn execute(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Request::ExecuteRequest {
            id: id.into(),
            data: MethodCall {
                name: name.into(),
                args,
            },
        }
    }

    pub fn abort(id: impl Into<String>) -> Self {
        Request::AbortRequest { id: id.into() }
    }

    pub fn id(&self) -> &str {
        match self {
            Request::ExecuteRequest { id, .. } | Request::AbortRequest { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Exactly one per started request, after all of its progress
    ExecuteResponse {
        id: String,
        data: TaskOutcome<Value, PdfErrorReason>,
    },
    ExecuteProgress { id: String, data: Value },
    ReadyResponse { id: String },
}

impl Response {
    pub fn ready() -> Self {
        Response::ReadyResponse {
            id: READY_ID.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Response::ExecuteResponse { id, .. }
            | Response::ExecuteProgress { id, .. }
            | Response::ReadyResponse { id } => id,
        }
    }
}
