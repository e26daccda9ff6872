//! Request and response payloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::ServiceEndpoint;

/// A single RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Opaque id, unique within the originating runtime's lifetime.
    pub id: String,

    /// Where the request goes; also decides how (`https` vs `poll`).
    pub destination: ServiceEndpoint,

    /// Identifier of the service implementation to invoke.
    pub service_type: String,

    /// Method name, looked up by the remote invoker.
    pub method: String,

    /// Positional arguments, opaque to the transport.
    pub args: Vec<Value>,

    /// Optional destination-specific metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl RequestMessage {
    /// Create a request with a freshly generated id and no metadata.
    pub fn new(
        destination: ServiceEndpoint,
        service_type: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            id: next_request_id(),
            destination,
            service_type: service_type.into(),
            method: method.into(),
            args,
            metadata: None,
        }
    }

    /// Attach destination-specific metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

fn next_request_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("r-{:08x}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Structured failure raised by a remote service handler.
///
/// Travels inside the response body; it is not a transport error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorDescriptor {
    /// Failure kind, e.g. `ServiceError` or `UnknownMethod`.
    pub kind: String,

    /// Human-readable description.
    pub message: String,

    /// Remote stack text, when the remote side captured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_stack: Option<String>,
}

impl ErrorDescriptor {
    /// Create a descriptor without stack text.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            remote_stack: None,
        }
    }

    /// Attach remote stack text.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.remote_stack = Some(stack.into());
        self
    }
}

/// Reply to a [`RequestMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Id of the request this answers.
    pub request_id: String,

    /// The outcome: a result value, or a structured error from the remote
    /// handler.
    pub result: Result<Value, ErrorDescriptor>,
}

impl ResponseMessage {
    /// A successful response.
    pub fn result(request_id: impl Into<String>, value: Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: Ok(value),
        }
    }

    /// A failed response.
    pub fn error(request_id: impl Into<String>, descriptor: ErrorDescriptor) -> Self {
        Self {
            request_id: request_id.into(),
            result: Err(descriptor),
        }
    }
}
