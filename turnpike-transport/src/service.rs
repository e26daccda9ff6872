//! Service dispatch: how inbound requests reach user code.
//!
//! The transport does not generate proxies. A service registers a
//! [`ServiceHandler`] under its service-type identifier; the registry's
//! invoker looks the handler up, checks the method name and argument arity,
//! and calls `invoke`. Anything the handler raises travels back inside the
//! response as an [`ErrorDescriptor`], never as a transport error.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use turnpike_core::{ErrorDescriptor, RequestMessage, ResponseMessage};

/// Error-descriptor kinds produced by the registry invoker.
pub mod error_kind {
    /// The handler itself failed.
    pub const SERVICE_ERROR: &str = "ServiceError";
    /// No service registered under the requested service type.
    pub const UNKNOWN_SERVICE: &str = "UnknownService";
    /// The service has no method of the requested name.
    pub const UNKNOWN_METHOD: &str = "UnknownMethod";
    /// The method exists but takes a different number of arguments.
    pub const ARITY_MISMATCH: &str = "ArityMismatch";
}

/// Handles one inbound request and produces its response.
///
/// This is the seam between the exchange protocol and everything above it;
/// the listener and the polling client both drive it.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request. Failures are reported inside the response.
    async fn handle(&self, request: RequestMessage) -> ResponseMessage;
}

/// A user-supplied service implementation.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Number of arguments `method` expects, or `None` if the method is
    /// unknown. Consulted before `invoke`.
    fn arity_of(&self, method: &str) -> Option<usize>;

    /// Invoke `method` with positional arguments.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ErrorDescriptor>;
}

/// Registry of service implementations keyed by service-type identifier.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a service type.
    pub fn register(&self, service_type: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        let service_type = service_type.into();
        tracing::debug!(service_type = %service_type, "registering service");
        self.services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(service_type, handler);
    }

    /// Look up the handler for a service type.
    pub fn get(&self, service_type: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(service_type)
            .cloned()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`RequestHandler`] backed by a [`ServiceRegistry`]: lookup by service
/// type, then method name and arity, then invoke.
pub struct RegistryHandler {
    registry: Arc<ServiceRegistry>,
}

impl RegistryHandler {
    /// Wrap a registry.
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RequestHandler for RegistryHandler {
    async fn handle(&self, request: RequestMessage) -> ResponseMessage {
        let RequestMessage {
            id,
            service_type,
            method,
            args,
            ..
        } = request;

        let Some(service) = self.registry.get(&service_type) else {
            return ResponseMessage::error(
                id,
                ErrorDescriptor::new(
                    error_kind::UNKNOWN_SERVICE,
                    format!("no service registered for {service_type:?}"),
                ),
            );
        };

        match service.arity_of(&method) {
            None => ResponseMessage::error(
                id,
                ErrorDescriptor::new(
                    error_kind::UNKNOWN_METHOD,
                    format!("{service_type:?} has no method {method:?}"),
                ),
            ),
            Some(arity) if arity != args.len() => ResponseMessage::error(
                id,
                ErrorDescriptor::new(
                    error_kind::ARITY_MISMATCH,
                    format!(
                        "{service_type:?}.{method} takes {arity} argument(s), got {}",
                        args.len()
                    ),
                ),
            ),
            Some(_) => match service.invoke(&method, args).await {
                Ok(value) => ResponseMessage::result(id, value),
                Err(descriptor) => ResponseMessage::error(id, descriptor),
            },
        }
    }
}
