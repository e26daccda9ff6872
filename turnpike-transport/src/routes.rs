//! Route table: a per-destination next-hop hint.
//!
//! Routing is a lookup, not a forwarding engine: `resolve` consults the
//! table exactly once and never recurses, so a chain of routes is not
//! followed. Entries never expire.

use std::collections::HashMap;
use std::sync::Mutex;

use turnpike_core::ServiceEndpoint;

/// Mapping of destination endpoint → next-hop endpoint.
#[derive(Default)]
pub struct RouteTable {
    inner: Mutex<HashMap<ServiceEndpoint, ServiceEndpoint>>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that traffic for `to` should be sent via `via`.
    pub fn insert(&self, to: ServiceEndpoint, via: ServiceEndpoint) {
        tracing::debug!(to = %to, via = %via, "route recorded");
        self.lock().insert(to, via);
    }

    /// Resolve a destination with a single lookup.
    pub fn resolve(&self, destination: &ServiceEndpoint) -> ServiceEndpoint {
        self.lock()
            .get(destination)
            .cloned()
            .unwrap_or_else(|| destination.clone())
    }

    /// Number of recorded routes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceEndpoint, ServiceEndpoint>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THUMB: &str = "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709";

    fn endpoint(port: u16) -> ServiceEndpoint {
        ServiceEndpoint::parse(&format!("https://127.0.0.1:{port}/"), THUMB).expect("endpoint")
    }

    #[test]
    fn unrouted_destination_resolves_to_itself() {
        let routes = RouteTable::new();
        assert_eq!(routes.resolve(&endpoint(1)), endpoint(1));
    }

    #[test]
    fn routed_destination_resolves_to_its_hop() {
        let routes = RouteTable::new();
        routes.insert(endpoint(1), endpoint(2));
        assert_eq!(routes.resolve(&endpoint(1)), endpoint(2));
    }

    #[test]
    fn resolution_is_a_single_lookup() {
        let routes = RouteTable::new();
        routes.insert(endpoint(1), endpoint(2));
        routes.insert(endpoint(2), endpoint(3));

        // No transitive chase: 1 → 2, even though 2 is itself routed.
        assert_eq!(routes.resolve(&endpoint(1)), endpoint(2));
    }
}
