//! Dynamic endpoint registry.
//!
//! Maps externally visible XRPC method names to deployed endpoints.
//! Names are globally unique: registering a name again replaces the
//! earlier entry.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use avaast_core::DeployedEndpoint;

use crate::error::XrpcError;

/// Registry of live XRPC endpoints.
#[derive(Default)]
pub struct DynamicRouter {
    endpoints: RwLock<HashMap<String, DeployedEndpoint>>,
}

impl DynamicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one endpoint, replacing any earlier holder of the name.
    pub fn register(&self, endpoint: DeployedEndpoint) {
        let mut endpoints = self.endpoints.write().expect("endpoints lock");
        if endpoints.insert(endpoint.name.clone(), endpoint.clone()).is_some() {
            debug!(name = %endpoint.name, "endpoint replaced");
        } else {
            debug!(name = %endpoint.name, "endpoint registered");
        }
    }

    /// Replace the whole registry (admin push semantics).
    pub fn replace_all(&self, new_endpoints: Vec<DeployedEndpoint>) -> usize {
        let mut endpoints = self.endpoints.write().expect("endpoints lock");
        endpoints.clear();
        for endpoint in new_endpoints {
            endpoints.insert(endpoint.name.clone(), endpoint);
        }
        endpoints.len()
    }

    pub fn get_endpoint(&self, name: &str) -> Option<DeployedEndpoint> {
        let endpoints = self.endpoints.read().expect("endpoints lock");
        endpoints.get(name).cloned()
    }

    /// Resolve a name or fail with the XRPC `MethodNotFound` error.
    pub fn resolve(&self, name: &str) -> Result<DeployedEndpoint, XrpcError> {
        self.get_endpoint(name)
            .ok_or_else(|| XrpcError::MethodNotFound(format!("no endpoint named {name}")))
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        let endpoints = self.endpoints.read().expect("endpoints lock");
        let mut names: Vec<String> = endpoints.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avaast_core::{EndpointKind, ResourceRef};

    fn endpoint(name: &str, hash: &str) -> DeployedEndpoint {
        DeployedEndpoint {
            name: name.to_string(),
            kind: EndpointKind::Computed,
            resource: ResourceRef::new("did:plc:alice", hash),
        }
    }

    #[test]
    fn register_and_resolve() {
        let router = DynamicRouter::new();
        router.register(endpoint("chat.pirate.getAvasts", "a"));
        let found = router.resolve("chat.pirate.getAvasts").unwrap();
        assert_eq!(found.resource.content_hash, "a");
    }

    #[test]
    fn unknown_name_is_method_not_found() {
        let router = DynamicRouter::new();
        let err = router.resolve("chat.pirate.doesNotExist").unwrap_err();
        assert_eq!(err.kind(), "MethodNotFound");
    }

    #[test]
    fn duplicate_name_replaces() {
        let router = DynamicRouter::new();
        router.register(endpoint("m", "old"));
        router.register(endpoint("m", "new"));
        assert_eq!(router.resolve("m").unwrap().resource.content_hash, "new");
        assert_eq!(router.endpoint_names().len(), 1);
    }

    #[test]
    fn replace_all_swaps_the_registry() {
        let router = DynamicRouter::new();
        router.register(endpoint("old.one", "a"));
        let count = router.replace_all(vec![endpoint("new.one", "b"), endpoint("new.two", "c")]);
        assert_eq!(count, 2);
        assert!(router.get_endpoint("old.one").is_none());
        assert_eq!(router.endpoint_names(), vec!["new.one", "new.two"]);
    }
}
