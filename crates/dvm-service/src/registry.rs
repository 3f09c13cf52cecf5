// SPDX-License-Identifier: MIT OR Apache-2.0
//! Kind-to-service dispatch table.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::DvmService;

/// Immutable mapping from request kind to its service.
///
/// Built once at startup. A lookup miss means the request kind is not
/// served; callers drop such requests silently to shrug off relay noise.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<u16, Arc<dyn DvmService>>,
}

impl ServiceRegistry {
    /// Empty registry; chain [`with`](Self::with) to populate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its kind. A later registration for the
    /// same kind replaces the earlier one.
    #[must_use]
    pub fn with(mut self, service: Arc<dyn DvmService>) -> Self {
        self.services.insert(service.kind(), service);
        self
    }

    /// Look up the service for a request kind.
    pub fn get(&self, kind: u16) -> Option<Arc<dyn DvmService>> {
        self.services.get(&kind).cloned()
    }

    /// All served kinds, ascending.
    pub fn kinds(&self) -> Vec<u16> {
        self.services.keys().copied().collect()
    }

    /// Iterate services in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (&u16, &Arc<dyn DvmService>)> {
        self.services.iter()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiscoveryService, MockInference, TextGenerationService};

    fn registry() -> ServiceRegistry {
        let backend = Arc::new(MockInference::default());
        ServiceRegistry::new()
            .with(Arc::new(TextGenerationService::new(backend.clone(), 500, 400)))
            .with(Arc::new(DiscoveryService::new(backend, 500)))
    }

    #[test]
    fn lookup_hits_registered_kinds() {
        let reg = registry();
        assert!(reg.get(5001).is_some());
        assert!(reg.get(5300).is_some());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn lookup_misses_unserved_kinds() {
        let reg = registry();
        assert!(reg.get(5999).is_none());
        assert!(reg.get(5100).is_none());
    }

    #[test]
    fn kinds_are_sorted() {
        let reg = registry();
        assert_eq!(reg.kinds(), vec![5001, 5300]);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let backend = Arc::new(MockInference::default());
        let reg = ServiceRegistry::new()
            .with(Arc::new(TextGenerationService::new(backend.clone(), 500, 400)))
            .with(Arc::new(TextGenerationService::new(backend, 900, 700)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(5001).unwrap().default_price_msats(), 900);
    }
}
