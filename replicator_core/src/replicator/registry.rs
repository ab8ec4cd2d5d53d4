use std::collections::HashMap;
use std::sync::Arc;

use crate::models::ServiceIntegration;
use crate::replicator::traits::{Replicator, ReplicatorFactory};
use crate::{Error, Result};

/// Maps a service name to the factory building its replicator.
///
/// Built once at startup and shared read-only; callers resolve adapters
/// explicitly through `build` rather than through ambient state.
#[derive(Clone, Default)]
pub struct ReplicatorRegistry {
    factories: HashMap<String, Arc<dyn ReplicatorFactory>>,
}

impl ReplicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "debug", skip(self, factory), fields(service = factory.service_name()))]
    pub fn register(&mut self, factory: Arc<dyn ReplicatorFactory>) -> Result<()> {
        let name = factory.service_name().trim().to_string();
        if name.is_empty() {
            return Err(Error::InvalidInput(
                "replicator service_name is empty".to_string(),
            ));
        }
        if self.factories.contains_key(&name) {
            return Err(Error::Conflict(format!(
                "replicator '{name}' is already registered"
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Register a closure as the factory for `service_name`.
    pub fn register_fn<F>(&mut self, service_name: &str, build: F) -> Result<()>
    where
        F: Fn(&ServiceIntegration) -> Result<Arc<dyn Replicator>> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnFactory {
            service_name: service_name.to_string(),
            build,
        }))
    }

    pub fn contains(&self, service_name: &str) -> bool {
        self.factories.contains_key(service_name)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Bind the registered replicator for `integration.service_name` to `integration`.
    #[tracing::instrument(level = "debug", skip_all, fields(integration = %integration.id, service = %integration.service_name))]
    pub fn build(&self, integration: &ServiceIntegration) -> Result<Arc<dyn Replicator>> {
        let factory = self
            .factories
            .get(&integration.service_name)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no replicator registered for service '{}'",
                    integration.service_name
                ))
            })?;
        factory.build(integration)
    }
}

struct FnFactory<F> {
    service_name: String,
    build: F,
}

impl<F> ReplicatorFactory for FnFactory<F>
where
    F: Fn(&ServiceIntegration) -> Result<Arc<dyn Replicator>> + Send + Sync + 'static,
{
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn build(&self, integration: &ServiceIntegration) -> Result<Arc<dyn Replicator>> {
        (self.build)(integration)
    }
}
