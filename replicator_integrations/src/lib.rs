//! Source API adapters shared by concrete replicators, plus a settings-driven
//! generic JSON replicator.

pub mod generic;
pub mod http_source;

pub use generic::{GenericJsonFactory, GenericJsonReplicator};
pub use http_source::{HttpAuth, HttpPagedSource, HttpSourceConfig};

use replicator_core::replicator::registry::ReplicatorRegistry;
use replicator_core::Result;
use std::sync::Arc;

/// Register every replicator this crate ships.
pub fn register_all(registry: &mut ReplicatorRegistry) -> Result<()> {
    registry.register(Arc::new(GenericJsonFactory))
}
