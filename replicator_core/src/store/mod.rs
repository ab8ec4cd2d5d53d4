//! Storage seams: the per-organization row store holding replicated tables,
//! the configuration store for integrations/jobs, and the job queue.

pub mod memory;
pub mod postgres;
pub mod postgres_integrations;
pub mod schema;
pub mod traits;

pub use memory::{MemoryIntegrationStore, MemoryJobScheduler, MemoryRowStore, StatementRecord};
pub use schema::{
    ColumnSpec, ColumnType, ColumnValue, Columns, DeletePredicate, ExpiryPredicate, RowWrite,
    SessionScope, StoredRow, TableSchema, UpsertOutcome,
};
pub use traits::{IntegrationStore, JobScheduler, RowStore, RowStoreResolver, SharedRowStore};
