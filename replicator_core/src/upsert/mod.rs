pub mod diff;
pub mod engine;

pub use diff::{EnrichmentStatus, UpsertDiff, UpsertSummary};
pub use engine::UpsertEngine;
