//! Stale row maintenance.

pub mod deleter;
pub mod guard;

pub use deleter::{StaleRowDeleter, StaleRowReport};
pub use guard::{AutovacuumPause, with_autovacuum_paused};
