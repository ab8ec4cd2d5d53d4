//! Cursor-driven historical import.

pub mod pages;
pub mod runner;

pub use pages::PageWalker;
pub use runner::{BackfillRunner, schedule_backfill};
