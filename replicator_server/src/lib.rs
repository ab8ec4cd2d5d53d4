#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod error;
pub mod jobs;
pub mod routes;
pub mod server;
