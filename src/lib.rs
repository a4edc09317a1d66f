//! CONCLAVE — consensus, node scaling and staged execution core
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod events;
pub mod consensus;
pub mod scaler;
pub mod pipeline;
pub mod engine;
pub mod dashboard;
