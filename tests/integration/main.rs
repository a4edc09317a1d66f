//! Integration tests for the CONCLAVE core.

mod mocks;
mod scenarios;
mod simulation;
