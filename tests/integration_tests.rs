//! Integration test entry point.
//!
//! Compiles the tests in tests/integration/ as a single binary.

mod integration;
