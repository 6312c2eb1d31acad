//! Cross-module integration tests.

mod pipeline_test;
mod security_test;
