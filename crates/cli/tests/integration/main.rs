//! CLI integration tests: real builds through the `kiln` binary.

mod common;

mod build_tests;
mod cache_tests;
mod rulekey_tests;
