//! End-to-end tests of the caching build engine.

mod common;

mod build_tests;
mod cache_tests;
mod failure_tests;
mod pipeline_tests;
