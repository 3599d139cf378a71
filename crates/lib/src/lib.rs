//! kiln-lib: caching build engine
//!
//! This crate provides the pieces of an incremental, cache-backed build:
//! - `BuildTarget` and `Rule`: what to build and how
//! - `ActionGraph`: the rules of a build and their dependencies
//! - `RuleKeyFactory`: deterministic keys over every input of a rule
//! - `ArtifactCache`: local and remote storage for rule outputs
//! - `CachingBuildEngine`: schedules rules, consults caches and runs actions

pub mod buildinfo;
pub mod cache;
pub mod config;
pub mod consts;
pub mod engine;
pub mod graph;
pub mod pipeline;
pub mod rule;
pub mod rulekey;
pub mod session;
pub mod stats;
pub mod target;
pub mod util;
