//! Result and error types of a build.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buildinfo::BuildInfoError;
use crate::graph::GraphError;
use crate::rule::ActionError;
use crate::rulekey::{RuleKey, RuleKeyError};
use crate::stats::CacheStats;
use crate::target::{BuildTarget, DependencyStack};

/// How a rule ended up successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessType {
  /// The action ran.
  Built,
  /// Outputs came from the artifact cache under the full rule key.
  FetchedFromCache,
  /// Outputs came from the artifact cache through a dependency-file manifest.
  FetchedFromCacheManifestBased,
  /// The last build had the same rule key and its outputs are intact.
  MatchingRuleKey,
  /// The last build read the same inputs with the same contents.
  MatchingDepFileRuleKey,
  /// Another target with the same rule key was built; its outputs were copied.
  Deduplicated,
}

impl SuccessType {
  pub fn status(self) -> BuildStatus {
    match self {
      SuccessType::FetchedFromCache | SuccessType::FetchedFromCacheManifestBased => BuildStatus::Cached,
      _ => BuildStatus::Success,
    }
  }
}

impl std::fmt::Display for SuccessType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      SuccessType::Built => "built",
      SuccessType::FetchedFromCache => "fetched from cache",
      SuccessType::FetchedFromCacheManifestBased => "fetched from cache (manifest)",
      SuccessType::MatchingRuleKey => "up to date",
      SuccessType::MatchingDepFileRuleKey => "up to date (dep file)",
      SuccessType::Deduplicated => "deduplicated",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
  Success,
  Fail,
  Cached,
}

/// Errors that can occur while building a rule.
#[derive(Debug, Error)]
pub enum BuildError {
  /// A dependency edge names a target with no rule.
  #[error("no rule for {target} (required by {stack})")]
  DependencyNotFound { target: BuildTarget, stack: DependencyStack },

  /// The dependency graph has a cycle.
  #[error("dependency cycle: {}", .chain.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "))]
  Cycle { chain: Vec<BuildTarget> },

  /// The graph file or a pipeline chain is malformed.
  #[error(transparent)]
  Graph(GraphError),

  /// A dependency failed, so the rule was not attempted.
  #[error("{target} not built: dependency {dependency} failed")]
  DependencyFailed {
    target: BuildTarget,
    dependency: BuildTarget,
    stack: DependencyStack,
  },

  /// Another target with the same rule key failed.
  #[error("{target} not built: {leader} has the same rule key and failed")]
  DuplicateFailed { target: BuildTarget, leader: BuildTarget },

  /// The build was stopped after another rule failed.
  #[error("{target} not built: build stopped after an earlier failure")]
  Cancelled { target: BuildTarget },

  /// The rule did not produce a declared output.
  #[error("{target} did not produce declared output {path}")]
  MissingOutput { target: BuildTarget, path: PathBuf },

  /// The rule's action failed.
  #[error("{target} failed: {source}")]
  Execution {
    target: BuildTarget,
    stack: DependencyStack,
    #[source]
    source: ActionError,
  },

  /// An earlier member of the rule's pipeline chain failed.
  #[error("{target} not built: pipeline member {failed} failed")]
  PipelineFault { target: BuildTarget, failed: BuildTarget },

  #[error("{target}: {source}")]
  RuleKey {
    target: BuildTarget,
    #[source]
    source: RuleKeyError,
  },

  #[error("{target}: {context}: {source}")]
  Io {
    target: BuildTarget,
    context: String,
    #[source]
    source: io::Error,
  },

  #[error("{target}: {source}")]
  BuildInfo {
    target: BuildTarget,
    #[source]
    source: BuildInfoError,
  },

  /// The output tree could not be prepared.
  #[error("failed to prepare {path}: {source}")]
  Setup {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// The task building the rule panicked or was aborted.
  #[error("{target}: build task failed: {message}")]
  Panicked { target: BuildTarget, message: String },
}

impl From<GraphError> for BuildError {
  fn from(e: GraphError) -> Self {
    match e {
      GraphError::DependencyNotFound { target, stack } => BuildError::DependencyNotFound { target, stack },
      GraphError::Cycle { chain } => BuildError::Cycle { chain },
      other => BuildError::Graph(other),
    }
  }
}

impl BuildError {
  pub(crate) fn io(target: &BuildTarget, context: impl Into<String>, source: io::Error) -> Self {
    BuildError::Io {
      target: target.clone(),
      context: context.into(),
      source,
    }
  }

  /// Whether this error is a consequence of another rule's failure.
  pub fn is_derived(&self) -> bool {
    matches!(
      self,
      BuildError::DependencyFailed { .. }
        | BuildError::DuplicateFailed { .. }
        | BuildError::Cancelled { .. }
        | BuildError::PipelineFault { .. }
    )
  }

  /// Path from a requested target to the failing rule, when known.
  pub fn stack(&self) -> Option<&DependencyStack> {
    match self {
      BuildError::DependencyNotFound { stack, .. }
      | BuildError::DependencyFailed { stack, .. }
      | BuildError::Execution { stack, .. } => Some(stack),
      _ => None,
    }
  }

  pub fn target(&self) -> Option<&BuildTarget> {
    match self {
      BuildError::DependencyNotFound { target, .. }
      | BuildError::DependencyFailed { target, .. }
      | BuildError::DuplicateFailed { target, .. }
      | BuildError::Cancelled { target }
      | BuildError::MissingOutput { target, .. }
      | BuildError::Execution { target, .. }
      | BuildError::PipelineFault { target, .. }
      | BuildError::RuleKey { target, .. }
      | BuildError::Io { target, .. }
      | BuildError::BuildInfo { target, .. }
      | BuildError::Panicked { target, .. } => Some(target),
      BuildError::Cycle { .. } | BuildError::Graph(_) | BuildError::Setup { .. } => None,
    }
  }
}

/// Outcome of one requested target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
  pub target: BuildTarget,
  pub status: BuildStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub success_type: Option<SuccessType>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rule_key: Option<RuleKey>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output_dir: Option<PathBuf>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// A failure that was not caused by another failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFailure {
  pub target: BuildTarget,
  pub message: String,
  /// Path from a requested target down to `target`.
  pub stack: Vec<BuildTarget>,
}

/// Everything known about a finished build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
  pub build_id: String,
  pub success: bool,
  /// One entry per requested target, in request order.
  pub results: Vec<TargetResult>,
  /// Root causes, one per failing rule.
  pub failures: Vec<RootFailure>,
  /// Rules whose action ran, in the order they finished.
  pub executed: Vec<BuildTarget>,
  pub stats: CacheStats,
  pub duration_ms: u64,
}

impl BuildReport {
  pub fn result_for(&self, target: &BuildTarget) -> Option<&TargetResult> {
    self.results.iter().find(|r| &r.target == target)
  }

  pub fn exit_code(&self) -> i32 {
    if self.success { 0 } else { 1 }
  }
}
