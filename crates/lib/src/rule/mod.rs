//! Build rules.
//!
//! A [`Rule`] pairs a [`BuildTarget`] with its declared dependencies, the
//! outputs it promises to produce and a [`Buildable`] that knows how to
//! describe itself for rule keys and how to run its action.
//!
//! Two rule kinds ship with the engine:
//! - [`cmd::CmdRule`]: runs a shell command in an isolated environment
//! - [`write_file::WriteFileRule`]: writes fixed content to a file

pub mod cmd;
pub mod write_file;

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::buildinfo::BuildableContext;
use crate::rulekey::RuleKeyFields;
use crate::target::BuildTarget;

pub use cmd::CmdRule;
pub use write_file::WriteFileRule;

/// Errors raised by a rule's action.
#[derive(Debug, Error)]
pub enum ActionError {
  /// Command execution failed.
  #[error("command failed with exit code {code:?}: {cmd}")]
  CmdFailed { cmd: String, code: Option<i32> },

  /// The action reported a failure of its own.
  #[error("{0}")]
  Failed(String),

  /// I/O error during execution.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Optional behaviors a rule opts into.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
  /// The rule shares pipeline state with `previous`, which must be one of
  /// its declared dependencies. A rule without `previous` heads a chain.
  SupportsPipelining { previous: Option<BuildTarget> },

  /// The rule reports which of its coverable inputs it actually read.
  SupportsDependencyFileKeys,
}

/// Shared state handed along a pipelined chain of rules.
pub trait RulePipelineState: Send {
  fn as_any_mut(&mut self) -> &mut dyn Any;

  /// Release resources held by the state. Called exactly once.
  fn close(&mut self) {}
}

/// What a rule is and how to build it.
#[async_trait]
pub trait Buildable: Send + Sync + fmt::Debug {
  /// Short name of the rule kind, folded into every rule key.
  fn rule_type(&self) -> &str;

  /// Describe every input that affects the rule's output.
  fn append_to_rule_key(&self, fields: &mut RuleKeyFields);

  async fn build(&self, ctx: &mut ActionContext<'_>) -> Result<(), ActionError>;

  /// Create the state shared by a pipelined chain this rule heads.
  fn create_pipeline_state(&self) -> Result<Option<Box<dyn RulePipelineState>>, ActionError> {
    Ok(None)
  }
}

/// Everything an action may touch while it runs.
pub struct ActionContext<'a> {
  pub target: &'a BuildTarget,
  pub project_root: &'a Path,

  /// Directory the rule writes its outputs into. Empty when the action starts.
  pub output_dir: &'a Path,

  /// Output directories of the rule's dependencies, in dependency order.
  pub dep_output_dirs: &'a BTreeMap<BuildTarget, PathBuf>,

  /// Shell override from configuration.
  pub shell: Option<&'a str>,

  pub buildable_context: &'a mut BuildableContext,
  pub pipeline_state: Option<&'a mut Box<dyn RulePipelineState>>,
}

impl ActionContext<'_> {
  /// The chain's pipeline state, if this rule runs pipelined and the state
  /// has type `T`.
  pub fn pipeline_state<T: 'static>(&mut self) -> Option<&mut T> {
    self
      .pipeline_state
      .as_mut()
      .and_then(|state| state.as_any_mut().downcast_mut::<T>())
  }
}

/// A node of the action graph.
#[derive(Debug, Clone)]
pub struct Rule {
  target: BuildTarget,
  deps: BTreeSet<BuildTarget>,
  outputs: Vec<PathBuf>,
  capabilities: BTreeSet<Capability>,
  buildable: Arc<dyn Buildable>,
}

impl Rule {
  pub fn new(target: BuildTarget, buildable: Arc<dyn Buildable>) -> Self {
    Self {
      target,
      deps: BTreeSet::new(),
      outputs: Vec::new(),
      capabilities: BTreeSet::new(),
      buildable,
    }
  }

  pub fn with_deps<I>(mut self, deps: I) -> Self
  where
    I: IntoIterator<Item = BuildTarget>,
  {
    self.deps.extend(deps);
    self
  }

  /// Declare outputs, relative to the rule's output directory.
  pub fn with_outputs<I, P>(mut self, outputs: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
  {
    self.outputs.extend(outputs.into_iter().map(Into::into));
    self
  }

  pub fn with_capability(mut self, capability: Capability) -> Self {
    self.capabilities.insert(capability);
    self
  }

  pub fn target(&self) -> &BuildTarget {
    &self.target
  }

  pub fn deps(&self) -> &BTreeSet<BuildTarget> {
    &self.deps
  }

  pub fn outputs(&self) -> &[PathBuf] {
    &self.outputs
  }

  pub fn capabilities(&self) -> &BTreeSet<Capability> {
    &self.capabilities
  }

  pub fn buildable(&self) -> &Arc<dyn Buildable> {
    &self.buildable
  }

  pub fn rule_type(&self) -> &str {
    self.buildable.rule_type()
  }

  pub fn supports_dep_file_keys(&self) -> bool {
    self.capabilities.contains(&Capability::SupportsDependencyFileKeys)
  }

  pub fn supports_pipelining(&self) -> bool {
    self
      .capabilities
      .iter()
      .any(|c| matches!(c, Capability::SupportsPipelining { .. }))
  }

  /// The previous rule of this rule's pipeline chain.
  pub fn pipeline_previous(&self) -> Option<&BuildTarget> {
    self.capabilities.iter().find_map(|c| match c {
      Capability::SupportsPipelining { previous } => previous.as_ref(),
      _ => None,
    })
  }
}
