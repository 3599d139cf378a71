//! What a rule records about itself while it builds.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Collects the artifacts, metadata and used inputs of one rule execution.
///
/// Artifact paths are relative to the rule's output directory. Used inputs
/// are project-relative and only meaningful for rules that support
/// dependency-file keys.
#[derive(Debug, Clone, Default)]
pub struct BuildableContext {
  artifacts: BTreeSet<PathBuf>,
  metadata: BTreeMap<String, String>,
  used_inputs: Option<BTreeSet<PathBuf>>,
}

impl BuildableContext {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_artifact(&mut self, path: impl AsRef<Path>) {
    self.artifacts.insert(path.as_ref().to_path_buf());
  }

  pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.metadata.insert(key.into(), value.into());
  }

  /// Report the inputs the action actually read. Replaces earlier reports.
  pub fn record_used_inputs<I, P>(&mut self, paths: I)
  where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
  {
    self.used_inputs = Some(paths.into_iter().map(Into::into).collect());
  }

  pub fn artifacts(&self) -> &BTreeSet<PathBuf> {
    &self.artifacts
  }

  pub fn metadata(&self) -> &BTreeMap<String, String> {
    &self.metadata
  }

  pub fn used_inputs(&self) -> Option<&BTreeSet<PathBuf>> {
    self.used_inputs.as_ref()
  }
}
