//! Build target identifiers and dependency stacks.
//!
//! A [`BuildTarget`] names one rule in the action graph. Its text form is
//!
//! ```text
//! [cell]//base/path:name[#flavor1,flavor2][?configuration]
//! ```
//!
//! A [`DependencyStack`] records the chain of targets leading from a build
//! request to the node currently being processed. It is attached to errors so
//! a failure can be reported together with the path that reached it.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::hash_bytes;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetParseError {
  #[error("build target '{0}' must contain '//'")]
  MissingSlashes(String),

  #[error("build target '{0}' must contain ':' followed by a name")]
  MissingName(String),

  #[error("build target '{0}' has an invalid base path")]
  InvalidBasePath(String),

  #[error("build target '{0}' has an empty flavor")]
  EmptyFlavor(String),
}

/// Immutable identifier of a rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildTarget {
  cell: Option<String>,
  base_path: String,
  name: String,
  flavors: BTreeSet<String>,
  configuration: Option<String>,
}

impl BuildTarget {
  /// Create an unflavored target in the root cell.
  pub fn new(base_path: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      cell: None,
      base_path: base_path.into().trim_matches('/').to_string(),
      name: name.into(),
      flavors: BTreeSet::new(),
      configuration: None,
    }
  }

  pub fn parse(text: &str) -> Result<Self, TargetParseError> {
    let (rest, configuration) = match text.split_once('?') {
      Some((rest, cfg)) if !cfg.is_empty() => (rest, Some(cfg.to_string())),
      Some((rest, _)) => (rest, None),
      None => (text, None),
    };

    let (rest, flavors) = match rest.split_once('#') {
      Some((rest, flavors)) => {
        let mut set = BTreeSet::new();
        for flavor in flavors.split(',') {
          if flavor.is_empty() {
            return Err(TargetParseError::EmptyFlavor(text.to_string()));
          }
          set.insert(flavor.to_string());
        }
        (rest, set)
      }
      None => (rest, BTreeSet::new()),
    };

    let Some((cell, path_and_name)) = rest.split_once("//") else {
      return Err(TargetParseError::MissingSlashes(text.to_string()));
    };

    let Some((base_path, name)) = path_and_name.rsplit_once(':') else {
      return Err(TargetParseError::MissingName(text.to_string()));
    };

    if name.is_empty() || name.contains('/') {
      return Err(TargetParseError::MissingName(text.to_string()));
    }

    if base_path.starts_with('/') || base_path.ends_with('/') || base_path.contains("//") || base_path.contains("..") {
      return Err(TargetParseError::InvalidBasePath(text.to_string()));
    }

    Ok(Self {
      cell: (!cell.is_empty()).then(|| cell.to_string()),
      base_path: base_path.to_string(),
      name: name.to_string(),
      flavors,
      configuration,
    })
  }

  pub fn with_cell(mut self, cell: impl Into<String>) -> Self {
    self.cell = Some(cell.into());
    self
  }

  pub fn with_flavors<I, S>(mut self, flavors: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.flavors.extend(flavors.into_iter().map(Into::into));
    self
  }

  pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
    self.configuration = Some(configuration.into());
    self
  }

  pub fn cell(&self) -> Option<&str> {
    self.cell.as_deref()
  }

  pub fn base_path(&self) -> &str {
    &self.base_path
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn flavors(&self) -> &BTreeSet<String> {
    &self.flavors
  }

  pub fn configuration(&self) -> Option<&str> {
    self.configuration.as_deref()
  }

  /// The same target without flavors or configuration.
  pub fn unflavored(&self) -> Self {
    Self {
      cell: self.cell.clone(),
      base_path: self.base_path.clone(),
      name: self.name.clone(),
      flavors: BTreeSet::new(),
      configuration: None,
    }
  }

  /// Relative directory that holds this target's outputs and records.
  ///
  /// Flavored and configured variants get distinct directories so they never
  /// clobber each other.
  pub fn output_subdir(&self) -> PathBuf {
    let mut dir = PathBuf::from(self.cell.as_deref().unwrap_or("root"));
    for segment in self.base_path.split('/').filter(|s| !s.is_empty()) {
      dir.push(segment);
    }

    let mut leaf = self.name.clone();
    if !self.flavors.is_empty() {
      leaf.push_str("__");
      leaf.push_str(&self.flavors.iter().cloned().collect::<Vec<_>>().join(","));
    }
    if let Some(cfg) = &self.configuration {
      leaf.push('-');
      leaf.push_str(&hash_bytes(cfg.as_bytes()).0[..8]);
    }
    dir.push(leaf);
    dir
  }
}

impl std::fmt::Display for BuildTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(cell) = &self.cell {
      write!(f, "{}", cell)?;
    }
    write!(f, "//{}:{}", self.base_path, self.name)?;
    if !self.flavors.is_empty() {
      let flavors: Vec<&str> = self.flavors.iter().map(String::as_str).collect();
      write!(f, "#{}", flavors.join(","))?;
    }
    if let Some(cfg) = &self.configuration {
      write!(f, "?{}", cfg)?;
    }
    Ok(())
  }
}

impl FromStr for BuildTarget {
  type Err = TargetParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl TryFrom<String> for BuildTarget {
  type Error = TargetParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}

impl From<BuildTarget> for String {
  fn from(target: BuildTarget) -> Self {
    target.to_string()
  }
}

#[derive(Debug)]
struct StackFrame {
  target: BuildTarget,
  parent: Option<Arc<StackFrame>>,
}

/// Path of targets from a build request down to the current node.
///
/// Pushing a child shares the parent frames, so cloning and extending a stack
/// is O(1).
#[derive(Debug, Clone, Default)]
pub struct DependencyStack(Option<Arc<StackFrame>>);

impl DependencyStack {
  pub fn root() -> Self {
    Self(None)
  }

  pub fn child(&self, target: BuildTarget) -> Self {
    Self(Some(Arc::new(StackFrame {
      target,
      parent: self.0.clone(),
    })))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_none()
  }

  pub fn len(&self) -> usize {
    let mut len = 0;
    let mut frame = self.0.as_ref();
    while let Some(f) = frame {
      len += 1;
      frame = f.parent.as_ref();
    }
    len
  }

  /// The most recently pushed target.
  pub fn top(&self) -> Option<&BuildTarget> {
    self.0.as_ref().map(|f| &f.target)
  }

  pub fn contains(&self, target: &BuildTarget) -> bool {
    let mut frame = self.0.as_ref();
    while let Some(f) = frame {
      if &f.target == target {
        return true;
      }
      frame = f.parent.as_ref();
    }
    false
  }

  /// Targets ordered from the root request to the top of the stack.
  pub fn to_vec(&self) -> Vec<BuildTarget> {
    let mut targets = Vec::with_capacity(self.len());
    let mut frame = self.0.as_ref();
    while let Some(f) = frame {
      targets.push(f.target.clone());
      frame = f.parent.as_ref();
    }
    targets.reverse();
    targets
  }
}

impl std::fmt::Display for DependencyStack {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let targets: Vec<String> = self.to_vec().iter().map(ToString::to_string).collect();
    write!(f, "{}", targets.join(" -> "))
  }
}
