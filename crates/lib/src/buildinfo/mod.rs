//! Persisted build information.
//!
//! After a rule is built or fetched, a [`BuildInfoRecord`] is written next to
//! the other rule records so that the next build can skip the rule when its
//! key is unchanged and its outputs are intact.
//!
//! # Storage Layout
//!
//! ```text
//! {out}/info/
//! └── <cell>/<base path>/<name>/
//!     └── build-info.json
//! ```

mod context;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::BUILD_INFO_VERSION;
use crate::engine::SuccessType;
use crate::rulekey::RuleKey;
use crate::target::BuildTarget;
use crate::util::hash::{ContentHash, HashError, hash_path};

pub use context::BuildableContext;

const BUILD_INFO_FILENAME: &str = "build-info.json";

#[derive(Debug, Error)]
pub enum BuildInfoError {
  #[error("failed to read build info {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse build info {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to write build info {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize build info: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("failed to hash outputs: {0}")]
  Hash(#[from] HashError),
}

/// What is known about the last successful build of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfoRecord {
  pub version: u32,
  pub target: BuildTarget,
  pub rule_key: RuleKey,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dep_file_key: Option<RuleKey>,

  /// Project-relative inputs the rule read, for dependency-file rules.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub used_inputs: Option<BTreeSet<PathBuf>>,

  /// Recorded artifact paths mapped to their content hashes.
  pub outputs: BTreeMap<String, ContentHash>,

  #[serde(default)]
  pub metadata: BTreeMap<String, String>,

  pub origin: SuccessType,
  pub duration_ms: u64,
}

impl BuildInfoRecord {
  pub fn artifact_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
    self.outputs.keys().map(PathBuf::from)
  }

  /// Whether every recorded output still exists with its recorded content.
  pub fn outputs_intact(&self, output_dir: &Path) -> bool {
    for (rel, expected) in &self.outputs {
      match hash_path(&output_dir.join(rel)) {
        Ok(actual) if &actual == expected => {}
        Ok(actual) => {
          warn!(
            rule = %self.target,
            path = %rel,
            expected = %expected,
            actual = %actual,
            "build output modified, will rebuild"
          );
          return false;
        }
        Err(e) => {
          debug!(rule = %self.target, path = %rel, error = %e, "build output missing, will rebuild");
          return false;
        }
      }
    }
    true
  }
}

/// Hash every recorded artifact below `output_dir`.
pub fn hash_outputs<'a>(
  output_dir: &Path,
  artifacts: impl IntoIterator<Item = &'a PathBuf>,
) -> Result<BTreeMap<String, ContentHash>, HashError> {
  let mut outputs = BTreeMap::new();
  for rel in artifacts {
    let hash = hash_path(&output_dir.join(rel))?;
    outputs.insert(rel.to_string_lossy().replace('\\', "/"), hash);
  }
  Ok(outputs)
}

/// Reads and writes [`BuildInfoRecord`]s below one directory.
///
/// Writes are atomic (write to temp, then rename).
#[derive(Debug, Clone)]
pub struct BuildInfoStore {
  root: PathBuf,
}

impl BuildInfoStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn path_for(&self, target: &BuildTarget) -> PathBuf {
    self.root.join(target.output_subdir()).join(BUILD_INFO_FILENAME)
  }

  /// Load a target's record.
  ///
  /// Returns `Ok(None)` when there is no record or it was written by a
  /// different format version.
  pub fn load(&self, target: &BuildTarget) -> Result<Option<BuildInfoRecord>, BuildInfoError> {
    let path = self.path_for(target);

    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(BuildInfoError::Read { path, source: e }),
    };

    let record: BuildInfoRecord =
      serde_json::from_str(&content).map_err(|e| BuildInfoError::Parse { path: path.clone(), source: e })?;

    if record.version != BUILD_INFO_VERSION {
      debug!(rule = %target, version = record.version, "ignoring build info with unsupported version");
      return Ok(None);
    }

    Ok(Some(record))
  }

  pub fn save(&self, record: &BuildInfoRecord) -> Result<(), BuildInfoError> {
    let path = self.path_for(&record.target);
    let write_err = |source| BuildInfoError::Write {
      path: path.clone(),
      source,
    };

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(write_err)?;
    }

    let temp_path = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(record)?;
    fs::write(&temp_path, format!("{}\n", content)).map_err(write_err)?;
    fs::rename(&temp_path, &path).map_err(write_err)?;
    Ok(())
  }

  /// Forget a target's record. Missing records are not an error.
  pub fn remove(&self, target: &BuildTarget) -> Result<(), BuildInfoError> {
    let path = self.path_for(target);
    match fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(BuildInfoError::Write { path, source: e }),
    }
  }
}
