//! Hooks the engine calls out to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::rule::Rule;
use crate::util::hash::{ContentHash, HashError, hash_path};

/// Content hashes of project files.
pub trait FileHashCache: Send + Sync {
  /// Hash of `path`, relative to the project root.
  fn get(&self, path: &Path) -> Result<ContentHash, HashError>;

  /// Forget a cached hash, e.g. after the file was rewritten.
  fn invalidate(&self, path: &Path);
}

/// Hashes files below a project root, remembering each hash for the
/// lifetime of the cache.
#[derive(Debug)]
pub struct DefaultFileHashCache {
  root: PathBuf,
  hashes: DashMap<PathBuf, ContentHash>,
}

impl DefaultFileHashCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      hashes: DashMap::new(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }
}

impl FileHashCache for DefaultFileHashCache {
  fn get(&self, path: &Path) -> Result<ContentHash, HashError> {
    if let Some(hash) = self.hashes.get(path) {
      return Ok(hash.clone());
    }
    let hash = hash_path(&self.root.join(path))?;
    trace!(path = ?path, hash = %hash, "hashed input");
    self.hashes.insert(path.to_path_buf(), hash.clone());
    Ok(hash)
  }

  fn invalidate(&self, path: &Path) {
    self.hashes.remove(path);
  }
}

/// Callbacks from the build engine.
pub trait EngineDelegate: Send + Sync {
  fn file_hash_cache(&self) -> Arc<dyn FileHashCache>;

  /// Called right before a rule's action runs, after every cache lookup
  /// missed.
  fn on_rule_about_to_be_built(&self, _rule: &Rule) {}
}

pub struct DefaultEngineDelegate {
  file_hashes: Arc<DefaultFileHashCache>,
}

impl DefaultEngineDelegate {
  pub fn new(project_root: impl Into<PathBuf>) -> Self {
    Self {
      file_hashes: Arc::new(DefaultFileHashCache::new(project_root)),
    }
  }
}

impl EngineDelegate for DefaultEngineDelegate {
  fn file_hash_cache(&self) -> Arc<dyn FileHashCache> {
    self.file_hashes.clone()
  }
}
