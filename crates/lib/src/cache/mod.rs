//! Artifact caches.
//!
//! An artifact cache maps a [`RuleKey`] to a blob (a gzip-compressed tar of
//! the rule's recorded outputs) plus a small string metadata map. Metadata
//! always carries the key it was stored under; a fetched entry whose
//! metadata names another key is rejected.
//!
//! Implementations:
//! - [`DirArtifactCache`]: sharded local directory with optional size cap
//! - [`HttpArtifactCache`]: remote cache over plain HTTP GET/PUT
//! - [`NoopArtifactCache`]: always misses
//! - [`MultiArtifactCache`]: ordered tiers with back-filling

pub mod archive;
mod dir;
mod http;
pub mod manifest;
mod multi;
mod noop;
mod uploader;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{CacheConfig, CacheTierKind};
use crate::rulekey::RuleKey;
use crate::stats::CacheStatsTracker;

pub use dir::{DirArtifactCache, DirCacheStats};
pub use http::HttpArtifactCache;
pub use multi::MultiArtifactCache;
pub use noop::NoopArtifactCache;
pub use uploader::ArtifactUploader;

/// Metadata entry naming the key an artifact was stored under.
pub const METADATA_RULE_KEY: &str = "rule_key";
/// Metadata entry naming the target that produced an artifact.
pub const METADATA_TARGET: &str = "target";
/// Metadata entry with the dependency-file key of an artifact.
pub const METADATA_DEP_FILE_KEY: &str = "dep_file_key";
/// Metadata entry with the JSON list of inputs a dependency-file rule read.
pub const METADATA_USED_INPUTS: &str = "used_inputs";
/// Metadata entry naming the build that stored an artifact.
pub const METADATA_BUILD_ID: &str = "build_id";

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("{cache} cache i/o error: {source}")]
  Io {
    cache: String,
    #[source]
    source: io::Error,
  },

  #[error("{cache} cache request failed: {message}")]
  Http { cache: String, message: String },

  #[error("{cache} cache is read-only")]
  ReadOnly { cache: String },

  #[error("upload of {key} timed out after {timeout:?}")]
  Timeout { key: RuleKey, timeout: Duration },

  #[error("invalid cache metadata: {0}")]
  Metadata(String),

  #[error("invalid cache configuration: {0}")]
  Config(String),
}

impl CacheError {
  pub(crate) fn io(cache: &str, source: io::Error) -> Self {
    CacheError::Io {
      cache: cache.to_string(),
      source,
    }
  }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheResult {
  Hit {
    source: String,
    metadata: BTreeMap<String, String>,
  },
  Miss,
  /// The lookup failed. Treated like a miss, but reported separately.
  Error { source: String, message: String },
}

impl CacheResult {
  pub fn is_hit(&self) -> bool {
    matches!(self, CacheResult::Hit { .. })
  }
}

/// Keys and metadata for storing one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactInfo {
  pub rule_keys: BTreeSet<RuleKey>,
  pub metadata: BTreeMap<String, String>,
}

impl ArtifactInfo {
  pub fn new(key: RuleKey) -> Self {
    Self {
      rule_keys: [key].into(),
      metadata: BTreeMap::new(),
    }
  }

  pub fn with_key(mut self, key: RuleKey) -> Self {
    self.rule_keys.insert(key);
    self
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  /// Metadata written alongside the blob stored under `key`.
  pub fn metadata_for(&self, key: &RuleKey) -> BTreeMap<String, String> {
    let mut metadata = self.metadata.clone();
    metadata.insert(METADATA_RULE_KEY.to_string(), key.to_hex());
    metadata
  }
}

#[async_trait]
pub trait ArtifactCache: Send + Sync + fmt::Debug {
  fn name(&self) -> &str;

  /// Look up `key`, writing the blob to `output` on a hit.
  async fn fetch(&self, key: &RuleKey, output: &Path) -> CacheResult;

  /// Store `blob` under every key of `info`.
  async fn store(&self, info: &ArtifactInfo, blob: &Path) -> Result<(), CacheError>;

  fn is_store_supported(&self) -> bool {
    true
  }
}

/// Reject metadata that does not name the key it was fetched with.
pub(crate) fn check_metadata(key: &RuleKey, metadata: &BTreeMap<String, String>) -> Result<(), String> {
  match metadata.get(METADATA_RULE_KEY) {
    Some(stored) if stored == &key.to_hex() => Ok(()),
    Some(stored) => Err(format!("metadata names key {} but {} was requested", stored, key)),
    None => Err(format!("metadata for {} does not name a rule key", key)),
  }
}

/// Build the configured cache tiers.
///
/// `default_dir` is used for the dir tier when no path is configured.
pub fn from_config(
  config: &CacheConfig,
  default_dir: &Path,
  stats: Arc<CacheStatsTracker>,
) -> Result<Arc<dyn ArtifactCache>, CacheError> {
  if !config.enabled || config.tiers.is_empty() {
    return Ok(Arc::new(NoopArtifactCache));
  }

  let mut tiers: Vec<Arc<dyn ArtifactCache>> = Vec::new();
  for kind in &config.tiers {
    match kind {
      CacheTierKind::Dir => {
        let path: PathBuf = config.dir.path.clone().unwrap_or_else(|| default_dir.to_path_buf());
        let cache = DirArtifactCache::new(path, config.dir.max_size_bytes, config.dir.mode.is_writable())
          .with_stats(stats.clone());
        tiers.push(Arc::new(cache));
      }
      CacheTierKind::Http => {
        let url = config
          .http
          .url
          .as_deref()
          .ok_or_else(|| CacheError::Config("cache.http.url is required for the http tier".to_string()))?;
        let cache = HttpArtifactCache::new(
          url,
          Duration::from_secs(config.http.timeout_secs),
          config.http.mode.is_writable(),
        )?;
        tiers.push(Arc::new(cache));
      }
    }
  }

  if tiers.len() == 1 {
    return Ok(tiers.remove(0));
  }
  Ok(Arc::new(MultiArtifactCache::new(tiers).with_stats(stats)))
}
