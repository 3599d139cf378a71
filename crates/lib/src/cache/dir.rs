//! Local directory cache.
//!
//! # Storage Layout
//!
//! ```text
//! {root}/
//! └── <first two hex chars of key>/
//!     ├── <key>            # artifact blob
//!     └── <key>.metadata   # JSON metadata map
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{ArtifactCache, ArtifactInfo, CacheError, CacheResult, check_metadata};
use crate::rulekey::RuleKey;
use crate::stats::CacheStatsTracker;

const CACHE_NAME: &str = "dir";
const METADATA_EXTENSION: &str = "metadata";
const TEMP_EXTENSION: &str = "tmp";

/// Size and entry count of a directory cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirCacheStats {
  pub entries: u64,
  pub total_bytes: u64,
}

#[derive(Debug)]
pub struct DirArtifactCache {
  root: PathBuf,
  max_size_bytes: Option<u64>,
  writable: bool,
  stats: Option<Arc<CacheStatsTracker>>,
}

impl DirArtifactCache {
  pub fn new(root: impl Into<PathBuf>, max_size_bytes: Option<u64>, writable: bool) -> Self {
    Self {
      root: root.into(),
      max_size_bytes,
      writable,
      stats: None,
    }
  }

  /// Report evictions to `stats`.
  pub fn with_stats(mut self, stats: Arc<CacheStatsTracker>) -> Self {
    self.stats = Some(stats);
    self
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn path_for_key(&self, key: &RuleKey) -> PathBuf {
    let hex = key.to_hex();
    self.root.join(&hex[..2]).join(hex)
  }

  fn metadata_path(&self, key: &RuleKey) -> PathBuf {
    self.path_for_key(key).with_extension(METADATA_EXTENSION)
  }

  /// Count entries and bytes. A missing cache directory is empty.
  pub fn stats(&self) -> Result<DirCacheStats, CacheError> {
    let mut stats = DirCacheStats::default();
    for entry in self.blob_entries()? {
      stats.entries += 1;
      stats.total_bytes += entry.size;
    }
    Ok(stats)
  }

  /// Delete every entry, returning how many were removed.
  pub fn clean(&self) -> Result<u64, CacheError> {
    let entries = self.stats()?.entries;
    match std::fs::remove_dir_all(&self.root) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(CacheError::io(CACHE_NAME, e)),
    }
    info!(path = ?self.root, entries, "cleaned directory cache");
    Ok(entries)
  }

  fn blob_entries(&self) -> Result<Vec<BlobEntry>, CacheError> {
    if !self.root.exists() {
      return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
      let entry = entry.map_err(|e| CacheError::io(CACHE_NAME, io::Error::other(e.to_string())))?;
      let path = entry.path();
      let is_blob = entry.file_type().is_file() && path.extension().is_none();
      if !is_blob {
        continue;
      }
      let metadata = entry.metadata().map_err(|e| CacheError::io(CACHE_NAME, io::Error::other(e.to_string())))?;
      let sidecar_size = std::fs::metadata(path.with_extension(METADATA_EXTENSION))
        .map(|m| m.len())
        .unwrap_or(0);
      entries.push(BlobEntry {
        path: path.to_path_buf(),
        size: metadata.len() + sidecar_size,
        modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
      });
    }
    Ok(entries)
  }

  /// Remove oldest entries until the cache fits its size cap.
  fn evict(&self) -> Result<u64, CacheError> {
    let Some(max) = self.max_size_bytes else {
      return Ok(0);
    };

    let mut entries = self.blob_entries()?;
    let mut total: u64 = entries.iter().map(|e| e.size).sum();
    if total <= max {
      return Ok(0);
    }

    entries.sort_by_key(|e| e.modified);
    let mut evicted = 0;
    for entry in entries {
      if total <= max {
        break;
      }
      debug!(path = ?entry.path, size = entry.size, "evicting cache entry");
      std::fs::remove_file(&entry.path).map_err(|e| CacheError::io(CACHE_NAME, e))?;
      let _ = std::fs::remove_file(entry.path.with_extension(METADATA_EXTENSION));
      total = total.saturating_sub(entry.size);
      evicted += 1;
    }

    if let Some(stats) = &self.stats {
      stats.record_evictions(evicted);
    }
    info!(evicted, remaining_bytes = total, "evicted directory cache entries");
    Ok(evicted)
  }
}

struct BlobEntry {
  path: PathBuf,
  size: u64,
  modified: SystemTime,
}

#[async_trait]
impl ArtifactCache for DirArtifactCache {
  fn name(&self) -> &str {
    CACHE_NAME
  }

  async fn fetch(&self, key: &RuleKey, output: &Path) -> CacheResult {
    let blob = self.path_for_key(key);
    let metadata_path = self.metadata_path(key);

    let content = match tokio::fs::read_to_string(&metadata_path).await {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return CacheResult::Miss,
      Err(e) => return error(e.to_string()),
    };

    let metadata: BTreeMap<String, String> = match serde_json::from_str(&content) {
      Ok(metadata) => metadata,
      Err(e) => return error(format!("corrupt metadata {}: {}", metadata_path.display(), e)),
    };

    if let Err(message) = check_metadata(key, &metadata) {
      warn!(key = %key, message = %message, "rejecting directory cache entry");
      return error(message);
    }

    match tokio::fs::copy(&blob, output).await {
      Ok(_) => {
        debug!(key = %key, "directory cache hit");
        CacheResult::Hit {
          source: CACHE_NAME.to_string(),
          metadata,
        }
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => CacheResult::Miss,
      Err(e) => error(e.to_string()),
    }
  }

  async fn store(&self, info: &ArtifactInfo, blob: &Path) -> Result<(), CacheError> {
    if !self.writable {
      return Err(CacheError::ReadOnly {
        cache: CACHE_NAME.to_string(),
      });
    }

    for key in &info.rule_keys {
      let dest = self.path_for_key(key);
      if let Some(shard) = dest.parent() {
        tokio::fs::create_dir_all(shard)
          .await
          .map_err(|e| CacheError::io(CACHE_NAME, e))?;
      }

      // Blob first, so a visible metadata file always has its blob
      let temp_blob = dest.with_extension(TEMP_EXTENSION);
      tokio::fs::copy(blob, &temp_blob)
        .await
        .map_err(|e| CacheError::io(CACHE_NAME, e))?;
      tokio::fs::rename(&temp_blob, &dest)
        .await
        .map_err(|e| CacheError::io(CACHE_NAME, e))?;

      let content = serde_json::to_string(&info.metadata_for(key)).map_err(|e| CacheError::Metadata(e.to_string()))?;
      let metadata_path = self.metadata_path(key);
      let temp_metadata = metadata_path.with_extension(format!("{}.{}", METADATA_EXTENSION, TEMP_EXTENSION));
      tokio::fs::write(&temp_metadata, content)
        .await
        .map_err(|e| CacheError::io(CACHE_NAME, e))?;
      tokio::fs::rename(&temp_metadata, &metadata_path)
        .await
        .map_err(|e| CacheError::io(CACHE_NAME, e))?;

      debug!(key = %key, "stored artifact in directory cache");
    }

    if self.max_size_bytes.is_some() {
      self.evict()?;
    }
    Ok(())
  }

  fn is_store_supported(&self) -> bool {
    self.writable
  }
}

fn error(message: String) -> CacheResult {
  CacheResult::Error {
    source: CACHE_NAME.to_string(),
    message,
  }
}
