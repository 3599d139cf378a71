//! Per-invocation build context.
//!
//! A [`BuildSession`] carries everything one `kiln` invocation shares across
//! components: configuration, output paths, the cache statistics and the
//! build id. It is created once and passed down explicitly.
//!
//! # Output Layout
//!
//! ```text
//! {out}/
//! ├── gen/<cell>/<base path>/<name>/   # rule outputs
//! ├── info/<cell>/<base path>/<name>/  # build-info.json
//! ├── cache/                           # default dir cache
//! └── tmp/<build id>/                  # scratch space for one build
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::cache::{self, ArtifactCache, CacheError, DirArtifactCache, NoopArtifactCache};
use crate::config::KilnConfig;
use crate::stats::CacheStatsTracker;
use crate::target::BuildTarget;

#[derive(Debug)]
pub struct BuildSession {
  build_id: String,
  project_root: PathBuf,
  out_dir: PathBuf,
  config: KilnConfig,
  stats: Arc<CacheStatsTracker>,
  started: Instant,
}

impl BuildSession {
  pub fn new(project_root: impl Into<PathBuf>, config: KilnConfig) -> Self {
    let project_root = project_root.into();
    let out_dir = config.out_dir(&project_root);
    Self {
      build_id: new_build_id(),
      project_root,
      out_dir,
      config,
      stats: Arc::new(CacheStatsTracker::new()),
      started: Instant::now(),
    }
  }

  pub fn build_id(&self) -> &str {
    &self.build_id
  }

  pub fn project_root(&self) -> &Path {
    &self.project_root
  }

  pub fn config(&self) -> &KilnConfig {
    &self.config
  }

  pub fn stats(&self) -> &Arc<CacheStatsTracker> {
    &self.stats
  }

  pub fn started(&self) -> Instant {
    self.started
  }

  pub fn out_dir(&self) -> &Path {
    &self.out_dir
  }

  /// Where `target` writes its outputs.
  pub fn output_dir_for(&self, target: &BuildTarget) -> PathBuf {
    self.out_dir.join("gen").join(target.output_subdir())
  }

  pub fn info_dir(&self) -> PathBuf {
    self.out_dir.join("info")
  }

  pub fn default_cache_dir(&self) -> PathBuf {
    self.out_dir.join("cache")
  }

  /// Scratch directory of this build.
  pub fn tmp_dir(&self) -> PathBuf {
    self.out_dir.join("tmp").join(&self.build_id)
  }

  /// Root of the directory cache tier, configured or default.
  pub fn dir_cache_path(&self) -> PathBuf {
    match &self.config.cache.dir.path {
      Some(path) if path.is_relative() => self.project_root.join(path),
      Some(path) => path.clone(),
      None => self.default_cache_dir(),
    }
  }

  /// The directory cache tier on its own, for maintenance commands.
  pub fn dir_cache(&self) -> DirArtifactCache {
    let dir = &self.config.cache.dir;
    DirArtifactCache::new(self.dir_cache_path(), dir.max_size_bytes, dir.mode.is_writable())
  }

  /// The configured artifact cache, or a no-op cache when `no_cache` is set.
  pub fn open_cache(&self, no_cache: bool) -> Result<Arc<dyn ArtifactCache>, CacheError> {
    if no_cache {
      return Ok(Arc::new(NoopArtifactCache));
    }
    let mut config = self.config.cache.clone();
    config.dir.path = Some(self.dir_cache_path());
    cache::from_config(&config, &self.default_cache_dir(), self.stats.clone())
  }
}

fn new_build_id() -> String {
  let millis = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis())
    .unwrap_or_default();
  format!("{:x}-{:x}", millis, std::process::id())
}
