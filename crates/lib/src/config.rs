//! Layered configuration.
//!
//! Configuration is merged from, in increasing precedence:
//!
//! 1. `<project>/.kiln.toml`
//! 2. `<project>/.kiln.local.toml`
//! 3. `section.key=value` overrides (usually from `-c` on the command line)
//! 4. `KILN_OUT` / `KILN_THREADS` environment variables
//!
//! Tables are merged key by key, so a local file only needs the keys it
//! changes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::{CONFIG_FILENAME, DEFAULT_OUT_DIR, LOCAL_CONFIG_FILENAME, OUT_DIR_ENV, THREADS_ENV};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse config file {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("invalid config override '{0}': expected section.key=value")]
  InvalidOverride(String),

  #[error("invalid value for {key}: {message}")]
  InvalidValue { key: String, message: String },
}

/// Whether a cache tier accepts stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  #[default]
  ReadWrite,
  ReadOnly,
}

impl CacheMode {
  pub fn is_writable(self) -> bool {
    matches!(self, CacheMode::ReadWrite)
  }
}

/// Kind of an artifact cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTierKind {
  Dir,
  Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
  /// Requested worker count; defaults to the available parallelism.
  pub threads: Option<usize>,

  /// Hard cap on the worker count regardless of `threads`.
  pub max_threads: usize,

  /// Continue building independent rules after a failure.
  pub keep_going: bool,

  /// Upper bound on the serialized size of a single rule key.
  pub max_rule_key_bytes: usize,

  /// Shell used by `cmd` rules. Defaults to `/bin/sh` (Unix) or PowerShell.
  pub shell: Option<String>,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      threads: None,
      max_threads: 64,
      keep_going: false,
      max_rule_key_bytes: 1024 * 1024,
      shell: None,
    }
  }
}

impl BuildConfig {
  /// Number of concurrent workers for a build.
  ///
  /// The minimum of the configured thread count, the hard cap and the
  /// available parallelism of the machine, never less than one.
  pub fn worker_count(&self) -> usize {
    let optimal = default_parallelism();
    self
      .threads
      .unwrap_or(optimal)
      .min(self.max_threads)
      .min(optimal)
      .max(1)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirCacheConfig {
  /// Cache directory; defaults to `<out>/cache`.
  pub path: Option<PathBuf>,

  /// Evict oldest entries once the cache grows beyond this size.
  pub max_size_bytes: Option<u64>,

  pub mode: CacheMode,
}

impl Default for DirCacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      max_size_bytes: None,
      mode: CacheMode::ReadWrite,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpCacheConfig {
  pub url: Option<String>,
  pub timeout_secs: u64,
  pub mode: CacheMode,
}

impl Default for HttpCacheConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_secs: 10,
      mode: CacheMode::ReadWrite,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Master switch for the artifact cache.
  pub enabled: bool,

  /// Tiers in lookup order; the first hit wins.
  pub tiers: Vec<CacheTierKind>,

  pub dir: DirCacheConfig,
  pub http: HttpCacheConfig,

  /// Upper bound on a single upload attempt.
  pub upload_timeout_secs: u64,

  /// Extra attempts after a failed or timed out upload.
  pub upload_retries: u32,

  /// Number of dependency-file entries kept per manifest.
  pub manifest_max_entries: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      tiers: vec![CacheTierKind::Dir],
      dir: DirCacheConfig::default(),
      http: HttpCacheConfig::default(),
      upload_timeout_secs: 30,
      upload_retries: 1,
      manifest_max_entries: 64,
    }
  }
}

impl CacheConfig {
  pub fn upload_timeout(&self) -> Duration {
    Duration::from_secs(self.upload_timeout_secs)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
  /// Output directory; relative paths are resolved against the project root.
  pub out: Option<PathBuf>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
  pub build: BuildConfig,
  pub cache: CacheConfig,
  pub paths: PathsConfig,
}

impl KilnConfig {
  /// Load the layered configuration for a project.
  pub fn load(project_root: &Path, overrides: &[String]) -> Result<Self, ConfigError> {
    let mut merged = toml::Table::new();

    for name in [CONFIG_FILENAME, LOCAL_CONFIG_FILENAME] {
      let path = project_root.join(name);
      if let Some(table) = read_table(&path)? {
        debug!(path = %path.display(), "loaded config file");
        merge_tables(&mut merged, table);
      }
    }

    for raw in overrides {
      apply_override(&mut merged, raw)?;
    }

    let mut config: KilnConfig = toml::Value::Table(merged)
      .try_into()
      .map_err(|e: toml::de::Error| ConfigError::Parse {
        path: project_root.to_path_buf(),
        message: e.to_string(),
      })?;

    config.apply_env()?;
    Ok(config)
  }

  /// Parse a single TOML document (no layering).
  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse {
      path: PathBuf::from("<string>"),
      message: e.to_string(),
    })
  }

  fn apply_env(&mut self) -> Result<(), ConfigError> {
    if let Ok(out) = std::env::var(OUT_DIR_ENV)
      && !out.is_empty()
    {
      self.paths.out = Some(PathBuf::from(out));
    }

    if let Ok(threads) = std::env::var(THREADS_ENV)
      && !threads.is_empty()
    {
      let parsed = threads.parse::<usize>().map_err(|e| ConfigError::InvalidValue {
        key: THREADS_ENV.to_string(),
        message: e.to_string(),
      })?;
      self.build.threads = Some(parsed);
    }

    Ok(())
  }

  /// Resolved output directory for a project.
  pub fn out_dir(&self, project_root: &Path) -> PathBuf {
    match &self.paths.out {
      Some(out) if out.is_absolute() => out.clone(),
      Some(out) => project_root.join(out),
      None => project_root.join(DEFAULT_OUT_DIR),
    }
  }
}

fn default_parallelism() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

fn read_table(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => {
      return Err(ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
      });
    }
  };

  content.parse::<toml::Table>().map(Some).map_err(|e| ConfigError::Parse {
    path: path.to_path_buf(),
    message: e.to_string(),
  })
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
  for (key, value) in overlay {
    match (base.get_mut(&key), value) {
      (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => merge_tables(existing, incoming),
      (_, value) => {
        base.insert(key, value);
      }
    }
  }
}

fn apply_override(table: &mut toml::Table, raw: &str) -> Result<(), ConfigError> {
  let (path, value) = raw
    .split_once('=')
    .ok_or_else(|| ConfigError::InvalidOverride(raw.to_string()))?;

  let segments: Vec<&str> = path.trim().split('.').collect();
  if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
    return Err(ConfigError::InvalidOverride(raw.to_string()));
  }

  let value = parse_override_value(value.trim());

  let (leaf, sections) = segments.split_last().ok_or_else(|| ConfigError::InvalidOverride(raw.to_string()))?;
  let mut current = table;
  for section in sections {
    let entry = current
      .entry(section.to_string())
      .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    current = match entry {
      toml::Value::Table(t) => t,
      _ => return Err(ConfigError::InvalidOverride(raw.to_string())),
    };
  }
  current.insert(leaf.to_string(), value);
  Ok(())
}

/// Interpret an override value as TOML, falling back to a bare string.
fn parse_override_value(raw: &str) -> toml::Value {
  let doc = format!("v = {}", raw);
  doc
    .parse::<toml::Table>()
    .ok()
    .and_then(|mut t| t.remove("v"))
    .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}
