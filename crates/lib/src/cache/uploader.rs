//! Bounded artifact uploads.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{ArtifactCache, ArtifactInfo, CacheError};

/// Stores artifacts with a per-attempt timeout and a fixed number of retries.
#[derive(Debug, Clone)]
pub struct ArtifactUploader {
  cache: Arc<dyn ArtifactCache>,
  timeout: Duration,
  retries: u32,
}

impl ArtifactUploader {
  pub fn new(cache: Arc<dyn ArtifactCache>, timeout: Duration, retries: u32) -> Self {
    Self { cache, timeout, retries }
  }

  pub fn is_enabled(&self) -> bool {
    self.cache.is_store_supported()
  }

  /// Upload `blob`. Returns the error of the last attempt if all fail.
  pub async fn upload(&self, info: &ArtifactInfo, blob: &Path) -> Result<(), CacheError> {
    let Some(first_key) = info.rule_keys.iter().next().copied() else {
      return Ok(());
    };

    let mut attempt = 0;
    loop {
      let result = match tokio::time::timeout(self.timeout, self.cache.store(info, blob)).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout {
          key: first_key,
          timeout: self.timeout,
        }),
      };

      match result {
        Ok(()) => {
          debug!(key = %first_key, attempt, "uploaded artifact");
          return Ok(());
        }
        Err(e) if attempt < self.retries => {
          warn!(key = %first_key, attempt, error = %e, "artifact upload failed, retrying");
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}
