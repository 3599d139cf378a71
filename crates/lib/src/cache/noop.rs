use std::path::Path;

use async_trait::async_trait;

use super::{ArtifactCache, ArtifactInfo, CacheError, CacheResult};
use crate::rulekey::RuleKey;

/// Cache that never hits and discards stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopArtifactCache;

#[async_trait]
impl ArtifactCache for NoopArtifactCache {
  fn name(&self) -> &str {
    "noop"
  }

  async fn fetch(&self, _key: &RuleKey, _output: &Path) -> CacheResult {
    CacheResult::Miss
  }

  async fn store(&self, _info: &ArtifactInfo, _blob: &Path) -> Result<(), CacheError> {
    Ok(())
  }

  fn is_store_supported(&self) -> bool {
    false
  }
}
