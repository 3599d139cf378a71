//! Tiered cache.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ArtifactCache, ArtifactInfo, CacheError, CacheResult, METADATA_RULE_KEY};
use crate::rulekey::RuleKey;
use crate::stats::CacheStatsTracker;

/// Consults tiers in order.
///
/// The first hit wins and is copied into every earlier tier that accepts
/// stores. Stores go to every tier that accepts them. A tier error counts as
/// a miss for the lookup, but is returned if no later tier hits. Errors
/// hidden behind a later hit are recorded on the attached stats tracker.
#[derive(Debug)]
pub struct MultiArtifactCache {
  tiers: Vec<Arc<dyn ArtifactCache>>,
  stats: Option<Arc<CacheStatsTracker>>,
}

impl MultiArtifactCache {
  pub fn new(tiers: Vec<Arc<dyn ArtifactCache>>) -> Self {
    Self { tiers, stats: None }
  }

  pub fn with_stats(mut self, stats: Arc<CacheStatsTracker>) -> Self {
    self.stats = Some(stats);
    self
  }

  pub fn tiers(&self) -> &[Arc<dyn ArtifactCache>] {
    &self.tiers
  }
}

#[async_trait]
impl ArtifactCache for MultiArtifactCache {
  fn name(&self) -> &str {
    "multi"
  }

  async fn fetch(&self, key: &RuleKey, output: &Path) -> CacheResult {
    let mut first_error = None;
    let mut errors = 0;

    for (index, tier) in self.tiers.iter().enumerate() {
      match tier.fetch(key, output).await {
        CacheResult::Hit { source, metadata } => {
          let mut info = ArtifactInfo::new(*key);
          info.metadata = metadata.clone();
          info.metadata.remove(METADATA_RULE_KEY);

          for earlier in self.tiers[..index].iter().filter(|t| t.is_store_supported()) {
            debug!(key = %key, from = %source, to = %earlier.name(), "back-filling cache tier");
            if let Err(e) = earlier.store(&info, output).await {
              warn!(key = %key, tier = %earlier.name(), error = %e, "failed to back-fill cache tier");
            }
          }

          if let Some(stats) = &self.stats {
            (0..errors).for_each(|_| stats.record_error());
          }
          return CacheResult::Hit { source, metadata };
        }
        CacheResult::Miss => {}
        err @ CacheResult::Error { .. } => {
          if let CacheResult::Error { source, message } = &err {
            warn!(key = %key, tier = %source, error = %message, "cache tier lookup failed");
          }
          errors += 1;
          first_error.get_or_insert(err);
        }
      }
    }

    first_error.unwrap_or(CacheResult::Miss)
  }

  async fn store(&self, info: &ArtifactInfo, blob: &Path) -> Result<(), CacheError> {
    let mut first_error = None;
    for tier in self.tiers.iter().filter(|t| t.is_store_supported()) {
      if let Err(e) = tier.store(info, blob).await {
        warn!(tier = %tier.name(), error = %e, "failed to store artifact");
        first_error.get_or_insert(e);
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn is_store_supported(&self) -> bool {
    self.tiers.iter().any(|t| t.is_store_supported())
  }
}
