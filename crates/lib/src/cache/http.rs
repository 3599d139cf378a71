//! Remote cache over HTTP.
//!
//! Artifacts live at `{base}/artifacts/{key}` and their metadata (a JSON
//! string map) at `{base}/metadata/{key}`. A 404 on either is a miss.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{ArtifactCache, ArtifactInfo, CacheError, CacheResult, check_metadata};
use crate::consts::APP_NAME;
use crate::rulekey::RuleKey;

const CACHE_NAME: &str = "http";

#[derive(Debug)]
pub struct HttpArtifactCache {
  base: String,
  client: reqwest::Client,
  writable: bool,
}

impl HttpArtifactCache {
  pub fn new(url: &str, timeout: Duration, writable: bool) -> Result<Self, CacheError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| http_error(e.to_string()))?;
    Ok(Self {
      base: url.trim_end_matches('/').to_string(),
      client,
      writable,
    })
  }

  fn artifact_url(&self, key: &RuleKey) -> String {
    format!("{}/artifacts/{}", self.base, key)
  }

  fn metadata_url(&self, key: &RuleKey) -> String {
    format!("{}/metadata/{}", self.base, key)
  }

  /// GET a resource. `Ok(None)` on 404.
  async fn get(&self, url: &str) -> Result<Option<Vec<u8>>, String> {
    let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !response.status().is_success() {
      return Err(format!("GET {}: HTTP {}", url, response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    Ok(Some(bytes.to_vec()))
  }

  async fn put(&self, url: &str, body: Vec<u8>) -> Result<(), CacheError> {
    let response = self
      .client
      .put(url)
      .body(body)
      .send()
      .await
      .map_err(|e| http_error(e.to_string()))?;
    if !response.status().is_success() {
      return Err(http_error(format!("PUT {}: HTTP {}", url, response.status())));
    }
    Ok(())
  }
}

#[async_trait]
impl ArtifactCache for HttpArtifactCache {
  fn name(&self) -> &str {
    CACHE_NAME
  }

  async fn fetch(&self, key: &RuleKey, output: &Path) -> CacheResult {
    let metadata = match self.get(&self.metadata_url(key)).await {
      Ok(Some(bytes)) => match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
        Ok(metadata) => metadata,
        Err(e) => return error(format!("corrupt metadata for {}: {}", key, e)),
      },
      Ok(None) => return CacheResult::Miss,
      Err(message) => return error(message),
    };

    if let Err(message) = check_metadata(key, &metadata) {
      warn!(key = %key, message = %message, "rejecting http cache entry");
      return error(message);
    }

    let body = match self.get(&self.artifact_url(key)).await {
      Ok(Some(body)) => body,
      Ok(None) => return CacheResult::Miss,
      Err(message) => return error(message),
    };

    if let Err(e) = tokio::fs::write(output, &body).await {
      return error(e.to_string());
    }

    debug!(key = %key, bytes = body.len(), "http cache hit");
    CacheResult::Hit {
      source: CACHE_NAME.to_string(),
      metadata,
    }
  }

  async fn store(&self, info: &ArtifactInfo, blob: &Path) -> Result<(), CacheError> {
    if !self.writable {
      return Err(CacheError::ReadOnly {
        cache: CACHE_NAME.to_string(),
      });
    }

    let body = tokio::fs::read(blob).await.map_err(|e| CacheError::io(CACHE_NAME, e))?;
    for key in &info.rule_keys {
      let metadata = serde_json::to_vec(&info.metadata_for(key)).map_err(|e| CacheError::Metadata(e.to_string()))?;
      // Artifact first, so visible metadata always has its artifact
      self.put(&self.artifact_url(key), body.clone()).await?;
      self.put(&self.metadata_url(key), metadata).await?;
      debug!(key = %key, "stored artifact in http cache");
    }
    Ok(())
  }

  fn is_store_supported(&self) -> bool {
    self.writable
  }
}

fn http_error(message: String) -> CacheError {
  CacheError::Http {
    cache: CACHE_NAME.to_string(),
    message,
  }
}

fn error(message: String) -> CacheResult {
  CacheResult::Error {
    source: CACHE_NAME.to_string(),
    message,
  }
}
