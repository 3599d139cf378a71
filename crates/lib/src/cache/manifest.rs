//! Dependency-file manifests.
//!
//! A rule that reports the inputs it read can be fetched even when one of
//! its unread inputs changed. The manifest stored under the rule's manifest
//! key lists, for earlier builds, the inputs they read with their content
//! hashes and the dependency-file key their artifact was stored under. An
//! entry whose inputs all still hash the same names a usable artifact.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::MANIFEST_VERSION;
use crate::rulekey::RuleKey;
use crate::util::hash::ContentHash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub dep_file_key: RuleKey,
  /// Project-relative input path mapped to its content hash.
  pub inputs: BTreeMap<String, ContentHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
  pub version: u32,
  pub entries: Vec<ManifestEntry>,
}

impl Default for Manifest {
  fn default() -> Self {
    Self {
      version: MANIFEST_VERSION,
      entries: Vec::new(),
    }
  }
}

impl Manifest {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an entry, dropping the oldest ones beyond `max_entries`.
  pub fn add(&mut self, entry: ManifestEntry, max_entries: usize) {
    self.entries.retain(|e| e.dep_file_key != entry.dep_file_key);
    self.entries.push(entry);
    if self.entries.len() > max_entries {
      let excess = self.entries.len() - max_entries;
      self.entries.drain(..excess);
    }
  }

  /// Newest entry whose inputs all hash as recorded.
  ///
  /// `current_hash` returns `None` for inputs that no longer exist.
  pub fn lookup<F>(&self, mut current_hash: F) -> Option<&ManifestEntry>
  where
    F: FnMut(&Path) -> Option<ContentHash>,
  {
    self.entries.iter().rev().find(|entry| {
      entry
        .inputs
        .iter()
        .all(|(path, expected)| current_hash(Path::new(path)).as_ref() == Some(expected))
    })
  }

  pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }

  pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(self)
  }
}
