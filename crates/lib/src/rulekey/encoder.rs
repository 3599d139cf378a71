//! Canonical byte encoding of rule key fields.
//!
//! Every value is written as a one-byte tag followed by its payload, with
//! lengths and counts as little-endian `u64`. Field names and map keys are
//! visited in sorted order. Set elements are encoded on their own, digested,
//! and the digests are written sorted, so element order never matters.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{KeyValue, RuleKey, RuleKeyError, RuleKeyFields};
use crate::target::BuildTarget;
use crate::util::hash::ContentHash;

const TAG_STR: u8 = b's';
const TAG_INT: u8 = b'i';
const TAG_BOOL: u8 = b'b';
const TAG_NONE: u8 = b'n';
const TAG_SEQUENCE: u8 = b'q';
const TAG_SET: u8 = b'e';
const TAG_MAP: u8 = b'm';
const TAG_RECORD: u8 = b'r';
const TAG_FILE: u8 = b'f';
const TAG_COVERABLE: u8 = b'c';
const TAG_DEP: u8 = b'd';

/// How coverable files are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncodeMode {
  /// Coverable files are keyed like any other file.
  Full,
  /// Coverable files contribute only their presence; their paths are collected.
  Manifest,
}

/// Supplies the external facts a key depends on.
pub(crate) trait KeyInputs {
  fn file_hash(&self, path: &Path) -> Result<ContentHash, RuleKeyError>;
  fn dep_key(&self, target: &BuildTarget) -> Result<RuleKey, RuleKeyError>;
}

pub(crate) struct KeyEncoder<'a> {
  hasher: Sha256,
  written: usize,
  limit: usize,
  mode: EncodeMode,
  inputs: &'a dyn KeyInputs,
  target: &'a BuildTarget,
  coverable: BTreeSet<PathBuf>,
}

impl<'a> KeyEncoder<'a> {
  pub(crate) fn new(target: &'a BuildTarget, limit: usize, mode: EncodeMode, inputs: &'a dyn KeyInputs) -> Self {
    Self {
      hasher: Sha256::new(),
      written: 0,
      limit,
      mode,
      inputs,
      target,
      coverable: BTreeSet::new(),
    }
  }

  /// Encode a top-level field list.
  pub(crate) fn encode_fields(&mut self, fields: &RuleKeyFields) -> Result<(), RuleKeyError> {
    self.write_len(fields.len())?;
    for (name, value) in fields.iter() {
      self.write_str(name)?;
      self.encode_value(value)?;
    }
    Ok(())
  }

  /// Finish encoding, returning the key and the coverable paths seen.
  pub(crate) fn finish(self) -> (RuleKey, BTreeSet<PathBuf>) {
    let digest = self.hasher.finalize();
    (RuleKey::from_digest(&digest), self.coverable)
  }

  fn encode_value(&mut self, value: &KeyValue) -> Result<(), RuleKeyError> {
    match value {
      KeyValue::Str(s) => {
        self.write(&[TAG_STR])?;
        self.write_str(s)
      }
      KeyValue::Int(i) => {
        self.write(&[TAG_INT])?;
        self.write(&i.to_le_bytes())
      }
      KeyValue::Bool(b) => self.write(&[TAG_BOOL, u8::from(*b)]),
      KeyValue::None => self.write(&[TAG_NONE]),
      KeyValue::Sequence(values) => {
        self.write(&[TAG_SEQUENCE])?;
        self.write_len(values.len())?;
        for v in values {
          self.encode_value(v)?;
        }
        Ok(())
      }
      KeyValue::Set(values) => {
        let mut digests = Vec::with_capacity(values.len());
        for v in values {
          digests.push(self.element_digest(v)?);
        }
        digests.sort_unstable();
        self.write(&[TAG_SET])?;
        self.write_len(digests.len())?;
        for d in &digests {
          self.write(d)?;
        }
        Ok(())
      }
      KeyValue::Map(entries) => {
        self.write(&[TAG_MAP])?;
        self.write_len(entries.len())?;
        for (k, v) in entries {
          self.write_str(k)?;
          self.encode_value(v)?;
        }
        Ok(())
      }
      KeyValue::Record(fields) => {
        self.write(&[TAG_RECORD])?;
        self.encode_fields(fields)
      }
      KeyValue::File(path) => {
        self.write(&[TAG_FILE])?;
        self.write_file(path)
      }
      KeyValue::CoverableFile(path) => {
        self.write(&[TAG_COVERABLE])?;
        match self.mode {
          EncodeMode::Full => self.write_file(path),
          EncodeMode::Manifest => {
            self.coverable.insert(path.clone());
            Ok(())
          }
        }
      }
      KeyValue::Dep(target) => {
        let key = self.inputs.dep_key(target)?;
        self.write(&[TAG_DEP])?;
        self.write(key.as_bytes())
      }
    }
  }

  /// Encode a set element with its own hasher. Its bytes still count
  /// towards this encoder's limit.
  fn element_digest(&mut self, value: &KeyValue) -> Result<[u8; 32], RuleKeyError> {
    let remaining = self.limit.saturating_sub(self.written);
    let mut child = KeyEncoder::new(self.target, remaining, self.mode, self.inputs);
    child.encode_value(value)?;
    self.written += child.written;
    self.coverable.append(&mut child.coverable);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&child.hasher.finalize());
    Ok(digest)
  }

  fn write_file(&mut self, path: &Path) -> Result<(), RuleKeyError> {
    let hash = self.inputs.file_hash(path)?;
    self.write_str(&normalize_path(path))?;
    self.write_str(hash.as_str())
  }

  fn write_str(&mut self, s: &str) -> Result<(), RuleKeyError> {
    self.write_len(s.len())?;
    self.write(s.as_bytes())
  }

  fn write_len(&mut self, len: usize) -> Result<(), RuleKeyError> {
    self.write(&(len as u64).to_le_bytes())
  }

  fn write(&mut self, bytes: &[u8]) -> Result<(), RuleKeyError> {
    self.written += bytes.len();
    if self.written > self.limit {
      return Err(RuleKeyError::TooLarge {
        target: self.target.clone(),
        limit: self.limit,
      });
    }
    self.hasher.update(bytes);
    Ok(())
  }
}

/// Project-relative path with forward slashes.
pub(crate) fn normalize_path(path: &Path) -> String {
  path.to_string_lossy().replace('\\', "/")
}
