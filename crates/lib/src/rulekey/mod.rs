//! Rule keys.
//!
//! A [`RuleKey`] is a 160-bit digest of everything that can influence a
//! rule's output: its type, its declared fields, the keys of its
//! dependencies and its declared outputs. Two rules with equal keys produce
//! interchangeable outputs, which is what makes artifact caching sound.
//!
//! Rules describe themselves through [`RuleKeyFields`], an explicit list of
//! named [`KeyValue`]s filled in by [`Buildable::append_to_rule_key`].
//!
//! [`Buildable::append_to_rule_key`]: crate::rule::Buildable::append_to_rule_key

mod encoder;
mod factory;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::RULE_KEY_BYTES;
use crate::target::BuildTarget;
use crate::util::hash::HashError;

pub use factory::{RuleKeyAndInputs, RuleKeyFactory};

#[derive(Debug, Error)]
pub enum RuleKeyError {
  #[error("rule key for {target} exceeds {limit} bytes")]
  TooLarge { target: BuildTarget, limit: usize },

  #[error("failed to hash {path}: {source}")]
  FileHash {
    path: PathBuf,
    #[source]
    source: HashError,
  },

  #[error("rule key references unknown dependency {0}")]
  UnknownDependency(BuildTarget),

  #[error("{target} reported input {path} that is not one of its coverable inputs")]
  UndeclaredInput { target: BuildTarget, path: PathBuf },

  #[error("invalid rule key '{0}': expected {width} hex characters", width = RULE_KEY_BYTES * 2)]
  InvalidHex(String),
}

/// Digest identifying a rule's inputs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleKey([u8; RULE_KEY_BYTES]);

impl RuleKey {
  /// Truncate a longer digest to key width.
  pub(crate) fn from_digest(digest: &[u8]) -> Self {
    let mut bytes = [0u8; RULE_KEY_BYTES];
    bytes.copy_from_slice(&digest[..RULE_KEY_BYTES]);
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; RULE_KEY_BYTES] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl std::fmt::Display for RuleKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl std::fmt::Debug for RuleKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "RuleKey({})", self.to_hex())
  }
}

impl FromStr for RuleKey {
  type Err = RuleKeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || RuleKeyError::InvalidHex(s.to_string());
    if s.len() != RULE_KEY_BYTES * 2 || s.chars().any(|c| c.is_ascii_uppercase()) {
      return Err(invalid());
    }
    let decoded = hex::decode(s).map_err(|_| invalid())?;
    Ok(Self::from_digest(&decoded))
  }
}

impl TryFrom<String> for RuleKey {
  type Error = RuleKeyError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<RuleKey> for String {
  fn from(key: RuleKey) -> Self {
    key.to_hex()
  }
}

/// A single value contributing to a rule key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
  Str(String),
  Int(i64),
  Bool(bool),
  None,

  /// Ordered values; order is significant.
  Sequence(Vec<KeyValue>),

  /// Unordered values; any permutation yields the same key.
  Set(Vec<KeyValue>),

  Map(BTreeMap<String, KeyValue>),

  /// A nested group of named fields.
  Record(RuleKeyFields),

  /// A project-relative source file, keyed by path and content.
  File(PathBuf),

  /// A source file that may be dropped from the key when the rule reports
  /// it did not read it.
  CoverableFile(PathBuf),

  /// Another rule, keyed by its own rule key.
  Dep(BuildTarget),
}

impl KeyValue {
  pub fn sequence<I, V>(values: I) -> Self
  where
    I: IntoIterator<Item = V>,
    V: Into<KeyValue>,
  {
    KeyValue::Sequence(values.into_iter().map(Into::into).collect())
  }

  pub fn set<I, V>(values: I) -> Self
  where
    I: IntoIterator<Item = V>,
    V: Into<KeyValue>,
  {
    KeyValue::Set(values.into_iter().map(Into::into).collect())
  }

  pub fn map<I, K, V>(entries: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<KeyValue>,
  {
    KeyValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }

  pub fn file(path: impl Into<PathBuf>) -> Self {
    KeyValue::File(path.into())
  }

  pub fn coverable_file(path: impl Into<PathBuf>) -> Self {
    KeyValue::CoverableFile(path.into())
  }
}

impl From<&str> for KeyValue {
  fn from(value: &str) -> Self {
    KeyValue::Str(value.to_string())
  }
}

impl From<String> for KeyValue {
  fn from(value: String) -> Self {
    KeyValue::Str(value)
  }
}

impl From<&String> for KeyValue {
  fn from(value: &String) -> Self {
    KeyValue::Str(value.clone())
  }
}

impl From<i64> for KeyValue {
  fn from(value: i64) -> Self {
    KeyValue::Int(value)
  }
}

impl From<bool> for KeyValue {
  fn from(value: bool) -> Self {
    KeyValue::Bool(value)
  }
}

impl<T: Into<KeyValue>> From<Option<T>> for KeyValue {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(KeyValue::None)
  }
}

impl From<RuleKeyFields> for KeyValue {
  fn from(value: RuleKeyFields) -> Self {
    KeyValue::Record(value)
  }
}

/// Named values describing a rule. Field order is irrelevant to the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleKeyFields {
  fields: BTreeMap<String, KeyValue>,
}

impl RuleKeyFields {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set a field, replacing any previous value with the same name.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<KeyValue>) -> &mut Self {
    self.fields.insert(name.into(), value.into());
    self
  }

  pub fn get(&self, name: &str) -> Option<&KeyValue> {
    self.fields.get(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &KeyValue)> {
    self.fields.iter()
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }
}
