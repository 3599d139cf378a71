//! Rule key computation with per-build memoization.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::encoder::{EncodeMode, KeyEncoder, KeyInputs, normalize_path};
use super::{KeyValue, RuleKey, RuleKeyError, RuleKeyFields};
use crate::engine::FileHashCache;
use crate::graph::RuleLookup;
use crate::rule::Rule;
use crate::target::BuildTarget;
use crate::util::hash::ContentHash;

const FIELD_RULE_TYPE: &str = ".rule_type";
const FIELD_DEPS: &str = ".deps";
const FIELD_OUTPUTS: &str = ".outputs";
const FIELD_KEY_KIND: &str = ".key_kind";
const FIELD_USED_INPUTS: &str = ".used_inputs";

/// A key together with the inputs it covers.
///
/// For a manifest key these are the coverable inputs left out of the key;
/// for a dependency-file key, the inputs the rule actually read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleKeyAndInputs {
  pub key: RuleKey,
  pub inputs: BTreeSet<PathBuf>,
}

/// Computes rule keys for one build invocation.
///
/// Dependency keys are memoized by target, so each rule's key is derived
/// once no matter how many dependents reference it.
pub struct RuleKeyFactory {
  file_hashes: Arc<dyn FileHashCache>,
  max_bytes: usize,
  keys: DashMap<BuildTarget, RuleKey>,
}

impl std::fmt::Debug for RuleKeyFactory {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RuleKeyFactory")
      .field("max_bytes", &self.max_bytes)
      .field("memoized", &self.keys.len())
      .finish()
  }
}

impl RuleKeyFactory {
  pub fn new(file_hashes: Arc<dyn FileHashCache>, max_bytes: usize) -> Self {
    Self {
      file_hashes,
      max_bytes,
      keys: DashMap::new(),
    }
  }

  /// Key of a rule computed earlier in this invocation.
  pub fn cached_key(&self, target: &BuildTarget) -> Option<RuleKey> {
    self.keys.get(target).map(|k| *k)
  }

  pub fn compute_key(&self, rule: &Rule, rules: &dyn RuleLookup) -> Result<RuleKey, RuleKeyError> {
    if let Some(key) = self.cached_key(rule.target()) {
      return Ok(key);
    }

    let mut fields = descriptor(rule);
    fields.set(FIELD_KEY_KIND, "default");

    let inputs = FactoryInputs { factory: self, rules };
    let mut encoder = KeyEncoder::new(rule.target(), self.max_bytes, EncodeMode::Full, &inputs);
    encoder.encode_fields(&fields)?;
    let (key, _) = encoder.finish();

    trace!(rule = %rule.target(), key = %key, "computed rule key");
    self.keys.insert(rule.target().clone(), key);
    Ok(key)
  }

  /// Key that leaves out coverable inputs. Its inputs are the left-out paths.
  pub fn compute_manifest_key(&self, rule: &Rule, rules: &dyn RuleLookup) -> Result<RuleKeyAndInputs, RuleKeyError> {
    let mut fields = descriptor(rule);
    fields.set(FIELD_KEY_KIND, "manifest");

    let inputs = FactoryInputs { factory: self, rules };
    let mut encoder = KeyEncoder::new(rule.target(), self.max_bytes, EncodeMode::Manifest, &inputs);
    encoder.encode_fields(&fields)?;
    let (key, coverable) = encoder.finish();
    Ok(RuleKeyAndInputs { key, inputs: coverable })
  }

  /// Key over the manifest fields plus the contents of the inputs the rule
  /// reported as read.
  pub fn compute_dep_file_key(
    &self,
    rule: &Rule,
    rules: &dyn RuleLookup,
    used_inputs: &BTreeSet<PathBuf>,
  ) -> Result<RuleKeyAndInputs, RuleKeyError> {
    let manifest = self.compute_manifest_key(rule, rules)?;
    if let Some(path) = used_inputs.iter().find(|p| !manifest.inputs.contains(*p)) {
      return Err(RuleKeyError::UndeclaredInput {
        target: rule.target().clone(),
        path: path.clone(),
      });
    }

    let mut used = std::collections::BTreeMap::new();
    for path in used_inputs {
      let hash = self.file_hash(path)?;
      used.insert(normalize_path(path), KeyValue::Str(hash.0));
    }

    let mut fields = descriptor(rule);
    fields.set(FIELD_KEY_KIND, "dep_file");
    fields.set(FIELD_USED_INPUTS, KeyValue::Map(used));

    let inputs = FactoryInputs { factory: self, rules };
    let mut encoder = KeyEncoder::new(rule.target(), self.max_bytes, EncodeMode::Manifest, &inputs);
    encoder.encode_fields(&fields)?;
    let (key, _) = encoder.finish();
    Ok(RuleKeyAndInputs {
      key,
      inputs: used_inputs.clone(),
    })
  }

  /// Human-readable contribution of each field to a rule's key.
  pub fn explain(&self, rule: &Rule, rules: &dyn RuleLookup) -> Result<Vec<String>, RuleKeyError> {
    let inputs = FactoryInputs { factory: self, rules };
    let fields = descriptor(rule);
    fields
      .iter()
      .map(|(name, value)| Ok(format!("{} = {}", name, render(value, &inputs)?)))
      .collect()
  }

  fn file_hash(&self, path: &Path) -> Result<ContentHash, RuleKeyError> {
    self.file_hashes.get(path).map_err(|source| RuleKeyError::FileHash {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// Fields every key is made of: the rule's own descriptor plus its type,
/// dependencies and declared outputs.
fn descriptor(rule: &Rule) -> RuleKeyFields {
  let mut fields = RuleKeyFields::new();
  rule.buildable().append_to_rule_key(&mut fields);
  fields.set(FIELD_RULE_TYPE, rule.rule_type());
  fields.set(
    FIELD_DEPS,
    KeyValue::Set(rule.deps().iter().cloned().map(KeyValue::Dep).collect()),
  );
  fields.set(
    FIELD_OUTPUTS,
    KeyValue::sequence(rule.outputs().iter().map(|p| normalize_path(p))),
  );
  fields
}

struct FactoryInputs<'a> {
  factory: &'a RuleKeyFactory,
  rules: &'a dyn RuleLookup,
}

impl KeyInputs for FactoryInputs<'_> {
  fn file_hash(&self, path: &Path) -> Result<ContentHash, RuleKeyError> {
    self.factory.file_hash(path)
  }

  fn dep_key(&self, target: &BuildTarget) -> Result<RuleKey, RuleKeyError> {
    if let Some(key) = self.factory.cached_key(target) {
      return Ok(key);
    }
    let rule = self
      .rules
      .rule(target)
      .ok_or_else(|| RuleKeyError::UnknownDependency(target.clone()))?;
    self.factory.compute_key(rule, self.rules)
  }
}

fn render(value: &KeyValue, inputs: &FactoryInputs<'_>) -> Result<String, RuleKeyError> {
  Ok(match value {
    KeyValue::Str(s) => format!("{:?}", s),
    KeyValue::Int(i) => i.to_string(),
    KeyValue::Bool(b) => b.to_string(),
    KeyValue::None => "none".to_string(),
    KeyValue::Sequence(values) => {
      let items: Result<Vec<String>, RuleKeyError> = values.iter().map(|v| render(v, inputs)).collect();
      format!("[{}]", items?.join(", "))
    }
    KeyValue::Set(values) => {
      let mut items = values
        .iter()
        .map(|v| render(v, inputs))
        .collect::<Result<Vec<_>, _>>()?;
      items.sort();
      format!("{{{}}}", items.join(", "))
    }
    KeyValue::Map(entries) => {
      let items: Result<Vec<String>, RuleKeyError> = entries
        .iter()
        .map(|(k, v)| Ok(format!("{:?}: {}", k, render(v, inputs)?)))
        .collect();
      format!("{{{}}}", items?.join(", "))
    }
    KeyValue::Record(fields) => {
      let items: Result<Vec<String>, RuleKeyError> = fields
        .iter()
        .map(|(k, v)| Ok(format!("{} = {}", k, render(v, inputs)?)))
        .collect();
      format!("({})", items?.join(", "))
    }
    KeyValue::File(path) => format!("file({}, {})", normalize_path(path), inputs.file_hash(path)?),
    KeyValue::CoverableFile(path) => {
      format!("coverable({}, {})", normalize_path(path), inputs.file_hash(path)?)
    }
    KeyValue::Dep(target) => format!("dep({}, {})", target, inputs.dep_key(target)?),
  })
}
