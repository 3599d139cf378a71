//! Implementation of the `kiln rulekey` command.
//!
//! Prints the rule key of a target together with every field that went into
//! it, and whether the last build of the target used the same key.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use kiln_lib::buildinfo::BuildInfoStore;
use kiln_lib::engine::{DefaultEngineDelegate, EngineDelegate};
use kiln_lib::graph::RuleLookup;
use kiln_lib::rulekey::{RuleKey, RuleKeyFactory};
use kiln_lib::target::BuildTarget;

use super::{Project, parse_target};
use crate::output::{OutputFormat, print_info, print_json, print_stat, print_success, print_warning};

#[derive(Serialize)]
struct RuleKeyReport {
  target: BuildTarget,
  rule_type: String,
  rule_key: RuleKey,
  fields: Vec<String>,
  deps: Vec<DepKey>,
  #[serde(skip_serializing_if = "Option::is_none")]
  last_built: Option<RuleKey>,
}

#[derive(Serialize)]
struct DepKey {
  target: BuildTarget,
  rule_key: RuleKey,
}

pub fn cmd_rulekey(project: &Project, target: &str, graph: Option<&Path>, output: OutputFormat) -> Result<()> {
  let graph = project.graph(graph)?;
  let target = parse_target(target)?;
  let resolved = graph
    .resolve(std::slice::from_ref(&target))
    .context("Failed to resolve target")?;
  let rule = resolved
    .rule(&target)
    .with_context(|| format!("No rule for {}", target))?;

  let delegate = DefaultEngineDelegate::new(&project.root);
  let factory = RuleKeyFactory::new(delegate.file_hash_cache(), project.config.build.max_rule_key_bytes);
  let rule_key = factory
    .compute_key(rule, &resolved)
    .with_context(|| format!("Failed to compute rule key of {}", target))?;
  let fields = factory
    .explain(rule, &resolved)
    .with_context(|| format!("Failed to describe {}", target))?;
  let deps = rule
    .deps()
    .iter()
    .filter_map(|dep| {
      factory.cached_key(dep).map(|rule_key| DepKey {
        target: dep.clone(),
        rule_key,
      })
    })
    .collect();

  let session = project.session(project.config.clone());
  let last_built = BuildInfoStore::new(session.info_dir())
    .load(&target)
    .ok()
    .flatten()
    .map(|record| record.rule_key);

  let report = RuleKeyReport {
    target,
    rule_type: rule.rule_type().to_string(),
    rule_key,
    fields,
    deps,
    last_built,
  };

  if output.is_json() {
    return print_json(&report);
  }

  print_success(&format!("{} {}", report.target, report.rule_key));
  print_stat("Rule type", &report.rule_type);
  println!();
  println!("Fields:");
  for field in &report.fields {
    println!("  {}", field);
  }
  if !report.deps.is_empty() {
    println!();
    println!("Dependencies:");
    for dep in &report.deps {
      println!("  {} {}", dep.target, dep.rule_key);
    }
  }
  println!();
  match report.last_built {
    Some(key) if key == report.rule_key => print_info("Up to date with the last build"),
    Some(key) => print_warning(&format!("Last built with a different key: {}", key)),
    None => print_info("Not built yet"),
  }

  Ok(())
}
