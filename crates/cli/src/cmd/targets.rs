use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use kiln_lib::target::BuildTarget;

use super::Project;
use crate::output::{OutputFormat, print_json, print_warning};

#[derive(Serialize)]
struct TargetEntry<'a> {
  target: &'a BuildTarget,
  rule_type: &'a str,
  deps: Vec<&'a BuildTarget>,
}

/// List every target of the action graph, sorted.
pub fn cmd_targets(project: &Project, graph: Option<&Path>, output: OutputFormat) -> Result<()> {
  let graph = project.graph(graph)?;
  let targets = graph.targets();
  let entries: Vec<TargetEntry<'_>> = targets
    .iter()
    .filter_map(|target| graph.find(target))
    .map(|rule| TargetEntry {
      target: rule.target(),
      rule_type: rule.rule_type(),
      deps: rule.deps().iter().collect(),
    })
    .collect();

  if output.is_json() {
    return print_json(&entries);
  }

  if entries.is_empty() {
    print_warning("The action graph has no rules");
    return Ok(());
  }
  for entry in &entries {
    println!("{} ({})", entry.target, entry.rule_type);
  }
  Ok(())
}
