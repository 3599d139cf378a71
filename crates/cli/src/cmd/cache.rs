//! Implementation of the `kiln cache` commands.
//!
//! Both commands operate on the directory cache tier only; remote tiers are
//! left alone.

use std::time::Instant;

use anyhow::{Context, Result};

use super::Project;
use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_cache_stats(project: &Project, output: OutputFormat) -> Result<()> {
  let session = project.session(project.config.clone());
  let cache = session.dir_cache();
  let stats = cache.stats().context("Failed to read directory cache")?;

  if output.is_json() {
    let json_output = serde_json::json!({
      "path": cache.root(),
      "enabled": project.config.cache.enabled,
      "tiers": project.config.cache.tiers,
      "entries": stats.entries,
      "total_bytes": stats.total_bytes,
    });
    return print_json(&json_output);
  }

  print_info(&format!("Directory cache: {}", cache.root().display()));
  if !project.config.cache.enabled {
    print_stat("Status", "disabled");
  }
  print_stat("Entries", &stats.entries.to_string());
  print_stat("Size", &format_bytes(stats.total_bytes));
  Ok(())
}

pub fn cmd_cache_clean(project: &Project, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let session = project.session(project.config.clone());
  let cache = session.dir_cache();
  let removed = cache.clean().context("Failed to clean directory cache")?;

  if output.is_json() {
    let json_output = serde_json::json!({ "path": cache.root(), "removed": removed });
    return print_json(&json_output);
  }

  print_success("Cache cleaned");
  print_stat("Entries removed", &removed.to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
