//! Implementation of the `kiln build` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use kiln_lib::engine::{BuildReport, BuildStatus, CachingBuildEngine, DefaultEngineDelegate};

use super::{Project, parse_target};
use crate::output::{Mark, OutputFormat, format_duration, format_stack, print_error, print_json, print_stat, short_key, status};

pub struct BuildArgs {
  pub targets: Vec<String>,
  pub keep_going: bool,
  pub threads: Option<usize>,
  pub graph: Option<PathBuf>,
  pub no_cache: bool,
  pub upload_timeout: Option<Duration>,
  pub build_report: Option<PathBuf>,
  pub output: OutputFormat,
}

/// Build the requested targets. Returns whether every target succeeded.
pub fn cmd_build(project: &Project, args: BuildArgs) -> Result<bool> {
  let mut config = project.config.clone();
  if args.keep_going {
    config.build.keep_going = true;
  }
  if let Some(threads) = args.threads {
    config.build.threads = Some(threads);
  }
  if let Some(timeout) = args.upload_timeout {
    config.cache.upload_timeout_secs = timeout.as_secs().max(1);
  }

  let graph = project.graph(args.graph.as_deref())?;
  let targets = args
    .targets
    .iter()
    .map(|raw| parse_target(raw))
    .collect::<Result<Vec<_>>>()?;

  let session = Arc::new(project.session(config));
  let cache = session
    .open_cache(args.no_cache)
    .context("Failed to open artifact cache")?;
  let delegate = Arc::new(DefaultEngineDelegate::new(&project.root));
  let engine = CachingBuildEngine::new(session, delegate, cache);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(engine.build(&graph, &targets)).context("Build failed")?;

  if let Some(path) = &args.build_report {
    let json = serde_json::to_vec_pretty(&report).context("Failed to serialize build report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write build report {}", path.display()))?;
  }

  if args.output.is_json() {
    print_json(&report)?;
  } else {
    print_report(&report);
  }

  Ok(report.success)
}

fn print_report(report: &BuildReport) {
  for result in &report.results {
    let mark = match result.status {
      BuildStatus::Success => Mark::Built,
      BuildStatus::Cached => Mark::Cached,
      BuildStatus::Fail => Mark::Failed,
    };
    match (result.success_type, result.rule_key) {
      (Some(how), Some(key)) => status(mark, &format!("{} {} ({})", result.target, how, short_key(&key))),
      (Some(how), None) => status(mark, &format!("{} {}", result.target, how)),
      _ => status(mark, &format!("{} failed", result.target)),
    }
  }

  if !report.failures.is_empty() {
    eprintln!();
    for failure in &report.failures {
      print_error(&failure.message);
      if failure.stack.len() > 1 {
        eprintln!("    {}", format_stack(&failure.stack));
      }
    }
  }

  let stats = &report.stats;
  println!();
  print_stat("Executed", &report.executed.len().to_string());
  print_stat("Cache hits", &stats.hit_count.to_string());
  print_stat("Cache misses", &(stats.miss_count + stats.miss_match_count).to_string());
  if stats.error_count > 0 {
    print_stat("Cache errors", &stats.error_count.to_string());
  }
  print_stat("Duration", &format_duration(Duration::from_millis(report.duration_ms)));
}
