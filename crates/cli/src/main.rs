mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{BuildArgs, Project};
use crate::output::OutputFormat;

/// kiln - Caching build engine
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log output (-v info, -vv debug). RUST_LOG takes precedence
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  /// Project root (default: current directory)
  #[arg(short = 'C', long, global = true, value_name = "DIR")]
  project: Option<PathBuf>,

  /// Override a configuration value, e.g. `-c build.keep_going=true`
  #[arg(short = 'c', long = "config", global = true, value_name = "KEY=VALUE")]
  overrides: Vec<String>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build targets and everything they depend on
  Build {
    /// Targets to build, e.g. //app:main
    #[arg(required = true)]
    targets: Vec<String>,

    /// Keep building independent targets after a failure
    #[arg(short, long)]
    keep_going: bool,

    /// Number of rules to build concurrently
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Action graph file (default: kiln-graph.json in the project root)
    #[arg(long, value_name = "FILE")]
    graph: Option<PathBuf>,

    /// Neither read nor write the artifact cache
    #[arg(long)]
    no_cache: bool,

    /// Upper bound for a single artifact upload (e.g. "30s", "2m")
    #[arg(long, value_parser = humantime::parse_duration)]
    upload_timeout: Option<Duration>,

    /// Write the JSON build report to FILE
    #[arg(long, value_name = "FILE")]
    build_report: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
  },

  /// Show the rule key of a target and what went into it
  Rulekey {
    /// Target to inspect
    target: String,

    /// Action graph file (default: kiln-graph.json in the project root)
    #[arg(long, value_name = "FILE")]
    graph: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
  },

  /// List the targets of the action graph
  Targets {
    /// Action graph file (default: kiln-graph.json in the project root)
    #[arg(long, value_name = "FILE")]
    graph: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
  },

  /// Inspect or clear the local artifact cache
  Cache {
    #[command(subcommand)]
    command: CacheCommands,
  },
}

#[derive(Subcommand)]
enum CacheCommands {
  /// Show entry count and size of the directory cache
  Stats {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
  },

  /// Delete every entry of the directory cache
  Clean {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let root = match &cli.project {
    Some(dir) => dunce::canonicalize(dir).with_context(|| format!("Project directory not found: {}", dir.display()))?,
    None => std::env::current_dir().context("Failed to determine current directory")?,
  };
  let project = Project::load(root, &cli.overrides)?;

  match cli.command {
    Commands::Build {
      targets,
      keep_going,
      threads,
      graph,
      no_cache,
      upload_timeout,
      build_report,
      output,
    } => {
      let success = cmd::cmd_build(
        &project,
        BuildArgs {
          targets,
          keep_going,
          threads,
          graph,
          no_cache,
          upload_timeout,
          build_report,
          output,
        },
      )?;
      if !success {
        std::process::exit(1);
      }
    }
    Commands::Rulekey { target, graph, output } => {
      cmd::cmd_rulekey(&project, &target, graph.as_deref(), output)?;
    }
    Commands::Targets { graph, output } => {
      cmd::cmd_targets(&project, graph.as_deref(), output)?;
    }
    Commands::Cache { command } => match command {
      CacheCommands::Stats { output } => cmd::cmd_cache_stats(&project, output)?,
      CacheCommands::Clean { output } => cmd::cmd_cache_clean(&project, output)?,
    },
  }

  Ok(())
}

fn init_tracing(verbose: u8) {
  let level = match verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}
