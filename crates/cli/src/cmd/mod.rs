mod build;
mod cache;
mod rulekey;
mod targets;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use kiln_lib::config::KilnConfig;
use kiln_lib::consts::GRAPH_FILENAME;
use kiln_lib::graph::ActionGraph;
use kiln_lib::session::BuildSession;
use kiln_lib::target::BuildTarget;

pub use build::{BuildArgs, cmd_build};
pub use cache::{cmd_cache_clean, cmd_cache_stats};
pub use rulekey::cmd_rulekey;
pub use targets::cmd_targets;

/// The project a command operates on: its root and layered configuration.
pub struct Project {
  pub root: PathBuf,
  pub config: KilnConfig,
}

impl Project {
  pub fn load(root: PathBuf, overrides: &[String]) -> Result<Self> {
    let config = KilnConfig::load(&root, overrides).context("Failed to load configuration")?;
    Ok(Self { root, config })
  }

  /// Load the action graph from `graph`, or from the project's default graph file.
  pub fn graph(&self, graph: Option<&Path>) -> Result<ActionGraph> {
    let path = match graph {
      Some(path) => path.to_path_buf(),
      None => self.root.join(GRAPH_FILENAME),
    };
    let graph =
      ActionGraph::load(&path).with_context(|| format!("Failed to load action graph {}", path.display()))?;
    debug!(path = %path.display(), rules = graph.len(), "loaded action graph");
    Ok(graph)
  }

  pub fn session(&self, config: KilnConfig) -> BuildSession {
    BuildSession::new(&self.root, config)
  }
}

pub fn parse_target(raw: &str) -> Result<BuildTarget> {
  BuildTarget::parse(raw).with_context(|| format!("Invalid target: {}", raw))
}
