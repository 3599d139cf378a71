//! JSON action graph files.
//!
//! ```json
//! {
//!   "rules": [
//!     { "target": "//lib:gen", "type": "write_file", "out": "gen.txt", "content": "hi" },
//!     { "target": "//app:main", "type": "cmd", "deps": ["//lib:gen"],
//!       "cmd": "cat $DEPS/gen.txt > $OUT/main.txt", "outputs": ["main.txt"] }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ActionGraph, GraphError};
use crate::rule::{Capability, CmdRule, Rule, WriteFileRule};
use crate::target::BuildTarget;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFile {
  pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
  pub target: BuildTarget,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub deps: Vec<BuildTarget>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub outputs: Vec<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pipeline: Option<PipelineSpec>,
  #[serde(flatten)]
  pub kind: RuleKindSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
  /// Previous rule of the chain. Absent for the chain head.
  #[serde(default)]
  pub previous: Option<BuildTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKindSpec {
  Cmd {
    cmd: String,
    #[serde(default)]
    srcs: Vec<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    dep_file: Option<PathBuf>,
  },
  WriteFile {
    out: PathBuf,
    content: String,
    #[serde(default)]
    executable: bool,
  },
}

impl RuleSpec {
  pub fn into_rule(self) -> Rule {
    let mut outputs = self.outputs;
    let mut dep_file_keys = false;

    let buildable: Arc<dyn crate::rule::Buildable> = match self.kind {
      RuleKindSpec::Cmd {
        cmd,
        srcs,
        env,
        dep_file,
      } => {
        let mut rule = CmdRule::new(cmd).with_srcs(srcs);
        for (key, value) in env {
          rule = rule.with_env(key, value);
        }
        if let Some(dep_file) = dep_file {
          dep_file_keys = true;
          rule = rule.with_dep_file(dep_file);
        }
        Arc::new(rule)
      }
      RuleKindSpec::WriteFile {
        out,
        content,
        executable,
      } => {
        if outputs.is_empty() {
          outputs.push(out.clone());
        }
        Arc::new(WriteFileRule::new(out, content).executable(executable))
      }
    };

    let mut rule = Rule::new(self.target, buildable)
      .with_deps(self.deps)
      .with_outputs(outputs);
    if dep_file_keys {
      rule = rule.with_capability(Capability::SupportsDependencyFileKeys);
    }
    if let Some(pipeline) = self.pipeline {
      rule = rule.with_capability(Capability::SupportsPipelining {
        previous: pipeline.previous,
      });
    }
    rule
  }
}

impl ActionGraph {
  /// Load a graph from a JSON file.
  pub fn load(path: &Path) -> Result<Self, GraphError> {
    let content = fs::read_to_string(path).map_err(|source| GraphError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&content).map_err(|e| match e {
      GraphError::Parse { message, .. } => GraphError::Parse {
        path: path.to_path_buf(),
        message,
      },
      other => other,
    })
  }

  pub fn from_json(content: &str) -> Result<Self, GraphError> {
    let file: GraphFile = serde_json::from_str(content).map_err(|e| GraphError::Parse {
      path: PathBuf::from("<inline>"),
      message: e.to_string(),
    })?;

    let mut graph = ActionGraph::new();
    for spec in file.rules {
      graph.add(spec.into_rule());
    }
    Ok(graph)
  }
}
