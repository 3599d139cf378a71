//! Action graphs.
//!
//! An [`ActionGraph`] is the ordered list of rules handed to the engine. It
//! tolerates duplicates and does not check its edges; [`ActionGraph::resolve`]
//! walks it from the requested targets and produces a [`ResolvedGraph`] in
//! which every dependency exists and there are no cycles.

mod file;

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::rule::Rule;
use crate::target::{BuildTarget, DependencyStack};

pub use file::{GraphFile, PipelineSpec, RuleKindSpec, RuleSpec};

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("failed to read graph file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse graph file {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("no rule for {target} (required by {stack})")]
  DependencyNotFound { target: BuildTarget, stack: DependencyStack },

  #[error("dependency cycle: {}", format_chain(.chain))]
  Cycle { chain: Vec<BuildTarget> },

  #[error("invalid pipeline at {target}: {message}")]
  InvalidPipeline { target: BuildTarget, message: String },
}

fn format_chain(chain: &[BuildTarget]) -> String {
  chain.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}

/// Looks up rules by target.
pub trait RuleLookup {
  fn rule(&self, target: &BuildTarget) -> Option<&Arc<Rule>>;
}

/// Insertion-ordered collection of rules.
#[derive(Debug, Clone, Default)]
pub struct ActionGraph {
  rules: Vec<Arc<Rule>>,
}

impl ActionGraph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, rule: Rule) -> Arc<Rule> {
    let rule = Arc::new(rule);
    self.rules.push(rule.clone());
    rule
  }

  pub fn add_shared(&mut self, rule: Arc<Rule>) {
    self.rules.push(rule);
  }

  pub fn rules(&self) -> &[Arc<Rule>] {
    &self.rules
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// First rule added for `target`.
  pub fn find(&self, target: &BuildTarget) -> Option<&Arc<Rule>> {
    self.rules.iter().find(|r| r.target() == target)
  }

  /// Distinct targets, sorted.
  pub fn targets(&self) -> BTreeSet<BuildTarget> {
    self.rules.iter().map(|r| r.target().clone()).collect()
  }

  /// Check the part of the graph reachable from `roots`.
  ///
  /// Fails with the dependency path for the first missing rule or cycle.
  pub fn resolve(&self, roots: &[BuildTarget]) -> Result<ResolvedGraph, GraphError> {
    let mut index: HashMap<&BuildTarget, &Arc<Rule>> = HashMap::new();
    for rule in &self.rules {
      if index.contains_key(rule.target()) {
        debug!(rule = %rule.target(), "ignoring duplicate rule");
        continue;
      }
      index.insert(rule.target(), rule);
    }

    let mut walk = Walk {
      index: &index,
      state: HashMap::new(),
      rules: HashMap::new(),
    };
    for root in roots {
      walk.visit(root, DependencyStack::root().child(root.clone()))?;
    }

    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for target in walk.rules.keys() {
      nodes.insert(target.clone(), graph.add_node(target.clone()));
    }
    for (target, rule) in &walk.rules {
      for dep in rule.deps() {
        graph.add_edge(nodes[dep], nodes[target], ());
      }
    }

    let order = toposort(&graph, None)
      .map_err(|cycle| GraphError::Cycle {
        chain: vec![graph[cycle.node_id()].clone()],
      })?
      .into_iter()
      .map(|idx| graph[idx].clone())
      .collect();

    let mut unique_roots = Vec::new();
    for root in roots {
      if !unique_roots.contains(root) {
        unique_roots.push(root.clone());
      }
    }

    Ok(ResolvedGraph {
      graph,
      nodes,
      rules: walk.rules,
      order,
      roots: unique_roots,
    })
  }
}

impl RuleLookup for ActionGraph {
  fn rule(&self, target: &BuildTarget) -> Option<&Arc<Rule>> {
    self.find(target)
  }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
  InProgress,
  Done,
}

struct Walk<'a> {
  index: &'a HashMap<&'a BuildTarget, &'a Arc<Rule>>,
  state: HashMap<BuildTarget, Visit>,
  rules: HashMap<BuildTarget, Arc<Rule>>,
}

impl Walk<'_> {
  /// Depth-first post-order walk; `stack` ends with `target`.
  fn visit(&mut self, target: &BuildTarget, stack: DependencyStack) -> Result<(), GraphError> {
    match self.state.get(target) {
      Some(Visit::Done) => return Ok(()),
      Some(Visit::InProgress) => {
        let path = stack.to_vec();
        let start = path.iter().position(|t| t == target).unwrap_or(0);
        return Err(GraphError::Cycle {
          chain: path[start..].to_vec(),
        });
      }
      None => {}
    }

    let Some(rule) = self.index.get(target).copied() else {
      return Err(GraphError::DependencyNotFound {
        target: target.clone(),
        stack,
      });
    };

    self.state.insert(target.clone(), Visit::InProgress);
    for dep in rule.deps() {
      self.visit(dep, stack.child(dep.clone()))?;
    }
    self.state.insert(target.clone(), Visit::Done);
    self.rules.insert(target.clone(), rule.clone());
    Ok(())
  }
}

/// The validated, acyclic part of an action graph needed for a build.
#[derive(Debug)]
pub struct ResolvedGraph {
  graph: DiGraph<BuildTarget, ()>,
  nodes: HashMap<BuildTarget, NodeIndex>,
  rules: HashMap<BuildTarget, Arc<Rule>>,
  order: Vec<BuildTarget>,
  roots: Vec<BuildTarget>,
}

impl ResolvedGraph {
  /// Requested targets, deduplicated, in request order.
  pub fn roots(&self) -> &[BuildTarget] {
    &self.roots
  }

  /// Every rule, dependencies before dependents.
  pub fn topo_order(&self) -> &[BuildTarget] {
    &self.order
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  pub fn contains(&self, target: &BuildTarget) -> bool {
    self.rules.contains_key(target)
  }

  /// Rules that directly depend on `target`.
  pub fn dependents(&self, target: &BuildTarget) -> Vec<BuildTarget> {
    let Some(&idx) = self.nodes.get(target) else {
      return Vec::new();
    };
    let mut dependents: Vec<BuildTarget> = self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .map(|n| self.graph[n].clone())
      .collect();
    dependents.sort();
    dependents.dedup();
    dependents
  }
}

impl RuleLookup for ResolvedGraph {
  fn rule(&self, target: &BuildTarget) -> Option<&Arc<Rule>> {
    self.rules.get(target)
  }
}
