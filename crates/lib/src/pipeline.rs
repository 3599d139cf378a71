//! Pipelined rule chains.
//!
//! Rules that declare [`Capability::SupportsPipelining`] form chains through
//! their `previous` links. Every chain gets one [`PipelineLane`] that owns the
//! chain's [`RulePipelineState`]:
//!
//! - the state is created from the chain head when the first member actually
//!   runs, so a chain served entirely from cache never creates it
//! - members run one at a time under the lane lock, in chain order
//! - the state is closed exactly once: when every member finished, when a
//!   member failed, or when the lane is dropped
//!
//! [`Capability::SupportsPipelining`]: crate::rule::Capability::SupportsPipelining

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::engine::BuildError;
use crate::graph::{GraphError, ResolvedGraph, RuleLookup};
use crate::rule::{ActionError, Rule, RulePipelineState};
use crate::target::BuildTarget;

/// The lanes of one build.
#[derive(Debug, Default)]
pub struct PipelineManager {
  lanes: HashMap<BuildTarget, Arc<PipelineLane>>,
}

impl PipelineManager {
  /// Discover the chains among the rules of `graph`.
  ///
  /// A member's `previous` must be a declared dependency that is itself
  /// pipelined, and no rule may be the `previous` of two members.
  pub fn from_graph(graph: &ResolvedGraph) -> Result<Self, GraphError> {
    let mut next: HashMap<BuildTarget, BuildTarget> = HashMap::new();
    let mut heads = Vec::new();

    for target in graph.topo_order() {
      let Some(rule) = graph.rule(target) else {
        continue;
      };
      if !rule.supports_pipelining() {
        continue;
      }

      let Some(previous) = rule.pipeline_previous() else {
        heads.push(rule.clone());
        continue;
      };

      let invalid = |message: String| GraphError::InvalidPipeline {
        target: target.clone(),
        message,
      };
      if !rule.deps().contains(previous) {
        return Err(invalid(format!("previous rule {} is not a dependency", previous)));
      }
      if !graph.rule(previous).is_some_and(|p| p.supports_pipelining()) {
        return Err(invalid(format!("previous rule {} is not pipelined", previous)));
      }
      if let Some(other) = next.insert(previous.clone(), target.clone()) {
        return Err(invalid(format!("{} already continues into {}", previous, other)));
      }
    }

    let mut lanes = HashMap::new();
    for head in heads {
      let mut members = vec![head.target().clone()];
      while let Some(member) = members.last().and_then(|last| next.get(last)) {
        members.push(member.clone());
      }
      debug!(head = %head.target(), members = members.len(), "discovered pipeline");

      let lane = Arc::new(PipelineLane::new(head, members));
      for member in &lane.members {
        lanes.insert(member.clone(), lane.clone());
      }
    }

    Ok(Self { lanes })
  }

  /// Lane of the chain `target` belongs to.
  pub fn lane(&self, target: &BuildTarget) -> Option<&Arc<PipelineLane>> {
    self.lanes.get(target)
  }

  pub fn lane_count(&self) -> usize {
    self.lanes.values().map(|l| Arc::as_ptr(l) as usize).collect::<HashSet<_>>().len()
  }
}

/// Shared state and bookkeeping of one chain.
pub struct PipelineLane {
  head: Arc<Rule>,
  members: Vec<BuildTarget>,
  inner: Mutex<LaneInner>,
  releases: AtomicUsize,
}

#[derive(Default)]
struct LaneInner {
  state: Option<Box<dyn RulePipelineState>>,
  released: bool,
  finished: HashSet<BuildTarget>,
  failed: Option<BuildTarget>,
}

impl std::fmt::Debug for PipelineLane {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PipelineLane")
      .field("head", self.head.target())
      .field("members", &self.members)
      .finish()
  }
}

impl PipelineLane {
  fn new(head: Arc<Rule>, members: Vec<BuildTarget>) -> Self {
    Self {
      head,
      members,
      inner: Mutex::new(LaneInner::default()),
      releases: AtomicUsize::new(0),
    }
  }

  pub fn head(&self) -> &BuildTarget {
    self.head.target()
  }

  /// Members in chain order.
  pub fn members(&self) -> &[BuildTarget] {
    &self.members
  }

  /// How many times the state has been released. Never more than one.
  pub fn release_count(&self) -> usize {
    self.releases.load(Ordering::SeqCst)
  }

  /// First member that failed, if any.
  pub async fn failed_member(&self) -> Option<BuildTarget> {
    self.inner.lock().await.failed.clone()
  }

  /// Take the lane lock so `target` can run.
  ///
  /// Fails with [`BuildError::PipelineFault`] once any member failed.
  pub async fn acquire(&self, target: &BuildTarget) -> Result<LaneGuard<'_>, BuildError> {
    let inner = self.inner.lock().await;
    if let Some(failed) = &inner.failed {
      return Err(BuildError::PipelineFault {
        target: target.clone(),
        failed: failed.clone(),
      });
    }
    Ok(LaneGuard {
      lane: self,
      inner,
    })
  }

  /// Mark `target` finished. Repeated calls for the same member are ignored.
  pub async fn complete(&self, target: &BuildTarget, success: bool) {
    let mut inner = self.inner.lock().await;
    if !inner.finished.insert(target.clone()) {
      return;
    }
    if !success && inner.failed.is_none() {
      warn!(rule = %target, head = %self.head(), "pipeline member failed");
      inner.failed = Some(target.clone());
    }
    if !success || inner.finished.len() >= self.members.len() {
      self.release(&mut inner);
    }
  }

  fn release(&self, inner: &mut LaneInner) {
    if inner.released {
      return;
    }
    inner.released = true;
    if let Some(mut state) = inner.state.take() {
      state.close();
      self.releases.fetch_add(1, Ordering::SeqCst);
      debug!(head = %self.head(), "released pipeline state");
    }
  }
}

impl Drop for PipelineLane {
  fn drop(&mut self) {
    let mut inner = std::mem::take(self.inner.get_mut());
    self.release(&mut inner);
  }
}

/// Exclusive access to a lane while one member runs.
pub struct LaneGuard<'a> {
  lane: &'a PipelineLane,
  inner: MutexGuard<'a, LaneInner>,
}

impl LaneGuard<'_> {
  /// The chain's state, created from the head on first use.
  pub fn state(&mut self) -> Result<Option<&mut Box<dyn RulePipelineState>>, ActionError> {
    if self.inner.state.is_none() && !self.inner.released {
      debug!(head = %self.lane.head(), "creating pipeline state");
      self.inner.state = self.lane.head.buildable().create_pipeline_state()?;
    }
    Ok(self.inner.state.as_mut())
  }
}
