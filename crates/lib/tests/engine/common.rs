use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_lib::config::KilnConfig;
use kiln_lib::engine::{BuildError, BuildReport, CachingBuildEngine, DefaultEngineDelegate};
use kiln_lib::graph::ActionGraph;
use kiln_lib::rule::{ActionContext, ActionError, Buildable, Capability, Rule, RulePipelineState};
use kiln_lib::rulekey::{KeyValue, RuleKeyFields};
use kiln_lib::session::BuildSession;
use kiln_lib::target::BuildTarget;
use tempfile::TempDir;

pub const OUT_FILE: &str = "out.txt";

/// A project directory with its own output tree.
pub struct TestProject {
  pub temp: TempDir,
  pub config: KilnConfig,
}

impl TestProject {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
      config: KilnConfig::default(),
    }
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  pub fn write_file(&self, rel: &str, content: &str) {
    let path = self.root().join(rel);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
  }

  pub fn out_dir(&self) -> PathBuf {
    self.config.out_dir(self.root())
  }

  pub fn output_dir(&self, target: &BuildTarget) -> PathBuf {
    BuildSession::new(self.root(), self.config.clone()).output_dir_for(target)
  }

  /// Content of `out.txt` produced by the rule `name`.
  pub fn output(&self, name: &str) -> String {
    fs::read_to_string(self.output_dir(&target(name)).join(OUT_FILE)).unwrap()
  }

  /// Forget every local build result while keeping the artifact cache.
  pub fn wipe_local_state(&self) {
    for dir in ["gen", "info"] {
      let path = self.out_dir().join(dir);
      if path.exists() {
        fs::remove_dir_all(path).unwrap();
      }
    }
  }

  /// Build with a fresh session, engine and file hash cache, as a new
  /// invocation would.
  pub async fn try_build(&self, graph: &ActionGraph, targets: &[BuildTarget]) -> Result<BuildReport, BuildError> {
    let session = Arc::new(BuildSession::new(self.root(), self.config.clone()));
    let cache = session.open_cache(false).unwrap();
    let engine = CachingBuildEngine::new(session, Arc::new(DefaultEngineDelegate::new(self.root())), cache);
    engine.build(graph, targets).await
  }

  pub async fn build(&self, graph: &ActionGraph, targets: &[BuildTarget]) -> BuildReport {
    self.try_build(graph, targets).await.unwrap()
  }
}

pub fn target(name: &str) -> BuildTarget {
  BuildTarget::new("app", name)
}

pub fn rule(name: &str, buildable: impl Buildable + 'static) -> Rule {
  Rule::new(target(name), Arc::new(buildable))
}

/// Names of the actions that ran, in the order they started.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
  runs: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
  fn record(&self, label: &str) {
    self.runs.lock().unwrap().push(label.to_string());
  }

  pub fn runs(&self) -> Vec<String> {
    self.runs.lock().unwrap().clone()
  }

  pub fn count(&self, label: &str) -> usize {
    self.runs.lock().unwrap().iter().filter(|r| r.as_str() == label).count()
  }
}

/// Writes `out.txt` containing its content, an optional source file and the
/// outputs of its dependencies, joined by `|`.
#[derive(Debug, Clone)]
pub struct StepRule {
  label: String,
  content: String,
  src: Option<PathBuf>,
  fail: bool,
  delay: Duration,
  recorder: Recorder,
}

pub fn step(recorder: &Recorder, label: &str, content: &str) -> StepRule {
  StepRule {
    label: label.to_string(),
    content: content.to_string(),
    src: None,
    fail: false,
    delay: Duration::ZERO,
    recorder: recorder.clone(),
  }
}

impl StepRule {
  pub fn reading(mut self, src: &str) -> Self {
    self.src = Some(PathBuf::from(src));
    self
  }

  pub fn failing(mut self) -> Self {
    self.fail = true;
    self
  }

  pub fn slow(mut self, millis: u64) -> Self {
    self.delay = Duration::from_millis(millis);
    self
  }
}

#[async_trait]
impl Buildable for StepRule {
  fn rule_type(&self) -> &str {
    "step"
  }

  fn append_to_rule_key(&self, fields: &mut RuleKeyFields) {
    fields
      .set("content", &self.content)
      .set("src", self.src.clone().map(KeyValue::file))
      .set("fail", self.fail);
  }

  async fn build(&self, ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
    self.recorder.record(&self.label);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if self.fail {
      return Err(ActionError::Failed(format!("{} exploded", self.label)));
    }

    let mut parts = vec![self.content.clone()];
    if let Some(src) = &self.src {
      parts.push(tokio::fs::read_to_string(ctx.project_root.join(src)).await?);
    }
    for dir in ctx.dep_output_dirs.values() {
      parts.push(tokio::fs::read_to_string(dir.join(OUT_FILE)).await?);
    }
    tokio::fs::write(ctx.output_dir.join(OUT_FILE), parts.join("|")).await?;
    ctx.buildable_context.record_artifact(OUT_FILE);
    Ok(())
  }
}

/// Declares several coverable sources but reads only some of them.
#[derive(Debug, Clone)]
pub struct ScanRule {
  srcs: Vec<PathBuf>,
  reads: Vec<PathBuf>,
  recorder: Recorder,
}

pub fn scan(recorder: &Recorder, srcs: &[&str], reads: &[&str]) -> ScanRule {
  ScanRule {
    srcs: srcs.iter().map(PathBuf::from).collect(),
    reads: reads.iter().map(PathBuf::from).collect(),
    recorder: recorder.clone(),
  }
}

pub fn scan_rule(name: &str, buildable: ScanRule) -> Rule {
  rule(name, buildable).with_capability(Capability::SupportsDependencyFileKeys)
}

#[async_trait]
impl Buildable for ScanRule {
  fn rule_type(&self) -> &str {
    "scan"
  }

  fn append_to_rule_key(&self, fields: &mut RuleKeyFields) {
    fields.set(
      "srcs",
      KeyValue::set(self.srcs.iter().map(|p| KeyValue::coverable_file(p))),
    );
  }

  async fn build(&self, ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
    self.recorder.record("scan");
    let mut parts = Vec::new();
    for src in &self.reads {
      parts.push(tokio::fs::read_to_string(ctx.project_root.join(src)).await?);
    }
    tokio::fs::write(ctx.output_dir.join(OUT_FILE), parts.join("|")).await?;
    ctx.buildable_context.record_artifact(OUT_FILE);
    ctx.buildable_context.record_used_inputs(self.reads.clone());
    Ok(())
  }
}

/// How often pipeline state was created and closed.
#[derive(Debug, Default)]
pub struct StateCounters {
  created: AtomicUsize,
  closed: AtomicUsize,
}

impl StateCounters {
  pub fn created(&self) -> usize {
    self.created.load(Ordering::SeqCst)
  }

  pub fn closed(&self) -> usize {
    self.closed.load(Ordering::SeqCst)
  }
}

#[derive(Debug)]
struct SharedVisits {
  visits: Vec<String>,
  counters: Arc<StateCounters>,
}

impl RulePipelineState for SharedVisits {
  fn as_any_mut(&mut self) -> &mut dyn Any {
    self
  }

  fn close(&mut self) {
    self.counters.closed.fetch_add(1, Ordering::SeqCst);
  }
}

/// A pipelined stage. Writes the stages that touched the shared state so far.
#[derive(Debug, Clone)]
pub struct StageRule {
  label: String,
  fail: bool,
  counters: Arc<StateCounters>,
  recorder: Recorder,
}

pub fn stage(recorder: &Recorder, counters: &Arc<StateCounters>, label: &str) -> StageRule {
  StageRule {
    label: label.to_string(),
    fail: false,
    counters: counters.clone(),
    recorder: recorder.clone(),
  }
}

impl StageRule {
  pub fn failing(mut self) -> Self {
    self.fail = true;
    self
  }
}

/// A rule in a pipelined chain following `previous`.
pub fn stage_rule(name: &str, buildable: StageRule, previous: Option<&str>) -> Rule {
  let previous = previous.map(target);
  rule(name, buildable)
    .with_deps(previous.clone())
    .with_capability(Capability::SupportsPipelining { previous })
}

#[async_trait]
impl Buildable for StageRule {
  fn rule_type(&self) -> &str {
    "stage"
  }

  fn append_to_rule_key(&self, fields: &mut RuleKeyFields) {
    fields.set("label", &self.label).set("fail", self.fail);
  }

  async fn build(&self, ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
    self.recorder.record(&self.label);
    if self.fail {
      return Err(ActionError::Failed(format!("{} exploded", self.label)));
    }
    let state = ctx
      .pipeline_state::<SharedVisits>()
      .ok_or_else(|| ActionError::Failed("no pipeline state".to_string()))?;
    state.visits.push(self.label.clone());
    let visits = state.visits.join(",");
    tokio::fs::write(ctx.output_dir.join(OUT_FILE), visits).await?;
    ctx.buildable_context.record_artifact(OUT_FILE);
    Ok(())
  }

  fn create_pipeline_state(&self) -> Result<Option<Box<dyn RulePipelineState>>, ActionError> {
    self.counters.created.fetch_add(1, Ordering::SeqCst);
    Ok(Some(Box::new(SharedVisits {
      visits: Vec::new(),
      counters: self.counters.clone(),
    })))
  }
}
