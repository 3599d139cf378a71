//! Caching build engine.
//!
//! [`CachingBuildEngine::build`] resolves the requested targets, then builds
//! every rule they reach. Each rule runs in its own task; the task's result is
//! shared with every dependent, so a rule is processed at most once per build.
//!
//! Per rule:
//! 1. Wait for all dependencies. A failed dependency fails the rule without
//!    attempting it.
//! 2. Compute the rule key. Targets with the same key join the first one and
//!    copy its outputs.
//! 3. Skip the rule if its last build had the same key (or, for dependency
//!    file rules, read unchanged inputs) and its outputs are intact.
//! 4. Fetch from the artifact cache by key, then through the dependency-file
//!    manifest.
//! 5. Otherwise run the action, verify and record its outputs, persist the
//!    build info and upload in the background.
//!
//! Concurrency is bounded by a semaphore that a rule only acquires once its
//! dependencies are done.

mod delegate;
mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::buildinfo::{BuildInfoRecord, BuildInfoStore, BuildableContext, hash_outputs};
use crate::cache::manifest::{Manifest, ManifestEntry};
use crate::cache::{
  ArtifactCache, ArtifactInfo, ArtifactUploader, CacheError, CacheResult, METADATA_BUILD_ID, METADATA_DEP_FILE_KEY,
  METADATA_TARGET, METADATA_USED_INPUTS, archive,
};
use crate::consts::BUILD_INFO_VERSION;
use crate::graph::{ActionGraph, ResolvedGraph, RuleLookup};
use crate::pipeline::PipelineManager;
use crate::rule::{ActionContext, Rule};
use crate::rulekey::{RuleKey, RuleKeyAndInputs, RuleKeyFactory};
use crate::session::BuildSession;
use crate::target::{BuildTarget, DependencyStack};

pub use delegate::{DefaultEngineDelegate, DefaultFileHashCache, EngineDelegate, FileHashCache};
pub use types::{BuildError, BuildReport, BuildStatus, RootFailure, SuccessType, TargetResult};

/// Builds rules, consulting the build-info records and the artifact cache
/// before running any action.
pub struct CachingBuildEngine {
  session: Arc<BuildSession>,
  delegate: Arc<dyn EngineDelegate>,
  cache: Arc<dyn ArtifactCache>,
}

impl CachingBuildEngine {
  pub fn new(session: Arc<BuildSession>, delegate: Arc<dyn EngineDelegate>, cache: Arc<dyn ArtifactCache>) -> Self {
    Self {
      session,
      delegate,
      cache,
    }
  }

  pub fn session(&self) -> &Arc<BuildSession> {
    &self.session
  }

  /// Build `targets` and everything they depend on.
  ///
  /// Fails only if the graph cannot be resolved; rule failures are reported
  /// in the returned [`BuildReport`].
  pub async fn build(&self, graph: &ActionGraph, targets: &[BuildTarget]) -> Result<BuildReport, BuildError> {
    let resolved = Arc::new(graph.resolve(targets)?);
    let pipelines = PipelineManager::from_graph(&resolved)?;
    self.session.stats().reset();

    let config = self.session.config();
    let workers = config.build.worker_count();
    let tmp_dir = self.session.tmp_dir();
    tokio::fs::create_dir_all(&tmp_dir)
      .await
      .map_err(|source| BuildError::Setup {
        path: tmp_dir.clone(),
        source,
      })?;

    info!(
      build_id = %self.session.build_id(),
      targets = resolved.roots().len(),
      rules = resolved.len(),
      pipelines = pipelines.lane_count(),
      workers,
      "starting build"
    );

    let run = Arc::new(BuildRun {
      graph: resolved.clone(),
      session: self.session.clone(),
      delegate: self.delegate.clone(),
      cache: self.cache.clone(),
      uploader: ArtifactUploader::new(
        self.cache.clone(),
        config.cache.upload_timeout(),
        config.cache.upload_retries,
      ),
      keys: Arc::new(RuleKeyFactory::new(
        self.delegate.file_hash_cache(),
        config.build.max_rule_key_bytes,
      )),
      info: BuildInfoStore::new(self.session.info_dir()),
      pipelines,
      semaphore: Arc::new(Semaphore::new(workers)),
      keep_going: config.build.keep_going,
      stopped: AtomicBool::new(false),
      futures: DashMap::new(),
      in_flight: DashMap::new(),
      executed: Mutex::new(Vec::new()),
      failures: Mutex::new(Vec::new()),
      uploads: Mutex::new(JoinSet::new()),
      scratch: AtomicU64::new(0),
    });

    let roots = resolved.roots().iter().map(|target| {
      let future = run.future_for(target, DependencyStack::root().child(target.clone()));
      async move { (target.clone(), future.await) }
    });
    let outcomes = join_all(roots).await;

    run.finish_uploads().await;

    let results: Vec<TargetResult> = outcomes
      .into_iter()
      .map(|(target, outcome)| match outcome {
        Ok(success) => TargetResult {
          status: success.success_type.status(),
          success_type: Some(success.success_type),
          rule_key: Some(success.rule_key),
          output_dir: Some(success.output_dir),
          error: None,
          target,
        },
        Err(e) => TargetResult {
          status: BuildStatus::Fail,
          success_type: None,
          rule_key: None,
          output_dir: None,
          error: Some(e.to_string()),
          target,
        },
      })
      .collect();

    let mut failures = std::mem::take(&mut *run.failures.lock().await);
    failures.sort_by(|a, b| a.target.cmp(&b.target));
    failures.dedup_by(|a, b| a.target == b.target);
    let executed = std::mem::take(&mut *run.executed.lock().await);

    if let Err(e) = tokio::fs::remove_dir_all(&tmp_dir).await
      && e.kind() != io::ErrorKind::NotFound
    {
      debug!(path = ?tmp_dir, error = %e, "failed to remove build scratch dir");
    }

    let report = BuildReport {
      build_id: self.session.build_id().to_string(),
      success: results.iter().all(|r| r.status != BuildStatus::Fail),
      results,
      failures,
      executed,
      stats: self.session.stats().snapshot(),
      duration_ms: self.session.started().elapsed().as_millis() as u64,
    };

    info!(
      success = report.success,
      executed = report.executed.len(),
      failures = report.failures.len(),
      cache_hits = report.stats.hit_count,
      cache_misses = report.stats.miss_count,
      "build complete"
    );

    Ok(report)
  }
}

type RuleResult = Result<RuleSuccess, Arc<BuildError>>;
type RuleFuture = Shared<BoxFuture<'static, RuleResult>>;

#[derive(Debug, Clone)]
struct RuleSuccess {
  success_type: SuccessType,
  rule_key: RuleKey,
  output_dir: PathBuf,
  artifacts: BTreeSet<PathBuf>,
}

/// Everything a rule task needs, shared by all tasks of one build.
struct BuildRun {
  graph: Arc<ResolvedGraph>,
  session: Arc<BuildSession>,
  delegate: Arc<dyn EngineDelegate>,
  cache: Arc<dyn ArtifactCache>,
  uploader: ArtifactUploader,
  keys: Arc<RuleKeyFactory>,
  info: BuildInfoStore,
  pipelines: PipelineManager,
  semaphore: Arc<Semaphore>,
  keep_going: bool,
  stopped: AtomicBool,
  /// One shared task per target.
  futures: DashMap<BuildTarget, RuleFuture>,
  /// Target currently producing the outputs for a rule key.
  in_flight: DashMap<RuleKey, BuildTarget>,
  executed: Mutex<Vec<BuildTarget>>,
  failures: Mutex<Vec<RootFailure>>,
  uploads: Mutex<JoinSet<()>>,
  scratch: AtomicU64,
}

/// Outcome of consulting the artifact cache.
struct Fetched {
  success_type: SuccessType,
  artifacts: BTreeSet<PathBuf>,
  dep_file: Option<RuleKeyAndInputs>,
  metadata: BTreeMap<String, String>,
}

impl BuildRun {
  /// The shared task building `target`, spawning it on first request.
  fn future_for(self: &Arc<Self>, target: &BuildTarget, stack: DependencyStack) -> RuleFuture {
    if let Some(future) = self.futures.get(target) {
      return future.clone();
    }

    match self.futures.entry(target.clone()) {
      Entry::Occupied(entry) => entry.get().clone(),
      Entry::Vacant(entry) => {
        let run = self.clone();
        let task_target = target.clone();
        let handle = tokio::spawn(async move { run.process(task_target, stack).await });

        let panic_target = target.clone();
        let future = async move {
          match handle.await {
            Ok(result) => result,
            Err(e) => Err(Arc::new(BuildError::Panicked {
              target: panic_target,
              message: e.to_string(),
            })),
          }
        }
        .boxed()
        .shared();

        entry.insert(future.clone());
        future
      }
    }
  }

  fn is_stopped(&self) -> bool {
    !self.keep_going && self.stopped.load(Ordering::SeqCst)
  }

  /// Stop scheduling new rules, unless the build keeps going.
  fn stop(&self) {
    if !self.keep_going {
      self.stopped.store(true, Ordering::SeqCst);
    }
  }

  async fn process(self: Arc<Self>, target: BuildTarget, stack: DependencyStack) -> RuleResult {
    let result = self.process_rule(&target, &stack).await;

    if let Some(lane) = self.pipelines.lane(&target) {
      lane.complete(&target, result.is_ok()).await;
    }

    match &result {
      Ok(success) => debug!(rule = %target, outcome = %success.success_type, "rule finished"),
      Err(e) if e.is_derived() => debug!(rule = %target, reason = %e, "rule skipped"),
      Err(e) => {
        error!(rule = %target, error = %e, "rule failed");
        self.stop();
        self.failures.lock().await.push(RootFailure {
          target: e.target().unwrap_or(&target).clone(),
          message: e.to_string(),
          stack: e.stack().unwrap_or(&stack).to_vec(),
        });
      }
    }

    result.map_err(Arc::new)
  }

  async fn process_rule(self: &Arc<Self>, target: &BuildTarget, stack: &DependencyStack) -> Result<RuleSuccess, BuildError> {
    let rule = self
      .graph
      .rule(target)
      .cloned()
      .ok_or_else(|| BuildError::DependencyNotFound {
        target: target.clone(),
        stack: stack.clone(),
      })?;

    let deps = rule.deps().iter().map(|dep| {
      let future = self.future_for(dep, stack.child(dep.clone()));
      async move { (dep.clone(), future.await) }
    });

    let mut dep_dirs = BTreeMap::new();
    let mut failed_dep = None;
    for (dep, result) in join_all(deps).await {
      match result {
        Ok(success) => {
          dep_dirs.insert(dep, success.output_dir);
        }
        Err(_) => {
          failed_dep.get_or_insert(dep);
        }
      }
    }

    if let Some(dependency) = failed_dep {
      if rule.pipeline_previous() == Some(&dependency)
        && let Some(lane) = self.pipelines.lane(target)
      {
        let failed = lane.failed_member().await.unwrap_or(dependency);
        return Err(BuildError::PipelineFault {
          target: target.clone(),
          failed,
        });
      }
      return Err(BuildError::DependencyFailed {
        target: target.clone(),
        dependency,
        stack: stack.clone(),
      });
    }

    let cancelled = || BuildError::Cancelled { target: target.clone() };
    if self.is_stopped() {
      return Err(cancelled());
    }
    let permit = self.semaphore.clone().acquire_owned().await.map_err(|_| cancelled())?;
    if self.is_stopped() {
      return Err(cancelled());
    }

    let key = self.compute_key(&rule).await?;

    let leader = match self.in_flight.entry(key) {
      Entry::Occupied(entry) => Some(entry.get().clone()),
      Entry::Vacant(entry) => {
        entry.insert(target.clone());
        None
      }
    };

    if let Some(leader) = leader
      && let Some(future) = self.futures.get(&leader).map(|f| f.clone())
    {
      drop(permit);
      debug!(rule = %target, leader = %leader, key = %key, "waiting on rule with same key");
      let mut request = self.session.stats().start_request();
      let copied = match future.await {
        Ok(success) => self.copy_from_leader(&rule, key, &success).await,
        Err(_) => Err(BuildError::DuplicateFailed {
          target: target.clone(),
          leader,
        }),
      };
      if copied.is_ok() {
        request.record_hit();
      } else {
        request.record_miss();
      }
      return copied;
    }

    let result = self.build_or_fetch(&rule, key, &dep_dirs, stack).await;
    if let Err(e) = &result
      && !e.is_derived()
    {
      self.stop();
    }
    drop(permit);
    result
  }

  async fn compute_key(&self, rule: &Arc<Rule>) -> Result<RuleKey, BuildError> {
    let keys = self.keys.clone();
    let graph = self.graph.clone();
    let task_rule = rule.clone();
    blocking(rule.target(), move || {
      keys
        .compute_key(&task_rule, &*graph)
        .map_err(|source| BuildError::RuleKey {
          target: task_rule.target().clone(),
          source,
        })
    })
    .await
  }

  async fn compute_manifest_key(&self, rule: &Arc<Rule>) -> Result<RuleKeyAndInputs, BuildError> {
    let keys = self.keys.clone();
    let graph = self.graph.clone();
    let task_rule = rule.clone();
    blocking(rule.target(), move || {
      keys
        .compute_manifest_key(&task_rule, &*graph)
        .map_err(|source| BuildError::RuleKey {
          target: task_rule.target().clone(),
          source,
        })
    })
    .await
  }

  async fn compute_dep_file_key(&self, rule: &Arc<Rule>, used: &BTreeSet<PathBuf>) -> Result<RuleKeyAndInputs, BuildError> {
    let keys = self.keys.clone();
    let graph = self.graph.clone();
    let task_rule = rule.clone();
    let used = used.clone();
    blocking(rule.target(), move || {
      keys
        .compute_dep_file_key(&task_rule, &*graph, &used)
        .map_err(|source| BuildError::RuleKey {
          target: task_rule.target().clone(),
          source,
        })
    })
    .await
  }

  async fn build_or_fetch(
    self: &Arc<Self>,
    rule: &Arc<Rule>,
    key: RuleKey,
    dep_dirs: &BTreeMap<BuildTarget, PathBuf>,
    stack: &DependencyStack,
  ) -> Result<RuleSuccess, BuildError> {
    let target = rule.target();
    let output_dir = self.session.output_dir_for(target);
    let mut request = self.session.stats().start_request();

    let previous = match self.info.load(target) {
      Ok(record) => record,
      Err(e) => {
        warn!(rule = %target, error = %e, "ignoring unreadable build info");
        None
      }
    };

    if let Some(record) = &previous
      && let Some(success) = self.check_build_info(rule, key, record, &output_dir).await
    {
      request.record_hit();
      return Ok(success);
    }

    if let Some(fetched) = self.fetch_from_cache(rule, key, &output_dir).await {
      request.record_hit();
      let started = Instant::now();
      let artifacts = fetched.artifacts.clone();
      self
        .save_build_info(rule, key, &output_dir, &artifacts, fetched.dep_file, fetched.metadata, fetched.success_type, started)
        .await?;
      info!(rule = %target, key = %key, outcome = %fetched.success_type, "fetched from cache");
      return Ok(RuleSuccess {
        success_type: fetched.success_type,
        rule_key: key,
        output_dir,
        artifacts,
      });
    }

    if previous.as_ref().is_some_and(|record| record.rule_key != key) {
      request.record_miss_match();
    } else {
      request.record_miss();
    }

    match self.execute(rule, key, dep_dirs, stack, &output_dir).await {
      Ok(success) => {
        request.record_load_success();
        Ok(success)
      }
      Err(e) => {
        request.record_load_fail();
        Err(e)
      }
    }
  }

  /// Whether the last build of `rule` is still valid.
  async fn check_build_info(
    &self,
    rule: &Arc<Rule>,
    key: RuleKey,
    record: &BuildInfoRecord,
    output_dir: &Path,
  ) -> Option<RuleSuccess> {
    let target = rule.target();

    let success_type = if record.rule_key == key {
      SuccessType::MatchingRuleKey
    } else if rule.supports_dep_file_keys()
      && let (Some(dep_file_key), Some(used)) = (record.dep_file_key, &record.used_inputs)
    {
      match self.compute_dep_file_key(rule, used).await {
        Ok(recomputed) if recomputed.key == dep_file_key => SuccessType::MatchingDepFileRuleKey,
        Ok(_) => return None,
        Err(e) => {
          debug!(rule = %target, error = %e, "cannot recompute dep-file key");
          return None;
        }
      }
    } else {
      debug!(rule = %target, old = %record.rule_key, new = %key, "rule key changed");
      return None;
    };

    let task_record = record.clone();
    let task_dir = output_dir.to_path_buf();
    let declared: Vec<PathBuf> = rule.outputs().to_vec();
    let intact = blocking(target, move || {
      Ok::<_, io::Error>(task_record.outputs_intact(&task_dir) && declared.iter().all(|o| task_dir.join(o).exists()))
    })
    .await
    .unwrap_or(false);
    if !intact {
      debug!(rule = %target, "outputs changed since last build");
      self.session.stats().record_invalidation();
      return None;
    }

    if success_type == SuccessType::MatchingDepFileRuleKey {
      let mut updated = record.clone();
      updated.rule_key = key;
      updated.origin = success_type;
      if let Err(e) = self.info.save(&updated) {
        warn!(rule = %target, error = %e, "failed to refresh build info");
      }
    }

    info!(rule = %target, key = %key, outcome = %success_type, "rule is up to date");
    Some(RuleSuccess {
      success_type,
      rule_key: key,
      output_dir: output_dir.to_path_buf(),
      artifacts: record.artifact_paths().collect(),
    })
  }

  /// Look the rule up in the artifact cache: by key first, then through the
  /// dependency-file manifest. Cache errors are logged and treated as misses.
  async fn fetch_from_cache(&self, rule: &Arc<Rule>, key: RuleKey, output_dir: &Path) -> Option<Fetched> {
    let target = rule.target();

    if let Some((artifacts, metadata)) = self.fetch_artifact(rule, key, output_dir).await {
      let dep_file = match (metadata.get(METADATA_DEP_FILE_KEY), metadata.get(METADATA_USED_INPUTS)) {
        (Some(dep_key), Some(used)) => match (dep_key.parse::<RuleKey>(), serde_json::from_str(used)) {
          (Ok(dep_file_key), Ok(inputs)) => Some(RuleKeyAndInputs {
            key: dep_file_key,
            inputs,
          }),
          _ => None,
        },
        _ => None,
      };
      return Some(Fetched {
        success_type: SuccessType::FetchedFromCache,
        artifacts,
        dep_file,
        metadata,
      });
    }

    if !rule.supports_dep_file_keys() {
      return None;
    }

    let manifest_key = match self.compute_manifest_key(rule).await {
      Ok(manifest_key) => manifest_key,
      Err(e) => {
        warn!(rule = %target, error = %e, "cannot compute manifest key");
        return None;
      }
    };
    let manifest = self.fetch_manifest(manifest_key.key).await?;

    let file_hashes = self.delegate.file_hash_cache();
    let entry = manifest.lookup(|path| file_hashes.get(path).ok())?.clone();
    debug!(rule = %target, dep_file_key = %entry.dep_file_key, "manifest names a matching artifact");

    let (artifacts, metadata) = self.fetch_artifact(rule, entry.dep_file_key, output_dir).await?;
    Some(Fetched {
      success_type: SuccessType::FetchedFromCacheManifestBased,
      artifacts,
      dep_file: Some(RuleKeyAndInputs {
        key: entry.dep_file_key,
        inputs: entry.inputs.keys().map(PathBuf::from).collect(),
      }),
      metadata,
    })
  }

  /// Fetch and unpack the artifact stored under `key` into `output_dir`.
  ///
  /// An artifact that lacks one of the rule's declared outputs is a miss.
  async fn fetch_artifact(
    &self,
    rule: &Arc<Rule>,
    key: RuleKey,
    output_dir: &Path,
  ) -> Option<(BTreeSet<PathBuf>, BTreeMap<String, String>)> {
    let target = rule.target();
    let blob = self.scratch_path("artifact");
    let metadata = match self.cache.fetch(&key, &blob).await {
      CacheResult::Hit { source, metadata } => {
        debug!(rule = %target, key = %key, cache = %source, "cache hit");
        metadata
      }
      CacheResult::Miss => return None,
      CacheResult::Error { source, message } => {
        warn!(rule = %target, key = %key, cache = %source, error = %message, "cache lookup failed");
        self.session.stats().record_error();
        return None;
      }
    };

    let task_blob = blob.clone();
    let task_dir = output_dir.to_path_buf();
    let unpacked = blocking(target, move || {
      clean_dir(&task_dir)?;
      archive::unpack(&task_blob, &task_dir)
    })
    .await;
    let _ = tokio::fs::remove_file(&blob).await;

    let roots = match unpacked {
      Ok(roots) => roots,
      Err(e) => {
        warn!(rule = %target, key = %key, error = %e, "failed to unpack cached artifact");
        return None;
      }
    };

    if let Some(missing) = rule.outputs().iter().find(|o| !output_dir.join(o).exists()) {
      warn!(rule = %target, key = %key, output = %missing.display(), "cached artifact lacks a declared output");
      return None;
    }

    Some((roots.into_iter().collect(), metadata))
  }

  async fn fetch_manifest(&self, manifest_key: RuleKey) -> Option<Manifest> {
    let path = self.scratch_path("manifest");
    let manifest = match self.cache.fetch(&manifest_key, &path).await {
      CacheResult::Hit { .. } => match tokio::fs::read(&path).await {
        Ok(bytes) => Manifest::from_json(&bytes)
          .inspect_err(|e| warn!(key = %manifest_key, error = %e, "ignoring unreadable manifest"))
          .ok(),
        Err(_) => None,
      },
      CacheResult::Miss => None,
      CacheResult::Error { source, message } => {
        warn!(key = %manifest_key, cache = %source, error = %message, "manifest lookup failed");
        self.session.stats().record_error();
        None
      }
    };
    let _ = tokio::fs::remove_file(&path).await;
    manifest
  }

  /// Run the rule's action and record what it produced.
  async fn execute(
    self: &Arc<Self>,
    rule: &Arc<Rule>,
    key: RuleKey,
    dep_dirs: &BTreeMap<BuildTarget, PathBuf>,
    stack: &DependencyStack,
    output_dir: &Path,
  ) -> Result<RuleSuccess, BuildError> {
    let target = rule.target();
    self.delegate.on_rule_about_to_be_built(rule);
    info!(rule = %target, key = %key, rule_type = %rule.rule_type(), "building rule");

    let task_dir = output_dir.to_path_buf();
    blocking(target, move || clean_dir(&task_dir))
      .await
      .map_err(|e| BuildError::io(target, "failed to clean output dir", e))?;

    let started = Instant::now();
    let mut context = BuildableContext::new();
    let shell = self.session.config().build.shell.as_deref();
    let execution_error = |source| BuildError::Execution {
      target: target.clone(),
      stack: stack.clone(),
      source,
    };

    let result = match self.pipelines.lane(target) {
      Some(lane) => {
        let mut guard = lane.acquire(target).await?;
        let pipeline_state = guard.state().map_err(execution_error)?;
        let mut ctx = ActionContext {
          target,
          project_root: self.session.project_root(),
          output_dir,
          dep_output_dirs: dep_dirs,
          shell,
          buildable_context: &mut context,
          pipeline_state,
        };
        rule.buildable().build(&mut ctx).await
      }
      None => {
        let mut ctx = ActionContext {
          target,
          project_root: self.session.project_root(),
          output_dir,
          dep_output_dirs: dep_dirs,
          shell,
          buildable_context: &mut context,
          pipeline_state: None,
        };
        rule.buildable().build(&mut ctx).await
      }
    };
    self.executed.lock().await.push(target.clone());
    result.map_err(execution_error)?;

    for output in rule.outputs() {
      if !output_dir.join(output).exists() {
        return Err(BuildError::MissingOutput {
          target: target.clone(),
          path: output.clone(),
        });
      }
      context.record_artifact(output);
    }
    let artifacts = context.artifacts().clone();

    let mut dep_file = None;
    let mut manifest_key = None;
    if rule.supports_dep_file_keys() {
      match context.used_inputs() {
        Some(used) => {
          dep_file = Some(self.compute_dep_file_key(rule, used).await?);
          manifest_key = Some(self.compute_manifest_key(rule).await?.key);
        }
        None => warn!(rule = %target, "rule did not report the inputs it used"),
      }
    }

    let metadata = context.metadata().clone();
    self
      .save_build_info(rule, key, output_dir, &artifacts, dep_file.clone(), metadata.clone(), SuccessType::Built, started)
      .await?;

    self
      .schedule_upload(Upload {
        target: target.clone(),
        key,
        dep_file,
        manifest_key,
        output_dir: output_dir.to_path_buf(),
        artifacts: artifacts.clone(),
        metadata,
      })
      .await;

    Ok(RuleSuccess {
      success_type: SuccessType::Built,
      rule_key: key,
      output_dir: output_dir.to_path_buf(),
      artifacts,
    })
  }

  /// Copy the outputs of a rule with the same key.
  async fn copy_from_leader(&self, rule: &Arc<Rule>, key: RuleKey, leader: &RuleSuccess) -> Result<RuleSuccess, BuildError> {
    let target = rule.target();
    let output_dir = self.session.output_dir_for(target);

    let from = leader.output_dir.clone();
    let to = output_dir.clone();
    let artifacts = leader.artifacts.clone();
    blocking(target, move || {
      clean_dir(&to)?;
      for artifact in &artifacts {
        copy_tree(&from.join(artifact), &to.join(artifact))?;
      }
      Ok(())
    })
    .await
    .map_err(|e| BuildError::io(target, "failed to copy deduplicated outputs", e))?;

    for output in rule.outputs() {
      if !output_dir.join(output).exists() {
        return Err(BuildError::MissingOutput {
          target: target.clone(),
          path: output.clone(),
        });
      }
    }

    self
      .save_build_info(
        rule,
        key,
        &output_dir,
        &leader.artifacts,
        None,
        BTreeMap::new(),
        SuccessType::Deduplicated,
        Instant::now(),
      )
      .await?;

    Ok(RuleSuccess {
      success_type: SuccessType::Deduplicated,
      rule_key: key,
      output_dir,
      artifacts: leader.artifacts.clone(),
    })
  }

  #[allow(clippy::too_many_arguments)]
  async fn save_build_info(
    &self,
    rule: &Arc<Rule>,
    key: RuleKey,
    output_dir: &Path,
    artifacts: &BTreeSet<PathBuf>,
    dep_file: Option<RuleKeyAndInputs>,
    metadata: BTreeMap<String, String>,
    origin: SuccessType,
    started: Instant,
  ) -> Result<(), BuildError> {
    let target = rule.target();

    let task_dir = output_dir.to_path_buf();
    let task_artifacts = artifacts.clone();
    let outputs = blocking(target, move || {
      hash_outputs(&task_dir, &task_artifacts).map_err(|e| io::Error::other(e.to_string()))
    })
    .await
    .map_err(|e| BuildError::io(target, "failed to hash outputs", e))?;

    let (dep_file_key, used_inputs) = match dep_file {
      Some(dep_file) => (Some(dep_file.key), Some(dep_file.inputs)),
      None => (None, None),
    };

    let record = BuildInfoRecord {
      version: BUILD_INFO_VERSION,
      target: target.clone(),
      rule_key: key,
      dep_file_key,
      used_inputs,
      outputs,
      metadata,
      origin,
      duration_ms: started.elapsed().as_millis() as u64,
    };
    self.info.save(&record).map_err(|source| BuildError::BuildInfo {
      target: target.clone(),
      source,
    })
  }

  async fn schedule_upload(self: &Arc<Self>, upload: Upload) {
    if !self.uploader.is_enabled() {
      return;
    }
    let run = self.clone();
    self.uploads.lock().await.spawn(async move {
      let target = upload.target.clone();
      let key = upload.key;
      if let Err(e) = run.upload(upload).await {
        warn!(rule = %target, key = %key, error = %e, "failed to upload artifact");
      }
    });
  }

  async fn upload(&self, upload: Upload) -> Result<(), CacheError> {
    let blob = self.scratch_path("upload");
    let task_blob = blob.clone();
    let task_dir = upload.output_dir.clone();
    let artifacts = upload.artifacts.clone();
    tokio::task::spawn_blocking(move || archive::pack(&task_dir, &artifacts, &task_blob))
      .await
      .map_err(|e| CacheError::io("upload", io::Error::other(e.to_string())))?
      .map_err(|e| CacheError::io("upload", e))?;

    let mut info = ArtifactInfo::new(upload.key)
      .with_metadata(METADATA_TARGET, upload.target.to_string())
      .with_metadata(METADATA_BUILD_ID, self.session.build_id());
    for (name, value) in &upload.metadata {
      info = info.with_metadata(name.clone(), value.clone());
    }
    if let Some(dep_file) = &upload.dep_file {
      let used = serde_json::to_string(&dep_file.inputs).map_err(|e| CacheError::Metadata(e.to_string()))?;
      info = info
        .with_key(dep_file.key)
        .with_metadata(METADATA_DEP_FILE_KEY, dep_file.key.to_hex())
        .with_metadata(METADATA_USED_INPUTS, used);
    }

    let result = self.uploader.upload(&info, &blob).await;
    let _ = tokio::fs::remove_file(&blob).await;
    result?;
    debug!(rule = %upload.target, key = %upload.key, "uploaded artifact");

    if let (Some(dep_file), Some(manifest_key)) = (&upload.dep_file, upload.manifest_key) {
      self.update_manifest(&upload.target, manifest_key, dep_file).await?;
    }
    Ok(())
  }

  async fn update_manifest(
    &self,
    target: &BuildTarget,
    manifest_key: RuleKey,
    dep_file: &RuleKeyAndInputs,
  ) -> Result<(), CacheError> {
    let file_hashes = self.delegate.file_hash_cache();
    let mut inputs = BTreeMap::new();
    for path in &dep_file.inputs {
      let hash = file_hashes
        .get(path)
        .map_err(|e| CacheError::Metadata(e.to_string()))?;
      inputs.insert(path.to_string_lossy().replace('\\', "/"), hash);
    }

    let mut manifest = self.fetch_manifest(manifest_key).await.unwrap_or_default();
    manifest.add(
      ManifestEntry {
        dep_file_key: dep_file.key,
        inputs,
      },
      self.session.config().cache.manifest_max_entries,
    );

    let path = self.scratch_path("manifest-upload");
    let bytes = manifest.to_json().map_err(|e| CacheError::Metadata(e.to_string()))?;
    tokio::fs::write(&path, bytes)
      .await
      .map_err(|e| CacheError::io("upload", e))?;

    let info = ArtifactInfo::new(manifest_key).with_metadata(METADATA_TARGET, target.to_string());
    let result = self.uploader.upload(&info, &path).await;
    let _ = tokio::fs::remove_file(&path).await;
    result?;
    debug!(rule = %target, key = %manifest_key, entries = manifest.entries.len(), "updated manifest");
    Ok(())
  }

  async fn finish_uploads(&self) {
    let mut uploads = std::mem::take(&mut *self.uploads.lock().await);
    while let Some(result) = uploads.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "upload task failed");
      }
    }
  }

  /// Unique path in the build's scratch directory.
  fn scratch_path(&self, tag: &str) -> PathBuf {
    let n = self.scratch.fetch_add(1, Ordering::Relaxed);
    self.session.tmp_dir().join(format!("{}-{}", n, tag))
  }
}

struct Upload {
  target: BuildTarget,
  key: RuleKey,
  dep_file: Option<RuleKeyAndInputs>,
  manifest_key: Option<RuleKey>,
  output_dir: PathBuf,
  artifacts: BTreeSet<PathBuf>,
  metadata: BTreeMap<String, String>,
}

/// Run blocking filesystem or hashing work off the async workers.
async fn blocking<T, E, F>(target: &BuildTarget, f: F) -> Result<T, E>
where
  F: FnOnce() -> Result<T, E> + Send + 'static,
  T: Send + 'static,
  E: Send + 'static + From<PanickedTask>,
{
  match tokio::task::spawn_blocking(f).await {
    Ok(result) => result,
    Err(e) => Err(E::from(PanickedTask {
      target: target.clone(),
      message: e.to_string(),
    })),
  }
}

struct PanickedTask {
  target: BuildTarget,
  message: String,
}

impl From<PanickedTask> for BuildError {
  fn from(p: PanickedTask) -> Self {
    BuildError::Panicked {
      target: p.target,
      message: p.message,
    }
  }
}

impl From<PanickedTask> for io::Error {
  fn from(p: PanickedTask) -> Self {
    io::Error::other(format!("{}: {}", p.target, p.message))
  }
}

/// Remove and recreate `dir`.
fn clean_dir(dir: &Path) -> io::Result<()> {
  match std::fs::remove_dir_all(dir) {
    Ok(()) => {}
    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
    Err(e) => return Err(e),
  }
  std::fs::create_dir_all(dir)
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
  let metadata = std::fs::symlink_metadata(from)?;
  if !metadata.is_dir() {
    if let Some(parent) = to.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(from, to)?;
    return Ok(());
  }

  for entry in WalkDir::new(from) {
    let entry = entry.map_err(|e| io::Error::other(e.to_string()))?;
    let rel = entry
      .path()
      .strip_prefix(from)
      .map_err(|e| io::Error::other(e.to_string()))?;
    let dest = to.join(rel);
    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&dest)?;
    } else {
      std::fs::copy(entry.path(), &dest)?;
    }
  }
  Ok(())
}
