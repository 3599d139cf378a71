//! Shell command rules.
//!
//! Commands run in an isolated environment so that only declared inputs can
//! influence them:
//! - All environment variables are cleared
//! - PATH is set to /path-not-set (to fail fast on undeclared tools)
//! - HOME is set to /homeless-shelter
//! - TMPDIR/TMP/TEMP/TEMPDIR point to a temp directory within the output dir
//! - `out` is the rule's output directory
//! - `SRCS` and `DEPS` list the rule's sources and dependency output dirs
//!
//! Declared `env` entries are applied last, so a rule may set its own PATH.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ActionContext, ActionError, Buildable, RulePipelineState};
use crate::rulekey::{KeyValue, RuleKeyFields};

/// Runs `cmd` with `/bin/sh -c` (PowerShell on Windows).
#[derive(Debug, Clone, Default)]
pub struct CmdRule {
  cmd: String,
  srcs: BTreeSet<PathBuf>,
  env: BTreeMap<String, String>,
  dep_file: Option<PathBuf>,
}

impl CmdRule {
  pub fn new(cmd: impl Into<String>) -> Self {
    Self {
      cmd: cmd.into(),
      ..Default::default()
    }
  }

  /// Project-relative source files the command reads.
  pub fn with_srcs<I, P>(mut self, srcs: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
  {
    self.srcs.extend(srcs.into_iter().map(Into::into));
    self
  }

  pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  /// File, relative to the output dir, in which the command lists the
  /// sources it actually read, one per line. Sources become coverable.
  pub fn with_dep_file(mut self, path: impl Into<PathBuf>) -> Self {
    self.dep_file = Some(path.into());
    self
  }

  pub fn cmd(&self) -> &str {
    &self.cmd
  }

  pub fn srcs(&self) -> &BTreeSet<PathBuf> {
    &self.srcs
  }

  async fn read_dep_file(&self, path: &Path) -> Result<BTreeSet<PathBuf>, ActionError> {
    let content = tokio::fs::read_to_string(path)
      .await
      .map_err(|e| ActionError::Failed(format!("failed to read dep file {}: {}", path.display(), e)))?;
    Ok(
      content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect(),
    )
  }
}

#[async_trait]
impl Buildable for CmdRule {
  fn rule_type(&self) -> &str {
    "cmd"
  }

  fn append_to_rule_key(&self, fields: &mut RuleKeyFields) {
    let srcs = self.srcs.iter().map(|p| match self.dep_file {
      Some(_) => KeyValue::coverable_file(p),
      None => KeyValue::file(p),
    });
    fields
      .set("cmd", &self.cmd)
      .set("srcs", KeyValue::set(srcs))
      .set("env", KeyValue::map(self.env.iter().map(|(k, v)| (k.clone(), v.clone()))))
      .set("dep_file", self.dep_file.as_ref().map(|p| p.to_string_lossy().into_owned()));
  }

  async fn build(&self, ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
    let mut env = BTreeMap::new();
    env.insert("SRCS".to_string(), join_paths(self.srcs.iter()));
    env.insert("DEPS".to_string(), join_paths(ctx.dep_output_dirs.values()));
    if let Some(state) = ctx.pipeline_state::<CmdPipelineState>()
      && let Some(dir) = state.path()
    {
      env.insert("PIPELINE_DIR".to_string(), dir.to_string_lossy().into_owned());
    }
    env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    execute_cmd(&self.cmd, &env, ctx.project_root, ctx.output_dir, ctx.shell).await?;

    if let Some(dep_file) = &self.dep_file {
      let used = self.read_dep_file(&ctx.output_dir.join(dep_file)).await?;
      ctx.buildable_context.record_used_inputs(used);
    }

    Ok(())
  }

  fn create_pipeline_state(&self) -> Result<Option<Box<dyn RulePipelineState>>, ActionError> {
    Ok(Some(Box::new(CmdPipelineState::new()?)))
  }
}

/// Scratch directory shared by the commands of a pipelined chain.
#[derive(Debug)]
pub struct CmdPipelineState {
  dir: Option<TempDir>,
}

impl CmdPipelineState {
  pub fn new() -> Result<Self, ActionError> {
    Ok(Self {
      dir: Some(TempDir::new()?),
    })
  }

  pub fn path(&self) -> Option<&Path> {
    self.dir.as_ref().map(TempDir::path)
  }
}

impl RulePipelineState for CmdPipelineState {
  fn as_any_mut(&mut self) -> &mut dyn Any {
    self
  }

  fn close(&mut self) {
    if let Some(dir) = self.dir.take() {
      debug!(path = ?dir.path(), "removing pipeline scratch directory");
      let _ = dir.close();
    }
  }
}

fn join_paths<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> String {
  paths.map(|p| p.to_string_lossy().into_owned()).collect::<Vec<_>>().join(" ")
}

/// Variables every command starts from. Declared env entries are applied
/// on top and may override these.
const SANDBOX_ENV: &[(&str, &str)] = &[
  ("PATH", "/path-not-set"),
  ("HOME", "/homeless-shelter"),
  ("LANG", "C"),
  ("LC_ALL", "C"),
  // 1980-01-01T00:00:00Z
  ("SOURCE_DATE_EPOCH", "315532800"),
];

const TMP_VARS: &[&str] = &["TMPDIR", "TMP", "TEMP", "TEMPDIR"];

/// Interpreter a command string is handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Shell {
  program: String,
  flags: &'static [&'static str],
}

impl Shell {
  /// `/bin/sh -c` on unix, PowerShell elsewhere. Never `$SHELL`, whose
  /// profile files would leak into the build.
  fn platform_default() -> Self {
    if cfg!(windows) {
      Shell {
        program: "powershell.exe".to_string(),
        flags: &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command"],
      }
    } else {
      Shell {
        program: "/bin/sh".to_string(),
        flags: &["-c"],
      }
    }
  }

  fn named(program: &str) -> Self {
    let flags: &'static [&'static str] = if program.contains("powershell") || program.contains("pwsh") {
      &["-NoProfile", "-Command"]
    } else if program.ends_with("cmd") || program.ends_with("cmd.exe") {
      &["/C"]
    } else {
      &["-c"]
    };
    Shell {
      program: program.to_string(),
      flags,
    }
  }

  fn resolve(configured: Option<&str>) -> Self {
    configured.map_or_else(Self::platform_default, Self::named)
  }
}

/// Run `cmd` with a cleared environment from `cwd`.
///
/// `$out` points at `out_dir` and the temp variables at a scratch directory
/// inside it, which is removed again before returning. Returns the trimmed
/// stdout.
pub async fn execute_cmd(
  cmd: &str,
  env: &BTreeMap<String, String>,
  cwd: &Path,
  out_dir: &Path,
  shell: Option<&str>,
) -> Result<String, ActionError> {
  let shell = Shell::resolve(shell);
  let scratch = out_dir.join("tmp");
  tokio::fs::create_dir_all(&scratch).await?;

  let mut command = Command::new(&shell.program);
  command.args(shell.flags).arg(cmd).current_dir(cwd).env_clear();
  command.envs(SANDBOX_ENV.iter().copied());
  for var in TMP_VARS {
    command.env(var, &scratch);
  }
  command.env("out", out_dir);
  command.envs(env);

  debug!(shell = %shell.program, cwd = %cwd.display(), cmd = %cmd, "running command");
  let output = command.output().await;

  if let Err(e) = tokio::fs::remove_dir_all(&scratch).await
    && e.kind() != std::io::ErrorKind::NotFound
  {
    warn!(path = %scratch.display(), error = %e, "failed to remove scratch directory");
  }
  let output = output?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!(cmd = %cmd, code = ?output.status.code(), stderr = %stderr.trim_end(), "command failed");
    return Err(ActionError::CmdFailed {
      cmd: cmd.to_string(),
      code: output.status.code(),
    });
  }

  let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command output");
  }
  Ok(stdout)
}
