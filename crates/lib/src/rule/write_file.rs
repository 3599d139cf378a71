//! Rule that writes literal content to a file.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{ActionContext, ActionError, Buildable};
use crate::rulekey::RuleKeyFields;

#[derive(Debug, Clone)]
pub struct WriteFileRule {
  out: PathBuf,
  content: String,
  executable: bool,
}

impl WriteFileRule {
  pub fn new(out: impl Into<PathBuf>, content: impl Into<String>) -> Self {
    Self {
      out: out.into(),
      content: content.into(),
      executable: false,
    }
  }

  pub fn executable(mut self, executable: bool) -> Self {
    self.executable = executable;
    self
  }
}

#[async_trait]
impl Buildable for WriteFileRule {
  fn rule_type(&self) -> &str {
    "write_file"
  }

  fn append_to_rule_key(&self, fields: &mut RuleKeyFields) {
    fields
      .set("out", self.out.to_string_lossy().into_owned())
      .set("content", &self.content)
      .set("executable", self.executable);
  }

  async fn build(&self, ctx: &mut ActionContext<'_>) -> Result<(), ActionError> {
    let path = ctx.output_dir.join(&self.out);
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &self.content).await?;

    #[cfg(unix)]
    if self.executable {
      use std::os::unix::fs::PermissionsExt;
      tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    ctx.buildable_context.record_artifact(&self.out);
    Ok(())
  }
}
