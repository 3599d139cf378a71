//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// A write_file rule feeding a cmd rule that upper-cases its output.
pub const CHAIN_GRAPH: &str = r#"
{
  "rules": [
    { "target": "//gen:greeting", "type": "write_file", "out": "greeting.txt", "content": "hello" },
    {
      "target": "//app:shout",
      "type": "cmd",
      "deps": ["//gen:greeting"],
      "srcs": ["suffix.txt"],
      "outputs": ["shout.txt"],
      "cmd": "cat $DEPS/greeting.txt suffix.txt | tr a-z A-Z > $out/shout.txt",
      "env": { "PATH": "/usr/bin:/bin" }
    }
  ]
}
"#;

/// A rule that always fails, and one that depends on it.
pub const FAILING_GRAPH: &str = r#"
{
  "rules": [
    { "target": "//lib:broken", "type": "cmd", "cmd": "exit 3" },
    { "target": "//app:main", "type": "write_file", "deps": ["//lib:broken"], "out": "main.txt", "content": "x" }
  ]
}
"#;

/// Isolated project directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn with_graph(graph: &str) -> Self {
    let env = Self {
      temp: TempDir::new().unwrap(),
    };
    env.write_file("kiln-graph.json", graph);
    env.write_file("suffix.txt", "!");
    env
  }

  /// Write a file relative to the project root.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn root(&self) -> PathBuf {
    let p = self.temp.path().to_path_buf();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Output directory of a target in the default output tree.
  pub fn output_dir(&self, base_path: &str, name: &str) -> PathBuf {
    self.root().join("kiln-out/gen/root").join(base_path).join(name)
  }

  /// A Command for the kiln binary, run from the project root.
  ///
  /// Clears `KILN_OUT` and `KILN_THREADS` so the host environment cannot leak in.
  pub fn kiln_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("kiln");
    cmd.current_dir(self.root());
    cmd.env_remove("KILN_OUT");
    cmd.env_remove("KILN_THREADS");
    cmd.env_remove("RUST_LOG");
    cmd
  }
}
