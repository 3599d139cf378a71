use predicates::prelude::*;

use super::common::{CHAIN_GRAPH, FAILING_GRAPH, TestEnv};

#[cfg(unix)]
#[test]
fn build_runs_command_chain() {
  let env = TestEnv::with_graph(CHAIN_GRAPH);

  env
    .kiln_cmd()
    .args(["build", "//app:shout"])
    .assert()
    .success()
    .stdout(predicate::str::contains("//app:shout built"))
    .stdout(predicate::str::contains("Executed: 2"));

  let shout = std::fs::read_to_string(env.output_dir("app", "shout").join("shout.txt")).unwrap();
  assert_eq!(shout, "HELLO!");
}

#[cfg(unix)]
#[test]
fn second_build_is_up_to_date() {
  let env = TestEnv::with_graph(CHAIN_GRAPH);
  env.kiln_cmd().args(["build", "//app:shout"]).assert().success();

  env
    .kiln_cmd()
    .args(["build", "//app:shout"])
    .assert()
    .success()
    .stdout(predicate::str::contains("up to date"))
    .stdout(predicate::str::contains("Executed: 0"));
}

#[cfg(unix)]
#[test]
fn source_edit_triggers_rebuild() {
  let env = TestEnv::with_graph(CHAIN_GRAPH);
  env.kiln_cmd().args(["build", "//app:shout"]).assert().success();
  env.write_file("suffix.txt", "?");

  env
    .kiln_cmd()
    .args(["build", "//app:shout"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Executed: 1"));

  let shout = std::fs::read_to_string(env.output_dir("app", "shout").join("shout.txt")).unwrap();
  assert_eq!(shout, "HELLO?");
}

#[cfg(unix)]
#[test]
fn failing_rule_exits_with_one_and_names_root_cause() {
  let env = TestEnv::with_graph(FAILING_GRAPH);

  env
    .kiln_cmd()
    .args(["build", "//app:main"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("//app:main failed"))
    .stderr(predicate::str::contains("//lib:broken failed: command failed with exit code Some(3)"))
    .stderr(predicate::str::contains("//app:main → //lib:broken"));
}

#[cfg(unix)]
#[test]
fn json_output_and_build_report() {
  let env = TestEnv::with_graph(CHAIN_GRAPH);
  let report_path = env.root().join("report.json");

  let assert = env
    .kiln_cmd()
    .args(["build", "//app:shout", "--output", "json", "--build-report"])
    .arg(&report_path)
    .assert()
    .success();

  let stdout: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
  assert_eq!(stdout["success"], true);
  assert_eq!(stdout["results"][0]["target"], "//app:shout");
  assert_eq!(stdout["results"][0]["success_type"], "built");
  assert_eq!(stdout["stats"]["miss_count"], 2);

  let report: serde_json::Value = serde_json::from_slice(&std::fs::read(&report_path).unwrap()).unwrap();
  assert_eq!(report["build_id"], stdout["build_id"]);
}

#[test]
fn unknown_target_fails_with_dependency_path() {
  let env = TestEnv::with_graph(
    r#"{ "rules": [ { "target": "//app:main", "type": "write_file", "deps": ["//lib:gone"], "out": "m", "content": "" } ] }"#,
  );

  env
    .kiln_cmd()
    .args(["build", "//app:main"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("no rule for //lib:gone"));
}

#[test]
fn out_dir_override_is_respected() {
  let env = TestEnv::with_graph(
    r#"{ "rules": [ { "target": "//app:hello", "type": "write_file", "out": "hello.txt", "content": "hi" } ] }"#,
  );

  env
    .kiln_cmd()
    .args(["-c", "paths.out=elsewhere", "build", "//app:hello"])
    .assert()
    .success();

  let hello = env.root().join("elsewhere/gen/root/app/hello/hello.txt");
  assert_eq!(std::fs::read_to_string(hello).unwrap(), "hi");
}
