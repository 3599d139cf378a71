use predicates::prelude::*;

use super::common::TestEnv;

const GRAPH: &str = r#"
{
  "rules": [
    { "target": "//lib:base", "type": "write_file", "out": "base.txt", "content": "base" },
    { "target": "//app:hello", "type": "write_file", "deps": ["//lib:base"], "out": "hello.txt", "content": "hi" }
  ]
}
"#;

#[test]
fn rulekey_lists_fields_and_dependencies() {
  let env = TestEnv::with_graph(GRAPH);

  env
    .kiln_cmd()
    .args(["rulekey", "//app:hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("content = \"hi\""))
    .stdout(predicate::str::contains("//lib:base"))
    .stdout(predicate::str::contains("Not built yet"));
}

#[test]
fn rulekey_matches_the_built_key() {
  let env = TestEnv::with_graph(GRAPH);
  let assert = env
    .kiln_cmd()
    .args(["build", "//app:hello", "--output", "json"])
    .assert()
    .success();
  let report: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();

  let assert = env
    .kiln_cmd()
    .args(["rulekey", "//app:hello", "--output", "json"])
    .assert()
    .success();
  let key: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();

  assert_eq!(key["rule_type"], "write_file");
  assert_eq!(key["rule_key"], report["results"][0]["rule_key"]);
  assert_eq!(key["last_built"], key["rule_key"]);
  assert_eq!(key["deps"][0]["target"], "//lib:base");
}

#[test]
fn rulekey_of_unknown_target_fails() {
  let env = TestEnv::with_graph(GRAPH);
  env
    .kiln_cmd()
    .args(["rulekey", "//app:nope"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to resolve target"));
}

#[test]
fn targets_are_listed_sorted() {
  let env = TestEnv::with_graph(GRAPH);
  env
    .kiln_cmd()
    .arg("targets")
    .assert()
    .success()
    .stdout(predicate::str::is_match(r"(?s)//app:hello \(write_file\).*//lib:base \(write_file\)").unwrap());
}
