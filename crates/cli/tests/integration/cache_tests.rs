use predicates::prelude::*;

use super::common::TestEnv;

const HELLO_GRAPH: &str =
  r#"{ "rules": [ { "target": "//app:hello", "type": "write_file", "out": "hello.txt", "content": "hi" } ] }"#;

#[test]
fn build_fills_dir_cache() {
  let env = TestEnv::with_graph(HELLO_GRAPH);
  env.kiln_cmd().args(["build", "//app:hello"]).assert().success();

  env
    .kiln_cmd()
    .args(["cache", "stats"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Entries: 1"));
}

#[test]
fn no_cache_leaves_cache_empty() {
  let env = TestEnv::with_graph(HELLO_GRAPH);
  env
    .kiln_cmd()
    .args(["build", "//app:hello", "--no-cache"])
    .assert()
    .success();

  env
    .kiln_cmd()
    .args(["cache", "stats", "--output", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"entries\": 0"));
}

#[test]
fn lost_outputs_come_back_from_cache() {
  let env = TestEnv::with_graph(HELLO_GRAPH);
  env.kiln_cmd().args(["build", "//app:hello"]).assert().success();
  std::fs::remove_dir_all(env.root().join("kiln-out/gen")).unwrap();
  std::fs::remove_dir_all(env.root().join("kiln-out/info")).unwrap();

  env
    .kiln_cmd()
    .args(["build", "//app:hello"])
    .assert()
    .success()
    .stdout(predicate::str::contains("fetched from cache"))
    .stdout(predicate::str::contains("Executed: 0"));

  let hello = env.output_dir("app", "hello").join("hello.txt");
  assert_eq!(std::fs::read_to_string(hello).unwrap(), "hi");
}

#[test]
fn clean_empties_the_cache() {
  let env = TestEnv::with_graph(HELLO_GRAPH);
  env.kiln_cmd().args(["build", "//app:hello"]).assert().success();

  env
    .kiln_cmd()
    .args(["cache", "clean"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Entries removed: 1"));

  env
    .kiln_cmd()
    .args(["cache", "stats"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Entries: 0"));
}
