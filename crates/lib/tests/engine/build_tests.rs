use kiln_lib::engine::{BuildStatus, SuccessType};
use kiln_lib::graph::ActionGraph;
use kiln_lib::target::BuildTarget;

use crate::common::*;

/// `a -> b -> c`, where `c` reads `src/input.txt`.
fn chain(recorder: &Recorder) -> ActionGraph {
  let mut graph = ActionGraph::new();
  graph.add(rule("c", step(recorder, "c", "leaf").reading("src/input.txt")));
  graph.add(rule("b", step(recorder, "b", "middle")).with_deps([target("c")]));
  graph.add(rule("a", step(recorder, "a", "top")).with_deps([target("b")]));
  graph
}

#[tokio::test]
async fn first_build_runs_dependencies_first() {
  let project = TestProject::new();
  project.write_file("src/input.txt", "v1");
  let recorder = Recorder::default();

  let report = project.build(&chain(&recorder), &[target("a")]).await;

  assert!(report.success);
  assert_eq!(report.exit_code(), 0);
  assert_eq!(recorder.runs(), vec!["c", "b", "a"]);
  assert_eq!(report.executed, vec![target("c"), target("b"), target("a")]);
  assert_eq!(report.stats.miss_count, 3);
  assert_eq!(report.stats.hit_count, 0);

  let result = report.result_for(&target("a")).unwrap();
  assert_eq!(result.status, BuildStatus::Success);
  assert_eq!(result.success_type, Some(SuccessType::Built));
  assert!(result.rule_key.is_some());
  assert_eq!(project.output("a"), "top|middle|leaf|v1");
}

#[tokio::test]
async fn unchanged_rebuild_runs_nothing() {
  let project = TestProject::new();
  project.write_file("src/input.txt", "v1");
  let recorder = Recorder::default();
  let graph = chain(&recorder);

  let first = project.build(&graph, &[target("a")]).await;
  let second = project.build(&graph, &[target("a")]).await;

  assert!(second.success);
  assert!(second.executed.is_empty());
  assert_eq!(recorder.runs().len(), 3);
  assert_eq!(second.stats.hit_count, 3);
  assert_eq!(second.stats.miss_count, 0);

  let result = second.result_for(&target("a")).unwrap();
  assert_eq!(result.success_type, Some(SuccessType::MatchingRuleKey));
  assert_eq!(result.rule_key, first.result_for(&target("a")).unwrap().rule_key);
}

#[tokio::test]
async fn source_change_rebuilds_every_dependent() {
  let project = TestProject::new();
  project.write_file("src/input.txt", "v1");
  let recorder = Recorder::default();
  let graph = chain(&recorder);

  let first = project.build(&graph, &[target("a")]).await;
  project.write_file("src/input.txt", "v2");
  let second = project.build(&graph, &[target("a")]).await;

  assert!(second.success);
  assert_eq!(second.executed, vec![target("c"), target("b"), target("a")]);
  assert_eq!(second.stats.miss_match_count, 3);
  assert_ne!(
    first.result_for(&target("a")).unwrap().rule_key,
    second.result_for(&target("a")).unwrap().rule_key
  );
  assert_eq!(project.output("a"), "top|middle|leaf|v2");
}

#[tokio::test]
async fn change_in_one_branch_leaves_the_other_alone() {
  let project = TestProject::new();
  project.write_file("left.txt", "l1");
  project.write_file("right.txt", "r1");
  let recorder = Recorder::default();

  let mut graph = ActionGraph::new();
  graph.add(rule("left", step(&recorder, "left", "L").reading("left.txt")));
  graph.add(rule("right", step(&recorder, "right", "R").reading("right.txt")));
  graph.add(rule("top", step(&recorder, "top", "T")).with_deps([target("left"), target("right")]));

  project.build(&graph, &[target("top")]).await;
  project.write_file("right.txt", "r2");
  let report = project.build(&graph, &[target("top")]).await;

  assert_eq!(report.executed, vec![target("right"), target("top")]);
  assert_eq!(
    report.result_for(&target("top")).unwrap().success_type,
    Some(SuccessType::Built)
  );
  assert_eq!(project.output("top"), "T|L|l1|R|r2");
}

#[tokio::test]
async fn duplicate_requests_build_once() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("a", step(&recorder, "a", "A")));
  graph.add(rule("b", step(&recorder, "b", "B")).with_deps([target("a")]));

  let report = project
    .build(&graph, &[target("a"), target("b"), target("a")])
    .await;

  assert!(report.success);
  assert_eq!(report.results.len(), 2);
  assert_eq!(recorder.count("a"), 1);
  assert_eq!(recorder.count("b"), 1);
}

#[tokio::test]
async fn shared_dependency_runs_once() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("base", step(&recorder, "base", "base").slow(20)));

  let mut roots = Vec::new();
  for i in 0..8 {
    let name = format!("user{}", i);
    graph.add(rule(&name, step(&recorder, &name, &name)).with_deps([target("base")]));
    roots.push(target(&name));
  }

  let report = project.build(&graph, &roots).await;

  assert!(report.success);
  assert_eq!(recorder.count("base"), 1);
  assert_eq!(report.executed.len(), 9);
  assert_eq!(project.output("user3"), "user3|base");
}

#[tokio::test]
async fn identical_rules_are_deduplicated() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("x", step(&recorder, "x", "same").slow(20)));
  graph.add(rule("y", step(&recorder, "y", "same").slow(20)));

  let report = project.build(&graph, &[target("x"), target("y")]).await;

  assert!(report.success);
  assert_eq!(recorder.runs().len(), 1);

  let mut types: Vec<_> = report
    .results
    .iter()
    .map(|r| r.success_type.unwrap())
    .collect();
  types.sort_by_key(|t| t.to_string());
  assert_eq!(types, vec![SuccessType::Built, SuccessType::Deduplicated]);

  let x = report.result_for(&target("x")).unwrap();
  let y = report.result_for(&target("y")).unwrap();
  assert_eq!(x.rule_key, y.rule_key);
  assert_eq!(project.output("x"), "same");
  assert_eq!(project.output("y"), "same");

  // The copy counts as a hit, the single execution as a miss.
  assert_eq!(report.stats.request_count, 2);
  assert_eq!(report.stats.hit_count, 1);
  assert_eq!(report.stats.miss_count, 1);
}

#[tokio::test]
async fn deleted_output_is_rebuilt() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("a", step(&recorder, "a", "A")));

  let mut config = project.config.clone();
  config.cache.enabled = false;
  let project = TestProject { config, ..project };

  project.build(&graph, &[target("a")]).await;
  let out = project.output_dir(&target("a")).join(OUT_FILE);
  std::fs::remove_file(&out).unwrap();

  let report = project.build(&graph, &[target("a")]).await;
  assert_eq!(report.executed, vec![target("a")]);
  assert_eq!(report.stats.invalidation_count, 1);
  assert_eq!(report.stats.miss_count, 1);
  assert_eq!(report.stats.miss_match_count, 0);
  assert!(out.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn graph_file_rules_build_end_to_end() {
  let project = TestProject::new();
  let graph = ActionGraph::from_json(
    r#"{
      "rules": [
        { "target": "//gen:greeting", "type": "write_file", "out": "greeting.txt", "content": "hello" },
        {
          "target": "//app:shout",
          "type": "cmd",
          "deps": ["//gen:greeting"],
          "outputs": ["shout.txt"],
          "cmd": "tr a-z A-Z < $DEPS/greeting.txt > $out/shout.txt",
          "env": { "PATH": "/usr/bin:/bin" }
        }
      ]
    }"#,
  )
  .unwrap();
  let shout = BuildTarget::parse("//app:shout").unwrap();

  let report = project.build(&graph, std::slice::from_ref(&shout)).await;

  assert!(report.success, "{:?}", report.failures);
  let dir = project.output_dir(&shout);
  assert_eq!(std::fs::read_to_string(dir.join("shout.txt")).unwrap(), "HELLO");
}
