use kiln_lib::cache::DirArtifactCache;
use kiln_lib::engine::{BuildError, BuildStatus};
use kiln_lib::graph::ActionGraph;

use crate::common::*;

#[tokio::test]
async fn failed_dependency_is_never_followed_by_its_dependents() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("c", step(&recorder, "c", "leaf").failing()));
  graph.add(rule("b", step(&recorder, "b", "middle")).with_deps([target("c")]));
  graph.add(rule("a", step(&recorder, "a", "top")).with_deps([target("b")]));

  let report = project.build(&graph, &[target("a")]).await;

  assert!(!report.success);
  assert_eq!(report.exit_code(), 1);
  assert_eq!(recorder.runs(), vec!["c"]);
  assert_eq!(report.stats.load_failure_count, 1);

  let result = report.result_for(&target("a")).unwrap();
  assert_eq!(result.status, BuildStatus::Fail);
  assert!(result.error.as_deref().unwrap().contains("dependency //app:b failed"));

  assert_eq!(report.failures.len(), 1);
  let failure = &report.failures[0];
  assert_eq!(failure.target, target("c"));
  assert!(failure.message.contains("c exploded"));
  assert_eq!(failure.stack, vec![target("a"), target("b"), target("c")]);
}

#[tokio::test]
async fn failures_are_not_remembered() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("a", step(&recorder, "a", "A").failing()));

  project.build(&graph, &[target("a")]).await;
  let report = project.build(&graph, &[target("a")]).await;

  assert!(!report.success);
  assert_eq!(recorder.count("a"), 2);
}

#[tokio::test]
async fn missing_dependency_fails_before_anything_runs() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("b", step(&recorder, "b", "B")));
  graph.add(rule("a", step(&recorder, "a", "A")).with_deps([target("b"), target("gone")]));

  let err = project.try_build(&graph, &[target("a")]).await.unwrap_err();

  assert!(matches!(err, BuildError::DependencyNotFound { .. }));
  assert_eq!(err.to_string(), "no rule for //app:gone (required by //app:a -> //app:gone)");
  assert!(recorder.runs().is_empty());
}

#[tokio::test]
async fn cycle_fails_before_anything_runs() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("a", step(&recorder, "a", "A")).with_deps([target("b")]));
  graph.add(rule("b", step(&recorder, "b", "B")).with_deps([target("a")]));

  let err = project.try_build(&graph, &[target("a")]).await.unwrap_err();

  assert!(matches!(err, BuildError::Cycle { .. }));
  assert!(recorder.runs().is_empty());
}

#[tokio::test]
async fn keep_going_builds_independent_targets() {
  let mut project = TestProject::new();
  project.config.build.keep_going = true;
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("broken", step(&recorder, "broken", "B").failing()));
  graph.add(rule("slow", step(&recorder, "slow", "S").slow(100)));
  graph.add(rule("fine", step(&recorder, "fine", "F")).with_deps([target("slow")]));

  let report = project
    .build(&graph, &[target("broken"), target("fine")])
    .await;

  assert!(!report.success);
  assert_eq!(report.result_for(&target("broken")).unwrap().status, BuildStatus::Fail);
  assert_eq!(report.result_for(&target("fine")).unwrap().status, BuildStatus::Success);
  assert_eq!(project.output("fine"), "F|S");
  assert_eq!(report.failures.len(), 1);
}

#[tokio::test]
async fn oversized_rule_key_fails_without_running() {
  let mut project = TestProject::new();
  project.config.build.keep_going = true;
  project.config.build.max_rule_key_bytes = 1024;
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("huge", step(&recorder, "huge", &"x".repeat(4096))));
  graph.add(rule("fine", step(&recorder, "fine", "F")));

  let report = project.build(&graph, &[target("huge"), target("fine")]).await;

  assert!(!report.success);
  assert_eq!(report.result_for(&target("huge")).unwrap().status, BuildStatus::Fail);
  assert_eq!(report.result_for(&target("fine")).unwrap().status, BuildStatus::Success);
  assert_eq!(recorder.runs(), vec!["fine"]);

  assert_eq!(report.failures.len(), 1);
  let failure = &report.failures[0];
  assert_eq!(failure.target, target("huge"));
  assert!(failure.message.contains("exceeds 1024 bytes"), "{}", failure.message);

  let cache = DirArtifactCache::new(project.out_dir().join("cache"), None, true);
  assert_eq!(cache.stats().unwrap().entries, 1);
  let fine_key = report.result_for(&target("fine")).unwrap().rule_key.unwrap();
  assert!(cache.path_for_key(&fine_key).exists());
}

#[tokio::test]
async fn failure_stops_rules_not_yet_started() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("broken", step(&recorder, "broken", "B").failing()));
  graph.add(rule("slow", step(&recorder, "slow", "S").slow(200)));
  graph.add(rule("later", step(&recorder, "later", "L")).with_deps([target("slow")]));

  let report = project
    .build(&graph, &[target("broken"), target("later")])
    .await;

  assert!(!report.success);
  assert_eq!(recorder.count("later"), 0);
  let later = report.result_for(&target("later")).unwrap();
  assert_eq!(later.status, BuildStatus::Fail);
  assert!(later.error.as_deref().unwrap().contains("build stopped"));

  let failed: Vec<_> = report.failures.iter().map(|f| f.target.clone()).collect();
  assert_eq!(failed, vec![target("broken")]);
}

#[tokio::test]
async fn missing_declared_output_fails_the_rule() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("a", step(&recorder, "a", "A")).with_outputs(["promised.txt"]));

  let report = project.build(&graph, &[target("a")]).await;

  assert!(!report.success);
  assert!(
    report.failures[0]
      .message
      .contains("did not produce declared output promised.txt")
  );
}

#[tokio::test]
async fn duplicate_of_failed_rule_fails_without_running() {
  let mut project = TestProject::new();
  project.config.build.keep_going = true;
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("x", step(&recorder, "x", "same").failing().slow(20)));
  graph.add(rule("y", step(&recorder, "y", "same").failing().slow(20)));

  let report = project.build(&graph, &[target("x"), target("y")]).await;

  assert!(!report.success);
  assert_eq!(recorder.runs().len(), 1);
  assert_eq!(report.failures.len(), 1);

  let follower = report
    .results
    .iter()
    .find(|r| r.target != report.failures[0].target)
    .unwrap();
  assert!(
    follower
      .error
      .as_deref()
      .unwrap()
      .contains("has the same rule key and failed")
  );
}
