use std::sync::Arc;

use kiln_lib::engine::{BuildStatus, SuccessType};
use kiln_lib::graph::ActionGraph;

use crate::common::*;

fn chain(recorder: &Recorder, counters: &Arc<StateCounters>, failing_head: bool) -> ActionGraph {
  let head = stage(recorder, counters, "one");
  let head = if failing_head { head.failing() } else { head };

  let mut graph = ActionGraph::new();
  graph.add(stage_rule("one", head, None));
  graph.add(stage_rule("two", stage(recorder, counters, "two"), Some("one")));
  graph.add(stage_rule("three", stage(recorder, counters, "three"), Some("two")));
  graph
}

#[tokio::test]
async fn chain_shares_one_state() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let counters = Arc::new(StateCounters::default());

  let report = project
    .build(&chain(&recorder, &counters, false), &[target("three")])
    .await;

  assert!(report.success, "{:?}", report.failures);
  assert_eq!(recorder.runs(), vec!["one", "two", "three"]);
  assert_eq!(project.output("three"), "one,two,three");
  assert_eq!(counters.created(), 1);
  assert_eq!(counters.closed(), 1);
}

#[tokio::test]
async fn cached_chain_never_creates_state() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let counters = Arc::new(StateCounters::default());
  let graph = chain(&recorder, &counters, false);

  project.build(&graph, &[target("three")]).await;
  let report = project.build(&graph, &[target("three")]).await;

  assert_eq!(
    report.result_for(&target("three")).unwrap().success_type,
    Some(SuccessType::MatchingRuleKey)
  );
  assert_eq!(counters.created(), 1);
  assert_eq!(counters.closed(), 1);
}

#[tokio::test]
async fn failed_head_releases_state_and_stops_the_chain() {
  let mut project = TestProject::new();
  project.config.build.keep_going = true;
  let recorder = Recorder::default();
  let counters = Arc::new(StateCounters::default());

  let report = project
    .build(&chain(&recorder, &counters, true), &[target("three")])
    .await;

  assert!(!report.success);
  assert_eq!(recorder.runs(), vec!["one"]);
  assert_eq!(counters.created(), 1);
  assert_eq!(counters.closed(), 1);

  let three = report.result_for(&target("three")).unwrap();
  assert_eq!(three.status, BuildStatus::Fail);
  assert!(three.error.as_deref().unwrap().contains("pipeline member //app:one failed"));

  let failed: Vec<_> = report.failures.iter().map(|f| f.target.clone()).collect();
  assert_eq!(failed, vec![target("one")]);
}

#[tokio::test]
async fn rules_outside_the_chain_run_unpipelined() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let counters = Arc::new(StateCounters::default());

  let mut graph = chain(&recorder, &counters, false);
  graph.add(rule("after", step(&recorder, "after", "A")).with_deps([target("three")]));

  let report = project.build(&graph, &[target("after")]).await;

  assert!(report.success, "{:?}", report.failures);
  assert_eq!(project.output("after"), "A|one,two,three");
  assert_eq!(counters.closed(), 1);
}
