use std::path::PathBuf;

use kiln_lib::cache::{DirArtifactCache, archive};
use kiln_lib::config::CacheTierKind;
use kiln_lib::engine::{BuildStatus, SuccessType};
use kiln_lib::graph::ActionGraph;
use mockito::Matcher;
use tempfile::TempDir;

use crate::common::*;

fn pair(recorder: &Recorder) -> ActionGraph {
  let mut graph = ActionGraph::new();
  graph.add(rule("lib", step(recorder, "lib", "L").reading("lib.txt")));
  graph.add(rule("app", step(recorder, "app", "A")).with_deps([target("lib")]));
  graph
}

#[tokio::test]
async fn lost_outputs_are_fetched_from_cache() {
  let project = TestProject::new();
  project.write_file("lib.txt", "source");
  let recorder = Recorder::default();
  let graph = pair(&recorder);

  project.build(&graph, &[target("app")]).await;
  project.wipe_local_state();
  let report = project.build(&graph, &[target("app")]).await;

  assert!(report.success, "{:?}", report.failures);
  assert!(report.executed.is_empty());
  assert_eq!(recorder.runs().len(), 2);
  assert_eq!(report.stats.hit_count, 2);

  let app = report.result_for(&target("app")).unwrap();
  assert_eq!(app.status, BuildStatus::Cached);
  assert_eq!(app.success_type, Some(SuccessType::FetchedFromCache));
  assert_eq!(project.output("app"), "A|L|source");

  // Fetched outputs are recorded, so the next build short-circuits.
  let again = project.build(&graph, &[target("app")]).await;
  assert_eq!(
    again.result_for(&target("app")).unwrap().success_type,
    Some(SuccessType::MatchingRuleKey)
  );
}

#[tokio::test]
async fn cached_artifact_missing_declared_output_is_rebuilt() {
  let project = TestProject::new();
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("a", step(&recorder, "a", "A")).with_outputs([OUT_FILE]));

  let first = project.build(&graph, &[target("a")]).await;
  let key = first.result_for(&target("a")).unwrap().rule_key.unwrap();

  let cache = DirArtifactCache::new(project.out_dir().join("cache"), None, true);
  let blob = cache.path_for_key(&key);
  assert!(blob.exists());
  let empty = TempDir::new().unwrap();
  archive::pack(empty.path(), &Vec::<PathBuf>::new(), &blob).unwrap();

  project.wipe_local_state();
  let report = project.build(&graph, &[target("a")]).await;

  assert!(report.success, "{:?}", report.failures);
  assert_eq!(report.executed, vec![target("a")]);
  assert_eq!(recorder.count("a"), 2);
  assert_eq!(report.stats.hit_count, 0);
  assert_eq!(report.stats.miss_count, 1);

  let result = report.result_for(&target("a")).unwrap();
  assert_eq!(result.status, BuildStatus::Success);
  assert_eq!(result.success_type, Some(SuccessType::Built));
  assert_eq!(project.output("a"), "A");
}

#[tokio::test]
async fn cache_is_shared_between_checkouts() {
  let shared = TempDir::new().unwrap();
  let recorder = Recorder::default();
  let graph = pair(&recorder);

  let mut first = TestProject::new();
  first.config.cache.dir.path = Some(shared.path().to_path_buf());
  first.write_file("lib.txt", "source");
  first.build(&graph, &[target("app")]).await;

  let mut second = TestProject::new();
  second.config.cache.dir.path = Some(shared.path().to_path_buf());
  second.write_file("lib.txt", "source");
  let report = second.build(&graph, &[target("app")]).await;

  assert!(report.executed.is_empty());
  assert_eq!(recorder.runs().len(), 2);
  assert_eq!(second.output("app"), "A|L|source");
}

#[tokio::test]
async fn disabled_cache_rebuilds() {
  let mut project = TestProject::new();
  project.config.cache.enabled = false;
  project.write_file("lib.txt", "source");
  let recorder = Recorder::default();
  let graph = pair(&recorder);

  project.build(&graph, &[target("app")]).await;
  project.wipe_local_state();
  let report = project.build(&graph, &[target("app")]).await;

  assert_eq!(report.executed.len(), 2);
  assert!(!project.out_dir().join("cache").exists());
}

fn scanner(recorder: &Recorder) -> ActionGraph {
  let mut graph = ActionGraph::new();
  graph.add(scan_rule("scan", scan(recorder, &["a.h", "b.h"], &["a.h"])));
  graph
}

#[tokio::test]
async fn unused_input_change_keeps_dep_file_rule_up_to_date() {
  let project = TestProject::new();
  project.write_file("a.h", "used");
  project.write_file("b.h", "unused");
  let recorder = Recorder::default();
  let graph = scanner(&recorder);

  let first = project.build(&graph, &[target("scan")]).await;
  project.write_file("b.h", "unused, edited");
  let second = project.build(&graph, &[target("scan")]).await;

  assert!(second.executed.is_empty());
  let result = second.result_for(&target("scan")).unwrap();
  assert_eq!(result.success_type, Some(SuccessType::MatchingDepFileRuleKey));
  assert_ne!(result.rule_key, first.result_for(&target("scan")).unwrap().rule_key);

  project.write_file("a.h", "used, edited");
  let third = project.build(&graph, &[target("scan")]).await;
  assert_eq!(third.executed, vec![target("scan")]);
  assert_eq!(project.output("scan"), "used, edited");
}

#[tokio::test]
async fn manifest_finds_artifact_when_only_unused_inputs_changed() {
  let project = TestProject::new();
  project.write_file("a.h", "used");
  project.write_file("b.h", "unused");
  let recorder = Recorder::default();
  let graph = scanner(&recorder);

  project.build(&graph, &[target("scan")]).await;
  project.wipe_local_state();
  project.write_file("b.h", "unused, edited");
  let report = project.build(&graph, &[target("scan")]).await;

  assert!(report.executed.is_empty(), "{:?}", report.executed);
  assert_eq!(recorder.runs().len(), 1);
  let result = report.result_for(&target("scan")).unwrap();
  assert_eq!(result.status, BuildStatus::Cached);
  assert_eq!(result.success_type, Some(SuccessType::FetchedFromCacheManifestBased));
  assert_eq!(project.output("scan"), "used");
}

#[tokio::test]
async fn manifest_misses_when_used_input_changed() {
  let project = TestProject::new();
  project.write_file("a.h", "used");
  project.write_file("b.h", "unused");
  let recorder = Recorder::default();
  let graph = scanner(&recorder);

  project.build(&graph, &[target("scan")]).await;
  project.wipe_local_state();
  project.write_file("a.h", "used, edited");
  let report = project.build(&graph, &[target("scan")]).await;

  assert_eq!(report.executed, vec![target("scan")]);
  assert_eq!(project.output("scan"), "used, edited");
}

#[tokio::test]
async fn built_artifacts_are_uploaded_to_http_cache() {
  let mut server = mockito::Server::new_async().await;
  let lookups = server
    .mock("GET", Matcher::Regex(r"^/metadata/".to_string()))
    .with_status(404)
    .expect(1)
    .create_async()
    .await;
  let artifacts = server
    .mock("PUT", Matcher::Regex(r"^/artifacts/".to_string()))
    .with_status(200)
    .expect(1)
    .create_async()
    .await;
  let metadata = server
    .mock("PUT", Matcher::Regex(r"^/metadata/".to_string()))
    .match_body(Matcher::Regex(r#""target":"//app:a""#.to_string()))
    .with_status(200)
    .expect(1)
    .create_async()
    .await;

  let mut project = TestProject::new();
  project.config.cache.tiers = vec![CacheTierKind::Http];
  project.config.cache.http.url = Some(server.url());
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("a", step(&recorder, "a", "A")));

  let report = project.build(&graph, &[target("a")]).await;

  assert!(report.success);
  lookups.assert_async().await;
  artifacts.assert_async().await;
  metadata.assert_async().await;
}

#[tokio::test]
async fn unreachable_http_cache_does_not_fail_the_build() {
  let mut server = mockito::Server::new_async().await;
  let _lookups = server
    .mock("GET", Matcher::Any)
    .with_status(500)
    .create_async()
    .await;
  let _uploads = server
    .mock("PUT", Matcher::Any)
    .with_status(500)
    .create_async()
    .await;

  let mut project = TestProject::new();
  project.config.cache.tiers = vec![CacheTierKind::Http];
  project.config.cache.http.url = Some(server.url());
  project.config.cache.upload_retries = 0;
  let recorder = Recorder::default();
  let mut graph = ActionGraph::new();
  graph.add(rule("a", step(&recorder, "a", "A")));

  let report = project.build(&graph, &[target("a")]).await;

  assert!(report.success);
  assert_eq!(report.executed, vec![target("a")]);
  assert_eq!(project.output("a"), "A");
  assert!(report.stats.error_count >= 1);
  assert_eq!(report.stats.miss_count, 1);
}
