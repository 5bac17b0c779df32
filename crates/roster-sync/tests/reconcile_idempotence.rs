use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use roster_adapters::JsonFileSource;
use roster_avatar::ImageSource;
use roster_core::{ExclusionReason, ExistingRecord};
use roster_storage::{FetchError, MemorySink};
use roster_sync::{RuleSet, RunMode, SyncConfig, SyncPipeline};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Image host that is always down, so every fetched avatar fails open.
struct OfflineImages;

#[async_trait]
impl ImageSource for OfflineImages {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::HttpStatus {
            status: 503,
            url: url.to_string(),
        })
    }
}

fn config(reports_dir: Option<&Path>) -> SyncConfig {
    let root = workspace_root().display().to_string();
    let reports = reports_dir
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "off".to_string());
    let vars = HashMap::from([
        ("ROSTER_WORKSPACE_ROOT", root),
        ("ROSTER_SINK", "memory".to_string()),
        ("ROSTER_REPORTS_DIR", reports),
        ("ROSTER_CONCURRENCY", "3".to_string()),
    ]);
    SyncConfig::from_lookup(|key| vars.get(key).cloned()).expect("config")
}

fn pipeline(sink: &MemorySink, reports_dir: Option<&Path>) -> SyncPipeline {
    let config = config(reports_dir);
    let rules = RuleSet::load(&config.workspace_root).expect("rules");
    let source = JsonFileSource::new(config.resolve(&config.source_path));
    SyncPipeline::new(
        config,
        &rules,
        Box::new(source),
        Arc::new(sink.clone()),
        Arc::new(OfflineImages),
    )
    .expect("pipeline")
}

fn seeded_sink() -> MemorySink {
    MemorySink::with_records([
        ExistingRecord {
            identity: "Grace@Example.com".into(),
            display_name: Some("Grace Hopper".into()),
            position: Some("Director".into()),
            department: Some("IT".into()),
            ..Default::default()
        },
        ExistingRecord {
            identity: "former@example.com".into(),
            display_name: Some("Former Member".into()),
            position: Some("Member".into()),
            department: Some("Sales".into()),
            ..Default::default()
        },
    ])
}

#[tokio::test]
async fn second_run_over_unchanged_directory_only_updates() {
    let sink = seeded_sink();
    let pipeline = pipeline(&sink, None);

    let first = pipeline.run_once(RunMode::Apply).await.expect("first run");
    let first_result = first.summary.result.clone().expect("applied");
    assert_eq!(first.summary.source_entries, 11);
    assert_eq!(first.summary.desired, 5);
    assert_eq!(first.summary.excluded, 6);
    assert_eq!(
        (first_result.created, first_result.updated, first_result.deleted),
        (4, 1, 1)
    );
    assert!(first_result.is_clean());

    let second = pipeline.run_once(RunMode::Apply).await.expect("second run");
    let second_result = second.summary.result.clone().expect("applied");
    assert_eq!(
        (second_result.created, second_result.updated, second_result.deleted),
        (0, 5, 0)
    );
    assert!(second_result.errors.is_empty());

    let stored = sink.snapshot().await;
    let identities = stored.iter().map(|r| r.identity.as_str()).collect::<Vec<_>>();
    assert_eq!(
        identities,
        vec![
            "ada@example.com",
            "alan.turing@example.com",
            "barbara@example.com",
            "grace@example.com",
            "linus@example.com",
        ]
    );
}

#[tokio::test]
async fn sink_receives_parsed_roles_and_only_authentic_avatars() {
    let sink = MemorySink::new();
    let outcome = pipeline(&sink, None)
        .run_once(RunMode::Apply)
        .await
        .expect("run");

    let reasons = outcome
        .exclusions
        .iter()
        .map(|e| e.reason)
        .collect::<Vec<_>>();
    assert_eq!(
        reasons.iter().filter(|r| **r == ExclusionReason::InvalidRole).count(),
        2
    );
    assert!(reasons.contains(&ExclusionReason::Alumni));
    assert!(reasons.contains(&ExclusionReason::MissingIdentity));
    assert!(reasons.contains(&ExclusionReason::MissingName));
    assert!(reasons.contains(&ExclusionReason::DuplicateIdentity));

    let stored = sink
        .snapshot()
        .await
        .into_iter()
        .map(|r| (r.identity.clone(), r))
        .collect::<HashMap<_, _>>();

    let ada = &stored["ada@example.com"];
    assert_eq!(ada.position.as_deref(), Some("Head of"));
    assert_eq!(ada.department.as_deref(), Some("Marketing"));
    assert_eq!(
        ada.avatar_url.as_deref(),
        Some("https://avatars.example.com/ada_512.jpg")
    );

    let alan = &stored["alan.turing@example.com"];
    assert_eq!(alan.department.as_deref(), Some("Consultants"));
    assert_eq!(alan.avatar_url, None);

    let barbara = &stored["barbara@example.com"];
    assert_eq!(barbara.position.as_deref(), Some("Director"));
    assert_eq!(barbara.department.as_deref(), Some("Sales"));
    assert_eq!(barbara.avatar_url, None);

    assert_eq!(
        stored["grace@example.com"].department.as_deref(),
        Some("Presidency")
    );
    assert_eq!(stored["linus@example.com"].avatar_url, None);
}

#[tokio::test]
async fn plan_only_run_leaves_the_sink_untouched() {
    let sink = seeded_sink();
    let outcome = pipeline(&sink, None)
        .run_once(RunMode::PlanOnly)
        .await
        .expect("plan");

    assert!(outcome.summary.result.is_none());
    assert_eq!(outcome.summary.planned_creates, 4);
    assert_eq!(outcome.summary.planned_updates, 1);
    assert_eq!(outcome.plan.to_delete, vec!["former@example.com".to_string()]);
    assert_eq!(sink.snapshot().await.len(), 2);
}

#[tokio::test]
async fn each_run_writes_summary_and_result_reports() {
    let reports = tempfile::tempdir().expect("tempdir");
    let outcome = pipeline(&MemorySink::new(), Some(reports.path()))
        .run_once(RunMode::Apply)
        .await
        .expect("run");

    let dir = reports.path().join(outcome.summary.run_id.to_string());
    assert_eq!(
        outcome.summary.reports_dir.as_deref(),
        Some(dir.display().to_string().as_str())
    );
    let markdown = std::fs::read_to_string(dir.join("sync_summary.md")).expect("summary");
    assert!(markdown.contains("- Created: 5"));
    assert!(markdown.contains("- duplicate-identity: 1"));

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join("sync_result.json")).expect("result"))
            .expect("json");
    assert_eq!(json["summary"]["result"]["created"], 5);
    assert_eq!(json["exclusions"].as_array().map(Vec::len), Some(6));
}
