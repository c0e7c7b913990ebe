//! Integration tests for changegate-store-sqlite.
// crates/changegate-store-sqlite/tests/sqlite_store_integration.rs
// =============================================================================
// Module: SQLite Store Integration Tests
// Description: Exercises SqliteStore against a real file-backed database.
// Purpose: Validate round-tripping of every entity and the latest-of-kind
//          queries the orchestrator and workers rely on.
// =============================================================================

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]

use changegate_core::identifiers::ArtifactId;
use changegate_core::identifiers::JobName;
use changegate_core::identifiers::PatchSetId;
use changegate_core::identifiers::RunId;
use changegate_core::identifiers::StageName;
use changegate_core::identifiers::ViolationId;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::Store;
use changegate_core::interfaces::StoreError;
use changegate_core::model::Artifact;
use changegate_core::model::ArtifactKind;
use changegate_core::model::PatchSet;
use changegate_core::model::PatchSetStatus;
use changegate_core::model::PolicyViolation;
use changegate_core::model::Repo;
use changegate_core::model::RunStatus;
use changegate_core::model::Severity;
use changegate_core::model::StageStatus;
use changegate_core::model::Workflow;
use changegate_core::model::WorkflowRun;
use changegate_core::model::WorkflowState;
use changegate_core::time::Timestamp;
use changegate_store_sqlite::SqliteStore;
use changegate_store_sqlite::SqliteStoreConfig;
use tempfile::tempdir;

fn sample_workflow(id: &str) -> Workflow {
    Workflow {
        id: WorkflowId::new(id),
        state: WorkflowState::Ingested,
        stage: StageName::Ingest,
        stage_status: StageStatus::Pending,
        feature_goal: "add dark mode".to_owned(),
        business_justification: "user request".to_owned(),
        repos: vec![Repo { owner: "acme".to_owned(), name: "web".to_owned(), base_branch: "main".to_owned(), role: "primary".to_owned() }],
        feedback: None,
        created_at: Timestamp::from_unix_millis(1_000),
        updated_at: Timestamp::from_unix_millis(1_000),
        base_sha: None,
    }
}

#[tokio::test]
async fn workflow_round_trips_through_insert_and_load() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens");

    let workflow = sample_workflow("wf-1");
    store.insert_workflow(&workflow).await.expect("inserts");
    let loaded = store.load_workflow(&workflow.id).await.expect("loads");
    assert_eq!(loaded, workflow);
}

#[tokio::test]
async fn load_workflow_reports_not_found_for_unknown_id() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens");

    let result = store.load_workflow(&WorkflowId::new("missing")).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn update_workflow_overwrites_mutable_fields_only() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens");

    let mut workflow = sample_workflow("wf-2");
    store.insert_workflow(&workflow).await.expect("inserts");

    workflow.state = WorkflowState::PatchesProposed;
    workflow.stage = StageName::Patches;
    workflow.stage_status = StageStatus::Ready;
    workflow.feedback = Some("looks good".to_owned());
    workflow.updated_at = Timestamp::from_unix_millis(2_000);
    workflow.base_sha = Some("abc123".to_owned());
    store.update_workflow(&workflow).await.expect("updates");

    let loaded = store.load_workflow(&workflow.id).await.expect("loads");
    assert_eq!(loaded, workflow);
}

#[tokio::test]
async fn latest_artifact_returns_the_highest_inserted_version() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens");
    let workflow_id = WorkflowId::new("wf-3");

    for version in 1..=3u64 {
        let artifact = Artifact {
            id: ArtifactId::new(format!("art-{version}")),
            workflow_id: workflow_id.clone(),
            kind: ArtifactKind::FeasibilityV1,
            content: format!("{{\"version\":{version}}}"),
            content_sha: format!("sha-{version}"),
            artifact_version: version,
            supersedes_artifact_id: (version > 1).then(|| ArtifactId::new(format!("art-{}", version - 1))),
            created_at: Timestamp::from_unix_millis(1_000 + i64::try_from(version).expect("fits")),
        };
        store.insert_artifact(&artifact).await.expect("inserts");
    }

    let latest = store.latest_artifact(&workflow_id, ArtifactKind::FeasibilityV1).await.expect("queries").expect("present");
    assert_eq!(latest.artifact_version, 3);
    assert_eq!(latest.id, ArtifactId::new("art-3"));
}

#[tokio::test]
async fn latest_artifact_is_none_when_no_artifact_of_kind_exists() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens");
    let result = store.latest_artifact(&WorkflowId::new("wf-none"), ArtifactKind::SummaryV1).await.expect("queries");
    assert!(result.is_none());
}

#[tokio::test]
async fn patch_set_patches_round_trip_through_json_column() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens");

    let patch_set = PatchSet {
        id: PatchSetId::new("ps-1"),
        workflow_id: WorkflowId::new("wf-4"),
        artifact_id: ArtifactId::new("art-ps-1"),
        title: "dark mode toggle".to_owned(),
        base_sha: "deadbeef".to_owned(),
        status: PatchSetStatus::Proposed,
        patches: Vec::new(),
    };
    store.insert_patch_set(&patch_set).await.expect("inserts");

    let loaded = store.latest_patch_set(&patch_set.workflow_id).await.expect("queries").expect("present");
    assert_eq!(loaded, patch_set);
}

#[tokio::test]
async fn replace_violations_is_atomic_overwrite() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens");
    let patch_set_id = PatchSetId::new("ps-2");

    let first = vec![PolicyViolation {
        id: ViolationId::new("v-1"),
        patch_set_id: patch_set_id.clone(),
        rule: "frozen_file".to_owned(),
        severity: Severity::Block,
        file: "Cargo.lock".to_owned(),
        line: None,
        message: "frozen file touched".to_owned(),
        evidence: "Cargo.lock".to_owned(),
    }];
    store.replace_violations(&patch_set_id, &first).await.expect("replaces");
    assert_eq!(store.list_violations(&patch_set_id).await.expect("lists").len(), 1);

    store.replace_violations(&patch_set_id, &[]).await.expect("replaces");
    assert!(store.list_violations(&patch_set_id).await.expect("lists").is_empty());
}

#[tokio::test]
async fn find_runs_by_input_hash_only_returns_completed_runs() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens");
    let workflow_id = WorkflowId::new("wf-5");

    let running = WorkflowRun {
        id: RunId::new("run-1"),
        workflow_id: workflow_id.clone(),
        job_name: JobName::new("feasibility"),
        status: RunStatus::Running,
        input_hash: "hash-a".to_owned(),
        inputs: serde_json::json!({}),
        outputs: None,
        error_message: None,
        started_at: Timestamp::from_unix_millis(1_000),
        completed_at: None,
        duration_ms: None,
        usage: None,
    };
    store.start_run(&running).await.expect("starts");
    assert!(store.find_runs_by_input_hash("hash-a").await.expect("queries").is_empty());

    let mut completed = running.clone();
    completed.status = RunStatus::Completed;
    completed.completed_at = Some(Timestamp::from_unix_millis(2_000));
    completed.duration_ms = Some(1_000);
    completed.outputs = Some(serde_json::json!({"ok": true}));
    store.update_run(&completed).await.expect("updates");

    let found = store.find_runs_by_input_hash("hash-a").await.expect("queries");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].status, RunStatus::Completed);
}

#[tokio::test]
async fn with_workflow_lock_serializes_concurrent_callers() {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    let dir = tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::open(&SqliteStoreConfig { path: dir.path().join("store.sqlite3"), busy_timeout_ms: 1_000 }).expect("opens"));
    let workflow_id = WorkflowId::new("wf-lock");
    let concurrent = Arc::new(AtomicU32::new(0));
    let max_concurrent = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let workflow_id = workflow_id.clone();
        let concurrent = concurrent.clone();
        let max_concurrent = max_concurrent.clone();
        handles.push(tokio::spawn(async move {
            store
                .with_workflow_lock(
                    &workflow_id,
                    Box::new(move || {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("joins").expect("lock body succeeds");
    }
    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
}
