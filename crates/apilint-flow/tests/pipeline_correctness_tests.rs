//! End-to-end pipeline correctness tests on the in-memory seams.
//!
//! The loops are driven by hand (process / tick calls) so every test is
//! deterministic: no timers, no sleeps, except for the one smoke test that
//! exercises the spawned runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use apilint_core::{DocTaskId, ExecutorId};
use apilint_flow::error::Error;
use apilint_flow::hub::memory::InMemoryHub;
use apilint_flow::hub::HubDocument;
use apilint_flow::ingress::Ingress;
use apilint_flow::linter::{DocumentLinter, StaticLinter};
use apilint_flow::metrics::FlowMetrics;
use apilint_flow::ruleset::{LinterKind, Ruleset};
use apilint_flow::store::memory::InMemoryStore;
use apilint_flow::store::{DocLintStatus, TaskStore, VersionLintStatus};
use apilint_flow::task::{TaskStatus, MAX_RESTARTS};
use apilint_flow::workers::doc::DocTaskWorker;
use apilint_flow::workers::rollup::RollupLoop;
use apilint_flow::workers::version::VersionTaskWorker;

/// A report with one error-severity and one warning-severity finding.
const REPORT: &[u8] = br#"[{"severity": 0}, {"severity": 1}]"#;

struct Harness {
    store: Arc<InMemoryStore>,
    hub: Arc<InMemoryHub>,
    executor_id: ExecutorId,
    ingress: Ingress,
    version_worker: VersionTaskWorker,
    doc_worker: DocTaskWorker,
    rollup: RollupLoop,
    ruleset: Ruleset,
}

impl Harness {
    async fn new() -> Self {
        Self::with_linter(Arc::new(StaticLinter::new(REPORT.to_vec()))).await
    }

    async fn with_linter(linter: Arc<dyn DocumentLinter>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(InMemoryHub::new());
        let executor_id = ExecutorId::generate();
        let metrics = FlowMetrics::new();

        let ruleset = Ruleset::new(
            "oas recommended",
            "openapi-3-0",
            LinterKind::Spectral,
            "ruleset.yaml",
            b"extends: spectral:oas".to_vec(),
        );
        store.insert_ruleset(&ruleset).await.unwrap();

        let (wake_tx, wake_rx) = mpsc::channel(8);
        let ingress = Ingress::new(store.clone(), hub.clone(), executor_id, wake_tx);
        let version_worker = VersionTaskWorker::new(
            store.clone(),
            hub.clone(),
            executor_id,
            Duration::from_secs(5),
            Duration::from_millis(50),
            metrics,
            wake_rx,
        );
        let doc_worker = DocTaskWorker::new(
            store.clone(),
            hub.clone(),
            linter,
            executor_id,
            Duration::from_secs(5),
            Duration::from_millis(50),
            metrics,
        );
        let rollup = RollupLoop::new(
            store.clone(),
            executor_id,
            Duration::from_secs(5),
            metrics,
        );

        Self {
            store,
            hub,
            executor_id,
            ingress,
            version_worker,
            doc_worker,
            rollup,
            ruleset,
        }
    }

    fn put_document(&self, slug: &str, api_type: &str, raw: &[u8]) {
        self.hub
            .put_document(
                "pkg-a",
                "1.0@1",
                HubDocument {
                    file_id: format!("file-{slug}"),
                    slug: slug.to_string(),
                    api_type: api_type.to_string(),
                    title: None,
                },
                raw.to_vec(),
            )
            .unwrap();
    }

    /// Runs one full pipeline pass: fan-out, doc drain, roll-up.
    async fn run_once(&self, task_id: apilint_core::VersionTaskId) {
        self.version_worker.process(task_id).await;
        self.doc_worker.tick().await;
        self.rollup.tick().await.unwrap();
    }
}

#[tokio::test]
async fn happy_path_single_document() {
    let harness = Harness::new().await;
    harness.put_document("petstore", "openapi-3-0", b"openapi: 3.0.0");

    let task_id = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, Some("E1".to_string()))
        .await
        .unwrap();
    harness.run_once(task_id).await;

    let version_task = harness.store.get_version_task(task_id).await.unwrap();
    assert_eq!(version_task.status, TaskStatus::Complete);
    assert_eq!(version_task.restart_count, 0);

    let docs = harness
        .store
        .get_doc_tasks_for_version_tasks(&[task_id])
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].status, TaskStatus::Complete);
    assert_eq!(docs[0].restart_count, 0);

    let verdict = harness
        .store
        .get_linted_version("pkg-a", "1.0", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verdict.lint_status, VersionLintStatus::Success);

    let linted = harness
        .store
        .get_linted_documents("pkg-a", "1.0", 1)
        .await
        .unwrap();
    assert_eq!(linted.len(), 1);
    assert_eq!(linted[0].lint_status, DocLintStatus::Success);
    assert_eq!(linted[0].ruleset_id, harness.ruleset.id);

    let result = harness
        .store
        .get_lint_file_result(&linted[0].data_hash, harness.ruleset.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.summary.error_count, 1);
    assert_eq!(result.summary.warning_count, 1);
    assert!(result.summary.total() > 0);
}

#[tokio::test]
async fn identical_documents_deduplicate_into_one_result_row() {
    let harness = Harness::new().await;
    harness.put_document("doc-a", "openapi-3-0", b"openapi: 3.0.0");
    harness.put_document("doc-b", "openapi-3-0", b"openapi: 3.0.0");

    let task_id = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, None)
        .await
        .unwrap();
    harness.run_once(task_id).await;

    let linted = harness
        .store
        .get_linted_documents("pkg-a", "1.0", 1)
        .await
        .unwrap();
    assert_eq!(linted.len(), 2);
    assert_ne!(linted[0].file_id, linted[1].file_id);
    assert_eq!(linted[0].data_hash, linted[1].data_hash);

    // One deduplicated result row for both documents.
    assert!(harness
        .store
        .get_lint_file_result(&linted[0].data_hash, harness.ruleset.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn unsupported_api_type_fails_the_version() {
    let harness = Harness::new().await;
    harness.put_document("schema", "graphql", b"type Query { ok: Boolean }");

    let task_id = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, None)
        .await
        .unwrap();
    harness.version_worker.process(task_id).await;

    let version_task = harness.store.get_version_task(task_id).await.unwrap();
    assert_eq!(version_task.status, TaskStatus::Error);

    let docs = harness
        .store
        .get_doc_tasks_for_version_tasks(&[task_id])
        .await
        .unwrap();
    assert_eq!(docs[0].status, TaskStatus::Error);
    assert!(docs[0].details.contains("linter unknown"));

    // Pre-failed tasks never enter the dispatcher.
    harness.doc_worker.tick().await;
    let docs = harness
        .store
        .get_doc_tasks_for_version_tasks(&[task_id])
        .await
        .unwrap();
    assert_eq!(docs[0].restart_count, 0);
    assert_eq!(docs[0].executor_id, Some(harness.executor_id));
}

#[tokio::test]
async fn duplicate_event_yields_exactly_one_version_task() {
    let harness = Harness::new().await;
    harness.put_document("petstore", "openapi-3-0", b"openapi: 3.0.0");

    let first = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, Some("E1".to_string()))
        .await;
    assert!(first.is_ok());

    let second = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, Some("E1".to_string()))
        .await;
    assert!(matches!(second, Err(Error::DuplicateEvent { .. })));
    assert_eq!(harness.store.version_task_count().unwrap(), 1);
}

#[tokio::test]
async fn stale_lease_is_reclaimed_and_completed_by_a_sibling() {
    let harness = Harness::new().await;
    harness.put_document("petstore", "openapi-3-0", b"openapi: 3.0.0");

    let task_id = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, None)
        .await
        .unwrap();
    harness.version_worker.process(task_id).await;

    // A worker claims the doc task and dies before writing back.
    let crashed = ExecutorId::generate();
    let claimed = harness
        .store
        .claim_free_doc_task(crashed)
        .await
        .unwrap()
        .unwrap();
    harness
        .store
        .backdate_doc_task(claimed.id, Utc::now() - chrono::Duration::seconds(60))
        .unwrap();

    // The sibling's drain loop re-claims and completes the task.
    harness.doc_worker.tick().await;
    harness.rollup.tick().await.unwrap();

    let doc = harness.store.get_doc_task(claimed.id).await.unwrap();
    assert_eq!(doc.status, TaskStatus::Complete);
    assert_eq!(doc.restart_count, 1);

    let version_task = harness.store.get_version_task(task_id).await.unwrap();
    assert_eq!(version_task.status, TaskStatus::Complete);
    let verdict = harness
        .store
        .get_linted_version("pkg-a", "1.0", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verdict.lint_status, VersionLintStatus::Success);
}

#[tokio::test]
async fn repeated_crashes_poison_the_task() {
    let harness = Harness::new().await;
    harness.put_document("petstore", "openapi-3-0", b"openapi: 3.0.0");

    let task_id = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, None)
        .await
        .unwrap();
    harness.version_worker.process(task_id).await;

    // Crash through the whole restart budget.
    let mut doc_id: Option<DocTaskId> = None;
    for _ in 0..=MAX_RESTARTS {
        let claimed = harness
            .store
            .claim_free_doc_task(ExecutorId::generate())
            .await
            .unwrap()
            .unwrap();
        doc_id = Some(claimed.id);
        harness
            .store
            .backdate_doc_task(claimed.id, Utc::now() - chrono::Duration::seconds(60))
            .unwrap();
    }
    let doc_id = doc_id.unwrap();

    harness.doc_worker.tick().await;
    harness.rollup.tick().await.unwrap();

    let doc = harness.store.get_doc_task(doc_id).await.unwrap();
    assert_eq!(doc.status, TaskStatus::Error);
    assert!(doc.details.starts_with("Restart count exceeded"));
    assert!(doc.restart_count <= MAX_RESTARTS);

    let version_task = harness.store.get_version_task(task_id).await.unwrap();
    assert_eq!(version_task.status, TaskStatus::Error);
    assert_eq!(version_task.details, "1 doc lint task(s) failed");
}

#[tokio::test]
async fn mixed_success_and_failure_fails_the_version() {
    let harness = Harness::new().await;
    harness.put_document("good", "openapi-3-0", b"openapi: 3.0.0");
    harness.put_document("empty", "openapi-3-0", b"");

    let task_id = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, None)
        .await
        .unwrap();
    harness.run_once(task_id).await;

    let linted = harness
        .store
        .get_linted_documents("pkg-a", "1.0", 1)
        .await
        .unwrap();
    assert_eq!(linted.len(), 2);
    let empty = linted.iter().find(|d| d.slug == "empty").unwrap();
    let good = linted.iter().find(|d| d.slug == "good").unwrap();
    assert_eq!(good.lint_status, DocLintStatus::Success);
    assert_eq!(empty.lint_status, DocLintStatus::Error);
    assert_eq!(empty.lint_details, "document data is empty");
    assert_eq!(empty.data_hash, "");

    let verdict = harness
        .store
        .get_linted_version("pkg-a", "1.0", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verdict.lint_status, VersionLintStatus::Failed);

    let version_task = harness.store.get_version_task(task_id).await.unwrap();
    assert_eq!(version_task.status, TaskStatus::Error);
    assert_eq!(version_task.details, "1 doc lint task(s) failed");
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_task() {
    let harness = Harness::new().await;
    for i in 0..10 {
        harness.put_document(&format!("doc-{i}"), "openapi-3-0", format!("spec {i}").as_bytes());
    }

    let task_id = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, None)
        .await
        .unwrap();
    harness.version_worker.process(task_id).await;

    let mut claimers = Vec::new();
    for _ in 0..4 {
        let store = harness.store.clone();
        claimers.push(tokio::spawn(async move {
            let executor = ExecutorId::generate();
            let mut claimed = Vec::new();
            while let Some(task) = store.claim_free_doc_task(executor).await.unwrap() {
                claimed.push(task.id);
            }
            claimed
        }));
    }

    let mut all: Vec<DocTaskId> = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await.unwrap());
    }
    all.sort();
    let total = all.len();
    all.dedup();
    assert_eq!(total, 10, "every task claimed exactly once");
    assert_eq!(all.len(), 10, "no task claimed twice");
}

#[tokio::test]
async fn replayed_doc_lifecycle_yields_one_document_row() {
    let harness = Harness::new().await;
    harness.put_document("petstore", "openapi-3-0", b"openapi: 3.0.0");

    let task_id = harness
        .ingress
        .validate_version("pkg-a", "1.0", 1, None)
        .await
        .unwrap();
    harness.version_worker.process(task_id).await;

    // First claimant stalls mid-flight.
    let stale_executor = ExecutorId::generate();
    let claimed = harness
        .store
        .claim_free_doc_task(stale_executor)
        .await
        .unwrap()
        .unwrap();
    harness
        .store
        .backdate_doc_task(claimed.id, Utc::now() - chrono::Duration::seconds(60))
        .unwrap();

    // Sibling completes the task.
    harness.doc_worker.tick().await;

    // The stalled claimant wakes up and still writes its result; the
    // writeback is a keyed upsert, so the state converges.
    let completed = harness.store.get_doc_task(claimed.id).await.unwrap();
    let replay = apilint_flow::store::DocTaskWriteback {
        doc_task_id: claimed.id,
        executor_id: stale_executor,
        status: TaskStatus::Complete,
        details: String::new(),
        lint_time_ms: 7,
        version_row: apilint_flow::store::LintedVersion {
            package_id: claimed.package_id.clone(),
            version: claimed.version.clone(),
            revision: claimed.revision,
            lint_status: VersionLintStatus::InProgress,
            lint_details: String::new(),
            linted_at: Utc::now(),
        },
        doc_row: apilint_flow::store::LintedDocument {
            package_id: claimed.package_id.clone(),
            version: claimed.version.clone(),
            revision: claimed.revision,
            file_id: claimed.file_id.clone(),
            ruleset_id: claimed.ruleset_id.unwrap(),
            slug: claimed.file_slug.clone(),
            api_type: claimed.api_type.clone(),
            data_hash: "replayed-hash".to_string(),
            lint_status: DocLintStatus::Success,
            lint_details: String::new(),
        },
        result_row: None,
    };
    harness.store.save_lint_result(&replay).await.unwrap();

    let linted = harness
        .store
        .get_linted_documents("pkg-a", "1.0", 1)
        .await
        .unwrap();
    assert_eq!(linted.len(), 1);
    // The first terminal task outcome wins.
    let after = harness.store.get_doc_task(claimed.id).await.unwrap();
    assert_eq!(after.lint_time_ms, completed.lint_time_ms);

    harness.rollup.tick().await.unwrap();
    let version_task = harness.store.get_version_task(task_id).await.unwrap();
    assert_eq!(version_task.status, TaskStatus::Complete);
}

#[tokio::test]
async fn spawned_runtime_completes_a_version_end_to_end() {
    use apilint_flow::runtime::{PipelineConfig, PipelineRuntime};

    let store = Arc::new(InMemoryStore::new());
    let hub = Arc::new(InMemoryHub::new());

    let ruleset = Ruleset::new(
        "oas recommended",
        "openapi-3-0",
        LinterKind::Spectral,
        "ruleset.yaml",
        b"extends: spectral:oas".to_vec(),
    );
    store.insert_ruleset(&ruleset).await.unwrap();
    hub.put_document(
        "pkg-a",
        "1.0@1",
        HubDocument {
            file_id: "f1".to_string(),
            slug: "petstore".to_string(),
            api_type: "openapi-3-0".to_string(),
            title: None,
        },
        b"openapi: 3.0.0".to_vec(),
    )
    .unwrap();

    let config = PipelineConfig {
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(20),
        lease_ttl: Duration::from_secs(30),
    };
    let runtime = PipelineRuntime::new(
        store.clone(),
        hub,
        Arc::new(StaticLinter::new(REPORT.to_vec())),
        ExecutorId::generate(),
        config,
    );
    let pipeline = runtime.start();

    let task_id = pipeline
        .ingress()
        .validate_version("pkg-a", "1.0", 1, None)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = store.get_version_task(task_id).await.unwrap();
        if task.status.is_terminal() {
            assert_eq!(task.status, TaskStatus::Complete);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "version task did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pipeline.shutdown().await;
}
