//! Document-task worker.
//!
//! Claims one document task at a time, downloads the raw document, runs
//! the assigned linter, and persists the de-duplicated result. Every
//! failure path still writes a terminal per-document record and finalizes
//! the task as `error`; a document task must never be left stuck in
//! `processing`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use apilint_core::{ExecutorId, RulesetId};

use crate::heartbeat::spawn_doc_heartbeat;
use crate::hub::ApiHubClient;
use crate::linter::DocumentLinter;
use crate::metrics::FlowMetrics;
use crate::ruleset::LinterKind;
use crate::store::{
    DocLintStatus, DocTaskWriteback, LintFileResult, LintedDocument, LintedVersion, TaskStore,
    VersionLintStatus,
};
use crate::task::{DocumentLintTask, TaskStatus};

use super::DrainGuard;

/// A task-local failure: recorded on the task, never propagated.
struct DocFailure {
    details: String,
    data_hash: String,
}

impl DocFailure {
    fn before_download(details: impl Into<String>) -> Self {
        Self {
            details: details.into(),
            data_hash: String::new(),
        }
    }

    fn with_hash(details: impl Into<String>, data_hash: impl Into<String>) -> Self {
        Self {
            details: details.into(),
            data_hash: data_hash.into(),
        }
    }
}

/// Background loop that drains claimable document tasks.
pub struct DocTaskWorker {
    store: Arc<dyn TaskStore>,
    hub: Arc<dyn ApiHubClient>,
    linter: Arc<dyn DocumentLinter>,
    executor_id: ExecutorId,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    metrics: FlowMetrics,
    guard: DrainGuard,
}

impl std::fmt::Debug for DocTaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocTaskWorker")
            .field("executor_id", &self.executor_id)
            .finish_non_exhaustive()
    }
}

impl DocTaskWorker {
    /// Creates a worker bound to this process's executor id.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        hub: Arc<dyn ApiHubClient>,
        linter: Arc<dyn DocumentLinter>,
        executor_id: ExecutorId,
        poll_interval: Duration,
        heartbeat_interval: Duration,
        metrics: FlowMetrics,
    ) -> Self {
        Self {
            store,
            hub,
            linter,
            executor_id,
            poll_interval,
            heartbeat_interval,
            metrics,
            guard: DrainGuard::new(),
        }
    }

    /// Runs the claim loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(panic) = AssertUnwindSafe(self.tick()).catch_unwind().await {
                        let message = super::panic_message(panic.as_ref());
                        tracing::error!(panic = %message, "document tick panicked");
                    }
                }
            }
        }
        tracing::info!(executor_id = %self.executor_id, "document worker stopped");
    }

    /// One tick: claim and process until the queue is empty (drain mode).
    pub async fn tick(&self) {
        let Some(_pass) = self.guard.try_enter() else {
            return;
        };

        loop {
            match self.store.claim_free_doc_task(self.executor_id).await {
                Ok(Some(task)) => {
                    self.metrics.record_claim("doc", true);
                    self.process(task).await;
                }
                Ok(None) => {
                    self.metrics.record_claim("doc", false);
                    break;
                }
                Err(error) => {
                    tracing::warn!(%error, "document task claim failed");
                    break;
                }
            }
        }
    }

    /// Processes one claimed task to a terminal state.
    async fn process(&self, task: DocumentLintTask) {
        let span = apilint_core::observability::task_span(
            "process_doc_task",
            &task.id.to_string(),
            &self.executor_id.to_string(),
        );
        self.process_inner(task).instrument(span).await;
    }

    async fn process_inner(&self, task: DocumentLintTask) {
        let _beat = spawn_doc_heartbeat(
            self.store.clone(),
            task.id,
            self.executor_id,
            self.heartbeat_interval,
        );

        let started = Utc::now();
        let writeback = match self.lint_document(&task).await {
            Ok(writeback) => writeback,
            Err(failure) => {
                tracing::warn!(details = %failure.details, "document task failed");
                self.failure_writeback(&task, failure)
            }
        };

        let status = writeback.status;
        if let Err(error) = self.store.save_lint_result(&writeback).await {
            // The heartbeat has stopped by the time we return; the lease
            // will lapse and a sibling worker re-claims the task.
            tracing::error!(%error, task_id = %task.id, "lint result writeback failed");
            return;
        }

        let elapsed = Utc::now().signed_duration_since(started);
        self.metrics
            .observe_lint_duration(elapsed.num_milliseconds() as f64 / 1000.0);
        self.metrics.record_task_terminal("doc", status.as_label());
        tracing::info!(task_id = %task.id, status = %status, "document task finished");
    }

    /// The fallible middle of processing; every error is task-local.
    async fn lint_document(&self, task: &DocumentLintTask) -> Result<DocTaskWriteback, DocFailure> {
        let Some(ruleset_id) = task.ruleset_id else {
            return Err(DocFailure::before_download("no ruleset assigned"));
        };

        let raw = self
            .hub
            .get_document_raw(&task.package_id, &task.version_ref(), &task.file_slug)
            .await
            .map_err(|e| DocFailure::before_download(format!("failed to download document: {e}")))?;

        if raw.is_empty() {
            return Err(DocFailure::before_download("document data is empty"));
        }

        let data_hash = hex::encode(Sha256::digest(&raw));

        let ruleset = self
            .store
            .get_ruleset(ruleset_id)
            .await
            .map_err(|e| DocFailure::with_hash(format!("failed to load ruleset: {e}"), &data_hash))?;

        // Cosmetic transition; a failure here must not abort the lint.
        if let Err(error) = self
            .store
            .update_doc_task_status(task.id, TaskStatus::Linting, "")
            .await
        {
            tracing::warn!(%error, task_id = %task.id, "linting transition skipped");
        }

        let report = match task.linter {
            LinterKind::Spectral => self
                .linter
                .lint(&raw, &task.file_slug, &ruleset.data, &ruleset.file_name)
                .await
                .map_err(|e| DocFailure::with_hash(format!("linting failed: {e}"), &data_hash))?,
            LinterKind::Vacuum | LinterKind::Unknown => {
                return Err(DocFailure::with_hash(
                    format!("linter {} not supported", task.linter),
                    &data_hash,
                ));
            }
        };

        Ok(DocTaskWriteback {
            doc_task_id: task.id,
            executor_id: self.executor_id,
            status: TaskStatus::Complete,
            details: String::new(),
            lint_time_ms: report.elapsed_ms,
            version_row: in_progress_version_row(task),
            doc_row: LintedDocument {
                package_id: task.package_id.clone(),
                version: task.version.clone(),
                revision: task.revision,
                file_id: task.file_id.clone(),
                ruleset_id,
                slug: task.file_slug.clone(),
                api_type: task.api_type.clone(),
                data_hash: data_hash.clone(),
                lint_status: DocLintStatus::Success,
                lint_details: String::new(),
            },
            result_row: Some(LintFileResult {
                data_hash,
                ruleset_id,
                linter_version: self.linter.version().to_string(),
                data: report.raw,
                summary: report.summary,
            }),
        })
    }

    /// Builds the terminal `error` writeback for a task-local failure.
    fn failure_writeback(&self, task: &DocumentLintTask, failure: DocFailure) -> DocTaskWriteback {
        let ruleset_id = task
            .ruleset_id
            .unwrap_or_else(|| RulesetId::from_uuid(Uuid::nil()));
        DocTaskWriteback {
            doc_task_id: task.id,
            executor_id: self.executor_id,
            status: TaskStatus::Error,
            details: failure.details.clone(),
            lint_time_ms: 0,
            version_row: in_progress_version_row(task),
            doc_row: LintedDocument {
                package_id: task.package_id.clone(),
                version: task.version.clone(),
                revision: task.revision,
                file_id: task.file_id.clone(),
                ruleset_id,
                slug: task.file_slug.clone(),
                api_type: task.api_type.clone(),
                data_hash: failure.data_hash,
                lint_status: DocLintStatus::Error,
                lint_details: failure.details,
            },
            result_row: None,
        }
    }
}

/// Every document writeback marks the version `inProgress`; the roll-up
/// loop resolves the final verdict.
fn in_progress_version_row(task: &DocumentLintTask) -> LintedVersion {
    LintedVersion {
        package_id: task.package_id.clone(),
        version: task.version.clone(),
        revision: task.revision,
        lint_status: VersionLintStatus::InProgress,
        lint_details: String::new(),
        linted_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::memory::InMemoryHub;
    use crate::hub::HubDocument;
    use crate::linter::{FailingLinter, StaticLinter};
    use crate::ruleset::Ruleset;
    use crate::store::memory::InMemoryStore;
    use crate::task::VersionLintTask;

    struct Fixture {
        store: Arc<InMemoryStore>,
        hub: Arc<InMemoryHub>,
        parent: VersionLintTask,
        ruleset_id: RulesetId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(InMemoryHub::new());

        let ruleset = Ruleset::new(
            "oas recommended",
            "openapi-3-0",
            LinterKind::Spectral,
            "ruleset.yaml",
            b"extends: spectral:oas".to_vec(),
        );
        let ruleset_id = ruleset.id;
        store.insert_ruleset(&ruleset).await.unwrap();

        let mut parent = VersionLintTask::new("pkg", "1.0", 1);
        parent.status = TaskStatus::Processing;
        store.insert_version_task(&parent).await.unwrap();

        Fixture {
            store,
            hub,
            parent,
            ruleset_id,
        }
    }

    fn worker(fixture: &Fixture, linter: Arc<dyn DocumentLinter>) -> DocTaskWorker {
        DocTaskWorker::new(
            fixture.store.clone(),
            fixture.hub.clone(),
            linter,
            ExecutorId::generate(),
            Duration::from_secs(5),
            Duration::from_millis(50),
            FlowMetrics::new(),
        )
    }

    async fn seed_doc(fixture: &Fixture, slug: &str, raw: &[u8]) -> DocumentLintTask {
        fixture
            .hub
            .put_document(
                "pkg",
                "1.0@1",
                HubDocument {
                    file_id: format!("file-{slug}"),
                    slug: slug.to_string(),
                    api_type: "openapi-3-0".to_string(),
                    title: None,
                },
                raw.to_vec(),
            )
            .unwrap();

        let task = DocumentLintTask::new(
            &fixture.parent,
            format!("file-{slug}"),
            slug,
            "openapi-3-0",
            LinterKind::Spectral,
            fixture.ruleset_id,
        );
        fixture
            .store
            .save_doc_tasks_and_advance_version(std::slice::from_ref(&task), fixture.parent.id)
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn successful_lint_writes_all_rows() {
        let fixture = fixture().await;
        let task = seed_doc(&fixture, "petstore", b"openapi: 3.0.0").await;
        let worker = worker(
            &fixture,
            Arc::new(StaticLinter::new(br#"[{"severity": 1}]"#.to_vec())),
        );

        worker.tick().await;

        let task = fixture.store.get_doc_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.lint_time_ms >= 1);

        let docs = fixture
            .store
            .get_linted_documents("pkg", "1.0", 1)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].lint_status, DocLintStatus::Success);
        assert!(!docs[0].data_hash.is_empty());

        let version = fixture
            .store
            .get_linted_version("pkg", "1.0", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.lint_status, VersionLintStatus::InProgress);

        let result = fixture
            .store
            .get_lint_file_result(&docs[0].data_hash, fixture.ruleset_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.summary.warning_count, 1);
    }

    #[tokio::test]
    async fn identical_documents_share_one_result_row() {
        let fixture = fixture().await;
        seed_doc(&fixture, "doc-a", b"openapi: 3.0.0").await;
        seed_doc(&fixture, "doc-b", b"openapi: 3.0.0").await;
        let worker = worker(&fixture, Arc::new(StaticLinter::new(b"[]".to_vec())));

        worker.tick().await;

        let docs = fixture
            .store
            .get_linted_documents("pkg", "1.0", 1)
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].data_hash, docs[1].data_hash);
        assert!(fixture
            .store
            .get_lint_file_result(&docs[0].data_hash, fixture.ruleset_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn empty_document_fails_with_terminal_record() {
        let fixture = fixture().await;
        let task = seed_doc(&fixture, "empty", b"").await;
        let worker = worker(&fixture, Arc::new(StaticLinter::new(b"[]".to_vec())));

        worker.tick().await;

        let task = fixture.store.get_doc_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.details, "document data is empty");

        let docs = fixture
            .store
            .get_linted_documents("pkg", "1.0", 1)
            .await
            .unwrap();
        assert_eq!(docs[0].lint_status, DocLintStatus::Error);
        assert_eq!(docs[0].data_hash, "");
    }

    #[tokio::test]
    async fn download_failure_still_finalizes_the_task() {
        let fixture = fixture().await;
        let task = seed_doc(&fixture, "flaky", b"openapi: 3.0.0").await;
        fixture.hub.fail_raw_download("flaky").unwrap();
        let worker = worker(&fixture, Arc::new(StaticLinter::new(b"[]".to_vec())));

        worker.tick().await;

        let task = fixture.store.get_doc_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.details.contains("failed to download document"));
    }

    #[tokio::test]
    async fn linter_crash_is_task_local() {
        let fixture = fixture().await;
        let task = seed_doc(&fixture, "petstore", b"openapi: 3.0.0").await;
        let worker = worker(&fixture, Arc::new(FailingLinter::new("spectral crashed")));

        worker.tick().await;

        let task = fixture.store.get_doc_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.details.contains("linting failed"));

        let docs = fixture
            .store
            .get_linted_documents("pkg", "1.0", 1)
            .await
            .unwrap();
        // The hash was computed before the linter ran, so it is recorded
        // even though no result row exists.
        assert!(!docs[0].data_hash.is_empty());
        assert!(fixture
            .store
            .get_lint_file_result(&docs[0].data_hash, fixture.ruleset_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unsupported_linter_tag_fails_the_task() {
        let fixture = fixture().await;
        fixture
            .hub
            .put_document(
                "pkg",
                "1.0@1",
                HubDocument {
                    file_id: "f1".to_string(),
                    slug: "vac".to_string(),
                    api_type: "openapi-3-0".to_string(),
                    title: None,
                },
                b"openapi: 3.0.0".to_vec(),
            )
            .unwrap();
        let mut task = DocumentLintTask::new(
            &fixture.parent,
            "f1",
            "vac",
            "openapi-3-0",
            LinterKind::Spectral,
            fixture.ruleset_id,
        );
        task.linter = LinterKind::Vacuum;
        let id = task.id;
        fixture
            .store
            .save_doc_tasks_and_advance_version(&[task], fixture.parent.id)
            .await
            .unwrap();

        let worker = worker(&fixture, Arc::new(StaticLinter::new(b"[]".to_vec())));
        worker.tick().await;

        let task = fixture.store.get_doc_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.details, "linter vacuum not supported");
    }
}
