//! Version-task worker.
//!
//! Two entry points feed the same processing path: the fast path (ingress
//! wakes the worker with a pre-leased task id) and the slow path (the poll
//! tick claims tasks whose producer crashed or whose lease expired). Fan-
//! out enumerates the version's documents, pre-assigns a linter and
//! ruleset per document, and advances the parent to `waiting_for_docs`;
//! the worker never blocks waiting for its children.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use apilint_core::{ExecutorId, VersionTaskId};

use crate::heartbeat::spawn_version_heartbeat;
use crate::hub::ApiHubClient;
use crate::metrics::FlowMetrics;
use crate::ruleset::{select_ruleset, LinterKind, RulesetChoice};
use crate::store::TaskStore;
use crate::task::{DocumentLintTask, TaskStatus, VersionLintTask};

use super::DrainGuard;

/// Background loop that fans version tasks out into document tasks.
pub struct VersionTaskWorker {
    store: Arc<dyn TaskStore>,
    hub: Arc<dyn ApiHubClient>,
    executor_id: ExecutorId,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    metrics: FlowMetrics,
    guard: DrainGuard,
    wake: mpsc::Receiver<VersionTaskId>,
}

impl std::fmt::Debug for VersionTaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionTaskWorker")
            .field("executor_id", &self.executor_id)
            .finish_non_exhaustive()
    }
}

impl VersionTaskWorker {
    /// Creates a worker; `wake` is the fast-path channel fed by ingress.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        hub: Arc<dyn ApiHubClient>,
        executor_id: ExecutorId,
        poll_interval: Duration,
        heartbeat_interval: Duration,
        metrics: FlowMetrics,
        wake: mpsc::Receiver<VersionTaskId>,
    ) -> Self {
        Self {
            store,
            hub,
            executor_id,
            poll_interval,
            heartbeat_interval,
            metrics,
            guard: DrainGuard::new(),
            wake,
        }
    }

    /// Runs the fan-out loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut wake_open = true;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                woken = self.wake.recv(), if wake_open => {
                    match woken {
                        Some(task_id) => {
                            if let Err(panic) =
                                AssertUnwindSafe(self.process(task_id)).catch_unwind().await
                            {
                                let message = super::panic_message(panic.as_ref());
                                tracing::error!(panic = %message, "fan-out panicked");
                            }
                        }
                        None => wake_open = false,
                    }
                }
                _ = ticker.tick() => {
                    if let Err(panic) = AssertUnwindSafe(self.poll()).catch_unwind().await {
                        let message = super::panic_message(panic.as_ref());
                        tracing::error!(panic = %message, "version tick panicked");
                    }
                }
            }
        }
        tracing::info!(executor_id = %self.executor_id, "version worker stopped");
    }

    /// Slow path: claim unowned or expired-lease version tasks.
    async fn poll(&self) {
        let Some(_pass) = self.guard.try_enter() else {
            return;
        };

        loop {
            match self.store.claim_free_version_task(self.executor_id).await {
                Ok(Some(task)) => {
                    self.metrics.record_claim("version", true);
                    self.process(task.id).await;
                }
                Ok(None) => {
                    self.metrics.record_claim("version", false);
                    break;
                }
                Err(error) => {
                    tracing::warn!(%error, "version task claim failed");
                    break;
                }
            }
        }
    }

    /// Processes one version task: list documents, select linters, fan out.
    pub async fn process(&self, task_id: VersionTaskId) {
        let task = match self.store.get_version_task(task_id).await {
            Ok(task) => task,
            Err(error) => {
                tracing::warn!(%error, %task_id, "version task read failed");
                return;
            }
        };

        if task.status.is_terminal() || task.status == TaskStatus::WaitingForDocs {
            return;
        }
        // Only the lease owner may advance the task; anything else goes
        // through the dispatcher.
        if task.executor_id != Some(self.executor_id) {
            return;
        }

        let span = apilint_core::observability::pipeline_span(
            "fan_out",
            &task.package_id,
            &task.version,
            task.revision,
        );
        self.fan_out(task).instrument(span).await;
    }

    async fn fan_out(&self, task: VersionLintTask) {
        let task_id = task.id;
        if let Err(error) = self
            .store
            .update_version_task_status(task_id, TaskStatus::Processing, "")
            .await
        {
            tracing::warn!(%error, %task_id, "version task transition failed");
            return;
        }

        let _beat = spawn_version_heartbeat(
            self.store.clone(),
            task_id,
            self.executor_id,
            self.heartbeat_interval,
        );

        let documents = match self
            .hub
            .get_version_documents(&task.package_id, &task.version_ref())
            .await
        {
            Ok(documents) => documents,
            Err(error) => {
                let details = format!("failed to list version documents: {error}");
                tracing::warn!(%error, %task_id, "fan-out aborted");
                if let Err(error) = self
                    .store
                    .update_version_task_status(task_id, TaskStatus::Error, &details)
                    .await
                {
                    tracing::error!(%error, %task_id, "version task error writeback failed");
                }
                self.metrics.record_task_terminal("version", "error");
                return;
            }
        };

        let mut choices: HashMap<String, RulesetChoice> = HashMap::new();
        let mut doc_tasks = Vec::with_capacity(documents.len());

        for document in documents {
            let choice = if let Some(choice) = choices.get(&document.api_type) {
                *choice
            } else {
                match select_ruleset(self.store.as_ref(), &document.api_type).await {
                    Ok(choice) => {
                        choices.insert(document.api_type.clone(), choice);
                        choice
                    }
                    Err(error) => {
                        doc_tasks.push(DocumentLintTask::pre_failed(
                            &task,
                            document.file_id,
                            document.slug,
                            document.api_type,
                            LinterKind::Unknown,
                            self.executor_id,
                            format!("ruleset selection failed: {error}"),
                        ));
                        continue;
                    }
                }
            };

            doc_tasks.push(build_doc_task(
                &task,
                self.executor_id,
                document.file_id,
                document.slug,
                document.api_type,
                choice,
            ));
        }

        let fanned_out = doc_tasks.len();
        if let Err(error) = self
            .store
            .save_doc_tasks_and_advance_version(&doc_tasks, task_id)
            .await
        {
            tracing::error!(%error, %task_id, "fan-out persistence failed");
            return;
        }
        tracing::info!(%task_id, fanned_out, "version task fanned out");
    }
}

fn build_doc_task(
    parent: &VersionLintTask,
    executor_id: ExecutorId,
    file_id: String,
    slug: String,
    api_type: String,
    choice: RulesetChoice,
) -> DocumentLintTask {
    match choice {
        RulesetChoice::Lint { linter, ruleset_id } => {
            DocumentLintTask::new(parent, file_id, slug, api_type, linter, ruleset_id)
        }
        RulesetChoice::NoActiveRuleset { linter } => {
            let details = format!("no active ruleset for api type {api_type}");
            DocumentLintTask::pre_failed(
                parent, file_id, slug, api_type, linter, executor_id, details,
            )
        }
        RulesetChoice::Unsupported => {
            let linter = LinterKind::Unknown;
            let details = format!("linter {linter} not supported");
            DocumentLintTask::pre_failed(
                parent, file_id, slug, api_type, linter, executor_id, details,
            )
        }
    }
}
