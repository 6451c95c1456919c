//! Roll-up loop.
//!
//! Purely observational: it never inspects linter output, only child task
//! statuses. Every tick it correlates `waiting_for_docs` version tasks
//! with their document tasks and finalizes the parent once every child is
//! terminal.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;

use apilint_core::{ExecutorId, VersionTaskId};

use crate::metrics::FlowMetrics;
use crate::store::TaskStore;
use crate::task::TaskStatus;

/// Child status counts for one waiting version task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChildCounts {
    not_ready: usize,
    failed: usize,
    succeeded: usize,
}

/// Background loop that aggregates document outcomes into version verdicts.
pub struct RollupLoop {
    store: Arc<dyn TaskStore>,
    executor_id: ExecutorId,
    poll_interval: Duration,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for RollupLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupLoop")
            .field("executor_id", &self.executor_id)
            .finish_non_exhaustive()
    }
}

impl RollupLoop {
    /// Creates a roll-up loop bound to this process's executor id.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor_id: ExecutorId,
        poll_interval: Duration,
        metrics: FlowMetrics,
    ) -> Self {
        Self {
            store,
            executor_id,
            poll_interval,
            metrics,
        }
    }

    /// Runs the roll-up loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match AssertUnwindSafe(self.tick()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => tracing::warn!(%error, "roll-up tick failed"),
                        Err(panic) => {
                            let message = super::panic_message(panic.as_ref());
                            tracing::error!(panic = %message, "roll-up tick panicked");
                        }
                    }
                }
            }
        }
        tracing::info!(executor_id = %self.executor_id, "roll-up loop stopped");
    }

    /// One roll-up pass over the waiting version tasks.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the batch reads; per-task finalization
    /// failures are logged and skipped so one bad row cannot stall the
    /// rest.
    pub async fn tick(&self) -> crate::error::Result<()> {
        let waiting = self.store.get_waiting_version_tasks(self.executor_id).await?;
        if waiting.is_empty() {
            return Ok(());
        }

        let ids: Vec<VersionTaskId> = waiting.iter().map(|t| t.id).collect();
        let children = self.store.get_doc_tasks_for_version_tasks(&ids).await?;

        let mut counts: HashMap<VersionTaskId, ChildCounts> = HashMap::new();
        for child in &children {
            let entry = counts.entry(child.version_task_id).or_default();
            match child.status {
                TaskStatus::Error => entry.failed += 1,
                TaskStatus::Complete => entry.succeeded += 1,
                _ => entry.not_ready += 1,
            }
        }

        for task in waiting {
            let ChildCounts {
                not_ready,
                failed,
                succeeded,
            } = counts.get(&task.id).copied().unwrap_or_default();

            if not_ready > 0 {
                // Still waiting: refresh the lease so the task is not
                // considered abandoned.
                if let Err(error) = self
                    .store
                    .heartbeat_version_task(task.id, self.executor_id)
                    .await
                {
                    tracing::warn!(%error, task_id = %task.id, "waiting refresh failed");
                }
                continue;
            }

            let (status, details) = if failed > 0 {
                (TaskStatus::Error, format!("{failed} doc lint task(s) failed"))
            } else {
                (TaskStatus::Complete, String::new())
            };

            match self
                .store
                .finalize_version_task(task.id, status, &details)
                .await
            {
                Ok(()) => {
                    self.metrics.record_rollup_finalized(status.as_label());
                    self.metrics.record_task_terminal("version", status.as_label());
                    tracing::info!(
                        task_id = %task.id,
                        status = %status,
                        succeeded,
                        failed,
                        "version task finalized"
                    );
                }
                Err(error) => {
                    tracing::warn!(%error, task_id = %task.id, "finalization failed");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruleset::LinterKind;
    use crate::store::memory::InMemoryStore;
    use crate::store::VersionLintStatus;
    use crate::task::{DocumentLintTask, VersionLintTask};
    use apilint_core::RulesetId;

    struct Fixture {
        store: Arc<InMemoryStore>,
        executor_id: ExecutorId,
    }

    impl Fixture {
        fn rollup(&self) -> RollupLoop {
            RollupLoop::new(
                self.store.clone(),
                self.executor_id,
                Duration::from_secs(5),
                FlowMetrics::new(),
            )
        }

        /// Inserts a waiting version task with children in the given
        /// statuses.
        async fn waiting_version(&self, child_statuses: &[TaskStatus]) -> VersionLintTask {
            let mut parent = VersionLintTask::new("pkg", "1.0", 1);
            parent.status = TaskStatus::Processing;
            parent.executor_id = Some(self.executor_id);
            self.store.insert_version_task(&parent).await.unwrap();

            let children: Vec<DocumentLintTask> = child_statuses
                .iter()
                .enumerate()
                .map(|(i, status)| {
                    let mut child = DocumentLintTask::new(
                        &parent,
                        format!("f{i}"),
                        format!("slug-{i}"),
                        "openapi-3-0",
                        LinterKind::Spectral,
                        RulesetId::generate(),
                    );
                    child.status = *status;
                    child
                })
                .collect();
            self.store
                .save_doc_tasks_and_advance_version(&children, parent.id)
                .await
                .unwrap();
            parent
        }
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(InMemoryStore::new()),
            executor_id: ExecutorId::generate(),
        }
    }

    #[tokio::test]
    async fn all_children_complete_finalizes_success() {
        let fixture = fixture();
        let parent = fixture
            .waiting_version(&[TaskStatus::Complete, TaskStatus::Complete])
            .await;

        fixture.rollup().tick().await.unwrap();

        let task = fixture.store.get_version_task(parent.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Complete);

        let verdict = fixture
            .store
            .get_linted_version("pkg", "1.0", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verdict.lint_status, VersionLintStatus::Success);
    }

    #[tokio::test]
    async fn any_failed_child_finalizes_failure_once_all_terminal() {
        let fixture = fixture();
        let parent = fixture
            .waiting_version(&[TaskStatus::Complete, TaskStatus::Error])
            .await;

        fixture.rollup().tick().await.unwrap();

        let task = fixture.store.get_version_task(parent.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.details, "1 doc lint task(s) failed");

        let verdict = fixture
            .store
            .get_linted_version("pkg", "1.0", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verdict.lint_status, VersionLintStatus::Failed);
        assert_eq!(verdict.lint_details, "1 doc lint task(s) failed");
    }

    #[tokio::test]
    async fn pending_children_keep_the_version_waiting() {
        let fixture = fixture();
        let parent = fixture
            .waiting_version(&[TaskStatus::Complete, TaskStatus::NotStarted])
            .await;

        let before = fixture.store.get_version_task(parent.id).await.unwrap();
        let stale = before.last_active - chrono::Duration::seconds(10);
        fixture.store.backdate_version_task(parent.id, stale).unwrap();

        fixture.rollup().tick().await.unwrap();

        let task = fixture.store.get_version_task(parent.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::WaitingForDocs);
        // The lease was refreshed while waiting.
        assert!(task.last_active > stale);
    }

    #[tokio::test]
    async fn linting_children_count_as_not_ready() {
        let fixture = fixture();
        let parent = fixture
            .waiting_version(&[TaskStatus::Linting, TaskStatus::Error])
            .await;

        fixture.rollup().tick().await.unwrap();

        let task = fixture.store.get_version_task(parent.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::WaitingForDocs);
    }

    #[tokio::test]
    async fn other_executors_waiting_tasks_are_left_alone() {
        let fixture = fixture();
        let mut parent = VersionLintTask::new("pkg", "1.0", 1);
        parent.status = TaskStatus::WaitingForDocs;
        parent.executor_id = Some(ExecutorId::generate());
        fixture.store.insert_version_task(&parent).await.unwrap();

        fixture.rollup().tick().await.unwrap();

        let task = fixture.store.get_version_task(parent.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::WaitingForDocs);
    }
}
