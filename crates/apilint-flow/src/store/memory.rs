//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a thread-safe in-memory
//! implementation of the [`TaskStore`] trait suitable for tests and
//! development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: Claims are serialized behind one write lock,
//!   which gives the same mutual-exclusion contract as the skip-locked
//!   Postgres claim, but only within this process

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use apilint_core::{DocTaskId, ExecutorId, RulesetId, VersionTaskId};

use super::{
    DocTaskWriteback, LintFileResult, LintedDocument, LintedVersion, TaskStore, VersionLintStatus,
};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::ruleset::{LinterKind, Ruleset, RulesetStatus};
use crate::task::{DocumentLintTask, TaskStatus, VersionLintTask, MAX_RESTARTS};

/// Default lease TTL used when none is configured.
const DEFAULT_LEASE_TTL_SECS: i64 = 30;

#[derive(Debug, Default)]
struct Inner {
    version_tasks: HashMap<VersionTaskId, VersionLintTask>,
    doc_tasks: HashMap<DocTaskId, DocumentLintTask>,
    event_index: HashMap<String, VersionTaskId>,
    rulesets: HashMap<RulesetId, Ruleset>,
    linted_versions: HashMap<(String, String, i32), LintedVersion>,
    linted_documents: HashMap<(String, String, i32, String, RulesetId), LintedDocument>,
    lint_results: HashMap<(String, RulesetId), LintFileResult>,
}

/// In-memory store for testing.
#[derive(Debug)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    lease_ttl: Duration,
    metrics: FlowMetrics,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

fn doc_key(row: &LintedDocument) -> (String, String, i32, String, RulesetId) {
    (
        row.package_id.clone(),
        row.version.clone(),
        row.revision,
        row.file_id.clone(),
        row.ruleset_id,
    )
}

fn restart_exceeded_details(prior: &str) -> String {
    if prior.is_empty() {
        "Restart count exceeded".to_string()
    } else {
        format!("Restart count exceeded: {prior}")
    }
}

impl InMemoryStore {
    /// Creates a new in-memory store with the default lease TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lease_ttl(Duration::seconds(DEFAULT_LEASE_TTL_SECS))
    }

    /// Creates a store with a custom lease TTL.
    ///
    /// Use this to test stale-lease re-claims with short expiries.
    #[must_use]
    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            lease_ttl,
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the number of version tasks currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn version_task_count(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.version_tasks.len())
    }

    /// Returns the number of document tasks currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn doc_task_count(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.doc_tasks.len())
    }

    /// Rewinds a document task's `last_active`, simulating a stalled lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the task is unknown.
    pub fn backdate_doc_task(&self, id: DocTaskId, last_active: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let task = inner
            .doc_tasks
            .get_mut(&id)
            .ok_or(Error::DocTaskNotFound { task_id: id })?;
        task.last_active = Some(last_active);
        Ok(())
    }

    /// Rewinds a version task's `last_active`, simulating a stalled lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the task is unknown.
    pub fn backdate_version_task(
        &self,
        id: VersionTaskId,
        last_active: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let task = inner
            .version_tasks
            .get_mut(&id)
            .ok_or(Error::VersionTaskNotFound { task_id: id })?;
        task.last_active = last_active;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert_version_task(&self, task: &VersionLintTask) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        if let Some(event_id) = task.event_id.as_deref().filter(|e| !e.is_empty()) {
            if inner.event_index.contains_key(event_id) {
                return Err(Error::DuplicateEvent {
                    event_id: event_id.to_string(),
                });
            }
            inner
                .event_index
                .insert(event_id.to_string(), task.id);
        }

        inner.version_tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_version_task(&self, id: VersionTaskId) -> Result<VersionLintTask> {
        let inner = self.inner.read().map_err(poison_err)?;
        inner
            .version_tasks
            .get(&id)
            .cloned()
            .ok_or(Error::VersionTaskNotFound { task_id: id })
    }

    async fn update_version_task_status(
        &self,
        id: VersionTaskId,
        status: TaskStatus,
        details: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let task = inner
            .version_tasks
            .get_mut(&id)
            .ok_or(Error::VersionTaskNotFound { task_id: id })?;

        if !task.status.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: task.status.to_string(),
                to: status.to_string(),
                reason: "version task".to_string(),
            });
        }

        task.status = status;
        task.details = details.to_string();
        task.last_active = Utc::now();
        Ok(())
    }

    async fn heartbeat_version_task(
        &self,
        id: VersionTaskId,
        executor_id: ExecutorId,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(task) = inner.version_tasks.get_mut(&id) {
            if task.executor_id == Some(executor_id) {
                task.last_active = Utc::now();
            }
        }
        Ok(())
    }

    async fn claim_free_version_task(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Option<VersionLintTask>> {
        let now = Utc::now();
        let mut inner = self.inner.write().map_err(poison_err)?;

        let mut candidates: Vec<(DateTime<Utc>, VersionTaskId)> = inner
            .version_tasks
            .values()
            .filter(|t| match t.status {
                TaskStatus::NotStarted => {
                    t.executor_id.is_none() || !t.has_live_lease_at(now, self.lease_ttl)
                }
                TaskStatus::Processing => !t.has_live_lease_at(now, self.lease_ttl),
                _ => false,
            })
            .map(|t| (t.created_at, t.id))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            let task = inner
                .version_tasks
                .get_mut(&id)
                .ok_or(Error::VersionTaskNotFound { task_id: id })?;

            // A poisoned row is force-failed and the dispatcher moves on
            // to the next candidate.
            if task.restart_count >= MAX_RESTARTS {
                task.status = TaskStatus::Error;
                task.details = restart_exceeded_details(&task.details);
                task.last_active = now;
                tracing::warn!(task_id = %id, "version task restart budget exhausted");
                self.metrics.record_forced_failure("version");
                continue;
            }

            if task.status == TaskStatus::Processing {
                task.restart_count += 1;
            }
            task.status = TaskStatus::Processing;
            task.executor_id = Some(executor_id);
            task.last_active = now;
            return Ok(Some(task.clone()));
        }
        Ok(None)
    }

    async fn get_waiting_version_tasks(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Vec<VersionLintTask>> {
        let now = Utc::now();
        let inner = self.inner.read().map_err(poison_err)?;
        let mut tasks: Vec<VersionLintTask> = inner
            .version_tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::WaitingForDocs
                    && (t.executor_id == Some(executor_id)
                        || !t.has_live_lease_at(now, self.lease_ttl))
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn finalize_version_task(
        &self,
        id: VersionTaskId,
        status: TaskStatus,
        details: &str,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::storage(format!(
                "finalize requires a terminal status, got {status}"
            )));
        }

        let mut inner = self.inner.write().map_err(poison_err)?;
        let task = inner
            .version_tasks
            .get_mut(&id)
            .ok_or(Error::VersionTaskNotFound { task_id: id })?;

        if task.status == status {
            return Ok(());
        }
        if !task.status.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: task.status.to_string(),
                to: status.to_string(),
                reason: "roll-up finalization".to_string(),
            });
        }

        task.status = status;
        task.details = details.to_string();
        task.last_active = Utc::now();

        let lint_status = if status == TaskStatus::Complete {
            VersionLintStatus::Success
        } else {
            VersionLintStatus::Failed
        };
        let key = (task.package_id.clone(), task.version.clone(), task.revision);
        let row = LintedVersion {
            package_id: key.0.clone(),
            version: key.1.clone(),
            revision: key.2,
            lint_status,
            lint_details: details.to_string(),
            linted_at: Utc::now(),
        };
        inner.linted_versions.insert(key, row);
        Ok(())
    }

    async fn get_doc_task(&self, id: DocTaskId) -> Result<DocumentLintTask> {
        let inner = self.inner.read().map_err(poison_err)?;
        inner
            .doc_tasks
            .get(&id)
            .cloned()
            .ok_or(Error::DocTaskNotFound { task_id: id })
    }

    async fn update_doc_task_status(
        &self,
        id: DocTaskId,
        status: TaskStatus,
        details: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let task = inner
            .doc_tasks
            .get_mut(&id)
            .ok_or(Error::DocTaskNotFound { task_id: id })?;

        if !task.status.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: task.status.to_string(),
                to: status.to_string(),
                reason: "document task".to_string(),
            });
        }

        task.status = status;
        task.details = details.to_string();
        task.last_active = Some(Utc::now());
        Ok(())
    }

    async fn heartbeat_doc_task(&self, id: DocTaskId, executor_id: ExecutorId) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(task) = inner.doc_tasks.get_mut(&id) {
            if task.executor_id == Some(executor_id) {
                task.last_active = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn claim_free_doc_task(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Option<DocumentLintTask>> {
        let now = Utc::now();
        let mut inner = self.inner.write().map_err(poison_err)?;

        let mut candidates: Vec<(DateTime<Utc>, DocTaskId)> = inner
            .doc_tasks
            .values()
            .filter(|t| t.is_claimable_at(now, self.lease_ttl))
            .map(|t| (t.created_at, t.id))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            let task = inner
                .doc_tasks
                .get_mut(&id)
                .ok_or(Error::DocTaskNotFound { task_id: id })?;

            if task.restart_count >= MAX_RESTARTS {
                task.status = TaskStatus::Error;
                task.details = restart_exceeded_details(&task.details);
                task.last_active = Some(now);
                tracing::warn!(task_id = %id, "document task restart budget exhausted");
                self.metrics.record_forced_failure("doc");
                continue;
            }

            if task.status == TaskStatus::Processing {
                task.restart_count += 1;
            }
            task.status = TaskStatus::Processing;
            task.executor_id = Some(executor_id);
            task.last_active = Some(now);
            return Ok(Some(task.clone()));
        }
        Ok(None)
    }

    async fn save_doc_tasks_and_advance_version(
        &self,
        tasks: &[DocumentLintTask],
        version_task_id: VersionTaskId,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        if !inner.version_tasks.contains_key(&version_task_id) {
            return Err(Error::VersionTaskNotFound {
                task_id: version_task_id,
            });
        }

        for task in tasks {
            if task.version_task_id != version_task_id {
                return Err(Error::storage(format!(
                    "document task {} belongs to a different version task",
                    task.id
                )));
            }
            inner.doc_tasks.insert(task.id, task.clone());
        }

        let all_failed = !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Error);
        let (status, details) = if tasks.is_empty() {
            (TaskStatus::Complete, "no documents to lint".to_string())
        } else if all_failed {
            (
                TaskStatus::Error,
                format!("{} doc lint task(s) failed", tasks.len()),
            )
        } else {
            (TaskStatus::WaitingForDocs, String::new())
        };

        let parent = inner
            .version_tasks
            .get_mut(&version_task_id)
            .ok_or(Error::VersionTaskNotFound {
                task_id: version_task_id,
            })?;
        if !parent.status.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: parent.status.to_string(),
                to: status.to_string(),
                reason: "fan-out".to_string(),
            });
        }
        parent.status = status;
        parent.details = details;
        parent.last_active = Utc::now();
        Ok(())
    }

    async fn get_doc_tasks_for_version_tasks(
        &self,
        ids: &[VersionTaskId],
    ) -> Result<Vec<DocumentLintTask>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut tasks: Vec<DocumentLintTask> = inner
            .doc_tasks
            .values()
            .filter(|t| ids.contains(&t.version_task_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn save_lint_result(&self, writeback: &DocTaskWriteback) -> Result<()> {
        if !writeback.status.is_terminal() {
            return Err(Error::storage(format!(
                "writeback requires a terminal status, got {}",
                writeback.status
            )));
        }

        let mut inner = self.inner.write().map_err(poison_err)?;

        let current = inner
            .doc_tasks
            .get(&writeback.doc_task_id)
            .ok_or(Error::DocTaskNotFound {
                task_id: writeback.doc_task_id,
            })?
            .status;

        // A second claimant replaying a completed lifecycle must converge,
        // not fail: rows below are keyed upserts, and the first terminal
        // task status wins.
        if !current.is_terminal() {
            let task = inner
                .doc_tasks
                .get_mut(&writeback.doc_task_id)
                .ok_or(Error::DocTaskNotFound {
                    task_id: writeback.doc_task_id,
                })?;
            task.status = writeback.status;
            task.details = writeback.details.clone();
            task.lint_time_ms = writeback.lint_time_ms;
            task.last_active = Some(Utc::now());
        }

        let version_key = (
            writeback.version_row.package_id.clone(),
            writeback.version_row.version.clone(),
            writeback.version_row.revision,
        );
        inner
            .linted_versions
            .insert(version_key, writeback.version_row.clone());

        inner
            .linted_documents
            .insert(doc_key(&writeback.doc_row), writeback.doc_row.clone());

        if let Some(result) = &writeback.result_row {
            let key = (result.data_hash.clone(), result.ruleset_id);
            inner.lint_results.entry(key).or_insert_with(|| result.clone());
        }

        Ok(())
    }

    async fn insert_ruleset(&self, ruleset: &Ruleset) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        if ruleset.status == RulesetStatus::Active {
            for existing in inner.rulesets.values_mut() {
                if existing.api_type == ruleset.api_type
                    && existing.linter == ruleset.linter
                    && existing.status == RulesetStatus::Active
                {
                    existing.status = RulesetStatus::Inactive;
                    existing.can_be_deleted = true;
                }
            }
        }

        inner.rulesets.insert(ruleset.id, ruleset.clone());
        Ok(())
    }

    async fn get_ruleset(&self, id: RulesetId) -> Result<Ruleset> {
        let inner = self.inner.read().map_err(poison_err)?;
        inner
            .rulesets
            .get(&id)
            .cloned()
            .ok_or(Error::RulesetNotFound { ruleset_id: id })
    }

    async fn get_active_ruleset(
        &self,
        api_type: &str,
        linter: LinterKind,
    ) -> Result<Option<Ruleset>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .rulesets
            .values()
            .find(|r| {
                r.api_type == api_type
                    && r.linter == linter
                    && r.status == RulesetStatus::Active
            })
            .cloned())
    }

    async fn get_linted_version(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
    ) -> Result<Option<LintedVersion>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .linted_versions
            .get(&(package_id.to_string(), version.to_string(), revision))
            .cloned())
    }

    async fn get_linted_documents(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
    ) -> Result<Vec<LintedDocument>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut rows: Vec<LintedDocument> = inner
            .linted_documents
            .values()
            .filter(|d| {
                d.package_id == package_id && d.version == version && d.revision == revision
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(rows)
    }

    async fn get_lint_file_result(
        &self,
        data_hash: &str,
        ruleset_id: RulesetId,
    ) -> Result<Option<LintFileResult>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .lint_results
            .get(&(data_hash.to_string(), ruleset_id))
            .cloned())
    }
}
