//! Pluggable persistence for pipeline state.
//!
//! The [`TaskStore`] trait defines the transactional surface every worker
//! goes through: task claims, lease heartbeats, fan-out, and result
//! writeback. It is the single point of contention between worker
//! processes.
//!
//! ## Design Principles
//!
//! - **Claims are atomic**: `claim_free_*` hands a task to exactly one of N
//!   concurrent workers. The Postgres implementation uses a skip-locked row
//!   read inside an explicit transaction; the in-memory implementation
//!   serializes claims behind a single write lock.
//! - **Writebacks are idempotent**: result rows are keyed upserts, and the
//!   deduplication table is insert-if-absent, so at-least-once execution
//!   never duplicates results.
//! - **Testability**: In-memory implementation for tests, Postgres for
//!   production.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use apilint_core::{DocTaskId, ExecutorId, RulesetId, VersionTaskId};

use crate::error::{Error, Result};
use crate::linter::SeveritySummary;
use crate::ruleset::{LinterKind, Ruleset};
use crate::task::{DocumentLintTask, TaskStatus, VersionLintTask};

/// Version-level lint outcome.
///
/// Transitions monotonically: `inProgress` (written by every document
/// writeback) to `success` or `failed` (written only by the roll-up loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionLintStatus {
    /// At least one document writeback has landed; roll-up pending.
    InProgress,
    /// Every document task completed.
    Success,
    /// At least one document task failed.
    Failed,
}

impl VersionLintStatus {
    /// Returns the storage label for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "inProgress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored label back into a status.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` when the label is unknown.
    pub fn parse_label(label: &str) -> Result<Self> {
        match label {
            "inProgress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(Error::serialization(format!(
                "unknown version lint status '{other}'"
            ))),
        }
    }
}

/// Document-level lint outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocLintStatus {
    /// The document was linted; findings (if any) are in the result row.
    Success,
    /// The document could not be linted.
    Error,
}

impl DocLintStatus {
    /// Returns the storage label for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parses a stored label back into a status.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` when the label is unknown.
    pub fn parse_label(label: &str) -> Result<Self> {
        match label {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(Error::serialization(format!(
                "unknown document lint status '{other}'"
            ))),
        }
    }
}

/// The per-version verdict row, keyed by `(package_id, version, revision)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintedVersion {
    /// Package identifier.
    pub package_id: String,
    /// Version label.
    pub version: String,
    /// Revision number.
    pub revision: i32,
    /// Version-level outcome.
    pub lint_status: VersionLintStatus,
    /// Human-readable detail.
    pub lint_details: String,
    /// Last writeback timestamp.
    pub linted_at: DateTime<Utc>,
}

/// The terminal per-document record, keyed by
/// `(package_id, version, revision, file_id, ruleset_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintedDocument {
    /// Package identifier.
    pub package_id: String,
    /// Version label.
    pub version: String,
    /// Revision number.
    pub revision: i32,
    /// Hub file identifier.
    pub file_id: String,
    /// Ruleset the document was linted against.
    pub ruleset_id: RulesetId,
    /// Hub file slug.
    pub slug: String,
    /// Declared api type.
    pub api_type: String,
    /// SHA-256 of the exact bytes submitted to the linter, hex-encoded.
    /// Empty when the task failed before the download completed.
    pub data_hash: String,
    /// Document-level outcome.
    pub lint_status: DocLintStatus,
    /// Human-readable detail.
    pub lint_details: String,
}

/// The deduplicated report row, keyed by `(data_hash, ruleset_id)`.
///
/// Two documents with identical bytes validated against the same ruleset
/// share one row; writes are insert-if-absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintFileResult {
    /// SHA-256 of the linted bytes, hex-encoded.
    pub data_hash: String,
    /// Ruleset the bytes were linted against.
    pub ruleset_id: RulesetId,
    /// Version of the linter binary that produced the report.
    pub linter_version: String,
    /// Raw report bytes.
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Finding counts by severity.
    pub summary: SeveritySummary,
}

/// Everything a document worker persists when one document task finishes.
///
/// The store applies the whole writeback in a single transaction so readers
/// never observe a task marked `complete` whose result rows are missing.
#[derive(Debug, Clone)]
pub struct DocTaskWriteback {
    /// The finished task.
    pub doc_task_id: DocTaskId,
    /// The executor reporting the result.
    pub executor_id: ExecutorId,
    /// Terminal task status (`Complete` or `Error`).
    pub status: TaskStatus,
    /// Human-readable detail for the task row.
    pub details: String,
    /// Wall-clock linting duration in milliseconds.
    pub lint_time_ms: i64,
    /// Version verdict upsert (always `inProgress` from a doc writeback).
    pub version_row: LintedVersion,
    /// Terminal per-document record upsert.
    pub doc_row: LintedDocument,
    /// Deduplicated report insert; present only on success.
    pub result_row: Option<LintFileResult>,
}

/// Transactional persistence for tasks, rulesets, and lint results.
///
/// All mutating methods operate inside a single database transaction.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // --- Version tasks ---

    /// Inserts a new version task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEvent`] when the task's `event_id`
    /// collides with an existing row.
    async fn insert_version_task(&self, task: &VersionLintTask) -> Result<()>;

    /// Reads a version task by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionTaskNotFound`] when absent.
    async fn get_version_task(&self, id: VersionTaskId) -> Result<VersionLintTask>;

    /// Sets a version task's status and details, bumping `last_active`.
    ///
    /// A same-status update is a lease refresh; any other transition must
    /// be valid in the task state machine.
    async fn update_version_task_status(
        &self,
        id: VersionTaskId,
        status: TaskStatus,
        details: &str,
    ) -> Result<()>;

    /// Refreshes a version task's lease if `executor_id` still owns it.
    ///
    /// A lost lease is not an error; the refresh is silently skipped.
    async fn heartbeat_version_task(&self, id: VersionTaskId, executor_id: ExecutorId)
        -> Result<()>;

    /// Claims one free version task for `executor_id`.
    ///
    /// Selects the oldest claimable row — unclaimed, or carrying an expired
    /// lease — with a row-level lock that skips already-locked rows, and
    /// atomically leases it to the executor in `processing` state. A
    /// selected row whose restart budget is exhausted is force-failed
    /// inside the same transaction and `None` is returned.
    async fn claim_free_version_task(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Option<VersionLintTask>>;

    /// Version tasks in `waiting_for_docs` visible to this executor.
    ///
    /// Returns the executor's own waiting tasks plus any whose lease has
    /// expired, so a crashed producer's versions still get finalized.
    async fn get_waiting_version_tasks(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Vec<VersionLintTask>>;

    /// Finalizes a version task and its verdict row in one transaction.
    ///
    /// `status` must be terminal; the verdict row becomes `success` for
    /// `Complete` and `failed` for `Error`.
    async fn finalize_version_task(
        &self,
        id: VersionTaskId,
        status: TaskStatus,
        details: &str,
    ) -> Result<()>;

    // --- Document tasks ---

    /// Reads a document task by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DocTaskNotFound`] when absent.
    async fn get_doc_task(&self, id: DocTaskId) -> Result<DocumentLintTask>;

    /// Sets a document task's status and details, bumping `last_active`.
    async fn update_doc_task_status(
        &self,
        id: DocTaskId,
        status: TaskStatus,
        details: &str,
    ) -> Result<()>;

    /// Refreshes a document task's lease if `executor_id` still owns it.
    async fn heartbeat_doc_task(&self, id: DocTaskId, executor_id: ExecutorId) -> Result<()>;

    /// Claims one free document task for `executor_id`.
    ///
    /// Claimable means `not_started`, or `processing` with an expired
    /// lease. Re-taking a stale lease increments `restart_count`; a
    /// selected row whose `restart_count` has already reached the budget is
    /// force-failed inside the same transaction and `None` is returned (the
    /// caller simply claims again).
    async fn claim_free_doc_task(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Option<DocumentLintTask>>;

    /// Inserts fan-out document tasks and advances the parent, atomically.
    ///
    /// The parent moves to `waiting_for_docs`, or directly to `error` when
    /// every inserted child is pre-failed. An empty fan-out completes the
    /// parent immediately.
    async fn save_doc_tasks_and_advance_version(
        &self,
        tasks: &[DocumentLintTask],
        version_task_id: VersionTaskId,
    ) -> Result<()>;

    /// Document tasks belonging to any of the given version tasks.
    async fn get_doc_tasks_for_version_tasks(
        &self,
        ids: &[VersionTaskId],
    ) -> Result<Vec<DocumentLintTask>>;

    /// Persists one finished document task in a single transaction.
    ///
    /// Upserts the version verdict and per-document rows, inserts the
    /// deduplicated report iff absent, and moves the task to its terminal
    /// status. Idempotent: replaying the same writeback converges to the
    /// same state.
    async fn save_lint_result(&self, writeback: &DocTaskWriteback) -> Result<()>;

    // --- Ruleset catalogue ---

    /// Inserts a ruleset; an `active` insert deactivates the previous
    /// active ruleset for the same (api type, linter) in the same
    /// transaction.
    async fn insert_ruleset(&self, ruleset: &Ruleset) -> Result<()>;

    /// Reads a ruleset by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RulesetNotFound`] when absent.
    async fn get_ruleset(&self, id: RulesetId) -> Result<Ruleset>;

    /// The active ruleset for an (api type, linter) pair, if any.
    async fn get_active_ruleset(
        &self,
        api_type: &str,
        linter: LinterKind,
    ) -> Result<Option<Ruleset>>;

    // --- Result reads ---

    /// The version verdict row, if written.
    async fn get_linted_version(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
    ) -> Result<Option<LintedVersion>>;

    /// All per-document records for a version.
    async fn get_linted_documents(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
    ) -> Result<Vec<LintedDocument>>;

    /// The deduplicated report row for `(data_hash, ruleset_id)`, if any.
    async fn get_lint_file_result(
        &self,
        data_hash: &str,
        ruleset_id: RulesetId,
    ) -> Result<Option<LintFileResult>>;
}
