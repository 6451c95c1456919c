//! Task state and lifecycle management for the two-level task model.
//!
//! This module provides:
//! - `TaskStatus`: the state machine shared by version and document tasks
//! - `VersionLintTask`: one publish event's worth of work
//! - `DocumentLintTask`: one document linted against one ruleset
//! - Lease predicates used by the work-stealing dispatcher

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use apilint_core::{DocTaskId, ExecutorId, RulesetId, VersionTaskId};

use crate::error::{Error, Result};
use crate::ruleset::LinterKind;

/// The number of re-claims a task may undergo before being poisoned.
///
/// A task whose `restart_count` has reached this value and which re-enters
/// the dispatcher is force-failed instead of being claimed again.
pub const MAX_RESTARTS: i32 = 2;

/// Task execution state machine shared by version and document tasks.
///
/// States follow a directed graph:
/// ```text
///                     version task path
/// ┌─────────────┐   ┌────────────┐   ┌──────────────────┐   ┌──────────┐
/// │ NOT_STARTED │──►│ PROCESSING │──►│ WAITING_FOR_DOCS │──►│ COMPLETE │
/// └─────────────┘   └────────────┘   └──────────────────┘   └──────────┘
///        │                │                    │                  ▲
///        │                │                    ▼                  │
///        │                │               ┌───────┐              │
///        └────────────────┴──────────────►│ ERROR │              │
///                                         └───────┘              │
///                     document task path                          │
/// ┌─────────────┐   ┌────────────┐   ┌─────────┐                 │
/// │ NOT_STARTED │──►│ PROCESSING │──►│ LINTING │─────────────────┘
/// └─────────────┘   └────────────┘   └─────────┘
/// ```
///
/// `COMPLETE` and `ERROR` are terminal. A `PROCESSING` row whose lease has
/// expired is claimable again; the dispatcher handles that outside the
/// transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for an executor to claim it.
    NotStarted,
    /// Claimed by an executor and being worked on.
    Processing,
    /// Document task handed to the linter subprocess.
    Linting,
    /// Version task fanned out; waiting for child document tasks.
    WaitingForDocs,
    /// Finished successfully.
    Complete,
    /// Finished with a terminal failure.
    Error,
}

impl TaskStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Returns true if the roll-up loop counts this state as not yet ready.
    #[must_use]
    pub const fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Self::NotStarted | Self::Processing | Self::Linting | Self::WaitingForDocs
        )
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Same-state "transitions" are refreshes (lease renewal) and are
    /// always permitted for non-terminal states.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        if *self == target {
            return !self.is_terminal();
        }
        match self {
            Self::NotStarted => matches!(target, Self::Processing | Self::Error),
            Self::Processing => matches!(
                target,
                Self::Linting | Self::WaitingForDocs | Self::Complete | Self::Error
            ),
            Self::Linting => matches!(target, Self::Complete | Self::Error),
            Self::WaitingForDocs => matches!(target, Self::Complete | Self::Error),
            Self::Complete | Self::Error => false,
        }
    }

    /// Returns a lowercase label suitable for metrics, logs, and storage.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Processing => "processing",
            Self::Linting => "linting",
            Self::WaitingForDocs => "waiting_for_docs",
            Self::Complete => "complete",
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
            "not_started" => Ok(Self::NotStarted),
            "processing" => Ok(Self::Processing),
            "linting" => Ok(Self::Linting),
            "waiting_for_docs" => Ok(Self::WaitingForDocs),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(Error::serialization(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// One publish event's worth of validation work.
///
/// Created by ingress, claimed by a version worker, fanned out into
/// document tasks, and finalized by the roll-up loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionLintTask {
    /// Task identifier.
    pub id: VersionTaskId,
    /// Package whose version is being validated.
    pub package_id: String,
    /// Version label.
    pub version: String,
    /// Resolved revision number (always ≥ 1 once ingested).
    pub revision: i32,
    /// Idempotency key for publish-triggered validation, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Current state.
    pub status: TaskStatus,
    /// Human-readable detail for the current state.
    pub details: String,
    /// Creation timestamp; claim order is FIFO on this value.
    pub created_at: DateTime<Utc>,
    /// Executor currently holding the lease, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    /// Last lease refresh.
    pub last_active: DateTime<Utc>,
    /// Number of times the task has been re-claimed after a stale lease.
    pub restart_count: i32,
}

impl VersionLintTask {
    /// Creates a new unclaimed version task.
    #[must_use]
    pub fn new(package_id: impl Into<String>, version: impl Into<String>, revision: i32) -> Self {
        let now = Utc::now();
        Self {
            id: VersionTaskId::generate(),
            package_id: package_id.into(),
            version: version.into(),
            revision,
            event_id: None,
            status: TaskStatus::NotStarted,
            details: String::new(),
            created_at: now,
            executor_id: None,
            last_active: now,
            restart_count: 0,
        }
    }

    /// Sets the idempotency event id.
    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Pre-leases the task to an executor at creation time.
    ///
    /// Ingress uses this so the creating process can start fan-out
    /// immediately without going through the dispatcher.
    #[must_use]
    pub fn claimed_by(mut self, executor_id: ExecutorId) -> Self {
        self.executor_id = Some(executor_id);
        self
    }

    /// Returns true if an executor holds a live lease at `now`.
    #[must_use]
    pub fn has_live_lease_at(&self, now: DateTime<Utc>, lease_ttl: Duration) -> bool {
        self.executor_id.is_some() && now.signed_duration_since(self.last_active) < lease_ttl
    }

    /// Returns the `version@revision` reference used by the API Hub.
    #[must_use]
    pub fn version_ref(&self) -> String {
        format!("{}@{}", self.version, self.revision)
    }
}

/// One unit of work: lint one document against one ruleset with one linter.
///
/// Every document task references exactly one parent version task; the
/// parent must exist when the child is inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLintTask {
    /// Task identifier.
    pub id: DocTaskId,
    /// Parent version task.
    pub version_task_id: VersionTaskId,
    /// Package whose document is being linted.
    pub package_id: String,
    /// Version label.
    pub version: String,
    /// Resolved revision number.
    pub revision: i32,
    /// Hub file identifier.
    pub file_id: String,
    /// Hub file slug, used for raw downloads.
    pub file_slug: String,
    /// The document's declared api type (hub vocabulary, e.g. `openapi-3-0`).
    pub api_type: String,
    /// Linter pre-assigned at fan-out.
    pub linter: LinterKind,
    /// Ruleset pre-assigned at fan-out; absent for pre-failed tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ruleset_id: Option<RulesetId>,
    /// Current state.
    pub status: TaskStatus,
    /// Human-readable detail for the current state.
    pub details: String,
    /// Creation timestamp; claim order is FIFO on this value.
    pub created_at: DateTime<Utc>,
    /// Executor currently holding the lease, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    /// Last lease refresh; unset until first claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
    /// Number of times the task has been re-claimed after a stale lease.
    pub restart_count: i32,
    /// Wall-clock linting duration in milliseconds, once linted.
    pub lint_time_ms: i64,
}

impl DocumentLintTask {
    /// Creates a new unclaimed document task under a parent version task.
    #[must_use]
    pub fn new(
        parent: &VersionLintTask,
        file_id: impl Into<String>,
        file_slug: impl Into<String>,
        api_type: impl Into<String>,
        linter: LinterKind,
        ruleset_id: RulesetId,
    ) -> Self {
        Self {
            id: DocTaskId::generate(),
            version_task_id: parent.id,
            package_id: parent.package_id.clone(),
            version: parent.version.clone(),
            revision: parent.revision,
            file_id: file_id.into(),
            file_slug: file_slug.into(),
            api_type: api_type.into(),
            linter,
            ruleset_id: Some(ruleset_id),
            status: TaskStatus::NotStarted,
            details: String::new(),
            created_at: Utc::now(),
            executor_id: None,
            last_active: None,
            restart_count: 0,
            lint_time_ms: 0,
        }
    }

    /// Creates a document task that is terminal from birth.
    ///
    /// Used at fan-out when no linter or no active ruleset matched: the
    /// task records why it cannot run and never enters the dispatcher.
    #[must_use]
    pub fn pre_failed(
        parent: &VersionLintTask,
        file_id: impl Into<String>,
        file_slug: impl Into<String>,
        api_type: impl Into<String>,
        linter: LinterKind,
        executor_id: ExecutorId,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: DocTaskId::generate(),
            version_task_id: parent.id,
            package_id: parent.package_id.clone(),
            version: parent.version.clone(),
            revision: parent.revision,
            file_id: file_id.into(),
            file_slug: file_slug.into(),
            api_type: api_type.into(),
            linter,
            ruleset_id: None,
            status: TaskStatus::Error,
            details: details.into(),
            created_at: Utc::now(),
            executor_id: Some(executor_id),
            last_active: Some(Utc::now()),
            restart_count: 0,
            lint_time_ms: 0,
        }
    }

    /// Returns the `version@revision` reference used by the API Hub.
    #[must_use]
    pub fn version_ref(&self) -> String {
        format!("{}@{}", self.version, self.revision)
    }

    /// Returns true if the task can be handed to an executor at `now`.
    ///
    /// Claimable means either never claimed, or claimed but with a lease
    /// whose `last_active` is older than `lease_ttl`.
    #[must_use]
    pub fn is_claimable_at(&self, now: DateTime<Utc>, lease_ttl: Duration) -> bool {
        match self.status {
            TaskStatus::NotStarted => true,
            TaskStatus::Processing => self.is_lease_expired_at(now, lease_ttl),
            _ => false,
        }
    }

    /// Returns true if the lease has expired at `now`.
    ///
    /// A claimed row without `last_active` counts as expired; it can only
    /// arise from a writer that died between claim and first heartbeat.
    #[must_use]
    pub fn is_lease_expired_at(&self, now: DateTime<Utc>, lease_ttl: Duration) -> bool {
        self.last_active
            .is_none_or(|last| now.signed_duration_since(last) >= lease_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::WaitingForDocs.is_terminal());
    }

    #[test]
    fn not_ready_states_match_rollup_contract() {
        for status in [
            TaskStatus::NotStarted,
            TaskStatus::Processing,
            TaskStatus::Linting,
            TaskStatus::WaitingForDocs,
        ] {
            assert!(status.is_not_ready(), "{status} should be not-ready");
        }
        assert!(!TaskStatus::Complete.is_not_ready());
        assert!(!TaskStatus::Error.is_not_ready());
    }

    #[test]
    fn version_task_progression_is_valid() {
        assert!(TaskStatus::NotStarted.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::WaitingForDocs));
        assert!(TaskStatus::WaitingForDocs.can_transition_to(TaskStatus::Complete));
        assert!(TaskStatus::WaitingForDocs.can_transition_to(TaskStatus::Error));
    }

    #[test]
    fn doc_task_progression_is_valid() {
        assert!(TaskStatus::NotStarted.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Linting));
        assert!(TaskStatus::Linting.can_transition_to(TaskStatus::Complete));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Error));
    }

    #[test]
    fn terminal_states_cannot_move() {
        assert!(!TaskStatus::Complete.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Error.can_transition_to(TaskStatus::Complete));
        assert!(!TaskStatus::Error.can_transition_to(TaskStatus::Error));
    }

    #[test]
    fn refresh_is_allowed_for_non_terminal_states() {
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::WaitingForDocs.can_transition_to(TaskStatus::WaitingForDocs));
    }

    #[test]
    fn labels_round_trip() {
        for status in [
            TaskStatus::NotStarted,
            TaskStatus::Processing,
            TaskStatus::Linting,
            TaskStatus::WaitingForDocs,
            TaskStatus::Complete,
            TaskStatus::Error,
        ] {
            assert_eq!(TaskStatus::parse_label(status.as_label()).unwrap(), status);
        }
        assert!(TaskStatus::parse_label("bogus").is_err());
    }

    #[test]
    fn version_task_lease_liveness() {
        let ttl = Duration::seconds(30);
        let task = VersionLintTask::new("pkg", "1.0", 1).claimed_by(ExecutorId::generate());
        assert!(task.has_live_lease_at(Utc::now(), ttl));
        assert!(!task.has_live_lease_at(Utc::now() + Duration::seconds(60), ttl));

        let unclaimed = VersionLintTask::new("pkg", "1.0", 1);
        assert!(!unclaimed.has_live_lease_at(Utc::now(), ttl));
    }

    #[test]
    fn doc_task_claimable_transitions() {
        let ttl = Duration::seconds(30);
        let parent = VersionLintTask::new("pkg", "1.0", 1);
        let mut task = DocumentLintTask::new(
            &parent,
            "f1",
            "slug-1",
            "openapi-3-0",
            LinterKind::Spectral,
            RulesetId::generate(),
        );
        assert!(task.is_claimable_at(Utc::now(), ttl));

        task.status = TaskStatus::Processing;
        task.executor_id = Some(ExecutorId::generate());
        task.last_active = Some(Utc::now());
        assert!(!task.is_claimable_at(Utc::now(), ttl));
        assert!(task.is_claimable_at(Utc::now() + Duration::seconds(31), ttl));

        task.status = TaskStatus::Complete;
        assert!(!task.is_claimable_at(Utc::now() + Duration::seconds(120), ttl));
    }

    #[test]
    fn pre_failed_task_is_terminal_from_birth() {
        let parent = VersionLintTask::new("pkg", "1.0", 1);
        let task = DocumentLintTask::pre_failed(
            &parent,
            "f1",
            "slug-1",
            "graphql",
            LinterKind::Unknown,
            ExecutorId::generate(),
            "linter unknown not supported",
        );
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.ruleset_id.is_none());
        assert!(task.details.contains("linter unknown"));
    }

    #[test]
    fn version_ref_formats_version_and_revision() {
        let task = VersionLintTask::new("pkg", "2.1", 4);
        assert_eq!(task.version_ref(), "2.1@4");
    }
}
