//! # apilint-flow
//!
//! Distributed linting pipeline for API documents.
//!
//! Whenever a package version is published to the upstream API Hub, the
//! pipeline fetches every document in that version, selects a linter and
//! ruleset per document type, runs the linter out-of-process, persists a
//! de-duplicated result, and rolls per-document outcomes up into a
//! per-version verdict.
//!
//! ## Core Concepts
//!
//! - **Version task**: one publish event's worth of work, fanned out into
//!   document tasks
//! - **Document task**: lint one document against one ruleset with one
//!   linter
//! - **Lease**: a soft reservation `(executor_id, last_active)`; live
//!   while `now() - last_active < LEASE_TTL`
//! - **Work-stealing claim**: the transactional skip-locked row read that
//!   dispatches one task to exactly one of N workers
//!
//! ## Guarantees
//!
//! - **At-least-once with idempotent persistence**: lease expiry re-claims
//!   abandoned tasks; result writes are keyed upserts and hash-keyed
//!   inserts, so replays converge
//! - **Bounded retries**: a task re-claimed more than the restart budget
//!   is poisoned instead of looping forever
//! - **Horizontal scale**: N identical worker processes cooperate through
//!   the shared store with no external coordinator

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod ingress;
pub mod linter;
pub mod metrics;
pub mod ruleset;
pub mod runtime;
pub mod store;
pub mod task;
pub mod workers;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::hub::{ApiHubClient, HubDocument, VersionInfo};
    pub use crate::ingress::{Ingress, PublishEvent, PublishStream};
    pub use crate::linter::{DocumentLinter, LintReport, LinterError, SeveritySummary};
    pub use crate::metrics::FlowMetrics;
    pub use crate::ruleset::{ApiType, LinterKind, Ruleset, RulesetChoice, RulesetStatus};
    pub use crate::runtime::{PipelineConfig, PipelineRuntime, RunningPipeline};
    pub use crate::store::{
        DocLintStatus, DocTaskWriteback, LintFileResult, LintedDocument, LintedVersion,
        TaskStore, VersionLintStatus,
    };
    pub use crate::task::{DocumentLintTask, TaskStatus, VersionLintTask, MAX_RESTARTS};
}
