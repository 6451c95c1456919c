//! Linter invocation and report summarization.
//!
//! The [`DocumentLinter`] trait is the seam between the document worker and
//! a concrete linter process. The production implementation,
//! [`SpectralRunner`](spectral::SpectralRunner), forks the Spectral binary;
//! tests substitute [`StaticLinter`] or [`FailingLinter`].

pub mod spectral;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors from a linter invocation.
///
/// These are task-local: the document worker converts them into a terminal
/// `error` status on the owning task rather than propagating them.
#[derive(Debug, thiserror::Error)]
pub enum LinterError {
    /// The linter binary could not be found or probed.
    #[error("linter binary not found: {message}")]
    BinaryNotFound {
        /// Description of the probe failure.
        message: String,
    },

    /// Writing the document or ruleset to the invocation directory failed.
    #[error("failed to write linter input: {source}")]
    WriteFile {
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The linter process failed to start or exited abnormally.
    #[error("linter execution failed: {message}")]
    Exec {
        /// Exit detail, including captured stderr when available.
        message: String,
    },

    /// The report file was missing or unreadable.
    #[error("failed to read linter report: {message}")]
    ReadResult {
        /// Description of the read failure.
        message: String,
    },

    /// The report file was not valid finding JSON.
    #[error("failed to parse linter report: {message}")]
    ParseResult {
        /// Description of the parse failure.
        message: String,
    },
}

/// Finding counts aggregated from a linter report by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeveritySummary {
    /// Findings with severity 0.
    pub error_count: u32,
    /// Findings with severity 1.
    pub warning_count: u32,
    /// Findings with severity 2.
    pub info_count: u32,
    /// Findings with severity 3.
    pub hint_count: u32,
}

impl SeveritySummary {
    /// Returns the total number of findings.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.error_count + self.warning_count + self.info_count + self.hint_count
    }
}

/// One finding as emitted by the linter's JSON report.
///
/// Only the severity field matters to the pipeline; everything else in a
/// finding object is carried opaquely in the raw report bytes.
#[derive(Debug, Deserialize)]
struct ReportFinding {
    severity: i64,
}

/// Aggregates a raw report (a JSON array of finding objects) by severity.
///
/// # Errors
///
/// Returns [`LinterError::ParseResult`] when the bytes are not a JSON
/// array of objects with a numeric `severity` field.
pub fn summarize_report(raw: &[u8]) -> Result<SeveritySummary, LinterError> {
    let findings: Vec<ReportFinding> =
        serde_json::from_slice(raw).map_err(|e| LinterError::ParseResult {
            message: e.to_string(),
        })?;

    let mut summary = SeveritySummary::default();
    for finding in findings {
        match finding.severity {
            0 => summary.error_count += 1,
            1 => summary.warning_count += 1,
            2 => summary.info_count += 1,
            3 => summary.hint_count += 1,
            other => {
                return Err(LinterError::ParseResult {
                    message: format!("unknown severity {other}"),
                })
            }
        }
    }
    Ok(summary)
}

/// A completed lint invocation.
#[derive(Debug, Clone)]
pub struct LintReport {
    /// Raw report bytes as emitted by the linter.
    pub raw: Vec<u8>,
    /// Finding counts by severity.
    pub summary: SeveritySummary,
    /// Wall-clock duration of the invocation in milliseconds.
    pub elapsed_ms: i64,
}

/// The linter capability set consumed by the document worker.
#[async_trait]
pub trait DocumentLinter: Send + Sync {
    /// Lints one document against one ruleset.
    ///
    /// `document_name` and `ruleset_name` carry the original file names so
    /// the implementation can preserve extensions the linter is sensitive
    /// to.
    ///
    /// # Errors
    ///
    /// Returns a [`LinterError`] describing which stage of the invocation
    /// failed; callers record it as a task-local failure.
    async fn lint(
        &self,
        document: &[u8],
        document_name: &str,
        ruleset: &[u8],
        ruleset_name: &str,
    ) -> Result<LintReport, LinterError>;

    /// Returns the linter binary version detected at construction.
    fn version(&self) -> &str;
}

/// A linter that returns a fixed report, for tests.
#[derive(Debug)]
pub struct StaticLinter {
    raw: Vec<u8>,
    version: String,
}

impl StaticLinter {
    /// Creates a static linter returning the given raw report.
    #[must_use]
    pub fn new(raw: Vec<u8>) -> Self {
        Self {
            raw,
            version: "0.0.0-static".to_string(),
        }
    }
}

#[async_trait]
impl DocumentLinter for StaticLinter {
    async fn lint(
        &self,
        _document: &[u8],
        _document_name: &str,
        _ruleset: &[u8],
        _ruleset_name: &str,
    ) -> Result<LintReport, LinterError> {
        let summary = summarize_report(&self.raw)?;
        Ok(LintReport {
            raw: self.raw.clone(),
            summary,
            elapsed_ms: 1,
        })
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// A linter that always fails with a configurable error message, for tests.
#[derive(Debug)]
pub struct FailingLinter {
    message: String,
    version: String,
}

impl FailingLinter {
    /// Creates a failing linter with the given execution error message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            version: "0.0.0-failing".to_string(),
        }
    }
}

#[async_trait]
impl DocumentLinter for FailingLinter {
    async fn lint(
        &self,
        _document: &[u8],
        _document_name: &str,
        _ruleset: &[u8],
        _ruleset_name: &str,
    ) -> Result<LintReport, LinterError> {
        Err(LinterError::Exec {
            message: self.message.clone(),
        })
    }

    fn version(&self) -> &str {
        &self.version
    }
}
