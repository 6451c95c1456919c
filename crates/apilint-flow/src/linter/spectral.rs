//! Spectral subprocess runner.
//!
//! Spectral is invoked out-of-process, one invocation at a time per worker
//! process. Parallel linting happens across worker processes, not within
//! one: the binary's rule caches are not safe for concurrent in-process
//! use, so the runner holds a one-permit semaphore.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::process::Command;
use tokio::sync::Semaphore;

use async_trait::async_trait;

use super::{summarize_report, DocumentLinter, LintReport, LinterError};

/// Report file name inside the invocation directory.
const REPORT_FILE: &str = "report.json";

/// Runs the Spectral binary against documents on disk.
///
/// Each invocation gets a private temp directory; the document and ruleset
/// are written there under sanitized names because Spectral is sensitive to
/// filename characters. The directory is removed on drop, covering every
/// exit path.
pub struct SpectralRunner {
    binary: PathBuf,
    version: String,
    permit: Semaphore,
}

impl std::fmt::Debug for SpectralRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralRunner")
            .field("binary", &self.binary)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl SpectralRunner {
    /// Creates a runner, probing the binary once for its version.
    ///
    /// # Errors
    ///
    /// Returns [`LinterError::BinaryNotFound`] when the binary cannot be
    /// executed or does not report a version.
    pub async fn new(binary: impl Into<PathBuf>) -> Result<Self, LinterError> {
        let binary = binary.into();
        let output = Command::new(&binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| LinterError::BinaryNotFound {
                message: format!("{}: {e}", binary.display()),
            })?;

        if !output.status.success() {
            return Err(LinterError::BinaryNotFound {
                message: format!(
                    "{} --version exited with {}",
                    binary.display(),
                    output.status
                ),
            });
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            return Err(LinterError::BinaryNotFound {
                message: format!("{} reported an empty version", binary.display()),
            });
        }

        Ok(Self {
            binary,
            version,
            permit: Semaphore::new(1),
        })
    }
}

#[async_trait]
impl DocumentLinter for SpectralRunner {
    async fn lint(
        &self,
        document: &[u8],
        document_name: &str,
        ruleset: &[u8],
        ruleset_name: &str,
    ) -> Result<LintReport, LinterError> {
        // Serialize invocations within this process; the permit is held for
        // the full subprocess lifetime.
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| LinterError::Exec {
                message: "linter semaphore closed".to_string(),
            })?;

        let dir = tempfile::tempdir().map_err(|source| LinterError::WriteFile { source })?;

        let doc_path = dir
            .path()
            .join(format!("document.{}", safe_extension(document_name, "yaml")));
        let ruleset_path = dir
            .path()
            .join(format!("ruleset.{}", safe_extension(ruleset_name, "yaml")));
        let report_path = dir.path().join(REPORT_FILE);

        tokio::fs::write(&doc_path, document)
            .await
            .map_err(|source| LinterError::WriteFile { source })?;
        tokio::fs::write(&ruleset_path, ruleset)
            .await
            .map_err(|source| LinterError::WriteFile { source })?;

        let started = Instant::now();
        let output = Command::new(&self.binary)
            .arg("lint")
            .arg("--format")
            .arg("json")
            .arg("--output")
            .arg(&report_path)
            .arg("--ruleset")
            .arg(&ruleset_path)
            .arg(&doc_path)
            .output()
            .await
            .map_err(|e| LinterError::Exec {
                message: format!("failed to spawn {}: {e}", self.binary.display()),
            })?;
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        // Exit code 1 means the report contains at least one error-severity
        // finding; it is valid output, not a runner failure.
        let code = output.status.code();
        if !(output.status.success() || code == Some(1)) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LinterError::Exec {
                message: format!(
                    "spectral exited with {}: {}",
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    stderr.trim(),
                ),
            });
        }

        let raw = read_report(&report_path).await?;
        let summary = summarize_report(&raw)?;

        Ok(LintReport {
            raw,
            summary,
            elapsed_ms,
        })
    }

    fn version(&self) -> &str {
        &self.version
    }
}

async fn read_report(path: &Path) -> Result<Vec<u8>, LinterError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| LinterError::ReadResult {
            message: format!("{}: {e}", path.display()),
        })
}

/// Extracts a filename extension restricted to characters the linter
/// tolerates; falls back when the name has none.
fn safe_extension(file_name: &str, fallback: &'static str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(fallback);

    let cleaned: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();

    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned.to_ascii_lowercase()
    }
}
