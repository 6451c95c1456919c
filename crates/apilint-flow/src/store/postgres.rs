//! Postgres store implementation.
//!
//! The production [`TaskStore`]. Claims use a skip-locked row read inside
//! an explicit transaction, which is what lets N worker processes dequeue
//! without an external coordinator: pessimistic locking without
//! `SKIP LOCKED` risks stalls, and optimistic updates without locking risk
//! two workers claiming the same row under contention.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use apilint_core::{DocTaskId, ExecutorId, RulesetId, VersionTaskId};

use super::{
    DocLintStatus, DocTaskWriteback, LintFileResult, LintedDocument, LintedVersion, TaskStore,
    VersionLintStatus,
};
use crate::error::{Error, Result};
use crate::linter::SeveritySummary;
use crate::metrics::FlowMetrics;
use crate::ruleset::{LinterKind, Ruleset, RulesetStatus};
use crate::task::{DocumentLintTask, TaskStatus, VersionLintTask, MAX_RESTARTS};

/// Embedded schema, applied idempotently at startup.
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Work-stealing select for version tasks: oldest claimable row, locked,
/// skipping rows other transactions already hold.
const CLAIM_VERSION_TASK_SQL: &str = "\
SELECT id, package_id, version, revision, event_id, status, details, created_at, \
       executor_id, last_active, restart_count \
FROM version_lint_tasks \
WHERE (status = 'not_started' AND (executor_id IS NULL OR last_active < $1)) \
   OR (status = 'processing' AND last_active < $1) \
ORDER BY created_at ASC \
LIMIT 1 \
FOR UPDATE SKIP LOCKED";

/// Work-stealing select for document tasks.
const CLAIM_DOC_TASK_SQL: &str = "\
SELECT id, version_lint_task_id, package_id, version, revision, file_id, file_slug, \
       api_type, linter, ruleset_id, status, details, created_at, executor_id, \
       last_active, restart_count, lint_time_ms \
FROM document_lint_tasks \
WHERE status = 'not_started' \
   OR (status = 'processing' AND last_active < $1) \
ORDER BY created_at ASC \
LIMIT 1 \
FOR UPDATE SKIP LOCKED";

const UPSERT_LINTED_VERSION_SQL: &str = "\
INSERT INTO linted_versions (package_id, version, revision, lint_status, lint_details, linted_at) \
VALUES ($1, $2, $3, $4, $5, $6) \
ON CONFLICT (package_id, version, revision) \
DO UPDATE SET lint_status = EXCLUDED.lint_status, \
              lint_details = EXCLUDED.lint_details, \
              linted_at = EXCLUDED.linted_at";

const UPSERT_LINTED_DOCUMENT_SQL: &str = "\
INSERT INTO linted_documents \
    (package_id, version, revision, file_id, ruleset_id, slug, api_type, data_hash, lint_status, lint_details) \
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
ON CONFLICT (package_id, version, revision, file_id, ruleset_id) \
DO UPDATE SET data_hash = EXCLUDED.data_hash, \
              lint_status = EXCLUDED.lint_status, \
              lint_details = EXCLUDED.lint_details";

/// Deduplicated report insert: two documents with identical bytes linted
/// against the same ruleset share one row.
const INSERT_LINT_RESULT_SQL: &str = "\
INSERT INTO lint_file_results (data_hash, ruleset_id, linter_version, data, summary) \
VALUES ($1, $2, $3, $4, $5) \
ON CONFLICT (data_hash, ruleset_id) DO NOTHING";

/// Postgres-backed task store.
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
    lease_ttl: Duration,
    metrics: FlowMetrics,
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::storage_with_source(context, e)
}

fn restart_exceeded_details(prior: &str) -> String {
    if prior.is_empty() {
        "Restart count exceeded".to_string()
    } else {
        format!("Restart count exceeded: {prior}")
    }
}

fn version_task_from_row(row: &PgRow) -> Result<VersionLintTask> {
    Ok(VersionLintTask {
        id: VersionTaskId::from_uuid(row.try_get("id").map_err(db_err("decode version task row"))?),
        package_id: row.try_get("package_id").map_err(db_err("decode version task row"))?,
        version: row.try_get("version").map_err(db_err("decode version task row"))?,
        revision: row.try_get("revision").map_err(db_err("decode version task row"))?,
        event_id: row.try_get("event_id").map_err(db_err("decode version task row"))?,
        status: TaskStatus::parse_label(
            row.try_get::<String, _>("status")
                .map_err(db_err("decode version task row"))?
                .as_str(),
        )?,
        details: row.try_get("details").map_err(db_err("decode version task row"))?,
        created_at: row.try_get("created_at").map_err(db_err("decode version task row"))?,
        executor_id: row
            .try_get::<Option<Uuid>, _>("executor_id")
            .map_err(db_err("decode version task row"))?
            .map(ExecutorId::from_uuid),
        last_active: row.try_get("last_active").map_err(db_err("decode version task row"))?,
        restart_count: row
            .try_get("restart_count")
            .map_err(db_err("decode version task row"))?,
    })
}

fn doc_task_from_row(row: &PgRow) -> Result<DocumentLintTask> {
    Ok(DocumentLintTask {
        id: DocTaskId::from_uuid(row.try_get("id").map_err(db_err("decode document task row"))?),
        version_task_id: VersionTaskId::from_uuid(
            row.try_get("version_lint_task_id")
                .map_err(db_err("decode document task row"))?,
        ),
        package_id: row.try_get("package_id").map_err(db_err("decode document task row"))?,
        version: row.try_get("version").map_err(db_err("decode document task row"))?,
        revision: row.try_get("revision").map_err(db_err("decode document task row"))?,
        file_id: row.try_get("file_id").map_err(db_err("decode document task row"))?,
        file_slug: row.try_get("file_slug").map_err(db_err("decode document task row"))?,
        api_type: row.try_get("api_type").map_err(db_err("decode document task row"))?,
        linter: LinterKind::parse_label(
            row.try_get::<String, _>("linter")
                .map_err(db_err("decode document task row"))?
                .as_str(),
        )?,
        ruleset_id: row
            .try_get::<Option<Uuid>, _>("ruleset_id")
            .map_err(db_err("decode document task row"))?
            .map(RulesetId::from_uuid),
        status: TaskStatus::parse_label(
            row.try_get::<String, _>("status")
                .map_err(db_err("decode document task row"))?
                .as_str(),
        )?,
        details: row.try_get("details").map_err(db_err("decode document task row"))?,
        created_at: row.try_get("created_at").map_err(db_err("decode document task row"))?,
        executor_id: row
            .try_get::<Option<Uuid>, _>("executor_id")
            .map_err(db_err("decode document task row"))?
            .map(ExecutorId::from_uuid),
        last_active: row.try_get("last_active").map_err(db_err("decode document task row"))?,
        restart_count: row
            .try_get("restart_count")
            .map_err(db_err("decode document task row"))?,
        lint_time_ms: row
            .try_get("lint_time_ms")
            .map_err(db_err("decode document task row"))?,
    })
}

fn ruleset_from_row(row: &PgRow) -> Result<Ruleset> {
    Ok(Ruleset {
        id: RulesetId::from_uuid(row.try_get("id").map_err(db_err("decode ruleset row"))?),
        name: row.try_get("name").map_err(db_err("decode ruleset row"))?,
        api_type: row.try_get("api_type").map_err(db_err("decode ruleset row"))?,
        linter: LinterKind::parse_label(
            row.try_get::<String, _>("linter")
                .map_err(db_err("decode ruleset row"))?
                .as_str(),
        )?,
        file_name: row.try_get("file_name").map_err(db_err("decode ruleset row"))?,
        data: row.try_get("data").map_err(db_err("decode ruleset row"))?,
        status: RulesetStatus::parse_label(
            row.try_get::<String, _>("status")
                .map_err(db_err("decode ruleset row"))?
                .as_str(),
        )?,
        created_at: row.try_get("created_at").map_err(db_err("decode ruleset row"))?,
        can_be_deleted: row
            .try_get("can_be_deleted")
            .map_err(db_err("decode ruleset row"))?,
    })
}

fn linted_version_from_row(row: &PgRow) -> Result<LintedVersion> {
    Ok(LintedVersion {
        package_id: row.try_get("package_id").map_err(db_err("decode linted version row"))?,
        version: row.try_get("version").map_err(db_err("decode linted version row"))?,
        revision: row.try_get("revision").map_err(db_err("decode linted version row"))?,
        lint_status: VersionLintStatus::parse_label(
            row.try_get::<String, _>("lint_status")
                .map_err(db_err("decode linted version row"))?
                .as_str(),
        )?,
        lint_details: row
            .try_get("lint_details")
            .map_err(db_err("decode linted version row"))?,
        linted_at: row
            .try_get("linted_at")
            .map_err(db_err("decode linted version row"))?,
    })
}

fn linted_document_from_row(row: &PgRow) -> Result<LintedDocument> {
    Ok(LintedDocument {
        package_id: row.try_get("package_id").map_err(db_err("decode linted document row"))?,
        version: row.try_get("version").map_err(db_err("decode linted document row"))?,
        revision: row.try_get("revision").map_err(db_err("decode linted document row"))?,
        file_id: row.try_get("file_id").map_err(db_err("decode linted document row"))?,
        ruleset_id: RulesetId::from_uuid(
            row.try_get("ruleset_id")
                .map_err(db_err("decode linted document row"))?,
        ),
        slug: row.try_get("slug").map_err(db_err("decode linted document row"))?,
        api_type: row.try_get("api_type").map_err(db_err("decode linted document row"))?,
        data_hash: row.try_get("data_hash").map_err(db_err("decode linted document row"))?,
        lint_status: DocLintStatus::parse_label(
            row.try_get::<String, _>("lint_status")
                .map_err(db_err("decode linted document row"))?
                .as_str(),
        )?,
        lint_details: row
            .try_get("lint_details")
            .map_err(db_err("decode linted document row"))?,
    })
}

impl PgTaskStore {
    /// Connects to Postgres and wraps the pool with the given lease TTL.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the pool cannot be established.
    pub async fn connect(database_url: &str, lease_ttl: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_err("connect to postgres"))?;
        Ok(Self::from_pool(pool, lease_ttl))
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool, lease_ttl: Duration) -> Self {
        Self {
            pool,
            lease_ttl,
            metrics: FlowMetrics::new(),
        }
    }

    /// Applies the embedded schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a storage error when a DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err("apply schema"))?;
        Ok(())
    }

    fn stale_before(&self) -> DateTime<Utc> {
        Utc::now() - self.lease_ttl
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        self.pool.begin().await.map_err(db_err("begin transaction"))
    }

    async fn upsert_linted_version(
        tx: &mut Transaction<'_, Postgres>,
        row: &LintedVersion,
    ) -> Result<()> {
        sqlx::query(UPSERT_LINTED_VERSION_SQL)
            .bind(&row.package_id)
            .bind(&row.version)
            .bind(row.revision)
            .bind(row.lint_status.as_str())
            .bind(&row.lint_details)
            .bind(row.linted_at)
            .execute(&mut **tx)
            .await
            .map_err(db_err("upsert linted version"))?;
        Ok(())
    }

    async fn insert_doc_task(
        tx: &mut Transaction<'_, Postgres>,
        task: &DocumentLintTask,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO document_lint_tasks \
                 (id, version_lint_task_id, package_id, version, revision, file_id, file_slug, \
                  api_type, linter, ruleset_id, status, details, created_at, executor_id, \
                  last_active, restart_count, lint_time_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(task.id.as_uuid())
        .bind(task.version_task_id.as_uuid())
        .bind(&task.package_id)
        .bind(&task.version)
        .bind(task.revision)
        .bind(&task.file_id)
        .bind(&task.file_slug)
        .bind(&task.api_type)
        .bind(task.linter.as_str())
        .bind(task.ruleset_id.map(|r| r.as_uuid()))
        .bind(task.status.as_label())
        .bind(&task.details)
        .bind(task.created_at)
        .bind(task.executor_id.map(|e| e.as_uuid()))
        .bind(task.last_active)
        .bind(task.restart_count)
        .bind(task.lint_time_ms)
        .execute(&mut **tx)
        .await
        .map_err(db_err("insert document task"))?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert_version_task(&self, task: &VersionLintTask) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO version_lint_tasks \
                 (id, package_id, version, revision, event_id, status, details, created_at, \
                  executor_id, last_active, restart_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(task.id.as_uuid())
        .bind(&task.package_id)
        .bind(&task.version)
        .bind(task.revision)
        .bind(task.event_id.as_deref())
        .bind(task.status.as_label())
        .bind(&task.details)
        .bind(task.created_at)
        .bind(task.executor_id.map(|e| e.as_uuid()))
        .bind(task.last_active)
        .bind(task.restart_count)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.constraint() == Some("version_lint_tasks_event_id_unique") =>
            {
                Err(Error::DuplicateEvent {
                    event_id: task.event_id.clone().unwrap_or_default(),
                })
            }
            Err(e) => Err(Error::storage_with_source("insert version task", e)),
        }
    }

    async fn get_version_task(&self, id: VersionTaskId) -> Result<VersionLintTask> {
        let row = sqlx::query(
            "SELECT id, package_id, version, revision, event_id, status, details, created_at, \
                    executor_id, last_active, restart_count \
             FROM version_lint_tasks WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get version task"))?;

        row.as_ref()
            .map(version_task_from_row)
            .transpose()?
            .ok_or(Error::VersionTaskNotFound { task_id: id })
    }

    async fn update_version_task_status(
        &self,
        id: VersionTaskId,
        status: TaskStatus,
        details: &str,
    ) -> Result<()> {
        let mut tx = self.begin().await?;

        let row = sqlx::query("SELECT status FROM version_lint_tasks WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("lock version task"))?
            .ok_or(Error::VersionTaskNotFound { task_id: id })?;
        let current = TaskStatus::parse_label(
            row.try_get::<String, _>("status")
                .map_err(db_err("decode status"))?
                .as_str(),
        )?;

        if !current.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: status.to_string(),
                reason: "version task".to_string(),
            });
        }

        sqlx::query(
            "UPDATE version_lint_tasks SET status = $2, details = $3, last_active = now() \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_label())
        .bind(details)
        .execute(&mut *tx)
        .await
        .map_err(db_err("update version task"))?;

        tx.commit().await.map_err(db_err("commit version task update"))
    }

    async fn heartbeat_version_task(
        &self,
        id: VersionTaskId,
        executor_id: ExecutorId,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE version_lint_tasks SET last_active = now() \
             WHERE id = $1 AND executor_id = $2",
        )
        .bind(id.as_uuid())
        .bind(executor_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err("heartbeat version task"))?;
        Ok(())
    }

    async fn claim_free_version_task(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Option<VersionLintTask>> {
        // A selected row whose restart budget is exhausted is force-failed
        // and the claim moves on to the next oldest row.
        loop {
            let mut tx = self.begin().await?;

            let row = sqlx::query(CLAIM_VERSION_TASK_SQL)
                .bind(self.stale_before())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("claim version task"))?;

            let Some(row) = row else {
                tx.commit().await.map_err(db_err("commit empty claim"))?;
                return Ok(None);
            };
            let mut task = version_task_from_row(&row)?;

            if task.restart_count >= MAX_RESTARTS {
                let details = restart_exceeded_details(&task.details);
                sqlx::query(
                    "UPDATE version_lint_tasks SET status = 'error', details = $2, \
                     last_active = now() WHERE id = $1",
                )
                .bind(task.id.as_uuid())
                .bind(&details)
                .execute(&mut *tx)
                .await
                .map_err(db_err("force-fail version task"))?;
                tx.commit().await.map_err(db_err("commit force-fail"))?;
                tracing::warn!(task_id = %task.id, "version task restart budget exhausted");
                self.metrics.record_forced_failure("version");
                continue;
            }

            if task.status == TaskStatus::Processing {
                task.restart_count += 1;
            }
            task.status = TaskStatus::Processing;
            task.executor_id = Some(executor_id);
            task.last_active = Utc::now();

            sqlx::query(
                "UPDATE version_lint_tasks SET status = 'processing', executor_id = $2, \
                 last_active = $3, restart_count = $4 WHERE id = $1",
            )
            .bind(task.id.as_uuid())
            .bind(executor_id.as_uuid())
            .bind(task.last_active)
            .bind(task.restart_count)
            .execute(&mut *tx)
            .await
            .map_err(db_err("lease version task"))?;

            tx.commit().await.map_err(db_err("commit version claim"))?;
            return Ok(Some(task));
        }
    }

    async fn get_waiting_version_tasks(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Vec<VersionLintTask>> {
        let rows = sqlx::query(
            "SELECT id, package_id, version, revision, event_id, status, details, created_at, \
                    executor_id, last_active, restart_count \
             FROM version_lint_tasks \
             WHERE status = 'waiting_for_docs' AND (executor_id = $1 OR last_active < $2) \
             ORDER BY created_at ASC",
        )
        .bind(executor_id.as_uuid())
        .bind(self.stale_before())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get waiting version tasks"))?;

        rows.iter().map(version_task_from_row).collect()
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

        let mut tx = self.begin().await?;

        let row = sqlx::query(
            "SELECT id, package_id, version, revision, event_id, status, details, created_at, \
                    executor_id, last_active, restart_count \
             FROM version_lint_tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("lock version task"))?
        .ok_or(Error::VersionTaskNotFound { task_id: id })?;
        let task = version_task_from_row(&row)?;

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

        sqlx::query(
            "UPDATE version_lint_tasks SET status = $2, details = $3, last_active = now() \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_label())
        .bind(details)
        .execute(&mut *tx)
        .await
        .map_err(db_err("finalize version task"))?;

        let lint_status = if status == TaskStatus::Complete {
            VersionLintStatus::Success
        } else {
            VersionLintStatus::Failed
        };
        let verdict = LintedVersion {
            package_id: task.package_id,
            version: task.version,
            revision: task.revision,
            lint_status,
            lint_details: details.to_string(),
            linted_at: Utc::now(),
        };
        Self::upsert_linted_version(&mut tx, &verdict).await?;

        tx.commit().await.map_err(db_err("commit finalize"))
    }

    async fn get_doc_task(&self, id: DocTaskId) -> Result<DocumentLintTask> {
        let row = sqlx::query(
            "SELECT id, version_lint_task_id, package_id, version, revision, file_id, file_slug, \
                    api_type, linter, ruleset_id, status, details, created_at, executor_id, \
                    last_active, restart_count, lint_time_ms \
             FROM document_lint_tasks WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get document task"))?;

        row.as_ref()
            .map(doc_task_from_row)
            .transpose()?
            .ok_or(Error::DocTaskNotFound { task_id: id })
    }

    async fn update_doc_task_status(
        &self,
        id: DocTaskId,
        status: TaskStatus,
        details: &str,
    ) -> Result<()> {
        let mut tx = self.begin().await?;

        let row = sqlx::query("SELECT status FROM document_lint_tasks WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("lock document task"))?
            .ok_or(Error::DocTaskNotFound { task_id: id })?;
        let current = TaskStatus::parse_label(
            row.try_get::<String, _>("status")
                .map_err(db_err("decode status"))?
                .as_str(),
        )?;

        if !current.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: status.to_string(),
                reason: "document task".to_string(),
            });
        }

        sqlx::query(
            "UPDATE document_lint_tasks SET status = $2, details = $3, last_active = now() \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(status.as_label())
        .bind(details)
        .execute(&mut *tx)
        .await
        .map_err(db_err("update document task"))?;

        tx.commit().await.map_err(db_err("commit document task update"))
    }

    async fn heartbeat_doc_task(&self, id: DocTaskId, executor_id: ExecutorId) -> Result<()> {
        sqlx::query(
            "UPDATE document_lint_tasks SET last_active = now() \
             WHERE id = $1 AND executor_id = $2",
        )
        .bind(id.as_uuid())
        .bind(executor_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err("heartbeat document task"))?;
        Ok(())
    }

    async fn claim_free_doc_task(
        &self,
        executor_id: ExecutorId,
    ) -> Result<Option<DocumentLintTask>> {
        loop {
            let mut tx = self.begin().await?;

            let row = sqlx::query(CLAIM_DOC_TASK_SQL)
                .bind(self.stale_before())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("claim document task"))?;

            let Some(row) = row else {
                tx.commit().await.map_err(db_err("commit empty claim"))?;
                return Ok(None);
            };
            let mut task = doc_task_from_row(&row)?;

            if task.restart_count >= MAX_RESTARTS {
                let details = restart_exceeded_details(&task.details);
                sqlx::query(
                    "UPDATE document_lint_tasks SET status = 'error', details = $2, \
                     last_active = now() WHERE id = $1",
                )
                .bind(task.id.as_uuid())
                .bind(&details)
                .execute(&mut *tx)
                .await
                .map_err(db_err("force-fail document task"))?;
                tx.commit().await.map_err(db_err("commit force-fail"))?;
                tracing::warn!(task_id = %task.id, "document task restart budget exhausted");
                self.metrics.record_forced_failure("doc");
                continue;
            }

            if task.status == TaskStatus::Processing {
                task.restart_count += 1;
            }
            task.status = TaskStatus::Processing;
            task.executor_id = Some(executor_id);
            task.last_active = Some(Utc::now());

            sqlx::query(
                "UPDATE document_lint_tasks SET status = 'processing', executor_id = $2, \
                 last_active = $3, restart_count = $4 WHERE id = $1",
            )
            .bind(task.id.as_uuid())
            .bind(executor_id.as_uuid())
            .bind(task.last_active)
            .bind(task.restart_count)
            .execute(&mut *tx)
            .await
            .map_err(db_err("lease document task"))?;

            tx.commit().await.map_err(db_err("commit document claim"))?;
            return Ok(Some(task));
        }
    }

    async fn save_doc_tasks_and_advance_version(
        &self,
        tasks: &[DocumentLintTask],
        version_task_id: VersionTaskId,
    ) -> Result<()> {
        let mut tx = self.begin().await?;

        let row = sqlx::query("SELECT status FROM version_lint_tasks WHERE id = $1 FOR UPDATE")
            .bind(version_task_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("lock version task"))?
            .ok_or(Error::VersionTaskNotFound {
                task_id: version_task_id,
            })?;
        let current = TaskStatus::parse_label(
            row.try_get::<String, _>("status")
                .map_err(db_err("decode status"))?
                .as_str(),
        )?;

        for task in tasks {
            if task.version_task_id != version_task_id {
                return Err(Error::storage(format!(
                    "document task {} belongs to a different version task",
                    task.id
                )));
            }
            Self::insert_doc_task(&mut tx, task).await?;
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

        if !current.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: status.to_string(),
                reason: "fan-out".to_string(),
            });
        }

        sqlx::query(
            "UPDATE version_lint_tasks SET status = $2, details = $3, last_active = now() \
             WHERE id = $1",
        )
        .bind(version_task_id.as_uuid())
        .bind(status.as_label())
        .bind(&details)
        .execute(&mut *tx)
        .await
        .map_err(db_err("advance version task"))?;

        tx.commit().await.map_err(db_err("commit fan-out"))
    }

    async fn get_doc_tasks_for_version_tasks(
        &self,
        ids: &[VersionTaskId],
    ) -> Result<Vec<DocumentLintTask>> {
        let uuids: Vec<Uuid> = ids.iter().map(VersionTaskId::as_uuid).collect();
        let rows = sqlx::query(
            "SELECT id, version_lint_task_id, package_id, version, revision, file_id, file_slug, \
                    api_type, linter, ruleset_id, status, details, created_at, executor_id, \
                    last_active, restart_count, lint_time_ms \
             FROM document_lint_tasks \
             WHERE version_lint_task_id = ANY($1) \
             ORDER BY created_at ASC",
        )
        .bind(&uuids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get document tasks for versions"))?;

        rows.iter().map(doc_task_from_row).collect()
    }

    async fn save_lint_result(&self, writeback: &DocTaskWriteback) -> Result<()> {
        if !writeback.status.is_terminal() {
            return Err(Error::storage(format!(
                "writeback requires a terminal status, got {}",
                writeback.status
            )));
        }

        let mut tx = self.begin().await?;

        let row = sqlx::query("SELECT status FROM document_lint_tasks WHERE id = $1 FOR UPDATE")
            .bind(writeback.doc_task_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("lock document task"))?
            .ok_or(Error::DocTaskNotFound {
                task_id: writeback.doc_task_id,
            })?;
        let current = TaskStatus::parse_label(
            row.try_get::<String, _>("status")
                .map_err(db_err("decode status"))?
                .as_str(),
        )?;

        // A second claimant replaying a completed lifecycle converges: the
        // first terminal task status wins, rows below are keyed upserts.
        if !current.is_terminal() {
            sqlx::query(
                "UPDATE document_lint_tasks \
                 SET status = $2, details = $3, lint_time_ms = $4, last_active = now() \
                 WHERE id = $1",
            )
            .bind(writeback.doc_task_id.as_uuid())
            .bind(writeback.status.as_label())
            .bind(&writeback.details)
            .bind(writeback.lint_time_ms)
            .execute(&mut *tx)
            .await
            .map_err(db_err("finalize document task"))?;
        }

        Self::upsert_linted_version(&mut tx, &writeback.version_row).await?;

        let doc = &writeback.doc_row;
        sqlx::query(UPSERT_LINTED_DOCUMENT_SQL)
            .bind(&doc.package_id)
            .bind(&doc.version)
            .bind(doc.revision)
            .bind(&doc.file_id)
            .bind(doc.ruleset_id.as_uuid())
            .bind(&doc.slug)
            .bind(&doc.api_type)
            .bind(&doc.data_hash)
            .bind(doc.lint_status.as_str())
            .bind(&doc.lint_details)
            .execute(&mut *tx)
            .await
            .map_err(db_err("upsert linted document"))?;

        if let Some(result) = &writeback.result_row {
            let summary = serde_json::to_value(result.summary)
                .map_err(|e| Error::serialization(e.to_string()))?;
            sqlx::query(INSERT_LINT_RESULT_SQL)
                .bind(&result.data_hash)
                .bind(result.ruleset_id.as_uuid())
                .bind(&result.linter_version)
                .bind(&result.data)
                .bind(summary)
                .execute(&mut *tx)
                .await
                .map_err(db_err("insert lint result"))?;
        }

        tx.commit().await.map_err(db_err("commit writeback"))
    }

    async fn insert_ruleset(&self, ruleset: &Ruleset) -> Result<()> {
        let mut tx = self.begin().await?;

        if ruleset.status == RulesetStatus::Active {
            sqlx::query(
                "UPDATE rulesets SET status = 'inactive', can_be_deleted = TRUE \
                 WHERE api_type = $1 AND linter = $2 AND status = 'active'",
            )
            .bind(&ruleset.api_type)
            .bind(ruleset.linter.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err("deactivate previous ruleset"))?;
        }

        sqlx::query(
            "INSERT INTO rulesets \
                 (id, name, api_type, linter, file_name, data, status, created_at, can_be_deleted) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(ruleset.id.as_uuid())
        .bind(&ruleset.name)
        .bind(&ruleset.api_type)
        .bind(ruleset.linter.as_str())
        .bind(&ruleset.file_name)
        .bind(&ruleset.data)
        .bind(ruleset.status.as_str())
        .bind(ruleset.created_at)
        .bind(ruleset.can_be_deleted)
        .execute(&mut *tx)
        .await
        .map_err(db_err("insert ruleset"))?;

        tx.commit().await.map_err(db_err("commit ruleset insert"))
    }

    async fn get_ruleset(&self, id: RulesetId) -> Result<Ruleset> {
        let row = sqlx::query(
            "SELECT id, name, api_type, linter, file_name, data, status, created_at, \
                    can_be_deleted \
             FROM rulesets WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get ruleset"))?;

        row.as_ref()
            .map(ruleset_from_row)
            .transpose()?
            .ok_or(Error::RulesetNotFound { ruleset_id: id })
    }

    async fn get_active_ruleset(
        &self,
        api_type: &str,
        linter: LinterKind,
    ) -> Result<Option<Ruleset>> {
        let row = sqlx::query(
            "SELECT id, name, api_type, linter, file_name, data, status, created_at, \
                    can_be_deleted \
             FROM rulesets WHERE api_type = $1 AND linter = $2 AND status = 'active'",
        )
        .bind(api_type)
        .bind(linter.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get active ruleset"))?;

        row.as_ref().map(ruleset_from_row).transpose()
    }

    async fn get_linted_version(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
    ) -> Result<Option<LintedVersion>> {
        let row = sqlx::query(
            "SELECT package_id, version, revision, lint_status, lint_details, linted_at \
             FROM linted_versions \
             WHERE package_id = $1 AND version = $2 AND revision = $3",
        )
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get linted version"))?;

        row.as_ref().map(linted_version_from_row).transpose()
    }

    async fn get_linted_documents(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
    ) -> Result<Vec<LintedDocument>> {
        let rows = sqlx::query(
            "SELECT package_id, version, revision, file_id, ruleset_id, slug, api_type, \
                    data_hash, lint_status, lint_details \
             FROM linted_documents \
             WHERE package_id = $1 AND version = $2 AND revision = $3 \
             ORDER BY file_id ASC",
        )
        .bind(package_id)
        .bind(version)
        .bind(revision)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("get linted documents"))?;

        rows.iter().map(linted_document_from_row).collect()
    }

    async fn get_lint_file_result(
        &self,
        data_hash: &str,
        ruleset_id: RulesetId,
    ) -> Result<Option<LintFileResult>> {
        let row = sqlx::query(
            "SELECT data_hash, ruleset_id, linter_version, data, summary \
             FROM lint_file_results WHERE data_hash = $1 AND ruleset_id = $2",
        )
        .bind(data_hash)
        .bind(ruleset_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("get lint file result"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let summary_value: serde_json::Value = row
            .try_get("summary")
            .map_err(db_err("decode lint result row"))?;
        let summary: SeveritySummary = serde_json::from_value(summary_value)
            .map_err(|e| Error::serialization(e.to_string()))?;

        Ok(Some(LintFileResult {
            data_hash: row
                .try_get("data_hash")
                .map_err(db_err("decode lint result row"))?,
            ruleset_id: RulesetId::from_uuid(
                row.try_get("ruleset_id")
                    .map_err(db_err("decode lint result row"))?,
            ),
            linter_version: row
                .try_get("linter_version")
                .map_err(db_err("decode lint result row"))?,
            data: row.try_get("data").map_err(db_err("decode lint result row"))?,
            summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_queries_use_skip_locked() {
        assert!(CLAIM_VERSION_TASK_SQL.contains("FOR UPDATE SKIP LOCKED"));
        assert!(CLAIM_DOC_TASK_SQL.contains("FOR UPDATE SKIP LOCKED"));
        assert!(CLAIM_VERSION_TASK_SQL.contains("LIMIT 1"));
        assert!(CLAIM_DOC_TASK_SQL.contains("LIMIT 1"));
        assert!(CLAIM_DOC_TASK_SQL.contains("ORDER BY created_at ASC"));
    }

    #[test]
    fn result_insert_is_insert_if_absent() {
        assert!(INSERT_LINT_RESULT_SQL.contains("ON CONFLICT (data_hash, ruleset_id) DO NOTHING"));
    }

    #[test]
    fn verdict_and_document_writes_are_upserts() {
        assert!(UPSERT_LINTED_VERSION_SQL.contains("ON CONFLICT (package_id, version, revision)"));
        assert!(UPSERT_LINTED_DOCUMENT_SQL
            .contains("ON CONFLICT (package_id, version, revision, file_id, ruleset_id)"));
    }

    #[test]
    fn schema_declares_the_five_tables_and_catalogue() {
        for table in [
            "version_lint_tasks",
            "document_lint_tasks",
            "linted_versions",
            "linted_documents",
            "lint_file_results",
            "rulesets",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")),
                "schema missing {table}"
            );
        }
        assert!(SCHEMA.contains("version_lint_tasks_event_id_unique"));
        assert!(SCHEMA.contains("rulesets_active_unique"));
    }
}
