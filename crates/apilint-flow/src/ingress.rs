//! Validation ingress.
//!
//! Accepts `validate(package, version, revision, event_id)` from the HTTP
//! boundary and from publish notifications, and turns each into exactly one
//! version task. Idempotency hangs on the event id: replaying ingress with
//! the same event id yields `DuplicateEvent` and exactly one task row.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use apilint_core::{ExecutorId, VersionTaskId};

use crate::error::{Error, Result};
use crate::hub::{parse_version_ref, ApiHubClient};
use crate::store::TaskStore;
use crate::task::VersionLintTask;

/// A publish notification delivered by the cluster's pub-sub channel.
#[derive(Debug, Clone)]
pub struct PublishEvent {
    /// Package that was published.
    pub package_id: String,
    /// Published version.
    pub version: String,
    /// Published revision; 0 means "resolve the latest".
    pub revision: i32,
    /// Delivery id used as the idempotency key, when present.
    pub event_id: Option<String>,
}

/// Source of publish notifications.
///
/// The cluster-membership and pub-sub infrastructure behind it is out of
/// scope; the pipeline only consumes the delivered events.
#[async_trait]
pub trait PublishStream: Send + Sync {
    /// Awaits the next publish event; `None` means the stream closed.
    async fn next_event(&self) -> Result<Option<PublishEvent>>;
}

/// Creates version tasks for validation requests.
pub struct Ingress {
    store: Arc<dyn TaskStore>,
    hub: Arc<dyn ApiHubClient>,
    executor_id: ExecutorId,
    wake: mpsc::Sender<VersionTaskId>,
}

impl std::fmt::Debug for Ingress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingress")
            .field("executor_id", &self.executor_id)
            .finish_non_exhaustive()
    }
}

impl Ingress {
    /// Creates an ingress bound to this process's executor id.
    ///
    /// `wake` is the fast path: every created task id is pushed to the
    /// version worker so fan-out starts without waiting for a poll tick.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        hub: Arc<dyn ApiHubClient>,
        executor_id: ExecutorId,
        wake: mpsc::Sender<VersionTaskId>,
    ) -> Self {
        Self {
            store,
            hub,
            executor_id,
            wake,
        }
    }

    /// Creates a version task for `(package, version, revision)`.
    ///
    /// `revision = 0` means "latest": it is resolved through the API Hub
    /// here, before any task row exists, so workers never see an
    /// unresolved revision. The task is created pre-leased to this
    /// process, and the version worker is woken immediately.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRevisionFormat`] for a negative revision or an
    ///   unparseable hub reference
    /// - [`Error::DuplicateEvent`] when `event_id` was already ingested
    ///   (safe to retry from the caller's perspective)
    /// - Hub and storage errors propagate unchanged
    pub async fn validate_version(
        &self,
        package_id: &str,
        version: &str,
        revision: i32,
        event_id: Option<String>,
    ) -> Result<VersionTaskId> {
        if revision < 0 {
            return Err(Error::InvalidRevisionFormat {
                value: revision.to_string(),
            });
        }

        let (version, revision) = if revision == 0 {
            let info = self.hub.get_version(package_id, version).await?;
            parse_version_ref(&info.version)?
        } else {
            (version.to_string(), revision)
        };

        let mut task = VersionLintTask::new(package_id, version, revision)
            .claimed_by(self.executor_id);
        if let Some(event_id) = event_id.filter(|e| !e.is_empty()) {
            task = task.with_event_id(event_id);
        }
        let task_id = task.id;

        self.store.insert_version_task(&task).await?;
        tracing::info!(%task_id, package_id, "version task created");

        // Best effort: a full channel just means the polling path picks
        // the task up instead.
        if self.wake.try_send(task_id).is_err() {
            tracing::debug!(%task_id, "fast-path wake skipped, queue full");
        }

        Ok(task_id)
    }
}

/// Pumps publish notifications into ingress until shutdown.
///
/// Duplicate events are logged and dropped; other failures are logged and
/// the pump keeps running, because losing one notification only delays
/// validation until the event is redelivered.
pub async fn run_publish_pump(
    stream: Arc<dyn PublishStream>,
    ingress: Arc<Ingress>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = stream.next_event() => event,
            _ = shutdown.changed() => break,
        };

        match event {
            Ok(Some(event)) => {
                let result = ingress
                    .validate_version(
                        &event.package_id,
                        &event.version,
                        event.revision,
                        event.event_id.clone(),
                    )
                    .await;
                match result {
                    Ok(task_id) => {
                        tracing::info!(%task_id, package_id = %event.package_id, "publish event ingested");
                    }
                    Err(Error::DuplicateEvent { event_id }) => {
                        tracing::debug!(%event_id, "publish event already ingested");
                    }
                    Err(error) => {
                        tracing::warn!(%error, package_id = %event.package_id, "publish event ingest failed");
                    }
                }
            }
            Ok(None) => {
                tracing::info!("publish stream closed");
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "publish stream receive failed");
            }
        }
    }
}

/// In-memory publish stream for tests.
#[derive(Debug)]
pub struct InMemoryPublishStream {
    rx: tokio::sync::Mutex<mpsc::Receiver<PublishEvent>>,
}

impl InMemoryPublishStream {
    /// Creates a stream and the sender that feeds it.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<PublishEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx: tokio::sync::Mutex::new(rx),
            },
        )
    }
}

#[async_trait]
impl PublishStream for InMemoryPublishStream {
    async fn next_event(&self) -> Result<Option<PublishEvent>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::memory::InMemoryHub;
    use crate::store::memory::InMemoryStore;
    use crate::task::TaskStatus;

    fn ingress_with(
        store: Arc<InMemoryStore>,
        hub: Arc<InMemoryHub>,
    ) -> (Ingress, mpsc::Receiver<VersionTaskId>) {
        let (tx, rx) = mpsc::channel(8);
        let ingress = Ingress::new(store, hub, ExecutorId::generate(), tx);
        (ingress, rx)
    }

    #[tokio::test]
    async fn creates_pre_leased_task_and_wakes_worker() {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(InMemoryHub::new());
        let (ingress, mut rx) = ingress_with(store.clone(), hub);

        let task_id = ingress
            .validate_version("pkg", "1.0", 2, Some("E1".to_string()))
            .await
            .unwrap();

        let task = store.get_version_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert!(task.executor_id.is_some());
        assert_eq!(task.revision, 2);
        assert_eq!(rx.try_recv().unwrap(), task_id);
    }

    #[tokio::test]
    async fn revision_zero_resolves_through_hub() {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(InMemoryHub::new());
        hub.put_version("pkg", "1.0", "1.0@7").unwrap();
        let (ingress, _rx) = ingress_with(store.clone(), hub);

        let task_id = ingress
            .validate_version("pkg", "1.0", 0, None)
            .await
            .unwrap();

        let task = store.get_version_task(task_id).await.unwrap();
        assert_eq!(task.revision, 7);
        assert_eq!(task.version, "1.0");
    }

    #[tokio::test]
    async fn negative_revision_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(InMemoryHub::new());
        let (ingress, _rx) = ingress_with(store, hub);

        let err = ingress
            .validate_version("pkg", "1.0", -1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRevisionFormat { .. }));
    }

    #[tokio::test]
    async fn duplicate_event_surfaces_and_leaves_one_row() {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(InMemoryHub::new());
        let (ingress, _rx) = ingress_with(store.clone(), hub);

        ingress
            .validate_version("pkg", "1.0", 1, Some("E1".to_string()))
            .await
            .unwrap();
        let err = ingress
            .validate_version("pkg", "1.0", 1, Some("E1".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DuplicateEvent { .. }));
        assert_eq!(store.version_task_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_pump_ingests_and_tolerates_duplicates() {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(InMemoryHub::new());
        let (ingress, _rx) = ingress_with(store.clone(), hub);
        let ingress = Arc::new(ingress);

        let (tx, stream) = InMemoryPublishStream::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let event = PublishEvent {
            package_id: "pkg".to_string(),
            version: "1.0".to_string(),
            revision: 1,
            event_id: Some("E1".to_string()),
        };
        tx.send(event.clone()).await.unwrap();
        tx.send(event).await.unwrap();
        drop(tx);

        run_publish_pump(Arc::new(stream), ingress, shutdown_rx).await;
        drop(shutdown_tx);

        assert_eq!(store.version_task_count().unwrap(), 1);
    }
}
