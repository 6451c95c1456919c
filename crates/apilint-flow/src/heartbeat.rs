//! Lease heartbeats for in-flight tasks.
//!
//! A lease is live while `now() - last_active < LEASE_TTL`. Whoever is
//! working a task must refresh `last_active` at least once per heartbeat
//! interval, or a sibling worker will re-claim the task. The heartbeat
//! runs as its own tokio task so a blocking subprocess wait cannot starve
//! it; dropping the handle stops it on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use apilint_core::{DocTaskId, ExecutorId, VersionTaskId};

use crate::store::TaskStore;

/// Which task a heartbeat refreshes.
#[derive(Debug, Clone, Copy)]
enum Target {
    Version(VersionTaskId),
    Doc(DocTaskId),
}

/// Abort-on-drop guard for a background heartbeat task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn spawn(
    store: Arc<dyn TaskStore>,
    target: Target,
    executor_id: ExecutorId,
    interval: Duration,
) -> HeartbeatHandle {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it, the claim just set
        // last_active.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let result = match target {
                Target::Version(id) => store.heartbeat_version_task(id, executor_id).await,
                Target::Doc(id) => store.heartbeat_doc_task(id, executor_id).await,
            };
            if let Err(error) = result {
                tracing::warn!(%error, "heartbeat refresh failed");
            }
        }
    });
    HeartbeatHandle { handle }
}

/// Starts refreshing a version task's lease every `interval`.
#[must_use]
pub fn spawn_version_heartbeat(
    store: Arc<dyn TaskStore>,
    id: VersionTaskId,
    executor_id: ExecutorId,
    interval: Duration,
) -> HeartbeatHandle {
    spawn(store, Target::Version(id), executor_id, interval)
}

/// Starts refreshing a document task's lease every `interval`.
#[must_use]
pub fn spawn_doc_heartbeat(
    store: Arc<dyn TaskStore>,
    id: DocTaskId,
    executor_id: ExecutorId,
    interval: Duration,
) -> HeartbeatHandle {
    spawn(store, Target::Doc(id), executor_id, interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruleset::LinterKind;
    use crate::store::memory::InMemoryStore;
    use crate::store::TaskStore;
    use crate::task::{DocumentLintTask, VersionLintTask};
    use apilint_core::RulesetId;
    use chrono::Utc;

    #[tokio::test]
    async fn doc_heartbeat_refreshes_lease_until_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let mut parent = VersionLintTask::new("pkg", "1.0", 1);
        parent.status = crate::task::TaskStatus::Processing;
        store.insert_version_task(&parent).await.unwrap();
        let task = DocumentLintTask::new(
            &parent,
            "f1",
            "slug-1",
            "openapi-3-0",
            LinterKind::Spectral,
            RulesetId::generate(),
        );
        let id = task.id;
        store
            .save_doc_tasks_and_advance_version(&[task], parent.id)
            .await
            .unwrap();

        let executor = ExecutorId::generate();
        store.claim_free_doc_task(executor).await.unwrap().unwrap();
        let stale = Utc::now() - chrono::Duration::seconds(20);
        store.backdate_doc_task(id, stale).unwrap();

        let beat = spawn_doc_heartbeat(
            store.clone() as Arc<dyn TaskStore>,
            id,
            executor,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(beat);

        let task = store.get_doc_task(id).await.unwrap();
        assert!(task.last_active.unwrap() > stale + chrono::Duration::seconds(1));
    }
}
