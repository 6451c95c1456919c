//! Worker runtime configuration and loop wiring.
//!
//! One [`PipelineRuntime`] per worker process: it owns the shared
//! singletons (store, hub client, linter runner, executor id), spawns the
//! three background loops, and hands back a [`RunningPipeline`] for
//! ingress access and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use apilint_core::ExecutorId;

use crate::error::{Error, Result};
use crate::hub::ApiHubClient;
use crate::ingress::{run_publish_pump, Ingress, PublishStream};
use crate::linter::DocumentLinter;
use crate::metrics::FlowMetrics;
use crate::store::TaskStore;
use crate::workers::doc::DocTaskWorker;
use crate::workers::rollup::RollupLoop;
use crate::workers::version::VersionTaskWorker;

const ENV_POLL_INTERVAL_SECS: &str = "APILINT_POLL_INTERVAL_SECS";
const ENV_HEARTBEAT_INTERVAL_SECS: &str = "APILINT_HEARTBEAT_INTERVAL_SECS";
const ENV_LEASE_TTL_SECS: &str = "APILINT_LEASE_TTL_SECS";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
const DEFAULT_LEASE_TTL_SECS: u64 = 30;

/// Capacity of the ingress fast-path wake channel. Overflow is harmless:
/// the polling path picks up whatever the channel drops.
const WAKE_CHANNEL_CAPACITY: usize = 64;

/// Timing knobs for the worker loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// How often each loop polls for claimable work.
    pub poll_interval: Duration,
    /// How often a working executor refreshes its lease.
    pub heartbeat_interval: Duration,
    /// How stale a lease must be before a sibling may re-claim the task.
    pub lease_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
        }
    }
}

impl PipelineConfig {
    /// Loads the config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer number of seconds.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads the config with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer number of seconds.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            poll_interval: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_POLL_INTERVAL_SECS,
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            heartbeat_interval: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_HEARTBEAT_INTERVAL_SECS,
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )?),
            lease_ttl: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_LEASE_TTL_SECS,
                DEFAULT_LEASE_TTL_SECS,
            )?),
        })
    }

    /// Returns the lease TTL as a chrono duration for store construction.
    #[must_use]
    pub fn lease_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or_else(|_| chrono::Duration::seconds(
            i64::try_from(DEFAULT_LEASE_TTL_SECS).unwrap_or(30),
        ))
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

/// The shared singletons and knobs for one worker process.
pub struct PipelineRuntime {
    store: Arc<dyn TaskStore>,
    hub: Arc<dyn ApiHubClient>,
    linter: Arc<dyn DocumentLinter>,
    executor_id: ExecutorId,
    config: PipelineConfig,
    metrics: FlowMetrics,
    publish_stream: Option<Arc<dyn PublishStream>>,
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("executor_id", &self.executor_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineRuntime {
    /// Creates a runtime from the process-wide singletons.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        hub: Arc<dyn ApiHubClient>,
        linter: Arc<dyn DocumentLinter>,
        executor_id: ExecutorId,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            hub,
            linter,
            executor_id,
            config,
            metrics: FlowMetrics::new(),
            publish_stream: None,
        }
    }

    /// Attaches a publish-notification stream to pump into ingress.
    #[must_use]
    pub fn with_publish_stream(mut self, stream: Arc<dyn PublishStream>) -> Self {
        self.publish_stream = Some(stream);
        self
    }

    /// Spawns the background loops and returns the running pipeline.
    #[must_use]
    pub fn start(self) -> RunningPipeline {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CHANNEL_CAPACITY);

        let ingress = Arc::new(Ingress::new(
            self.store.clone(),
            self.hub.clone(),
            self.executor_id,
            wake_tx,
        ));

        let doc_worker = DocTaskWorker::new(
            self.store.clone(),
            self.hub.clone(),
            self.linter,
            self.executor_id,
            self.config.poll_interval,
            self.config.heartbeat_interval,
            self.metrics,
        );
        let version_worker = VersionTaskWorker::new(
            self.store.clone(),
            self.hub,
            self.executor_id,
            self.config.poll_interval,
            self.config.heartbeat_interval,
            self.metrics,
            wake_rx,
        );
        let rollup = RollupLoop::new(
            self.store,
            self.executor_id,
            self.config.poll_interval,
            self.metrics,
        );

        let mut handles = vec![
            tokio::spawn(doc_worker.run(shutdown_rx.clone())),
            tokio::spawn(version_worker.run(shutdown_rx.clone())),
            tokio::spawn(rollup.run(shutdown_rx.clone())),
        ];

        if let Some(stream) = self.publish_stream {
            handles.push(tokio::spawn(run_publish_pump(
                stream,
                ingress.clone(),
                shutdown_rx,
            )));
        }

        tracing::info!(executor_id = %self.executor_id, "pipeline started");
        RunningPipeline {
            ingress,
            shutdown: shutdown_tx,
            handles,
        }
    }
}

/// A started pipeline: ingress access plus graceful shutdown.
#[derive(Debug)]
pub struct RunningPipeline {
    ingress: Arc<Ingress>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningPipeline {
    /// The ingress bound to this process.
    #[must_use]
    pub fn ingress(&self) -> Arc<Ingress> {
        self.ingress.clone()
    }

    /// Signals shutdown and waits for every loop to stop.
    pub async fn shutdown(self) {
        drop(self.shutdown);
        for handle in self.handles {
            if let Err(error) = handle.await {
                if !error.is_cancelled() {
                    tracing::warn!(%error, "worker loop join failed");
                }
            }
        }
    }
}
