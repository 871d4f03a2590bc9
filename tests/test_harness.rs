//! Test harness for scheduler/worker integration tests.
//!
//! Runs a real scheduler on a loopback listener and any number of workers
//! backed by the host-shell isolation, so jobs travel the whole path:
//! dispatcher, registry queue, stream, worker pool, and result sink.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use oj_sandbox::config::{ExecConfig, IsolationConfig, RegistryConfig, SchedulerConfig, WorkerConfig};
use oj_sandbox::dispatch::Dispatcher;
use oj_sandbox::error::{Result, SandboxError};
use oj_sandbox::grpc::SchedulerServer;
use oj_sandbox::sink::{ChannelSink, JobOutcome};
use oj_sandbox::worker::isolation::{self, Isolation};
use oj_sandbox::worker::{
    Executor, JobRunner, Provisioner, SlotPool, SourceRequest, StaticScripts, WorkerRuntime,
};

/// Registry timings short enough for tests.
pub fn test_registry_config() -> RegistryConfig {
    RegistryConfig {
        queue_capacity: 16,
        reap_interval: Duration::from_millis(200),
        inactive_after: Duration::from_secs(5),
        remove_after: Duration::from_secs(10),
    }
}

/// Host-shell isolation rooted in `dir`.
pub fn host_shell(dir: &Path) -> Arc<dyn Isolation> {
    isolation::from_config(&IsolationConfig::host_shell(dir))
}

/// Checkouts are empty directories; repos named `missing/*` fail to fetch.
pub struct FixtureProvisioner {
    root: PathBuf,
}

impl FixtureProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Provisioner for FixtureProvisioner {
    async fn provision(&self, request: &SourceRequest) -> Result<PathBuf> {
        if request.full_name.starts_with("missing/") {
            return Err(SandboxError::Checkout(format!(
                "repository {} not found",
                request.full_name
            )));
        }
        let dir = self.root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

/// Running scheduler on an ephemeral loopback port.
pub struct TestScheduler {
    pub addr: String,
    pub dispatcher: Dispatcher,
    pub outcomes: mpsc::UnboundedReceiver<JobOutcome>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestScheduler {
    pub async fn start() -> Self {
        Self::start_with(test_registry_config()).await
    }

    pub async fn start_with(registry: RegistryConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let (sink, outcomes) = ChannelSink::new();

        let config = SchedulerConfig::new(local).with_registry(registry);
        let server = SchedulerServer::new(config, Arc::new(sink));
        let dispatcher = server.dispatcher();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run_with_listener(listener, token).await {
                tracing::error!("Scheduler error: {}", e);
            }
        });

        Self {
            addr: format!("http://{}", local),
            dispatcher,
            outcomes,
            shutdown,
            handle,
        }
    }

    /// Wait until `n` instances have reported status.
    pub async fn wait_for_instances(&self, n: usize) -> bool {
        let dispatcher = self.dispatcher.clone();
        wait_for(
            || {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher
                        .instances()
                        .await
                        .iter()
                        .filter(|i| i.status.is_some())
                        .count()
                        >= n
                }
            },
            Duration::from_secs(10),
            Duration::from_millis(20),
        )
        .await
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Running worker with its own slot directory and outcome channel.
pub struct TestWorker {
    pub instance_id: String,
    pub pool: Arc<SlotPool>,
    pub outcomes: mpsc::UnboundedReceiver<JobOutcome>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    _dir: TempDir,
}

impl TestWorker {
    pub async fn start(
        instance_id: &str,
        scheduler_addr: &str,
        capacity: usize,
        scripts: StaticScripts,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let pool = SlotPool::provision(capacity, host_shell(&dir.path().join("slots")))
            .await
            .unwrap();

        let mut config = WorkerConfig::new(instance_id, scheduler_addr)
            .with_capacity(capacity)
            .with_exec(ExecConfig::default().with_timeout(Duration::from_secs(10)));
        config.status_interval = Duration::from_millis(50);
        config.reconnect_delay = Duration::from_millis(100);
        config.retry_delay = Duration::from_millis(100);
        config.shutdown_timeout = Duration::from_secs(5);

        let (sink, outcomes) = ChannelSink::new();
        let executor = Executor::new(pool.clone(), config.exec.clone());
        let runner = JobRunner::new(
            executor,
            Arc::new(FixtureProvisioner::new(dir.path().join("repos"))),
            Arc::new(scripts),
            Arc::new(sink),
        );
        let runtime = WorkerRuntime::new(config, pool.clone(), runner);

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = runtime.run(token).await {
                tracing::error!("Worker error: {}", e);
            }
        });

        Self {
            instance_id: instance_id.to_string(),
            pool,
            outcomes,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    /// Next recorded outcome, or `None` after `timeout`.
    pub async fn next_outcome(&mut self, timeout: Duration) -> Option<JobOutcome> {
        tokio::time::timeout(timeout, self.outcomes.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }

    /// Kill the worker without draining, as a crash would.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
