//! Long-running worker node: keeps a stream open to the scheduler and runs
//! the jobs it sends.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::{Channel, Endpoint};

use crate::config::WorkerConfig;
use crate::error::{Result, SandboxError};
use crate::grpc::server::serve_sandbox_admin;
use crate::grpc::SandboxFacade;
use crate::proto;
use crate::proto::scheduler_service_client::SchedulerServiceClient;
use crate::scheduler::job::Job;
use crate::sink::ResultSink;
use crate::tls::TlsIdentity;
use crate::wire::{JobReport, SchedulerCommand, WorkerEvent};
use crate::worker::executor::Executor;
use crate::worker::heartbeat::StatusReporter;
use crate::worker::isolation;
use crate::worker::pool::SlotPool;
use crate::worker::provision::Provisioner;
use crate::worker::runner::JobRunner;
use crate::worker::scripts::ScriptCatalog;

const OUTBOUND_BUFFER: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Sending half of the current scheduler stream.
///
/// Clones are handed to job tasks. Closing the outbox ends the outbound
/// stream even while job tasks still hold clones.
#[derive(Clone)]
pub struct Outbox {
    instance_id: Arc<str>,
    tx: Arc<Mutex<Option<mpsc::Sender<proto::SandboxMessage>>>>,
}

impl Outbox {
    pub fn new(instance_id: &str, tx: mpsc::Sender<proto::SandboxMessage>) -> Self {
        Self {
            instance_id: Arc::from(instance_id),
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Returns false once the stream is gone.
    pub async fn send(&self, event: WorkerEvent) -> bool {
        let Some(tx) = self.tx.lock().clone() else {
            return false;
        };
        tx.send(event.into_message(&self.instance_id)).await.is_ok()
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }
}

pub struct WorkerRuntime {
    config: WorkerConfig,
    pool: Arc<SlotPool>,
    runner: JobRunner,
    tasks: TaskTracker,
    tls: Option<TlsIdentity>,
}

impl WorkerRuntime {
    /// Provision the slot pool and wire up the job pipeline.
    ///
    /// Fails if any slot cannot be initialised.
    pub async fn start(
        config: WorkerConfig,
        provisioner: Arc<dyn Provisioner>,
        scripts: Arc<dyn ScriptCatalog>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        let isolation = isolation::from_config(&config.isolation);
        tracing::info!(
            instance_id = %config.instance_id,
            capacity = config.capacity,
            backend = isolation.name(),
            "Provisioning sandbox slots"
        );
        let pool = SlotPool::provision(config.capacity, isolation).await?;
        let executor = Executor::new(pool.clone(), config.exec.clone());
        let runner = JobRunner::new(executor, provisioner, scripts, sink);
        Ok(Self::new(config, pool, runner))
    }

    pub fn new(config: WorkerConfig, pool: Arc<SlotPool>, runner: JobRunner) -> Self {
        Self {
            config,
            pool,
            runner,
            tasks: TaskTracker::new(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsIdentity>) -> Self {
        self.tls = tls;
        self
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Jobs started and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Serve until `shutdown` fires, then drain in-flight jobs and clean up
    /// the slot pool.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let admin = self.config.admin_addr.map(|addr| {
            let facade = SandboxFacade::new(self.pool.clone(), self.runner.clone(), self.tasks.clone());
            let tls = self.tls.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_sandbox_admin(addr, facade, tls, shutdown).await {
                    tracing::error!(addr = %addr, error = %e, "Sandbox admin server failed");
                }
            })
        });

        self.connection_loop(&shutdown).await;

        self.drain().await;
        self.pool.cleanup().await;
        if let Some(admin) = admin {
            let _ = admin.await;
        }
        tracing::info!(instance_id = %self.config.instance_id, "Worker stopped");
        Ok(())
    }

    async fn connection_loop(&self, shutdown: &CancellationToken) {
        while !shutdown.is_cancelled() {
            let client = match self.connect().await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(
                        addr = %self.config.scheduler_addr,
                        error = %e,
                        retry_in_secs = self.config.reconnect_delay.as_secs(),
                        "Failed to connect to scheduler"
                    );
                    if sleep_or_shutdown(self.config.reconnect_delay, shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.session(client, shutdown).await {
                Ok(()) => tracing::info!("Scheduler stream closed"),
                Err(e) => tracing::warn!(error = %e, "Scheduler stream failed"),
            }

            if sleep_or_shutdown(self.config.retry_delay, shutdown).await {
                break;
            }
        }
    }

    async fn connect(&self) -> Result<SchedulerServiceClient<Channel>> {
        let mut endpoint = Endpoint::from_shared(self.config.scheduler_addr.clone())?
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.client_tls_config(self.config.tls.server_name.as_deref()))?;
        }
        let channel = endpoint.connect().await?;
        Ok(SchedulerServiceClient::new(channel))
    }

    /// One connected stream, from the connect frame until either side closes.
    async fn session(
        &self,
        mut client: SchedulerServiceClient<Channel>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let outbox = Outbox::new(&self.config.instance_id, tx);
        outbox
            .send(WorkerEvent::Connect {
                instance_id: self.config.instance_id.clone(),
                capacity: self.pool.total(),
            })
            .await;

        let mut inbound = client
            .sandbox_stream(ReceiverStream::new(rx))
            .await?
            .into_inner();
        tracing::info!(
            instance_id = %self.config.instance_id,
            addr = %self.config.scheduler_addr,
            "Connected to scheduler"
        );

        let reporter_cancel = shutdown.child_token();
        let reporter = {
            let reporter =
                StatusReporter::new(self.config.status_interval, self.config.status_force_after);
            let pool = self.pool.clone();
            let outbox = outbox.clone();
            let cancel = reporter_cancel.clone();
            tokio::spawn(async move { reporter.run(pool, outbox, cancel).await })
        };

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                message = inbound.message() => match message {
                    Ok(Some(msg)) => match SchedulerCommand::try_from(msg) {
                        Ok(command) => {
                            if let Err(e) = self.handle_command(command, &outbox).await {
                                break Err(e);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed scheduler message"),
                    },
                    Ok(None) => break Ok(()),
                    Err(status) => break Err(status.into()),
                }
            }
        };

        reporter_cancel.cancel();
        let _ = reporter.await;
        outbox.close();
        result
    }

    async fn handle_command(&self, command: SchedulerCommand, outbox: &Outbox) -> Result<()> {
        match command {
            SchedulerCommand::ConnectAck { success, message } => {
                if !success {
                    return Err(SandboxError::Protocol(format!(
                        "scheduler rejected connection: {}",
                        message
                    )));
                }
                tracing::info!(message = %message, "Registered with scheduler");
                outbox.send(WorkerEvent::Status(self.pool.status())).await;
            }
            SchedulerCommand::StatusPull => {
                outbox.send(WorkerEvent::Status(self.pool.status())).await;
            }
            SchedulerCommand::Job(job) => self.spawn_job(job, outbox.clone()),
        }
        Ok(())
    }

    fn spawn_job(&self, job: Job, outbox: Outbox) {
        tracing::info!(
            correlation_id = job.correlation_id,
            repo = %job.repo_full_name,
            "Job received"
        );
        let runner = self.runner.clone();
        self.tasks.spawn(async move {
            let outcome = runner.run_job(&job).await;
            if !outbox.send(WorkerEvent::JobResult(JobReport::from(&outcome))).await {
                tracing::debug!(
                    correlation_id = outcome.correlation_id,
                    "Scheduler stream gone, result not reported upstream"
                );
            }
        });
    }

    /// Wait for in-flight jobs, bounded by the shutdown timeout.
    async fn drain(&self) {
        self.tasks.close();
        if self.tasks.is_empty() {
            return;
        }

        tracing::info!(
            in_flight = self.tasks.len(),
            timeout_secs = self.config.shutdown_timeout.as_secs(),
            "Waiting for in-flight jobs"
        );
        let deadline = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(deadline);
        let mut progress = tokio::time::interval(DRAIN_PROGRESS_INTERVAL);
        progress.tick().await;

        loop {
            tokio::select! {
                _ = self.tasks.wait() => {
                    tracing::info!("All in-flight jobs finished");
                    break;
                }
                _ = &mut deadline => {
                    tracing::warn!(remaining = self.tasks.len(), "Shutdown timeout reached with jobs still running");
                    break;
                }
                _ = progress.tick() => {
                    tracing::info!(remaining = self.tasks.len(), "Still waiting for in-flight jobs");
                }
            }
        }
    }
}

/// Sleep for `delay`; returns true if shutdown fired first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
