use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::grpc::sandbox_service::SandboxFacade;
use crate::grpc::scheduler_service::SchedulerGrpc;
use crate::proto::sandbox_service_server::SandboxServiceServer;
use crate::proto::scheduler_service_server::SchedulerServiceServer;
use crate::sink::ResultSink;
use crate::tls::TlsIdentity;

/// The scheduler process: gRPC listener plus the registry reaper.
pub struct SchedulerServer {
    config: SchedulerConfig,
    dispatcher: Dispatcher,
    sink: Arc<dyn ResultSink>,
    tls: Option<TlsIdentity>,
}

impl SchedulerServer {
    pub fn new(config: SchedulerConfig, sink: Arc<dyn ResultSink>) -> Self {
        let dispatcher = Dispatcher::with_config(config.registry.clone());
        Self {
            config,
            dispatcher,
            sink,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsIdentity>) -> Self {
        self.tls = tls;
        self
    }

    /// Handle for submitting jobs to this scheduler in-process.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        let registry = self.dispatcher.registry().clone();

        let reaper = tokio::spawn(registry.clone().run_reaper(shutdown.clone()));

        let service = SchedulerGrpc::new(self.dispatcher.clone(), self.sink.clone());
        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(tls.server_tls_config())?;
        }

        tracing::info!(addr = %addr, tls = self.tls.is_some(), "Starting scheduler");

        let signal = {
            let shutdown = shutdown.clone();
            let registry = registry.clone();
            async move {
                shutdown.cancelled().await;
                // Streams only end once their instances are closed.
                registry.close_all().await;
            }
        };

        let served = builder
            .add_service(SchedulerServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await;

        shutdown.cancel();
        registry.close_all().await;
        let _ = reaper.await;
        tracing::info!("Scheduler stopped");
        served.map_err(Into::into)
    }
}

/// Serve the worker's unary facade until `shutdown` fires.
pub async fn serve_sandbox_admin(
    addr: SocketAddr,
    facade: SandboxFacade,
    tls: Option<TlsIdentity>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut builder = Server::builder();
    if let Some(tls) = &tls {
        builder = builder.tls_config(tls.server_tls_config())?;
    }

    tracing::info!(addr = %addr, "Starting sandbox admin service");

    builder
        .add_service(SandboxServiceServer::new(facade))
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await?;
    Ok(())
}
