use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::dispatch::Dispatcher;
use crate::error::SandboxError;
use crate::proto;
use crate::proto::scheduler_service_server::SchedulerService;
use crate::scheduler::forwarder::{Forwarder, OutboundSender};
use crate::scheduler::job::Job;
use crate::scheduler::registry::InstanceRegistry;
use crate::sink::ResultSink;
use crate::wire::{SchedulerCommand, WorkerEvent};

/// Frames buffered toward one worker before the forwarder waits.
const OUTBOUND_BUFFER: usize = 64;

/// Scheduler side of the worker stream plus the unary dispatch calls.
pub struct SchedulerGrpc {
    dispatcher: Dispatcher,
    sink: Arc<dyn ResultSink>,
}

impl SchedulerGrpc {
    pub fn new(dispatcher: Dispatcher, sink: Arc<dyn ResultSink>) -> Self {
        Self { dispatcher, sink }
    }
}

#[tonic::async_trait]
impl SchedulerService for SchedulerGrpc {
    type SandboxStreamStream = ReceiverStream<Result<proto::SchedulerMessage, Status>>;

    async fn sandbox_stream(
        &self,
        request: Request<Streaming<proto::SandboxMessage>>,
    ) -> Result<Response<Self::SandboxStreamStream>, Status> {
        let remote = request.remote_addr();
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);

        let connection = Connection {
            registry: self.dispatcher.registry().clone(),
            sink: self.sink.clone(),
            outbound: tx,
        };
        tokio::spawn(async move {
            tracing::debug!(remote = ?remote, "Worker stream opened");
            connection.serve(inbound).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn reserve_job(
        &self,
        request: Request<proto::JobRequest>,
    ) -> Result<Response<proto::ReserveJobResponse>, Status> {
        let job = Job::try_from(request.into_inner()).map_err(Status::from)?;
        let correlation_id = job.correlation_id;

        let response = match self.dispatcher.reserve_job(job).await {
            Ok(instance_id) => proto::ReserveJobResponse {
                accepted: true,
                instance_id,
                message: String::new(),
            },
            Err(e) => {
                tracing::warn!(correlation_id, error = %e, "Job not reserved");
                proto::ReserveJobResponse {
                    accepted: false,
                    instance_id: String::new(),
                    message: e.to_string(),
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn get_global_status(
        &self,
        _request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        Ok(Response::new(self.dispatcher.status().await.into()))
    }
}

/// One worker's stream, from connect to removal.
struct Connection {
    registry: Arc<InstanceRegistry>,
    sink: Arc<dyn ResultSink>,
    outbound: OutboundSender,
}

impl Connection {
    async fn serve(self, mut inbound: Streaming<proto::SandboxMessage>) {
        let (instance_id, capacity) = match self.handshake(&mut inbound).await {
            Some(hello) => hello,
            None => return,
        };

        let handle = self.registry.register(&instance_id, capacity).await;
        let session = handle.session;
        let closed = handle.closed.clone();

        let ack = SchedulerCommand::ConnectAck {
            success: true,
            message: format!("registered with {} slots", capacity),
        };
        if !self.send(ack, &instance_id).await
            || !self.send(SchedulerCommand::StatusPull, &instance_id).await
        {
            self.registry.remove(&instance_id, session).await;
            return;
        }

        let forwarder = Forwarder::new(
            instance_id.clone(),
            handle.jobs,
            handle.closed,
            self.outbound.clone(),
            self.sink.clone(),
        );
        tokio::spawn(forwarder.run());

        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = inbound.message() => frame,
            };
            match frame {
                Ok(Some(msg)) => self.handle_frame(msg, &instance_id, session).await,
                Ok(None) => {
                    tracing::info!(instance_id = %instance_id, "Worker closed the stream");
                    break;
                }
                Err(status) => {
                    tracing::warn!(instance_id = %instance_id, error = %status, "Worker stream failed");
                    break;
                }
            }
        }

        self.registry.remove(&instance_id, session).await;
    }

    /// Read the first frame, which must be a connect request with an id.
    async fn handshake(
        &self,
        inbound: &mut Streaming<proto::SandboxMessage>,
    ) -> Option<(String, u32)> {
        let first = match inbound.message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return None,
            Err(status) => {
                tracing::warn!(error = %status, "Worker stream failed before connect");
                return None;
            }
        };

        let envelope_id = first.instance_id.clone();
        match WorkerEvent::try_from(first) {
            Ok(WorkerEvent::Connect {
                instance_id,
                capacity,
            }) => {
                let instance_id = if instance_id.is_empty() {
                    envelope_id
                } else {
                    instance_id
                };
                if instance_id.is_empty() {
                    let nack = SchedulerCommand::ConnectAck {
                        success: false,
                        message: "instance id is required".to_string(),
                    };
                    self.send(nack, "").await;
                    return None;
                }
                Some((instance_id, capacity))
            }
            Ok(other) => {
                tracing::warn!(event = ?other, "First frame was not a connect request");
                let _ = self
                    .outbound
                    .send(Err(Status::failed_precondition(
                        "first message must be a connect request",
                    )))
                    .await;
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed connect frame");
                let _ = self.outbound.send(Err(Status::from(e))).await;
                None
            }
        }
    }

    async fn handle_frame(&self, msg: proto::SandboxMessage, instance_id: &str, session: u64) {
        match WorkerEvent::try_from(msg) {
            Ok(WorkerEvent::Status(status)) => {
                if let Err(e) = self.registry.record_status(instance_id, session, status).await {
                    tracing::debug!(instance_id, error = %e, "Status for a replaced session");
                }
            }
            Ok(WorkerEvent::JobResult(report)) => {
                tracing::info!(
                    instance_id,
                    correlation_id = report.correlation_id,
                    success = report.success,
                    score = report.score,
                    "Job result received"
                );
            }
            Ok(WorkerEvent::Connect { .. }) => {
                tracing::warn!(instance_id, "Duplicate connect on an open stream, ignored");
            }
            Err(SandboxError::Protocol(reason)) => {
                tracing::warn!(instance_id, reason = %reason, "Ignoring malformed frame");
            }
            Err(e) => {
                tracing::warn!(instance_id, error = %e, "Ignoring invalid frame");
            }
        }
    }

    async fn send(&self, command: SchedulerCommand, instance_id: &str) -> bool {
        self.outbound
            .send(Ok(command.into_message(instance_id)))
            .await
            .is_ok()
    }
}
