use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::proto;
use crate::scheduler::job::Job;
use crate::sink::{FailureCode, JobOutcome, ResultSink};
use crate::wire::SchedulerCommand;

pub type OutboundSender = mpsc::Sender<Result<proto::SchedulerMessage, tonic::Status>>;

/// Drains one instance's job queue onto its stream.
///
/// Jobs still queued when the instance goes away are not re-routed; each is
/// recorded as a dispatch failure so the caller learns about it.
pub struct Forwarder {
    instance_id: String,
    jobs: mpsc::Receiver<Job>,
    closed: CancellationToken,
    outbound: OutboundSender,
    sink: Arc<dyn ResultSink>,
}

impl Forwarder {
    pub fn new(
        instance_id: String,
        jobs: mpsc::Receiver<Job>,
        closed: CancellationToken,
        outbound: OutboundSender,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            instance_id,
            jobs,
            closed,
            outbound,
            sink,
        }
    }

    /// Forward until the instance is closed or its stream is gone.
    /// Returns the number of jobs delivered.
    pub async fn run(mut self) -> usize {
        let mut delivered = 0;

        loop {
            let job = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let correlation_id = job.correlation_id;
            let message = SchedulerCommand::Job(job.clone()).into_message(&self.instance_id);
            if self.outbound.send(Ok(message)).await.is_err() {
                self.fail(job, "stream closed before the job was delivered")
                    .await;
                break;
            }
            delivered += 1;
            tracing::info!(correlation_id, instance_id = %self.instance_id, "Job forwarded");
        }

        self.jobs.close();
        let mut lost = 0;
        while let Ok(job) = self.jobs.try_recv() {
            self.fail(job, "instance removed before the job was delivered")
                .await;
            lost += 1;
        }
        if lost > 0 {
            tracing::warn!(instance_id = %self.instance_id, lost, "Queued jobs failed on instance removal");
        }
        tracing::debug!(instance_id = %self.instance_id, delivered, "Forwarder stopped");
        delivered
    }

    async fn fail(&self, job: Job, reason: &str) {
        self.sink
            .record(JobOutcome::failed(
                job.correlation_id,
                FailureCode::Dispatch,
                format!("{} (instance {})", reason, self.instance_id),
            ))
            .await;
    }
}
