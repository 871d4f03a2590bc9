//! Typed views of the duplex stream messages.
//!
//! The generated protobuf types carry their payload in an optional `oneof`.
//! Receive loops convert them into these enums first so that every variant is
//! handled explicitly and malformed frames are rejected in one place.

use chrono::{DateTime, Utc};

use crate::error::{Result, SandboxError};
use crate::proto;
use crate::proto::sandbox_message::Kind as WorkerKind;
use crate::proto::scheduler_message::Kind as SchedulerKind;
use crate::scheduler::job::{normalize_ref, Credentials, Job};
use crate::sink::JobOutcome;
use crate::worker::pool::PoolStatus;

/// Upper bound on the message text carried in a job result frame.
pub const MAX_REPORT_BYTES: usize = 16 * 1024;

/// Worker to scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Connect { instance_id: String, capacity: u32 },
    Status(PoolStatus),
    JobResult(JobReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub correlation_id: u64,
    pub success: bool,
    pub message: String,
    pub score: f64,
}

impl From<&JobOutcome> for JobReport {
    fn from(outcome: &JobOutcome) -> Self {
        Self {
            correlation_id: outcome.correlation_id,
            success: outcome.is_success(),
            message: truncate_utf8(&outcome.message, MAX_REPORT_BYTES).to_string(),
            score: outcome.verdict.score(),
        }
    }
}

/// Scheduler to worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCommand {
    ConnectAck { success: bool, message: String },
    StatusPull,
    Job(Job),
}

impl WorkerEvent {
    pub fn into_message(self, instance_id: &str) -> proto::SandboxMessage {
        let kind = match self {
            WorkerEvent::Connect {
                instance_id,
                capacity,
            } => WorkerKind::Connect(proto::ConnectRequest {
                instance_id,
                capacity: capacity.min(i32::MAX as u32) as i32,
            }),
            WorkerEvent::Status(status) => WorkerKind::Status(status.into()),
            WorkerEvent::JobResult(report) => WorkerKind::JobResult(proto::JobResult {
                success: report.success,
                message: report.message,
                correlation_id: report.correlation_id,
                score: report.score,
            }),
        };
        proto::SandboxMessage {
            instance_id: instance_id.to_string(),
            kind: Some(kind),
        }
    }
}

impl TryFrom<proto::SandboxMessage> for WorkerEvent {
    type Error = SandboxError;

    fn try_from(msg: proto::SandboxMessage) -> Result<Self> {
        match msg.kind {
            Some(WorkerKind::Connect(req)) => Ok(WorkerEvent::Connect {
                instance_id: req.instance_id,
                capacity: non_negative("capacity", req.capacity)?,
            }),
            Some(WorkerKind::Status(status)) => Ok(WorkerEvent::Status(status.try_into()?)),
            Some(WorkerKind::JobResult(res)) => Ok(WorkerEvent::JobResult(JobReport {
                correlation_id: res.correlation_id,
                success: res.success,
                message: res.message,
                score: res.score,
            })),
            None => Err(SandboxError::Protocol(
                "sandbox message without payload".to_string(),
            )),
        }
    }
}

impl SchedulerCommand {
    pub fn into_message(self, instance_id: &str) -> proto::SchedulerMessage {
        let kind = match self {
            SchedulerCommand::ConnectAck { success, message } => {
                SchedulerKind::ConnectAck(proto::ConnectAck { success, message })
            }
            SchedulerCommand::StatusPull => SchedulerKind::StatusPull(proto::StatusRequest {}),
            SchedulerCommand::Job(job) => SchedulerKind::JobRequest(job.into()),
        };
        proto::SchedulerMessage {
            instance_id: instance_id.to_string(),
            kind: Some(kind),
        }
    }
}

impl TryFrom<proto::SchedulerMessage> for SchedulerCommand {
    type Error = SandboxError;

    fn try_from(msg: proto::SchedulerMessage) -> Result<Self> {
        match msg.kind {
            Some(SchedulerKind::ConnectAck(ack)) => Ok(SchedulerCommand::ConnectAck {
                success: ack.success,
                message: ack.message,
            }),
            Some(SchedulerKind::StatusPull(_)) => Ok(SchedulerCommand::StatusPull),
            Some(SchedulerKind::JobRequest(req)) => Ok(SchedulerCommand::Job(req.try_into()?)),
            None => Err(SandboxError::Protocol(
                "scheduler message without payload".to_string(),
            )),
        }
    }
}

impl From<PoolStatus> for proto::StatusResponse {
    fn from(status: PoolStatus) -> Self {
        let clamp = |n: u32| n.min(i32::MAX as u32) as i32;
        Self {
            available_count: clamp(status.available),
            waiting_count: clamp(status.waiting),
            processing_count: clamp(status.processing),
            total_count: clamp(status.total),
        }
    }
}

impl TryFrom<proto::StatusResponse> for PoolStatus {
    type Error = SandboxError;

    fn try_from(status: proto::StatusResponse) -> Result<Self> {
        Ok(PoolStatus {
            available: non_negative("available_count", status.available_count)?,
            waiting: non_negative("waiting_count", status.waiting_count)?,
            processing: non_negative("processing_count", status.processing_count)?,
            total: non_negative("total_count", status.total_count)?,
        })
    }
}

impl From<Job> for proto::JobRequest {
    fn from(job: Job) -> Self {
        Self {
            parent_repo: job.parent_repo,
            repo_url: job.repo_url,
            repo_ref: job.repo_ref.unwrap_or_default(),
            repo_full_name: job.repo_full_name,
            submitter_username: job.credentials.username,
            submitter_credential: job.credentials.token,
            correlation_id: job.correlation_id,
            cutoff_unix_ms: job.cutoff.map(|t| t.timestamp_millis()).unwrap_or(0),
            script: job.script.unwrap_or_default(),
        }
    }
}

impl TryFrom<proto::JobRequest> for Job {
    type Error = SandboxError;

    fn try_from(req: proto::JobRequest) -> Result<Self> {
        if req.parent_repo.is_empty() {
            return Err(SandboxError::Protocol("job without parent_repo".to_string()));
        }
        let cutoff = match req.cutoff_unix_ms {
            0 => None,
            ms => Some(DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
                SandboxError::Protocol(format!("cutoff {} out of range", ms))
            })?),
        };

        Ok(Job {
            correlation_id: req.correlation_id,
            parent_repo: req.parent_repo,
            repo_url: req.repo_url,
            repo_ref: normalize_ref(&req.repo_ref),
            repo_full_name: req.repo_full_name,
            credentials: Credentials::new(req.submitter_username, req.submitter_credential),
            cutoff,
            script: Some(req.script).filter(|s| !s.is_empty()),
        })
    }
}

fn non_negative(field: &str, value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| SandboxError::Protocol(format!("negative {}: {}", field, value)))
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::FailureCode;

    #[test]
    fn empty_frames_are_protocol_errors() {
        let msg = proto::SandboxMessage {
            instance_id: "w1".into(),
            kind: None,
        };
        assert!(matches!(
            WorkerEvent::try_from(msg),
            Err(SandboxError::Protocol(_))
        ));

        let msg = proto::SchedulerMessage {
            instance_id: "w1".into(),
            kind: None,
        };
        assert!(matches!(
            SchedulerCommand::try_from(msg),
            Err(SandboxError::Protocol(_))
        ));
    }

    #[test]
    fn negative_counts_are_rejected() {
        let msg = proto::SandboxMessage {
            instance_id: "w1".into(),
            kind: Some(WorkerKind::Status(proto::StatusResponse {
                available_count: -1,
                waiting_count: 0,
                processing_count: 0,
                total_count: 2,
            })),
        };
        assert!(WorkerEvent::try_from(msg).is_err());
    }

    #[test]
    fn job_request_sentinels_map_to_none() {
        let req = proto::JobRequest {
            parent_repo: "course/hw1".into(),
            repo_url: "http://git/alice/hw1.git".into(),
            repo_ref: "0000000000000000000000000000000000000000".into(),
            repo_full_name: "alice/hw1".into(),
            submitter_username: "alice".into(),
            submitter_credential: "tok".into(),
            correlation_id: 9,
            cutoff_unix_ms: 0,
            script: String::new(),
        };
        let job = Job::try_from(req).unwrap();
        assert_eq!(job.repo_ref, None);
        assert_eq!(job.cutoff, None);
        assert_eq!(job.script, None);
        assert_eq!(job.credentials.username, "alice");
    }

    #[test]
    fn job_request_requires_parent_repo() {
        let req = proto::JobRequest::default();
        assert!(Job::try_from(req).is_err());
    }

    #[test]
    fn job_cutoff_survives_the_wire() {
        let cutoff = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        let job = Job::new(1, "course/hw1", "url", "alice/hw1")
            .with_ref("abc123")
            .with_cutoff(cutoff)
            .with_script("echo 1");

        let msg = SchedulerCommand::Job(job.clone()).into_message("w1");
        assert_eq!(msg.instance_id, "w1");
        assert_eq!(SchedulerCommand::try_from(msg).unwrap(), SchedulerCommand::Job(job));
    }

    #[test]
    fn failed_outcome_reports_legacy_score() {
        let outcome = JobOutcome::failed(3, FailureCode::System, "boom");
        let report = JobReport::from(&outcome);
        assert!(!report.success);
        assert_eq!(report.score, -2.0);
    }

    #[test]
    fn report_message_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_REPORT_BYTES);
        let outcome = JobOutcome::scored(1, 10.0, long);
        let report = JobReport::from(&outcome);
        assert!(report.message.len() <= MAX_REPORT_BYTES);
        assert!(report.message.chars().all(|c| c == 'é'));
    }
}
