//! Where finished jobs are reported.
//!
//! Every job attempt produces exactly one [`JobOutcome`], recorded once on
//! both the success and the failure path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Why a job produced no score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// Internal problem on the worker (launch failure, missing helper).
    System,
    /// The submission could not be fetched or violated the cutoff.
    Checkout,
    /// No judge script for the assignment.
    Script,
    /// The script exceeded its wall-clock budget.
    Timeout,
    /// The scheduler accepted the job but lost it before delivery.
    Dispatch,
}

impl FailureCode {
    /// Score stored by callers that only understand a number.
    pub const LEGACY_SCORE: f64 = -2.0;
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::System => write!(f, "system"),
            FailureCode::Checkout => write!(f, "checkout"),
            FailureCode::Script => write!(f, "script"),
            FailureCode::Timeout => write!(f, "timeout"),
            FailureCode::Dispatch => write!(f, "dispatch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Verdict {
    Scored(f64),
    Failed(FailureCode),
}

impl Verdict {
    pub fn score(&self) -> f64 {
        match self {
            Verdict::Scored(score) => *score,
            Verdict::Failed(_) => FailureCode::LEGACY_SCORE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub correlation_id: u64,
    pub verdict: Verdict,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn scored(correlation_id: u64, score: f64, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            verdict: Verdict::Scored(score),
            message: message.into(),
            finished_at: Utc::now(),
        }
    }

    pub fn failed(correlation_id: u64, code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            verdict: Verdict::Failed(code),
            message: message.into(),
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.verdict, Verdict::Scored(_))
    }
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, outcome: JobOutcome);
}

/// Writes outcomes to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl ResultSink for TracingSink {
    async fn record(&self, outcome: JobOutcome) {
        match outcome.verdict {
            Verdict::Scored(score) => tracing::info!(
                correlation_id = outcome.correlation_id,
                score,
                "Job graded"
            ),
            Verdict::Failed(code) => tracing::warn!(
                correlation_id = outcome.correlation_id,
                code = %code,
                message = %outcome.message,
                "Job failed"
            ),
        }
    }
}

/// Forwards outcomes to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<JobOutcome>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn record(&self, outcome: JobOutcome) {
        if self.tx.send(outcome).is_err() {
            tracing::debug!("Outcome receiver dropped");
        }
    }
}
